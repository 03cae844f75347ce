//! # Concurrent Access
//!
//! Many threads against one store: record updates stay whole, names intern
//! to one id, concurrent creations under one directory all land in its
//! children list, and crossing directory moves never form a cycle.

use std::collections::HashMap;
use std::sync::Barrier;
use std::thread;

use tempfile::tempdir;
use vfstore::{error_kind, ErrorKind, RecordFlags, VfsStore};

#[test]
fn record_updates_are_never_mixed() {
    let dir = tempdir().unwrap();
    let (store, _) = VfsStore::connect(dir.path(), 1).unwrap();
    let entity = store.records().allocate_record().unwrap();

    thread::scope(|scope| {
        for writer in 1..=4u32 {
            let store = &store;
            scope.spawn(move || {
                for round in 0..2_000u32 {
                    let stamp = writer * 1_000_000 + round;
                    store
                        .records()
                        .update_record(entity, &mut |f| {
                            f.parent_id = stamp;
                            f.name_id = stamp;
                            f.length = stamp as i64;
                            f.timestamp = stamp as i64;
                        })
                        .unwrap();
                }
            });
        }
        for _ in 0..4 {
            let store = &store;
            scope.spawn(move || {
                for _ in 0..5_000 {
                    let fields = store.records().read_record(entity).unwrap().fields;
                    assert_eq!(fields.parent_id, fields.name_id);
                    assert_eq!(fields.length, fields.parent_id as i64);
                    assert_eq!(fields.timestamp, fields.parent_id as i64);
                }
            });
        }
    });

    assert_eq!(store.records().mod_count(entity).unwrap(), 8_000);
}

#[test]
fn concurrent_enumeration_agrees_on_ids() {
    let dir = tempdir().unwrap();
    let (store, _) = VfsStore::connect(dir.path(), 1).unwrap();
    let values: Vec<String> = (0..2_000).map(|i| format!("shared-{}", i)).collect();

    let per_thread: Vec<Vec<u32>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..6)
            .map(|t| {
                let store = &store;
                let values = &values;
                scope.spawn(move || {
                    let mut ids = vec![0; values.len()];
                    // each thread walks the values from a different offset
                    for step in 0..values.len() {
                        let i = (step + t * 317) % values.len();
                        ids[i] = store.names().enumerate(&values[i]).unwrap();
                    }
                    ids
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for ids in &per_thread[1..] {
        assert_eq!(ids, &per_thread[0]);
    }
    let mut seen = HashMap::new();
    for (value, id) in values.iter().zip(&per_thread[0]) {
        assert!(seen.insert(*id, value).is_none(), "id {} handed out twice", id);
    }
}

#[test]
fn concurrent_creation_loses_no_children() {
    let dir = tempdir().unwrap();
    let (store, _) = VfsStore::connect(dir.path(), 1).unwrap();
    let root = store.create_root("root").unwrap();
    let shared = store.create_child(root, "shared", RecordFlags::DIRECTORY).unwrap();

    let created: Vec<u32> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = &store;
                scope.spawn(move || {
                    (0..150)
                        .map(|i| {
                            store
                                .create_child(shared, &format!("t{}-{}", t, i), RecordFlags::empty())
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let mut listed: Vec<u32> = store
        .list_children(shared)
        .unwrap()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    listed.sort_unstable();
    let mut expected = created;
    expected.sort_unstable();
    assert_eq!(listed, expected);
    assert_eq!(store.files_named("t3-77").unwrap().len(), 1);
}

#[test]
fn concurrent_renames_and_moves_keep_lists_consistent() {
    let dir = tempdir().unwrap();
    let (store, _) = VfsStore::connect(dir.path(), 1).unwrap();
    let root = store.create_root("root").unwrap();
    let left = store.create_child(root, "left", RecordFlags::DIRECTORY).unwrap();
    let right = store.create_child(root, "right", RecordFlags::DIRECTORY).unwrap();
    let files: Vec<u32> = (0..64)
        .map(|i| store.create_child(left, &format!("f{}", i), RecordFlags::empty()).unwrap())
        .collect();

    thread::scope(|scope| {
        for (t, chunk) in files.chunks(16).enumerate() {
            let store = &store;
            scope.spawn(move || {
                for (i, &file) in chunk.iter().enumerate() {
                    store.rename(file, &format!("renamed-{}-{}", t, i)).unwrap();
                    if i % 2 == 0 {
                        store.move_to(file, right).unwrap();
                    }
                }
            });
        }
    });

    let in_left = store.list_children(left).unwrap();
    let in_right = store.list_children(right).unwrap();
    assert_eq!(in_left.len(), 32);
    assert_eq!(in_right.len(), 32);
    for (id, name) in in_left.iter().chain(&in_right) {
        assert!(name.starts_with("renamed-"));
        assert_eq!(store.name_of(*id).unwrap().as_deref(), Some(&**name));
    }
    for (id, _) in &in_right {
        assert_eq!(store.records().parent_id(*id).unwrap(), right);
    }
}

#[test]
fn crossing_directory_moves_never_form_a_cycle() {
    let dir = tempdir().unwrap();
    let (store, _) = VfsStore::connect(dir.path(), 1).unwrap();
    let root = store.create_root("root").unwrap();
    let pairs: Vec<(u32, u32)> = (0..500)
        .map(|i| {
            (
                store.create_child(root, &format!("a{}", i), RecordFlags::DIRECTORY).unwrap(),
                store.create_child(root, &format!("b{}", i), RecordFlags::DIRECTORY).unwrap(),
            )
        })
        .collect();
    let barrier = Barrier::new(2);

    thread::scope(|scope| {
        for forward in [true, false] {
            let (store, pairs, barrier) = (&store, &pairs, &barrier);
            scope.spawn(move || {
                for &(a, b) in pairs {
                    let (entity, target) = if forward { (a, b) } else { (b, a) };
                    barrier.wait();
                    if let Err(err) = store.move_to(entity, target) {
                        assert_eq!(error_kind(&err), ErrorKind::Programming, "{:?}", err);
                    }
                }
            });
        }
    });

    let parent = |id| store.records().parent_id(id).unwrap();
    for (i, &(a, b)) in pairs.iter().enumerate() {
        assert!(
            !(parent(a) == b && parent(b) == a),
            "a{} and b{} are each other's parent",
            i,
            i
        );
        let moved = usize::from(parent(a) == b) + usize::from(parent(b) == a);
        assert_eq!(moved, 1, "exactly one move of pair {} wins", i);
        assert!(store.path_of(a).unwrap().starts_with("/root/"));
        assert!(store.path_of(b).unwrap().starts_with("/root/"));
    }
    assert_eq!(store.list_children(root).unwrap().len(), pairs.len());
}
