//! # Name Index Agreement
//!
//! Drives random create/rename/move/delete sequences through the store and
//! cross-checks `files_named` against a full scan of the record table, for
//! every index implementation and again after a reconnect.

use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;
use vfstore::{error_kind, ErrorKind, NameIndexKind, RecordFlags, VfsStore};

const NAMES: [&str; 12] = [
    "Cargo.toml", "main.rs", "lib.rs", "mod.rs", "README.md", "build.rs",
    "target", "src", "tests", "a.txt", "b.txt", ".gitignore",
];

fn open(root: &Path, kind: NameIndexKind) -> VfsStore {
    VfsStore::builder()
        .path(root)
        .name_index(kind)
        .open()
        .unwrap()
        .0
}

fn expected_ids(store: &VfsStore, name: &str) -> Vec<u32> {
    let Some(name_id) = store.names().try_enumerate(name).unwrap() else {
        return Vec::new();
    };
    let mut ids = Vec::new();
    store
        .records()
        .for_each_live(&mut |snapshot| {
            if snapshot.fields.name_id == name_id {
                ids.push(snapshot.id);
            }
            Ok(true)
        })
        .unwrap();
    ids
}

fn assert_agreement(store: &VfsStore) {
    for name in NAMES.iter().copied().chain(["root"]) {
        assert_eq!(
            store.files_named(name).unwrap(),
            expected_ids(store, name),
            "index disagrees with records for '{}'",
            name
        );
    }
}

/// Accepts rejected operations (name clashes, cycles) and fails on anything
/// that would take the store down.
fn tolerate<T>(result: eyre::Result<T>) {
    if let Err(err) = result {
        assert_eq!(error_kind(&err), ErrorKind::Programming, "{:#}", err);
    }
}

fn churn(store: &VfsStore, seed: u64, steps: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let root = match store.root_id("root").unwrap() {
        Some(root) => root,
        None => store.create_root("root").unwrap(),
    };
    let mut dirs = vec![root];
    let mut files = Vec::new();

    for _ in 0..steps {
        let name = *NAMES.choose(&mut rng).unwrap();
        match rng.gen_range(0..10) {
            0..=4 => {
                let parent = *dirs.choose(&mut rng).unwrap();
                let is_dir = rng.gen_bool(0.3);
                let flags = if is_dir {
                    RecordFlags::DIRECTORY
                } else {
                    RecordFlags::empty()
                };
                if let Ok(id) = store.create_child(parent, name, flags) {
                    if is_dir {
                        dirs.push(id);
                    } else {
                        files.push(id);
                    }
                }
            }
            5 | 6 => {
                if let Some(&id) = files.choose(&mut rng) {
                    tolerate(store.rename(id, name));
                }
            }
            7 => {
                if let (Some(&id), Some(&target)) = (files.choose(&mut rng), dirs.choose(&mut rng)) {
                    tolerate(store.move_to(id, target));
                }
            }
            _ => {
                let pool = if rng.gen_bool(0.5) && dirs.len() > 1 {
                    &dirs[1..]
                } else {
                    &files[..]
                };
                if let Some(&id) = pool.choose(&mut rng) {
                    store.delete(id).unwrap();
                    let records = store.records();
                    dirs.retain(|&d| !records.is_free(d).unwrap());
                    files.retain(|&f| !records.is_free(f).unwrap());
                }
            }
        }
    }
}

fn agreement_for(kind: NameIndexKind, seed: u64) {
    let dir = tempdir().unwrap();
    {
        let store = open(dir.path(), kind);
        churn(&store, seed, 2_000);
        assert_agreement(&store);
        store.close().unwrap();
    }
    let store = open(dir.path(), kind);
    assert_agreement(&store);
    churn(&store, seed + 1, 500);
    assert_agreement(&store);
}

#[test]
fn in_memory_index_agrees_with_records() {
    agreement_for(NameIndexKind::InMemory { background: false }, 7);
}

#[test]
fn background_built_index_agrees_with_records() {
    agreement_for(NameIndexKind::InMemory { background: true }, 11);
}

#[test]
fn durable_index_agrees_with_records() {
    agreement_for(NameIndexKind::Durable, 13);
}

#[test]
fn durable_index_is_rebuilt_after_unclean_shutdown() {
    let dir = tempdir().unwrap();
    {
        let store = open(dir.path(), NameIndexKind::Durable);
        churn(&store, 17, 300);
        store.close().unwrap();
    }
    // clear the index's clean-shutdown flag as a crash would have left it
    common::mark_dirty(&dir.path().join("nameindex.map"));

    let store = open(dir.path(), NameIndexKind::Durable);
    assert_agreement(&store);
}

mod common {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use std::path::Path;

    use vfstore::storage::headers::CLEAN_SHUTDOWN_OFFSET;

    pub fn mark_dirty(path: &Path) {
        let mut file = OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(CLEAN_SHUTDOWN_OFFSET)).unwrap();
        file.write_all(&0u32.to_le_bytes()).unwrap();
        file.sync_all().unwrap();
    }
}
