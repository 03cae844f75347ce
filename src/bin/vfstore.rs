//! # vfstore CLI
//!
//! Inspects and edits a store from the command line.
//!
//! ```bash
//! vfstore <root> stats
//! vfstore <root> ls /project/src
//! vfstore <root> find main.rs
//! vfstore <root> mkdir /project/src
//! vfstore <root> touch /project/src/main.rs
//! vfstore <root> rm /project/src
//! vfstore --store-version 3 <root> stats
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `warn`).

use std::env;
use std::path::PathBuf;

use eyre::{bail, eyre, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vfstore::{RecordFlags, VfsStore};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn run() -> Result<()> {
    init_logging();

    let mut store_version = 1u32;
    let mut positional = Vec::new();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            "--version" | "-v" => {
                println!("vfstore {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--store-version" => {
                let value = args
                    .next()
                    .ok_or_else(|| eyre!("--store-version needs a value"))?;
                store_version = value
                    .parse()
                    .map_err(|_| eyre!("invalid store version: {}", value))?;
            }
            other if other.starts_with('-') => bail!("Unknown option: {}", other),
            _ => positional.push(arg),
        }
    }

    let [root, command, rest @ ..] = positional.as_slice() else {
        print_usage();
        return Ok(());
    };

    let (store, init) = VfsStore::connect(PathBuf::from(root), store_version)?;
    if let Some(reason) = &init.rebuilt {
        eprintln!("storage corrupted, rebuilding ({})", reason);
    }

    match (command.as_str(), rest) {
        ("stats", []) => print_stats(&store)?,
        ("ls", [path]) => {
            let dir = resolve(&store, path)?;
            for (id, name) in store.list_children(dir)? {
                let marker = if store.records().flags(id)?.contains(RecordFlags::DIRECTORY) {
                    "/"
                } else {
                    ""
                };
                println!("{:>10}  {}{}", id, name, marker);
            }
        }
        ("ls", []) => {
            for id in store.roots()? {
                println!("{:>10}  {}", id, store.path_of(id)?);
            }
        }
        ("find", [name]) => {
            for id in store.files_named(name)? {
                println!("{:>10}  {}", id, store.path_of(id)?);
            }
        }
        ("mkdir", [path]) => {
            let id = create(&store, path, RecordFlags::DIRECTORY)?;
            println!("{}", id);
        }
        ("touch", [path]) => {
            let id = create(&store, path, RecordFlags::empty())?;
            println!("{}", id);
        }
        ("rm", [path]) => {
            let id = resolve(&store, path)?;
            println!("deleted {} entities", store.delete(id)?);
        }
        (other, _) => bail!("Unknown command or wrong arguments: {}", other),
    }

    store.close()
}

fn resolve(store: &VfsStore, path: &str) -> Result<u32> {
    store
        .resolve_path(path)?
        .ok_or_else(|| eyre!("no such entity: {}", path))
}

/// Creates the last component of `path`, creating missing parent
/// directories (and the root) on the way.
fn create(store: &VfsStore, path: &str, flags: RecordFlags) -> Result<u32> {
    let components: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
    let Some((last, parents)) = components.split_last() else {
        bail!("empty path");
    };
    if parents.is_empty() {
        if !flags.contains(RecordFlags::DIRECTORY) {
            bail!("only directories can be created at the top level");
        }
        return store.create_root(last);
    }

    let mut current = match store.root_id(parents[0])? {
        Some(id) => id,
        None => store.create_root(parents[0])?,
    };
    for component in &parents[1..] {
        current = match store.find_child(current, component)? {
            Some(id) => id,
            None => store.create_child(current, component, RecordFlags::DIRECTORY)?,
        };
    }
    store.create_child(current, last, flags)
}

fn print_stats(store: &VfsStore) -> Result<()> {
    let stats = store.stats()?;
    println!("root:              {}", store.path().display());
    println!("records:           {}", stats.records.allocated);
    println!("free records:      {}", stats.records.free);
    println!("names:             {}", stats.names);
    println!("global mod count:  {}", stats.global_mod_count);
    println!("attribute blobs:   {}", stats.attributes.blobs);
    println!("attribute bytes:   {}", stats.attributes.total_bytes);
    println!("garbage bytes:     {}", stats.attributes.garbage_bytes);
    Ok(())
}

fn print_usage() {
    println!(
        r#"vfstore {} - file-system metadata store

USAGE:
    vfstore [OPTIONS] <ROOT> <COMMAND> [ARGS]

COMMANDS:
    stats              Print record, name and attribute counters
    ls [PATH]          List roots, or the children of PATH
    find <NAME>        Print every entity named NAME
    mkdir <PATH>       Create a directory and any missing parents
    touch <PATH>       Create a file and any missing parents
    rm <PATH>          Delete PATH and everything below it

OPTIONS:
    --store-version N  Expected store version (default 1); a mismatch rebuilds
    -h, --help         Show this help message
    -v, --version      Show version information

Set RUST_LOG (e.g. RUST_LOG=vfstore=debug) to see logs on stderr."#,
        env!("CARGO_PKG_VERSION")
    );
}
