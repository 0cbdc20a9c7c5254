// src/storage.rs
// RocksDB-backed persistence helpers shared by the per-node stores.
//
// Every durable store (ledger, tasks, capsules, ratings) lives in one
// database keyed by string prefixes. Each store has a single writer;
// these helpers do not add locking of their own.

use rocksdb::{Options, WriteOptions, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

/// Shared database handle (Arc for cheap cloning across workers).
pub type MeshDb = Arc<DB>;

/// Open the node database, retrying with backoff while another process
/// releases the lock. Exits the process if the database stays unavailable;
/// a node without durable storage must not run (no partial-apply allowed).
pub fn open_db(path: &str) -> MeshDb {
    try_open_db(path).unwrap_or_else(|e| {
        eprintln!("FATAL: failed to open database at '{}': {}", path, e);
        eprintln!("  another node instance may hold the lock, or the disk is full");
        std::process::exit(1);
    })
}

pub fn try_open_db(path: &str) -> Result<MeshDb, String> {
    let mut attempt = 0u32;
    let max_attempts = 8u32;
    let mut wait = 250u64;

    loop {
        match open_internal(path) {
            Ok(db) => return Ok(Arc::new(db)),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(format!(
                        "failed to open database at '{}' after {} attempts: {}",
                        path, attempt, e
                    ));
                }
                tracing::warn!(path, attempt, error = %e, "open_db retry");
                sleep(Duration::from_millis(wait));
                wait = std::cmp::min(wait * 2, 2000);
            }
        }
    }
}

fn open_internal(path: &str) -> Result<DB, rocksdb::Error> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.increase_parallelism(num_cpus::get() as i32);
    opts.set_write_buffer_size(16 * 1024 * 1024);
    opts.set_max_open_files(256);
    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    DB::open(&opts, path)
}

/// Put a serializable value under a string key.
pub fn put<V: Serialize>(db: &MeshDb, key: &str, val: &V) -> Result<(), String> {
    let bytes = serde_json::to_vec(val).map_err(|e| e.to_string())?;
    db.put(key.as_bytes(), bytes).map_err(|e| e.to_string())
}

/// Put with a synced write. Used at fsync boundaries: after each accepted
/// ledger entry and after each task mutation.
pub fn put_sync<V: Serialize>(db: &MeshDb, key: &str, val: &V) -> Result<(), String> {
    let bytes = serde_json::to_vec(val).map_err(|e| e.to_string())?;
    let mut wo = WriteOptions::default();
    wo.set_sync(true);
    db.put_opt(key.as_bytes(), bytes, &wo).map_err(|e| e.to_string())
}

/// Get and deserialize the value stored under a key.
pub fn get<T: DeserializeOwned>(db: &MeshDb, key: &str) -> Result<Option<T>, String> {
    match db.get(key.as_bytes()).map_err(|e| e.to_string())? {
        Some(bytes) => {
            let v = serde_json::from_slice::<T>(&bytes).map_err(|e| e.to_string())?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

pub fn delete(db: &MeshDb, key: &str) -> Result<(), String> {
    db.delete(key.as_bytes()).map_err(|e| e.to_string())
}

pub fn exists(db: &MeshDb, key: &str) -> bool {
    db.get(key.as_bytes()).ok().flatten().is_some()
}

/// Iterate values whose keys start with `prefix`, in key order.
pub fn iter_prefix<T: DeserializeOwned>(db: &MeshDb, prefix: &str) -> Result<Vec<T>, String> {
    let mut out = Vec::new();
    let prefix_bytes = prefix.as_bytes();
    for item in db.prefix_iterator(prefix_bytes) {
        let (k, v) = item.map_err(|e| e.to_string())?;
        if !k.starts_with(prefix_bytes) {
            break;
        }
        out.push(serde_json::from_slice::<T>(&v).map_err(|e| e.to_string())?);
    }
    Ok(out)
}

/// Iterate values in key order starting at `start_key`, stopping when keys
/// leave `prefix` or `max` items were read.
pub fn iter_from<T: DeserializeOwned>(
    db: &MeshDb,
    start_key: &str,
    prefix: &str,
    max: usize,
) -> Result<Vec<T>, String> {
    use rocksdb::{Direction, IteratorMode};
    let mut out = Vec::new();
    let prefix_bytes = prefix.as_bytes();
    let iter = db.iterator(IteratorMode::From(start_key.as_bytes(), Direction::Forward));
    for item in iter {
        let (k, v) = item.map_err(|e| e.to_string())?;
        if !k.starts_with(prefix_bytes) {
            break;
        }
        if out.len() >= max {
            break;
        }
        out.push(serde_json::from_slice::<T>(&v).map_err(|e| e.to_string())?);
    }
    Ok(out)
}

/// Store a raw u64 counter (little-endian bytes, not JSON).
pub fn put_counter(db: &MeshDb, key: &str, value: u64) -> Result<(), String> {
    let mut wo = WriteOptions::default();
    wo.set_sync(true);
    db.put_opt(key.as_bytes(), value.to_le_bytes(), &wo)
        .map_err(|e| e.to_string())
}

pub fn get_counter(db: &MeshDb, key: &str) -> Result<u64, String> {
    match db.get(key.as_bytes()).map_err(|e| e.to_string())? {
        Some(bytes) => {
            let arr: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| "invalid counter bytes".to_string())?;
            Ok(u64::from_le_bytes(arr))
        }
        None => Ok(0),
    }
}
