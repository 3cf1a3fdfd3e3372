//! Module implement the process-wide lock registry.
//!
//! The registry mediates file-level and record-range locks across every
//! cursor in this process and coordinates them with the OS advisory
//! lock. Acquisition is always non-blocking, contention fails fast with
//! [Error::LockBusy] and the caller decides whether to retry; the
//! configured lock timeout is a caller-side retry budget only.
//!
//! A record-range lock acquires the underlying advisory file lock and
//! records the intended byte range in the registry, so coverage can be
//! reasoned about in-process without byte-range granularity from the OS.

use fs2::FileExt;
use lazy_static::lazy_static;
use log::error;

use std::{collections::HashMap, io, sync::RwLock};

use crate::{fio::FileHandle, Error, Result};

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum LockKey {
    File(String),
    Range(String, u64),
}

impl LockKey {
    fn owner(&self) -> &str {
        match self {
            LockKey::File(key) => key,
            LockKey::Range(key, _) => key,
        }
    }
}

// Range length for file locks is zero, the key already says it all.
lazy_static! {
    static ref REGISTRY: RwLock<HashMap<LockKey, u64>> = RwLock::new(HashMap::new());
}

/// Acquire an exclusive lock over the whole file. Fails with
/// [Error::LockBusy] when any lock on the file is already held,
/// whether by this process or another.
pub fn lock_file(fh: &FileHandle) -> Result<()> {
    let key = LockKey::File(fh.to_lock_key());

    let mut registry = REGISTRY.write().unwrap();
    if registry.contains_key(&key) {
        err_at!(LockBusy, msg: "file {:?} locked in-process", fh.to_location())?;
    }
    os_lock(fh)?;
    registry.insert(key, 0);

    Ok(())
}

/// Release the file lock taken by [lock_file].
pub fn unlock_file(fh: &FileHandle) -> Result<()> {
    let key = LockKey::File(fh.to_lock_key());

    let mut registry = REGISTRY.write().unwrap();
    if registry.remove(&key).is_none() {
        err_at!(LockBusy, msg: "file {:?} not locked", fh.to_location())?;
    }
    os_unlock_if_last(fh, &registry)
}

/// Acquire a record-range lock, keyed by `(file, start)`.
pub fn lock_range(fh: &FileHandle, start: u64, len: u64) -> Result<()> {
    let key = LockKey::Range(fh.to_lock_key(), start);

    let mut registry = REGISTRY.write().unwrap();
    if registry.contains_key(&key) {
        err_at!(LockBusy, msg: "range {:?}@{} locked in-process", fh.to_location(), start)?;
    }
    os_lock(fh)?;
    registry.insert(key, len);

    Ok(())
}

/// Release the range lock taken by [lock_range].
pub fn unlock_range(fh: &FileHandle, start: u64) -> Result<()> {
    let key = LockKey::Range(fh.to_lock_key(), start);

    let mut registry = REGISTRY.write().unwrap();
    if registry.remove(&key).is_none() {
        err_at!(LockBusy, msg: "range {:?}@{} not locked", fh.to_location(), start)?;
    }
    os_unlock_if_last(fh, &registry)
}

/// Whether the registry holds a range lock at `start` for this file.
pub fn is_locked(fh: &FileHandle, start: u64) -> bool {
    let registry = REGISTRY.read().unwrap();
    registry.contains_key(&LockKey::Range(fh.to_lock_key(), start))
}

/// Lock a set of files as one unit, the data file and every attached
/// index file. Atomic, on partial failure every lock acquired by this
/// call is rolled back before the error is returned.
pub fn lock_all(files: &[&FileHandle]) -> Result<()> {
    let mut locked: Vec<&FileHandle> = vec![];
    for fh in files.iter() {
        match lock_file(fh) {
            Ok(()) => locked.push(fh),
            Err(err) => {
                for fh in locked.into_iter() {
                    unlock_file(fh).ok();
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Release a set of locks taken by [lock_all]. Continues past
/// individual failures and reports the last one.
pub fn unlock_all(files: &[&FileHandle]) -> Result<()> {
    let mut last: Result<()> = Ok(());
    for fh in files.iter() {
        if let Err(err) = unlock_file(fh) {
            last = Err(err);
        }
    }
    last
}

/// Drop every registry entry owned by this file and release the OS
/// lock. Called from file close, failures are logged and swallowed.
pub fn cleanup(fh: &FileHandle) {
    let owner = fh.to_lock_key();

    let mut registry = match REGISTRY.write() {
        Ok(registry) => registry,
        Err(err) => {
            error!(target: "lock", "cleanup {:?} poisoned registry {}", fh.to_location(), err);
            return;
        }
    };
    let before = registry.len();
    registry.retain(|key, _| key.owner() != owner.as_str());
    if registry.len() < before {
        fh.as_fd().unlock().ok();
    }
}

fn os_lock(fh: &FileHandle) -> Result<()> {
    match fh.as_fd().try_lock_exclusive() {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            err_at!(LockBusy, msg: "file {:?} locked elsewhere", fh.to_location())
        }
        Err(err) => err_at!(IoOpen, Err(err), "lock {:?}", fh.to_location()),
    }
}

// The advisory lock covers the whole file, release it only when the
// last registry entry for the file is gone.
fn os_unlock_if_last(fh: &FileHandle, registry: &HashMap<LockKey, u64>) -> Result<()> {
    let owner = fh.to_lock_key();
    if registry.keys().any(|key| key.owner() == owner.as_str()) {
        return Ok(());
    }
    err_at!(IoClose, fh.as_fd().unlock(), "unlock {:?}", fh.to_location())
}

#[cfg(test)]
#[path = "lock_test.rs"]
mod lock_test;
