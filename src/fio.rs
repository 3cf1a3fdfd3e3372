//! Module implement positioned byte I/O over a single OS file.
//!
//! Every read and write names an absolute byte position, there is no
//! implicit cursor. Short reads are reported to the caller as a count,
//! never as an error; writes either cover the requested range or fail.

use log::debug;

use std::{
    ffi, fmt, fs,
    io::{Read, Seek, SeekFrom, Write},
    path, result,
};

use crate::{lock, Error, Result};

/// Sharing mode for an open file.
///
/// `DenyNone` opens shared read-write and is the default everywhere.
/// `DenyReadWrite` opens the file for exclusive read-only use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessMode {
    DenyNone,
    DenyReadWrite,
}

impl Default for AccessMode {
    fn default() -> AccessMode {
        AccessMode::DenyNone
    }
}

/// Handle over one OS file, all I/O explicitly positioned.
pub struct FileHandle {
    location: ffi::OsString,
    key: String,
    fd: fs::File,
    read_only: bool,
    temp: bool,
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "FileHandle<{:?}>", self.location)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        lock::cleanup(self);
        if self.temp {
            fs::remove_file(&self.location).ok();
        }
        debug!(target: "fio", "closed {:?}", self.location);
    }
}

impl FileHandle {
    /// Open an existing file. `DenyReadWrite` opens read-only.
    pub fn open(file: &ffi::OsStr, mode: AccessMode) -> Result<FileHandle> {
        let read_only = mode == AccessMode::DenyReadWrite;
        let fd = {
            let mut opts = fs::OpenOptions::new();
            opts.read(true).write(!read_only);
            err_at!(IoOpen, opts.open(file), "open {:?}", file)?
        };

        debug!(target: "fio", "opened {:?} mode:{:?}", file, mode);

        Ok(FileHandle {
            location: file.to_os_string(),
            key: lock_key(file),
            fd,
            read_only,
            temp: false,
        })
    }

    /// Create a new file of length zero. With `safety` an existing
    /// file is never overwritten. With `temp` the file is removed when
    /// the handle is dropped.
    pub fn create(file: &ffi::OsStr, safety: bool, temp: bool) -> Result<FileHandle> {
        if safety && path::Path::new(file).exists() {
            err_at!(CreateExists, msg: "file {:?} exists", file)?;
        }

        let fd = {
            let mut opts = fs::OpenOptions::new();
            opts.read(true).write(true).create(true).truncate(true);
            err_at!(IoOpen, opts.open(file), "create {:?}", file)?
        };

        debug!(target: "fio", "created {:?} temp:{}", file, temp);

        Ok(FileHandle {
            location: file.to_os_string(),
            key: lock_key(file),
            fd,
            read_only: false,
            temp,
        })
    }

    /// Read upto `buf.len()` bytes at absolute position `pos`, return
    /// the count actually delivered. A short read is a signal to the
    /// caller, not an error.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        err_at!(IoSeek, self.fd.seek(SeekFrom::Start(pos)))?;

        let mut off = 0;
        while off < buf.len() {
            match err_at!(IoRead, self.fd.read(&mut buf[off..]))? {
                0 => break,
                n => off += n,
            }
        }
        Ok(off)
    }

    /// Write all of `buf` at absolute position `pos`, extending the
    /// file when the range lies past its end. Never a partial success.
    pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            err_at!(IoWrite, msg: "file {:?} is read-only", self.location)?;
        }
        err_at!(IoSeek, self.fd.seek(SeekFrom::Start(pos)))?;
        err_at!(IoWrite, self.fd.write_all(buf), "write {:?}", self.location)?;
        Ok(())
    }

    /// Make every completed write durable.
    pub fn flush(&mut self) -> Result<()> {
        err_at!(IoWrite, self.fd.sync_all(), "sync {:?}", self.location)
    }

    pub fn truncate(&mut self, len: u64) -> Result<()> {
        if self.read_only {
            err_at!(IoWrite, msg: "file {:?} is read-only", self.location)?;
        }
        err_at!(IoWrite, self.fd.set_len(len), "truncate {:?}", self.location)
    }

    pub fn len(&self) -> Result<u64> {
        let m = err_at!(IoRead, self.fd.metadata())?;
        Ok(m.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn to_location(&self) -> ffi::OsString {
        self.location.clone()
    }

    /// Registry key identifying this file across handles.
    pub fn to_lock_key(&self) -> String {
        self.key.clone()
    }

    pub fn as_fd(&self) -> &fs::File {
        &self.fd
    }
}

// Canonicalize so that two handles on the same file agree on the key,
// fall back to the lexical path for files not yet on disk.
fn lock_key(file: &ffi::OsStr) -> String {
    match fs::canonicalize(file) {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => path::Path::new(file).to_string_lossy().to_string(),
    }
}

#[cfg(test)]
#[path = "fio_test.rs"]
mod fio_test;
