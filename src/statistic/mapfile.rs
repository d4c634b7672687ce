//! File mapping primitive for persisted counters
//!
//! Opens (creating if needed) the file, takes an advisory write lock over the
//! mapped range where the platform supports it, sizes the file and maps it
//! shared read-write. Dropping a `MappedFile` flushes and unmaps the region
//! before closing the descriptor, which also releases the lock.

use crate::{Error, Result};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use tracing::debug;

/// A file region mapped read-write for the lifetime of the value
#[derive(Debug)]
pub struct MappedFile {
    // Field order matters: the mapping must go before the file closes.
    mmap: MmapMut,
    _file: File,
}

impl MappedFile {
    /// Map exactly `size` bytes of `path`
    pub fn map(path: &Path, size: usize) -> Result<Self> {
        let file = open(path)
            .map_err(|e| Error::persistence(format!("open {}: {}", path.display(), e)))?;

        lock_region(&file, size)
            .map_err(|e| Error::persistence(format!("lock {}: {}", path.display(), e)))?;

        resize(&file, size)
            .map_err(|e| Error::persistence(format!("truncate {}: {}", path.display(), e)))?;

        // SAFETY: the file is locked against other cooperating processes and
        // only ever accessed through atomics once mapped.
        let mmap = unsafe { memmap2::MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| Error::persistence(format!("map {}: {}", path.display(), e)))?;

        Ok(MappedFile { mmap, _file: file })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// Write dirty pages back to the file
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Err(e) = self.mmap.flush() {
            debug!("Flush mapped statistics failed: {}", e);
        }
    }
}

#[cfg(unix)]
fn open(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

#[cfg(unix)]
fn lock_region(file: &File, size: usize) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: an all-zero flock is a valid value for every field.
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_WRLCK as _;
    lock.l_whence = libc::SEEK_SET as _;
    lock.l_start = 0;
    lock.l_len = size as libc::off_t;

    // SAFETY: the descriptor is open for the duration of the call and `lock`
    // outlives it.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock as *const libc::flock) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_region(_file: &File, _size: usize) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn resize(file: &File, size: usize) -> io::Result<()> {
    file.set_len(size as u64)
}

#[cfg(not(unix))]
fn resize(file: &File, size: usize) -> io::Result<()> {
    if file.metadata()?.len() != size as u64 {
        file.set_len(size as u64)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_creates_sized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statistics.dat");

        let mapped = MappedFile::map(&path, 48).unwrap();
        assert_eq!(mapped.len(), 48);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 48);
    }

    #[test]
    fn test_map_truncates_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statistics.dat");
        std::fs::write(&path, vec![0xAB; 100]).unwrap();

        let mapped = MappedFile::map(&path, 48).unwrap();
        drop(mapped);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 48);
    }

    #[test]
    fn test_map_writes_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statistics.dat");

        let mut mapped = MappedFile::map(&path, 8).unwrap();
        // SAFETY: the mapping is 8 bytes long.
        unsafe { std::ptr::write_bytes(mapped.as_mut_ptr(), 0x5A, 8) };
        drop(mapped);

        assert_eq!(std::fs::read(&path).unwrap(), vec![0x5A; 8]);
    }

    #[test]
    fn test_map_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("statistics.dat");

        let err = MappedFile::map(&path, 48).unwrap_err();
        assert!(matches!(err, Error::Persistence(ref msg) if msg.starts_with("open ")));
    }
}
