//! Positional block I/O on segment files.

use parking_lot::Mutex;
use quarry_common::{QuarryError, Result};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// File access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Read-only. Writes and resizes are rejected.
    ReadOnly,
    /// Read-write. The file is created if it does not exist.
    ReadWrite,
}

/// A page-granular file accessed with positional reads and writes.
///
/// All I/O goes through `read_at`/`write_at`, so concurrent accesses to
/// disjoint ranges never share a file cursor and are atomic with respect to
/// each other. Resizes are serialized by an internal mutex.
pub struct PagedFile {
    mode: FileMode,
    file: File,
    resize_lock: Mutex<()>,
}

impl PagedFile {
    /// Opens a file with the given mode. Existing files are never truncated.
    pub fn open(path: &Path, mode: FileMode) -> Result<Self> {
        let file = match mode {
            FileMode::ReadOnly => OpenOptions::new().read(true).open(path)?,
            FileMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?,
        };
        Ok(Self {
            mode,
            file,
            resize_lock: Mutex::new(()),
        })
    }

    /// Opens an anonymous temporary file in read-write mode.
    ///
    /// The backing file is unlinked immediately after creation, so the disk
    /// space is reclaimed as soon as the handle is dropped.
    pub fn temporary() -> Result<Self> {
        Ok(Self {
            mode: FileMode::ReadWrite,
            file: tempfile::tempfile()?,
            resize_lock: Mutex::new(()),
        })
    }

    /// Returns the mode this file was opened with.
    pub fn mode(&self) -> FileMode {
        self.mode
    }

    /// Returns the current size of the file in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Returns true if the file holds no bytes.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Resizes the file to `new_len` bytes.
    ///
    /// Shrinking cuts the file off at the end; growing appends zero bytes.
    pub fn resize(&self, new_len: u64) -> Result<()> {
        if self.mode == FileMode::ReadOnly {
            return Err(QuarryError::ReadOnlyFile);
        }
        let _guard = self.resize_lock.lock();
        self.file.set_len(new_len)?;
        Ok(())
    }

    /// Reads `buf.len()` bytes starting at `offset`.
    ///
    /// Bytes past the end of the file read as zero, so callers may read a
    /// page that has never been written.
    pub fn read_block(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => {
                    // End of file: the remainder reads as zero.
                    buf[done..].fill(0);
                    return Ok(());
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Writes `buf` starting at `offset`, extending the file if necessary.
    pub fn write_block(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.mode == FileMode::ReadOnly {
            return Err(QuarryError::ReadOnlyFile);
        }
        let mut done = 0;
        while done < buf.len() {
            match self.file.write_at(&buf[done..], offset + done as u64) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "failed to write whole block",
                    )
                    .into())
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Flushes file contents and metadata to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_temporary_file_starts_empty() {
        let file = PagedFile::temporary().unwrap();
        assert_eq!(file.mode(), FileMode::ReadWrite);
        assert_eq!(file.len().unwrap(), 0);
        assert!(file.is_empty().unwrap());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let file = PagedFile::temporary().unwrap();

        let data = [0xABu8; 512];
        file.write_block(0, &data).unwrap();

        let mut out = [0u8; 512];
        file.read_block(0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_write_past_end_extends() {
        let file = PagedFile::temporary().unwrap();

        file.write_block(4096, &[0x11u8; 100]).unwrap();
        assert_eq!(file.len().unwrap(), 4196);
    }

    #[test]
    fn test_read_past_end_zero_pads() {
        let file = PagedFile::temporary().unwrap();
        file.write_block(0, &[0xFFu8; 10]).unwrap();

        let mut out = [0xAAu8; 20];
        file.read_block(0, &mut out).unwrap();
        assert_eq!(&out[..10], &[0xFFu8; 10]);
        assert_eq!(&out[10..], &[0u8; 10]);
    }

    #[test]
    fn test_read_entirely_past_end() {
        let file = PagedFile::temporary().unwrap();

        let mut out = [0xAAu8; 64];
        file.read_block(1 << 20, &mut out).unwrap();
        assert_eq!(out, [0u8; 64]);
    }

    #[test]
    fn test_resize_grow_and_shrink() {
        let file = PagedFile::temporary().unwrap();

        file.resize(1024).unwrap();
        assert_eq!(file.len().unwrap(), 1024);

        // Growing appends zeroes
        let mut out = [0xAAu8; 1024];
        file.read_block(0, &mut out).unwrap();
        assert_eq!(out, [0u8; 1024]);

        file.resize(100).unwrap();
        assert_eq!(file.len().unwrap(), 100);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");

        {
            let file = PagedFile::open(&path, FileMode::ReadWrite).unwrap();
            file.write_block(0, &[1, 2, 3]).unwrap();
        }

        let file = PagedFile::open(&path, FileMode::ReadOnly).unwrap();
        assert!(matches!(
            file.write_block(0, &[4, 5, 6]),
            Err(QuarryError::ReadOnlyFile)
        ));
        assert!(matches!(file.resize(0), Err(QuarryError::ReadOnlyFile)));

        let mut out = [0u8; 3];
        file.read_block(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_open_existing_keeps_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("7");

        {
            let file = PagedFile::open(&path, FileMode::ReadWrite).unwrap();
            file.write_block(0, &[9u8; 8]).unwrap();
            file.sync().unwrap();
        }

        let file = PagedFile::open(&path, FileMode::ReadWrite).unwrap();
        assert_eq!(file.len().unwrap(), 8);
        let mut out = [0u8; 8];
        file.read_block(0, &mut out).unwrap();
        assert_eq!(out, [9u8; 8]);
    }

    #[test]
    fn test_concurrent_disjoint_writes() {
        use std::sync::Arc;

        let file = Arc::new(PagedFile::temporary().unwrap());
        file.resize(8 * 1024).unwrap();

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let file = Arc::clone(&file);
            handles.push(std::thread::spawn(move || {
                let block = [i; 1024];
                file.write_block(i as u64 * 1024, &block).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..8u8 {
            let mut out = [0u8; 1024];
            file.read_block(i as u64 * 1024, &mut out).unwrap();
            assert_eq!(out, [i; 1024]);
        }
    }
}
