//! Positioned file I/O.
//!
//! One `FileAccessor` owns one file descriptor. Offsets are bytes from the
//! start of the file; every read and write transfers exactly the requested
//! count or fails. Instances are not shared between threads.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use osprey_common::error::{open_error, StreamError};

/// Advisory access-pattern hint applied when a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheHint {
    #[default]
    Sequential,
    Normal,
    Random,
}

/// Positioned read/write access to one file.
#[derive(Debug)]
pub struct FileAccessor {
    file: Option<File>,
    path: PathBuf,
    read: bool,
    write: bool,
}

impl FileAccessor {
    /// Open an existing file read-only.
    pub fn open_ro(path: &Path, hint: CacheHint) -> Result<Self, StreamError> {
        Self::open_with(path, true, false, false, hint)
    }

    /// Open an existing file write-only.
    pub fn open_wo(path: &Path, hint: CacheHint) -> Result<Self, StreamError> {
        Self::open_with(path, false, true, false, hint)
    }

    /// Open an existing file for reading and writing.
    pub fn open_rw(path: &Path, hint: CacheHint) -> Result<Self, StreamError> {
        Self::open_with(path, true, true, false, hint)
    }

    /// Create (truncating any existing file) and open for read/write.
    pub fn open_rw_new(path: &Path, hint: CacheHint) -> Result<Self, StreamError> {
        Self::open_with(path, true, true, true, hint)
    }

    fn open_with(
        path: &Path,
        read: bool,
        write: bool,
        create: bool,
        hint: CacheHint,
    ) -> Result<Self, StreamError> {
        let file = OpenOptions::new()
            .read(read)
            .write(write)
            .create(create)
            .truncate(create)
            .open(path)
            .map_err(|e| open_error(e, path))?;
        apply_cache_hint(&file, hint);
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            read,
            write,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn file(&mut self) -> Result<&mut File, StreamError> {
        self.file
            .as_mut()
            .ok_or_else(|| StreamError::Access("file accessor is closed".into()))
    }

    /// Read exactly `buf.len()` bytes at `offset`. A short read is an error.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StreamError> {
        if !self.read {
            return Err(StreamError::Access("read on a write-only file".into()));
        }
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Write all of `buf` at `offset`.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), StreamError> {
        if !self.write {
            return Err(StreamError::Access("write on a read-only file".into()));
        }
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    /// Current size of the file in bytes.
    pub fn size(&mut self) -> Result<u64, StreamError> {
        Ok(self.file()?.metadata()?.len())
    }

    /// Shrink or grow the file to exactly `len` bytes.
    pub fn truncate(&mut self, len: u64) -> Result<(), StreamError> {
        if !self.write {
            return Err(StreamError::Access("truncate on a read-only file".into()));
        }
        self.file()?.set_len(len)?;
        Ok(())
    }

    /// Flush buffered writes to the OS.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        if self.write {
            self.file()?.flush()?;
        }
        Ok(())
    }

    /// Close the file. Further operations fail with an access error.
    pub fn close(&mut self) -> Result<(), StreamError> {
        if let Some(mut file) = self.file.take() {
            if self.write {
                file.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn apply_cache_hint(file: &File, hint: CacheHint) {
    use std::os::unix::io::AsRawFd;
    let advice = match hint {
        CacheHint::Sequential => libc::POSIX_FADV_SEQUENTIAL,
        CacheHint::Normal => libc::POSIX_FADV_NORMAL,
        CacheHint::Random => libc::POSIX_FADV_RANDOM,
    };
    // Advisory; ignore the result.
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, advice);
    }
}

#[cfg(not(unix))]
fn apply_cache_hint(_file: &File, _hint: CacheHint) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positioned_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let mut fa = FileAccessor::open_rw_new(&path, CacheHint::Sequential).unwrap();
        fa.write_at(0, b"hello world").unwrap();
        fa.write_at(6, b"there").unwrap();
        let mut buf = [0u8; 11];
        fa.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello there");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileAccessor::open_ro(&dir.path().join("absent"), CacheHint::Normal).unwrap_err();
        assert!(matches!(err, StreamError::NotFound(_)));
    }

    #[test]
    fn test_read_on_write_only_is_access_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        FileAccessor::open_rw_new(&path, CacheHint::Normal)
            .unwrap()
            .write_at(0, b"x")
            .unwrap();
        let mut fa = FileAccessor::open_wo(&path, CacheHint::Normal).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(
            fa.read_at(0, &mut buf).unwrap_err(),
            StreamError::Access(_)
        ));
    }

    #[test]
    fn test_short_read_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let mut fa = FileAccessor::open_rw_new(&path, CacheHint::Normal).unwrap();
        fa.write_at(0, b"abc").unwrap();
        let mut buf = [0u8; 10];
        assert!(matches!(
            fa.read_at(0, &mut buf).unwrap_err(),
            StreamError::Io(_)
        ));
    }

    #[test]
    fn test_truncate_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let mut fa = FileAccessor::open_rw_new(&path, CacheHint::Normal).unwrap();
        fa.write_at(0, &[7u8; 100]).unwrap();
        fa.truncate(10).unwrap();
        assert_eq!(fa.size().unwrap(), 10);
    }

    #[test]
    fn test_use_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let mut fa = FileAccessor::open_rw_new(&path, CacheHint::Normal).unwrap();
        fa.close().unwrap();
        assert!(matches!(
            fa.write_at(0, b"x").unwrap_err(),
            StreamError::Access(_)
        ));
    }
}
