//! Positioned I/O over a backing file or an in-memory region.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{Result, VellumError};

/// Trait for positioned reads and writes against a backing store.
///
/// All offsets are absolute. Reads past the end of the store fail with an
/// `UnexpectedEof` I/O error rather than zero-filling; the pager decides
/// what a short store means.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes starting at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` starting at `off`, extending the store if needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Forces written data durable.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the store in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns `true` when the store is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the store to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod positioned {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::unix::fs::FileExt;

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read_at reached EOF"));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod positioned {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::windows::fs::FileExt;

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "seek_read reached EOF"));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Positioned file I/O over `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an existing file handle.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(VellumError::from)?;
        Ok(Self::new(file))
    }

    fn file(&self) -> &File {
        &self.inner
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        positioned::read_exact(self.file(), off, dst).map_err(VellumError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        positioned::write_all(self.file(), off, src).map_err(VellumError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(VellumError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata().map_err(VellumError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(VellumError::from)
    }
}

/// In-memory region implementing [`FileIo`], used for memory-only
/// environments and tests. Durability calls are no-ops.
#[derive(Clone, Default)]
pub struct MemIo {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemIo {
    /// Creates an empty in-memory region.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileIo for MemIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let buf = self.buf.lock();
        let start = off as usize;
        let end = start
            .checked_add(dst.len())
            .ok_or(VellumError::Invalid("read offset overflow"))?;
        if end > buf.len() {
            return Err(VellumError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of memory region",
            )));
        }
        dst.copy_from_slice(&buf[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut buf = self.buf.lock();
        let start = off as usize;
        let end = start
            .checked_add(src.len())
            .ok_or(VellumError::Invalid("write offset overflow"))?;
        if end > buf.len() {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.buf.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.buf.lock().resize(len as usize, 0);
        Ok(())
    }
}
