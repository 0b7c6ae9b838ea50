//! Byte-storage port
//!
//! The engine never touches files directly; it drives a [`Storage`]
//! implementation through explicit seek/read/write calls. The current
//! read/write position is never assumed preserved between engine operations,
//! so every operation seeks before touching bytes.
//!
//! Two backends are provided: [`FileStorage`] over a regular file and
//! [`MemoryStorage`] over a growable buffer. The memory backend doubles as
//! the stream-reader/stream-writer buffer: already-processed prefixes can be
//! discarded while positions keep counting from the start of the stream.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// Seekable byte storage used by the container engine
///
/// Positions are absolute stream offsets. Implementations are not required
/// to preserve the cursor across unrelated calls; the engine always seeks.
pub trait Storage {
    /// Position the cursor at an absolute offset
    fn seek(&mut self, pos: u64) -> Result<()>;

    /// Read up to `buf.len()` bytes at the cursor; returns bytes read (0 = EOF)
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write all bytes at the cursor
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Flush buffered writes; `final_write` signals the last sync before close
    fn sync(&mut self, final_write: bool) -> Result<()>;

    /// Total length of the stream in bytes (including any discarded prefix)
    fn max_pos(&self) -> u64;

    /// First offset still resident (non-zero after prefix discards)
    fn base_pos(&self) -> u64 {
        0
    }

    /// Detach and return buffered bytes (buffer-mode backends only)
    fn take_buffer(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Drop resident bytes before `pos` to bound memory (buffer-mode only)
    fn discard_before(&mut self, _pos: u64) {}
}

/// Storage backend over a regular file
pub struct FileStorage {
    file: File,
    len: u64,
}

impl FileStorage {
    /// Create a new file, failing if it already exists
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        debug!("Creating container file at {:?}", path.as_ref());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(FileStorage { file, len: 0 })
    }

    /// Open an existing file for reading and writing
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        debug!("Opening container file at {:?}", path.as_ref());
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(FileStorage { file, len })
    }
}

impl Storage for FileStorage {
    fn seek(&mut self, pos: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let pos = self.file.stream_position()?;
        self.file.write_all(data)?;
        let end = pos + data.len() as u64;
        if end > self.len {
            self.len = end;
        }
        Ok(())
    }

    fn sync(&mut self, final_write: bool) -> Result<()> {
        if final_write {
            self.file.sync_all()?;
        } else {
            self.file.flush()?;
        }
        Ok(())
    }

    fn max_pos(&self) -> u64 {
        self.len
    }
}

/// Storage backend over an in-memory buffer
///
/// `base` tracks how many leading bytes have been discarded; absolute
/// positions remain valid after a discard, reads below `base` simply fail as
/// EOF. Writes may only append or overwrite resident bytes.
#[derive(Default)]
pub struct MemoryStorage {
    data: Vec<u8>,
    base: u64,
    cursor: u64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing byte buffer (e.g. a container received whole)
    pub fn from_vec(data: Vec<u8>) -> Self {
        MemoryStorage {
            data,
            base: 0,
            cursor: 0,
        }
    }

    /// Append bytes at the end of the stream without moving the cursor
    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }
}

impl Storage for MemoryStorage {
    fn seek(&mut self, pos: u64) -> Result<()> {
        self.cursor = pos;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let end = self.base + self.data.len() as u64;
        if self.cursor < self.base || self.cursor >= end {
            return Ok(0);
        }
        let start = (self.cursor - self.base) as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.cursor += n as u64;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.cursor < self.base {
            return Err(crate::error::IfdsError::WriteFailed(
                "position precedes drained stream data".into(),
            ));
        }
        let end = self.base + self.data.len() as u64;
        let mut pos = self.cursor;
        if pos > end {
            // Gap writes land at the end of the stream.
            pos = end;
        }
        let start = (pos - self.base) as usize;
        let overlap = (self.data.len() - start).min(data.len());
        self.data[start..start + overlap].copy_from_slice(&data[..overlap]);
        self.data.extend_from_slice(&data[overlap..]);
        self.cursor = pos + data.len() as u64;
        Ok(())
    }

    fn sync(&mut self, _final_write: bool) -> Result<()> {
        Ok(())
    }

    fn max_pos(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    fn base_pos(&self) -> u64 {
        self.base
    }

    fn take_buffer(&mut self) -> Option<Vec<u8>> {
        let out = std::mem::take(&mut self.data);
        self.base += out.len() as u64;
        Some(out)
    }

    fn discard_before(&mut self, pos: u64) {
        if pos <= self.base {
            return;
        }
        let cut = ((pos - self.base) as usize).min(self.data.len());
        self.data.drain(..cut);
        self.base += cut as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_read_write() {
        let mut mem = MemoryStorage::new();
        mem.seek(0).unwrap();
        mem.write(b"hello world").unwrap();
        assert_eq!(mem.max_pos(), 11);

        mem.seek(6).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(mem.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn memory_storage_overwrite_and_append() {
        let mut mem = MemoryStorage::from_vec(b"abcdef".to_vec());
        mem.seek(4).unwrap();
        mem.write(b"XYZ").unwrap();
        assert_eq!(mem.max_pos(), 7);

        mem.seek(0).unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(mem.read(&mut buf).unwrap(), 7);
        assert_eq!(&buf, b"abcdXYZ");
    }

    #[test]
    fn memory_storage_discard_prefix() {
        let mut mem = MemoryStorage::from_vec(vec![7u8; 100]);
        mem.discard_before(60);
        assert_eq!(mem.base_pos(), 60);
        assert_eq!(mem.max_pos(), 100);

        // Reads below the drained prefix hit EOF.
        mem.seek(10).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(mem.read(&mut buf).unwrap(), 0);

        mem.seek(60).unwrap();
        assert_eq!(mem.read(&mut buf).unwrap(), 4);
    }

    #[test]
    fn file_storage_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("storage.bin");

        let mut fs = FileStorage::create(&path).unwrap();
        fs.seek(0).unwrap();
        fs.write(b"0123456789").unwrap();
        fs.sync(true).unwrap();
        assert_eq!(fs.max_pos(), 10);
        drop(fs);

        let mut fs = FileStorage::open(&path).unwrap();
        assert_eq!(fs.max_pos(), 10);
        fs.seek(3).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"3456");
    }
}
