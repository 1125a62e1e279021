//! In-memory and plain-file [`LogBackend`] implementations.
//!
//! Grounded on the teacher's `wal::writer`/`wal::reader` pair, which drive a
//! `std::fs::File` directly rather than through `tokio::fs`; this keeps the
//! same blocking-I/O-under-a-std-Mutex shape and generalizes it behind the
//! capability trait so `LogDevice` can also run entirely in memory for
//! tests.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use llfs_common::LogBackend;

/// An in-memory log backend — a growable byte buffer behind a mutex.
#[derive(Default)]
pub struct InMemoryLogBackend {
    bytes: Mutex<Vec<u8>>,
}

impl InMemoryLogBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogBackend for InMemoryLogBackend {
    async fn read(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let bytes = self.bytes.lock().unwrap();
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "offset overflow"))?;
        if end > bytes.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read [{start}, {end}) exceeds backend size {}", bytes.len()),
            ));
        }
        Ok(bytes[start..end].to_vec())
    }

    async fn write(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut bytes = self.bytes.lock().unwrap();
        let start = offset as usize;
        let end = start + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }

    async fn size(&self) -> std::io::Result<u64> {
        Ok(self.bytes.lock().unwrap().len() as u64)
    }
}

/// A log backend backed by a single plain file, opened for read+write.
pub struct FileLogBackend {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileLogBackend {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogBackend for FileLogBackend {
    async fn read(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    async fn write(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    async fn flush(&self) -> std::io::Result<()> {
        let file = self.file.lock().unwrap();
        file.sync_all()
    }

    async fn size(&self) -> std::io::Result<u64> {
        let file = self.file.lock().unwrap();
        Ok(file.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_write_then_read() {
        let backend = InMemoryLogBackend::new();
        backend.write(0, b"hello").await.unwrap();
        backend.write(5, b" world").await.unwrap();
        assert_eq!(backend.size().await.unwrap(), 11);
        assert_eq!(backend.read(0, 11).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn in_memory_read_past_end_fails() {
        let backend = InMemoryLogBackend::new();
        backend.write(0, b"abc").await.unwrap();
        assert!(backend.read(0, 10).await.is_err());
    }

    #[tokio::test]
    async fn file_backend_roundtrips() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let backend = FileLogBackend::open(tmp.path()).unwrap();
        backend.write(0, b"persisted").await.unwrap();
        backend.flush().await.unwrap();
        assert_eq!(backend.read(0, 9).await.unwrap(), b"persisted");
        assert_eq!(backend.size().await.unwrap(), 9);
    }
}
