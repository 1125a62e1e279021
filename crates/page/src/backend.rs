//! In-memory and plain-file [`PageBackend`] implementations.
//!
//! Grounded on `llfs_log::backend`'s `InMemoryLogBackend`/`FileLogBackend`
//! split, generalized from a growable byte stream to a fixed `page_count *
//! page_size` array of slots addressed by physical index rather than byte
//! offset.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use llfs_common::PageBackend;

/// An in-memory page backend: `page_count` fixed-size slots behind one
/// mutex, each slot zeroed until first written.
pub struct InMemoryPageBackend {
    page_size: usize,
    page_count: u32,
    slots: Mutex<Vec<Vec<u8>>>,
}

impl InMemoryPageBackend {
    pub fn new(page_size: usize, page_count: u32) -> Self {
        let slots = vec![vec![0u8; page_size]; page_count as usize];
        Self {
            page_size,
            page_count,
            slots: Mutex::new(slots),
        }
    }
}

#[async_trait]
impl PageBackend for InMemoryPageBackend {
    async fn read(&self, index: u32, page_size: usize) -> std::io::Result<Vec<u8>> {
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(index as usize).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "physical index out of range")
        })?;
        debug_assert_eq!(slot.len(), page_size);
        Ok(slot.clone())
    }

    async fn write(&self, index: u32, bytes: &[u8]) -> std::io::Result<()> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(index as usize).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "physical index out of range")
        })?;
        slot.copy_from_slice(bytes);
        Ok(())
    }

    async fn drop_page(&self, index: u32) -> std::io::Result<()> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(index as usize) {
            slot.iter_mut().for_each(|b| *b = 0);
        }
        Ok(())
    }

    async fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }
}

/// A page backend backed by a single plain file, pre-sized to
/// `page_count * page_size` bytes, each physical index addressed by a
/// fixed `index * page_size` byte offset.
pub struct FilePageBackend {
    path: PathBuf,
    page_size: usize,
    page_count: u32,
    file: Mutex<File>,
}

impl FilePageBackend {
    pub fn open(path: &Path, page_size: usize, page_count: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let total = page_size as u64 * page_count as u64;
        file.set_len(total.max(file.metadata()?.len()))?;
        Ok(Self {
            path: path.to_path_buf(),
            page_size,
            page_count,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PageBackend for FilePageBackend {
    async fn read(&self, index: u32, page_size: usize) -> std::io::Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(index as u64 * self.page_size as u64))?;
        let mut buf = vec![0u8; page_size];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    async fn write(&self, index: u32, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(index as u64 * self.page_size as u64))?;
        file.write_all(bytes)
    }

    async fn drop_page(&self, index: u32) -> std::io::Result<()> {
        self.write(index, &vec![0u8; self.page_size]).await
    }

    async fn flush(&self) -> std::io::Result<()> {
        let file = self.file.lock().unwrap();
        file.sync_all()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_write_then_read() {
        let backend = InMemoryPageBackend::new(512, 4);
        backend.write(2, &[7u8; 512]).await.unwrap();
        let got = backend.read(2, 512).await.unwrap();
        assert_eq!(got, vec![7u8; 512]);
        assert_eq!(backend.read(0, 512).await.unwrap(), vec![0u8; 512]);
    }

    #[tokio::test]
    async fn drop_zeroes_the_slot() {
        let backend = InMemoryPageBackend::new(512, 2);
        backend.write(0, &[9u8; 512]).await.unwrap();
        backend.drop_page(0).await.unwrap();
        assert_eq!(backend.read(0, 512).await.unwrap(), vec![0u8; 512]);
    }

    #[tokio::test]
    async fn file_backend_roundtrips() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let backend = FilePageBackend::open(tmp.path(), 512, 4).unwrap();
        backend.write(3, &[1u8; 512]).await.unwrap();
        assert_eq!(backend.read(3, 512).await.unwrap(), vec![1u8; 512]);
        assert_eq!(backend.page_count(), 4);
    }
}
