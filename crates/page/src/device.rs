//! Fixed-size random-access page store addressed by [`PageId`] (spec.md
//! §4.3), layered over a [`PageBackend`] the way [`llfs_log::LogDevice`]
//! layers over a [`llfs_common::LogBackend`].

use std::sync::Mutex;

use llfs_common::checksum::crc32_parts;
use llfs_common::{Generation, PageBackend, PageId};
use tracing::instrument;

use crate::error::PageError;

/// `u64 page_id | u32 payload_len | u32 crc32 | payload[] | trailer_crc32`
/// (spec.md §6).
const HEADER_SIZE: usize = 8 + 4 + 4;
const TRAILER_SIZE: usize = 4;

/// Configuration for a [`PageDevice`] (spec.md §3: power-of-two page size
/// `>= 512`).
#[derive(Debug, Clone, Copy)]
pub struct PageDeviceConfig {
    pub page_size: usize,
    pub page_count: u32,
}

impl PageDeviceConfig {
    pub fn validate(&self) -> Result<(), PageError> {
        if self.page_size < llfs_common::MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(PageError::Corruption(format!(
                "page_size {} must be a power of two >= {}",
                self.page_size,
                llfs_common::MIN_PAGE_SIZE
            )));
        }
        Ok(())
    }
}

/// Fixed-size page store; one physical index holds at most one live
/// generation at a time.
pub struct PageDevice {
    device_index: u8,
    backend: Box<dyn PageBackend>,
    page_size: usize,
    /// Live generation per physical index, 0 meaning "never written".
    live_generation: Mutex<Vec<Generation>>,
}

impl PageDevice {
    pub fn create(device_index: u8, backend: Box<dyn PageBackend>, config: PageDeviceConfig) -> Result<Self, PageError> {
        config.validate()?;
        let page_size = backend.page_size();
        let page_count = backend.page_count();
        Ok(Self {
            device_index,
            backend,
            page_size,
            live_generation: Mutex::new(vec![0; page_count as usize]),
        })
    }

    /// Rebuild `live_generation` by reading every header on recovery.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<(), PageError> {
        let page_count = self.backend.page_count();
        let mut generations = self.live_generation.lock().unwrap().clone();
        for idx in 0..page_count {
            let raw = self.backend.read(idx, self.page_size).await?;
            if let Some((page_id, _payload)) = decode_if_valid(&raw) {
                generations[idx as usize] = page_id.generation();
            }
        }
        *self.live_generation.lock().unwrap() = generations;
        Ok(())
    }

    pub fn device_index(&self) -> u8 {
        self.device_index
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.backend.page_count()
    }

    pub fn usable_payload_len(&self) -> usize {
        self.page_size - HEADER_SIZE - TRAILER_SIZE
    }

    /// Read the payload for `page_id`; fails with `NotFound` if the
    /// physical index's live generation does not match.
    pub async fn read(&self, page_id: PageId) -> Result<Vec<u8>, PageError> {
        let idx = page_id.physical_index();
        {
            let generations = self.live_generation.lock().unwrap();
            let live = *generations
                .get(idx as usize)
                .ok_or(PageError::NotFound(page_id))?;
            if live == 0 || live != page_id.generation() {
                return Err(PageError::NotFound(page_id));
            }
        }
        let raw = self.backend.read(idx, self.page_size).await?;
        match decode_if_valid(&raw) {
            Some((stored_id, payload)) if stored_id == page_id => Ok(payload),
            _ => Err(PageError::Corruption(format!(
                "page header at index {idx} failed checksum or id mismatch"
            ))),
        }
    }

    /// Write `payload` under `page_id`. `page_id`'s generation must exceed
    /// the index's previous live generation (enforced by the allocator
    /// bumping generations on allocation); a caller that violates this
    /// ordering has a programming bug, so it panics rather than returning
    /// a recoverable error (spec.md §4.3).
    #[instrument(skip(self, payload), fields(page_id = %page_id))]
    pub async fn write(&self, page_id: PageId, payload: &[u8]) -> Result<(), PageError> {
        let idx = page_id.physical_index();
        if payload.len() > self.usable_payload_len() {
            return Err(PageError::Corruption(format!(
                "payload of {} bytes exceeds usable page capacity {}",
                payload.len(),
                self.usable_payload_len()
            )));
        }
        {
            let generations = self.live_generation.lock().unwrap();
            let prev = *generations
                .get(idx as usize)
                .ok_or(PageError::NotFound(page_id))?;
            assert!(
                page_id.generation() > prev,
                "write to physical index {idx} with non-increasing generation {} (previous live {prev}): programming error",
                page_id.generation()
            );
        }
        let encoded = encode_page(page_id, payload, self.page_size);
        self.backend.write(idx, &encoded).await?;
        self.live_generation.lock().unwrap()[idx as usize] = page_id.generation();
        Ok(())
    }

    /// Release backing storage for `page_id`; idempotent, does not reset
    /// the live generation (a future allocation still bumps past it).
    pub async fn drop_page(&self, page_id: PageId) -> Result<(), PageError> {
        self.backend.drop_page(page_id.physical_index()).await?;
        Ok(())
    }

    /// Durably flush all writes issued so far to this device.
    pub async fn flush(&self) -> Result<(), PageError> {
        self.backend.flush().await?;
        Ok(())
    }
}

fn encode_page(page_id: PageId, payload: &[u8], page_size: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(page_size);
    buf.extend_from_slice(&page_id.as_u64().to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let header_crc = crc32_parts(&[
        &page_id.as_u64().to_le_bytes(),
        &(payload.len() as u32).to_le_bytes(),
        payload,
    ]);
    buf.extend_from_slice(&header_crc.to_le_bytes());
    buf.extend_from_slice(payload);
    buf.resize(page_size - TRAILER_SIZE, 0);
    let trailer_crc = crc32_parts(&[&buf]);
    buf.extend_from_slice(&trailer_crc.to_le_bytes());
    buf
}

fn decode_if_valid(raw: &[u8]) -> Option<(PageId, Vec<u8>)> {
    if raw.len() < HEADER_SIZE + TRAILER_SIZE {
        return None;
    }
    let page_id = PageId::from_u64(u64::from_le_bytes(raw[0..8].try_into().ok()?));
    let payload_len = u32::from_le_bytes(raw[8..12].try_into().ok()?) as usize;
    let header_crc = u32::from_le_bytes(raw[12..16].try_into().ok()?);
    if HEADER_SIZE + payload_len + TRAILER_SIZE > raw.len() {
        return None;
    }
    let payload = &raw[HEADER_SIZE..HEADER_SIZE + payload_len];
    let expected_header_crc = crc32_parts(&[&raw[0..8], &raw[8..12], payload]);
    if expected_header_crc != header_crc {
        return None;
    }
    let trailer_crc = u32::from_le_bytes(
        raw[raw.len() - TRAILER_SIZE..].try_into().ok()?,
    );
    let expected_trailer_crc = crc32_parts(&[&raw[..raw.len() - TRAILER_SIZE]]);
    if expected_trailer_crc != trailer_crc {
        return None;
    }
    if page_id.as_u64() == 0 && payload_len == 0 {
        // all-zero slot: never written, not a zero-length valid page.
        return None;
    }
    Some((page_id, payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryPageBackend;

    fn device() -> PageDevice {
        PageDevice::create(
            0,
            Box::new(InMemoryPageBackend::new(512, 4)),
            PageDeviceConfig { page_size: 512, page_count: 4 },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dev = device();
        let id = PageId::new(0, 1, 1);
        dev.write(id, b"hello page").await.unwrap();
        assert_eq!(dev.read(id).await.unwrap(), b"hello page");
    }

    #[tokio::test]
    async fn stale_generation_read_is_not_found() {
        let dev = device();
        let id1 = PageId::new(0, 1, 1);
        let id2 = PageId::new(0, 1, 2);
        dev.write(id1, b"v1").await.unwrap();
        dev.write(id2, b"v2").await.unwrap();
        assert!(matches!(dev.read(id1).await, Err(PageError::NotFound(_))));
        assert_eq!(dev.read(id2).await.unwrap(), b"v2");
    }

    #[tokio::test]
    #[should_panic(expected = "programming error")]
    async fn non_increasing_generation_write_panics() {
        let dev = device();
        let id1 = PageId::new(0, 1, 2);
        let id0 = PageId::new(0, 1, 1);
        dev.write(id1, b"first").await.unwrap();
        let _ = dev.write(id0, b"stale").await;
    }

    #[tokio::test]
    async fn recover_rebuilds_live_generations() {
        let backend = InMemoryPageBackend::new(512, 2);
        let id = PageId::new(0, 0, 5);
        {
            let dev = PageDevice::create(0, Box::new(backend), PageDeviceConfig { page_size: 512, page_count: 2 }).unwrap();
            dev.write(id, b"persisted").await.unwrap();
            // Simulate restart by constructing a fresh PageDevice over the
            // same backend's bytes via a new in-memory backend with the
            // same contents (file-backed devices would just reopen).
            let raw = dev.backend.read(0, 512).await.unwrap();
            let fresh_backend = InMemoryPageBackend::new(512, 2);
            fresh_backend.write(0, &raw).await.unwrap();
            let fresh = PageDevice::create(0, Box::new(fresh_backend), PageDeviceConfig { page_size: 512, page_count: 2 }).unwrap();
            fresh.recover().await.unwrap();
            assert_eq!(fresh.read(id).await.unwrap(), b"persisted");
        }
    }
}
