//! Sequential slot reader over a [`LogDevice`], bounded by a chosen
//! [`LogReadMode`] (spec.md §4.1).

use llfs_common::Offset;

use crate::device::{LogDevice, LogReadMode};
use crate::error::LogError;
use crate::slot::{self, padded_slot_len, SLOT_HEADER_SIZE};

/// Outcome of one [`LogReader::read_entry`] call.
#[derive(Debug)]
pub enum ReadResult {
    /// A fully validated slot, along with the offset it started at.
    Entry { offset: Offset, payload: Vec<u8> },
    /// No further entries are visible under the reader's mode yet.
    Eof,
    /// A slot at `offset` failed its checksum; the device should be
    /// poisoned and the caller should stop reading.
    Corrupted { offset: Offset },
}

/// Walks slots forward from a starting offset, never observing more than
/// the durability level fixed at construction.
pub struct LogReader {
    device: LogDevice,
    mode: LogReadMode,
    position: Offset,
}

impl LogReader {
    pub(crate) fn new(device: LogDevice, mode: LogReadMode, position: Offset) -> Self {
        LogReader {
            device,
            mode,
            position,
        }
    }

    pub fn position(&self) -> Offset {
        self.position
    }

    pub fn mode(&self) -> LogReadMode {
        self.mode
    }

    /// Reposition the reader; typically to the offset a [`crate::device::SlotReadLock`]
    /// was pinned at.
    pub fn seek(&mut self, offset: Offset) {
        self.position = offset;
    }

    /// Read the next slot, if one is visible under this reader's mode.
    pub async fn read_entry(&mut self) -> Result<ReadResult, LogError> {
        let bound = self.device.visible_bound(self.mode).await;
        if self.position + SLOT_HEADER_SIZE as u64 > bound {
            return Ok(ReadResult::Eof);
        }

        let header_bytes = self.device.read_raw(self.position, SLOT_HEADER_SIZE).await?;
        let header_arr: [u8; SLOT_HEADER_SIZE] = header_bytes.as_slice().try_into().unwrap();
        let header = slot::decode_header(&header_arr);
        let slot_len = padded_slot_len(header.payload_len as usize) as u64;
        if self.position + slot_len > bound {
            return Ok(ReadResult::Eof);
        }

        let payload = self
            .device
            .read_raw(self.position + SLOT_HEADER_SIZE as u64, header.payload_len as usize)
            .await?;
        if !slot::verify_checksum(&header, &payload) {
            return Ok(ReadResult::Corrupted {
                offset: self.position,
            });
        }

        let offset = self.position;
        self.position += slot_len;
        Ok(ReadResult::Entry { offset, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryLogBackend;
    use crate::device::LogDeviceConfig;

    #[tokio::test]
    async fn reads_back_what_was_appended() {
        let log = LogDevice::create(
            Box::new(InMemoryLogBackend::new()),
            LogDeviceConfig { capacity: 4096 },
        );
        log.append(b"one").await.unwrap();
        log.append(b"two").await.unwrap();

        let mut reader = log.new_reader(LogReadMode::Speculative).await;
        let mut seen = Vec::new();
        loop {
            match reader.read_entry().await.unwrap() {
                ReadResult::Entry { payload, .. } => seen.push(payload),
                ReadResult::Eof => break,
                ReadResult::Corrupted { .. } => panic!("unexpected corruption"),
            }
        }
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn durable_reader_does_not_see_unflushed_entries() {
        let log = LogDevice::create(
            Box::new(InMemoryLogBackend::new()),
            LogDeviceConfig { capacity: 4096 },
        );
        log.append(b"durable?").await.unwrap();

        let mut reader = log.new_reader(LogReadMode::Durable).await;
        assert!(matches!(reader.read_entry().await.unwrap(), ReadResult::Eof));

        log.flush_barrier().await.unwrap();
        assert!(matches!(
            reader.read_entry().await.unwrap(),
            ReadResult::Entry { .. }
        ));
    }
}
