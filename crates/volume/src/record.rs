//! Volume log record encoding (spec.md §6): `Prepare{job_uuid, n_new_pages,
//! n_read_pages, deltas[], user_payload[]}` and `Commit{prepare_slot_u64}`.
//! The `Commit` record is the single lineariser for a job: allocator
//! updates and page writes are idempotent/exactly-once, so replay only
//! needs to know whether a `Commit` exists for a given `Prepare`.

use llfs_common::PageId;
use uuid::Uuid;

use crate::error::VolumeError;

pub const TAG_PREPARE: u8 = 0;
pub const TAG_COMMIT: u8 = 1;

#[derive(Debug, Clone)]
pub struct PrepareRecord {
    pub job_uuid: Uuid,
    pub new_pages: Vec<PageId>,
    pub read_pages: Vec<PageId>,
    pub deltas: Vec<(PageId, i32)>,
    pub user_payload: Vec<u8>,
}

pub fn encode_prepare(record: &PrepareRecord) -> Vec<u8> {
    let mut buf = vec![TAG_PREPARE];
    buf.extend_from_slice(record.job_uuid.as_bytes());
    buf.extend_from_slice(&(record.new_pages.len() as u16).to_le_bytes());
    for id in &record.new_pages {
        buf.extend_from_slice(&id.as_u64().to_le_bytes());
    }
    buf.extend_from_slice(&(record.read_pages.len() as u16).to_le_bytes());
    for id in &record.read_pages {
        buf.extend_from_slice(&id.as_u64().to_le_bytes());
    }
    buf.extend_from_slice(&(record.deltas.len() as u16).to_le_bytes());
    for (id, delta) in &record.deltas {
        buf.extend_from_slice(&id.as_u64().to_le_bytes());
        buf.extend_from_slice(&delta.to_le_bytes());
    }
    buf.extend_from_slice(&(record.user_payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&record.user_payload);
    buf
}

pub fn decode_prepare(bytes: &[u8]) -> Result<PrepareRecord, VolumeError> {
    let mut off = 1usize;
    let take = |off: &mut usize, n: usize| -> Result<std::ops::Range<usize>, VolumeError> {
        let end = off
            .checked_add(n)
            .ok_or_else(|| VolumeError::Corruption("prepare record overflow".into()))?;
        if end > bytes.len() {
            return Err(VolumeError::Corruption("prepare record truncated".into()));
        }
        let r = *off..end;
        *off = end;
        Ok(r)
    };

    let r = take(&mut off, 16)?;
    let job_uuid = Uuid::from_slice(&bytes[r]).map_err(|e| VolumeError::Corruption(e.to_string()))?;

    let r = take(&mut off, 2)?;
    let n_new = u16::from_le_bytes(bytes[r].try_into().unwrap()) as usize;
    let mut new_pages = Vec::with_capacity(n_new);
    for _ in 0..n_new {
        let r = take(&mut off, 8)?;
        new_pages.push(PageId::from_u64(u64::from_le_bytes(bytes[r].try_into().unwrap())));
    }

    let r = take(&mut off, 2)?;
    let n_read = u16::from_le_bytes(bytes[r].try_into().unwrap()) as usize;
    let mut read_pages = Vec::with_capacity(n_read);
    for _ in 0..n_read {
        let r = take(&mut off, 8)?;
        read_pages.push(PageId::from_u64(u64::from_le_bytes(bytes[r].try_into().unwrap())));
    }

    let r = take(&mut off, 2)?;
    let n_deltas = u16::from_le_bytes(bytes[r].try_into().unwrap()) as usize;
    let mut deltas = Vec::with_capacity(n_deltas);
    for _ in 0..n_deltas {
        let r = take(&mut off, 8)?;
        let id = PageId::from_u64(u64::from_le_bytes(bytes[r].try_into().unwrap()));
        let r = take(&mut off, 4)?;
        let delta = i32::from_le_bytes(bytes[r].try_into().unwrap());
        deltas.push((id, delta));
    }

    let r = take(&mut off, 4)?;
    let user_len = u32::from_le_bytes(bytes[r].try_into().unwrap()) as usize;
    let r = take(&mut off, user_len)?;
    let user_payload = bytes[r].to_vec();

    Ok(PrepareRecord {
        job_uuid,
        new_pages,
        read_pages,
        deltas,
        user_payload,
    })
}

pub fn encode_commit(prepare_slot: u64) -> Vec<u8> {
    let mut buf = vec![TAG_COMMIT];
    buf.extend_from_slice(&prepare_slot.to_le_bytes());
    buf
}

pub fn decode_commit(bytes: &[u8]) -> Result<u64, VolumeError> {
    if bytes.len() != 9 {
        return Err(VolumeError::Corruption("malformed Commit record".into()));
    }
    Ok(u64::from_le_bytes(bytes[1..9].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_roundtrips() {
        let record = PrepareRecord {
            job_uuid: Uuid::from_u128(7),
            new_pages: vec![PageId::new(0, 1, 1), PageId::new(0, 2, 1)],
            read_pages: vec![PageId::new(0, 3, 2)],
            deltas: vec![(PageId::new(0, 1, 1), 2), (PageId::new(0, 3, 2), -1)],
            user_payload: b"user bytes".to_vec(),
        };
        let encoded = encode_prepare(&record);
        let decoded = decode_prepare(&encoded).unwrap();
        assert_eq!(decoded.job_uuid, record.job_uuid);
        assert_eq!(decoded.new_pages, record.new_pages);
        assert_eq!(decoded.read_pages, record.read_pages);
        assert_eq!(decoded.deltas, record.deltas);
        assert_eq!(decoded.user_payload, record.user_payload);
    }

    #[test]
    fn commit_roundtrips() {
        let encoded = encode_commit(4096);
        assert_eq!(decode_commit(&encoded).unwrap(), 4096);
    }
}
