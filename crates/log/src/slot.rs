//! On-disk slot encoding (spec.md §6): `u32 length | u32 crc32 | payload |
//! pad-to-8`. The CRC covers the length field and the payload, not the CRC
//! field itself, matching the header-minus-checksum coverage idiom the
//! teacher workspace uses for its WAL entry headers.

use llfs_common::checksum::crc32_parts;

/// Bytes occupied by the `length`/`crc32` prefix, before the payload.
pub const SLOT_HEADER_SIZE: usize = 8;

/// Total on-disk footprint of a slot holding `payload_len` bytes, including
/// the header and padding to the next 8-byte boundary.
pub fn padded_slot_len(payload_len: usize) -> usize {
    let raw = SLOT_HEADER_SIZE + payload_len;
    (raw + 7) & !7
}

/// Encode `payload` into its on-disk slot representation.
pub fn encode_slot(payload: &[u8]) -> Vec<u8> {
    let total = padded_slot_len(payload.len());
    let mut buf = Vec::with_capacity(total);
    let len = payload.len() as u32;
    buf.extend_from_slice(&len.to_le_bytes());
    let crc = crc32_parts(&[&len.to_le_bytes(), payload]);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(payload);
    buf.resize(total, 0);
    buf
}

#[derive(Debug, Clone, Copy)]
pub struct SlotHeader {
    pub payload_len: u32,
    pub crc32: u32,
}

pub fn decode_header(bytes: &[u8; SLOT_HEADER_SIZE]) -> SlotHeader {
    SlotHeader {
        payload_len: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        crc32: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
    }
}

/// Verify a decoded payload against its header's checksum.
pub fn verify_checksum(header: &SlotHeader, payload: &[u8]) -> bool {
    let expected = crc32_parts(&[&header.payload_len.to_le_bytes(), payload]);
    expected == header.crc32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips() {
        let payload = b"hello, llfs";
        let encoded = encode_slot(payload);
        assert_eq!(encoded.len(), padded_slot_len(payload.len()));
        assert_eq!(encoded.len() % 8, 0);

        let header_bytes: [u8; SLOT_HEADER_SIZE] = encoded[0..8].try_into().unwrap();
        let header = decode_header(&header_bytes);
        assert_eq!(header.payload_len as usize, payload.len());

        let decoded_payload = &encoded[8..8 + header.payload_len as usize];
        assert_eq!(decoded_payload, payload);
        assert!(verify_checksum(&header, decoded_payload));
    }

    #[test]
    fn detects_corruption() {
        let payload = b"abcdefg";
        let mut encoded = encode_slot(payload);
        let last = encoded.len() - 1 - (padded_slot_len(payload.len()) - SLOT_HEADER_SIZE - payload.len());
        encoded[SLOT_HEADER_SIZE] ^= 0xFF; // corrupt first payload byte
        let _ = last;

        let header_bytes: [u8; SLOT_HEADER_SIZE] = encoded[0..8].try_into().unwrap();
        let header = decode_header(&header_bytes);
        let decoded_payload = &encoded[8..8 + header.payload_len as usize];
        assert!(!verify_checksum(&header, decoded_payload));
    }

    #[test]
    fn empty_payload_is_just_the_header_padded() {
        let encoded = encode_slot(&[]);
        assert_eq!(encoded.len(), 8); // already 8-aligned
    }
}
