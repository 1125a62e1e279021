//! Convention for where a page's out-references live within its payload.
//!
//! spec.md leaves the page-content format up to the application; the
//! recycler still needs *some* fixed convention to find the `PageId`s a
//! page points to. This workspace picks the simplest one a DAG-building
//! application could use: `u16 ref_count | PageId[ref_count] | user_bytes`.
//! Documented as a resolved Open Question in DESIGN.md.

use llfs_common::PageId;

/// Prepend `refs` to `user_data` using the out-reference convention.
pub fn encode_with_refs(refs: &[PageId], user_data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + refs.len() * 8 + user_data.len());
    buf.extend_from_slice(&(refs.len() as u16).to_le_bytes());
    for r in refs {
        buf.extend_from_slice(&r.as_u64().to_le_bytes());
    }
    buf.extend_from_slice(user_data);
    buf
}

/// Parse the leading out-reference list out of a page's payload, returning
/// the refs and the remaining user bytes.
pub fn decode_refs(payload: &[u8]) -> Option<(Vec<PageId>, &[u8])> {
    if payload.len() < 2 {
        return None;
    }
    let count = u16::from_le_bytes(payload[0..2].try_into().ok()?) as usize;
    let needed = 2 + count * 8;
    if payload.len() < needed {
        return None;
    }
    let mut refs = Vec::with_capacity(count);
    let mut off = 2;
    for _ in 0..count {
        refs.push(PageId::from_u64(u64::from_le_bytes(
            payload[off..off + 8].try_into().ok()?,
        )));
        off += 8;
    }
    Some((refs, &payload[needed..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_refs_and_data() {
        let refs = vec![PageId::new(0, 1, 1), PageId::new(0, 2, 1)];
        let encoded = encode_with_refs(&refs, b"payload");
        let (decoded_refs, data) = decode_refs(&encoded).unwrap();
        assert_eq!(decoded_refs, refs);
        assert_eq!(data, b"payload");
    }

    #[test]
    fn no_refs_is_just_data() {
        let encoded = encode_with_refs(&[], b"leaf");
        let (refs, data) = decode_refs(&encoded).unwrap();
        assert!(refs.is_empty());
        assert_eq!(data, b"leaf");
    }
}
