//! CRC32 checksum helper shared by the log-slot and page-header wire
//! formats (spec.md §6). A standalone crate for this would be overkill for
//! one function; `crc32fast` is the teacher's own choice for the same job.

use crc32fast::Hasher;

/// Compute the CRC32 of the concatenation of `parts`, in order.
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_single_part_hasher() {
        let mut h = Hasher::new();
        h.update(b"hello world");
        assert_eq!(crc32_parts(&[b"hello world"]), h.finalize());
    }

    #[test]
    fn concatenates_parts() {
        let combined = crc32_parts(&[b"hello ", b"world"]);
        let single = crc32_parts(&[b"hello world"]);
        assert_eq!(combined, single);
    }
}
