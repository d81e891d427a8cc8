#![forbid(unsafe_code)]

/// Checksum of a header or log block body, seeded with the block's position
/// so that a block copied to the wrong offset fails validation.
pub fn block_crc32(block_no: u64, body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&block_no.to_be_bytes());
    hasher.update(body);
    hasher.finalize()
}
