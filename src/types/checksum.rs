//! Page checksums.

/// CRC32 over a page image, mixed with the page number and the per-database
/// salt so that a page written to the wrong offset, or copied from another
/// database, fails validation even when its payload is intact.
pub fn page_crc32(page_no: u64, salt: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
