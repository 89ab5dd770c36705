//! Field widths and canned values shared by the registry and the wire codec.
//!
//! These mirror the fixed limits of the rehearsal protocol:
//! - ids are truncated to [`MAX_ID_LEN`] bytes before lookup or insertion,
//! - allocation payloads are truncated to [`MAX_PAYLOAD_LEN`] bytes,
//! - freed-access reports leak [`UAF_LEAK_LEN`] / [`RAF_LEAK_LEN`] stale bytes.

/// Maximum id width in bytes.
pub const MAX_ID_LEN: usize = 32;

/// Maximum payload bytes retained by an allocation.
pub const MAX_PAYLOAD_LEN: usize = 256;

/// Width of the little-endian size field that prefixes an allocation request.
pub const ALLOC_SIZE_FIELD_LEN: usize = 4;

/// Marker a use-after-free "reads" out of reused memory.
pub const UAF_SENTINEL: u64 = 0x7f00_1337_dead_beef;

/// Stale payload bytes surfaced by a use-after-free report.
pub const UAF_LEAK_LEN: usize = 8;

/// Stale payload bytes surfaced by a read-after-free report.
pub const RAF_LEAK_LEN: usize = 16;

/// Declared size recorded for chunks created without an explicit size.
pub const CREATE_DECLARED_SIZE: u32 = 64;

/// Fixed prefix of auto-filled payloads.
pub const CREATE_PAYLOAD_PREFIX: &[u8] = b"initial_data_";

/// Filler bytes appended after [`CREATE_PAYLOAD_PREFIX`].
pub const CREATE_FILLER_LEN: usize = 8;

/// Little-endian encoding of [`UAF_SENTINEL`], as it appears on the wire.
#[must_use]
pub const fn sentinel_bytes() -> [u8; 8] {
    UAF_SENTINEL.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_little_endian() {
        assert_eq!(
            sentinel_bytes(),
            [0xef, 0xbe, 0xad, 0xde, 0x37, 0x13, 0x00, 0x7f]
        );
    }
}
