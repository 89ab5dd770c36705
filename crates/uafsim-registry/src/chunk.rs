//! Chunk records and their lifecycle state.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::{CREATE_FILLER_LEN, CREATE_PAYLOAD_PREFIX};

/// Lifecycle state of a simulated heap chunk.
///
/// The only transition is `Live -> Freed`. Nothing ever moves a chunk back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Live,
    Freed,
}

impl ChunkState {
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Freed => "freed",
        }
    }
}

/// Identifier handed back by a creation entry point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChunkId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A tracked chunk. Records are never removed once inserted.
#[derive(Debug, Clone)]
pub(crate) struct Chunk {
    pub(crate) id: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) declared_size: u32,
    pub(crate) state: ChunkState,
}

impl Chunk {
    pub(crate) fn live(id: String, payload: Vec<u8>, declared_size: u32) -> Self {
        Self {
            id,
            payload,
            declared_size,
            state: ChunkState::Live,
        }
    }

    /// Leading `len` bytes of the payload (fewer when the payload is shorter).
    pub(crate) fn prefix(&self, len: usize) -> Vec<u8> {
        self.payload[..self.payload.len().min(len)].to_vec()
    }

    pub(crate) fn view(&self) -> ChunkView {
        ChunkView {
            id: self.id.clone(),
            declared_size: self.declared_size,
            payload_len: self.payload.len(),
            state: self.state,
        }
    }
}

/// Read-only description of a chunk for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkView {
    pub id: String,
    pub declared_size: u32,
    pub payload_len: usize,
    pub state: ChunkState,
}

/// Build the payload for a chunk created without caller data.
///
/// `initial_data_` followed by the first 8 bytes of `SHA-256(id || index)`,
/// where `index` is the chunk's insertion position. Replaying the same command
/// sequence reproduces the same bytes.
pub(crate) fn filled_payload(id: &str, index: u64) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(index.to_le_bytes());
    let digest = hasher.finalize();

    let mut payload = Vec::with_capacity(CREATE_PAYLOAD_PREFIX.len() + CREATE_FILLER_LEN);
    payload.extend_from_slice(CREATE_PAYLOAD_PREFIX);
    payload.extend_from_slice(&digest[..CREATE_FILLER_LEN]);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_payload_is_deterministic() {
        let a = filled_payload("obj1", 0);
        let b = filled_payload("obj1", 0);
        assert_eq!(a, b);
        assert!(a.starts_with(b"initial_data_"));
        assert_eq!(a.len(), CREATE_PAYLOAD_PREFIX.len() + CREATE_FILLER_LEN);
    }

    #[test]
    fn filled_payload_varies_with_position() {
        assert_ne!(filled_payload("obj1", 0), filled_payload("obj1", 1));
        assert_ne!(filled_payload("obj1", 0), filled_payload("obj2", 0));
    }

    #[test]
    fn prefix_clamps_to_payload_length() {
        let chunk = Chunk::live("c".into(), b"abc".to_vec(), 3);
        assert_eq!(chunk.prefix(8), b"abc");
        assert_eq!(chunk.prefix(2), b"ab");
    }
}
