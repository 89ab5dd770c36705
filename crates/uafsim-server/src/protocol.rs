//! Wire codec for the chunk command protocol.
//!
//! Framing is deliberately naive: one socket read is one frame and one frame
//! is one command. There is no length prefix and no reassembly, so a command
//! split across TCP segments arrives as two (usually malformed) commands, and
//! anything past the server's read buffer is handled as the next frame.
//!
//! A frame is `COMMAND` or `COMMAND:PAYLOAD`, split on the first `:`.

use thiserror::Error;
use uafsim_registry::config::{ALLOC_SIZE_FIELD_LEN, MAX_ID_LEN};
use uafsim_registry::{ChunkId, Snapshot};

/// Fixed command vocabulary. Matching is case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Create,
    Delete,
    Use,
    Alloc,
    Free,
    Read,
    HeapInfo,
    Shutdown,
}

impl Command {
    pub const ALL: [Self; 8] = [
        Self::Create,
        Self::Delete,
        Self::Use,
        Self::Alloc,
        Self::Free,
        Self::Read,
        Self::HeapInfo,
        Self::Shutdown,
    ];

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cmd| cmd.as_str() == name)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Delete => "DELETE",
            Self::Use => "USE",
            Self::Alloc => "ALLOC",
            Self::Free => "FREE",
            Self::Read => "READ",
            Self::HeapInfo => "HEAPINFO",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed {command} request: {reason}")]
    MalformedRequest { command: Command, reason: String },
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("{0}")]
    Dispatch(String),
}

/// Decoded `ALLOC` payload: a little-endian `u32` size followed by data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocRequest {
    pub size: u32,
    pub data: Vec<u8>,
}

impl AllocRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let Some((size_field, data)) = payload.split_first_chunk::<ALLOC_SIZE_FIELD_LEN>() else {
            return Err(ProtocolError::MalformedRequest {
                command: Command::Alloc,
                reason: format!(
                    "need a {ALLOC_SIZE_FIELD_LEN}-byte size field, got {} bytes",
                    payload.len()
                ),
            });
        };
        Ok(Self {
            size: u32::from_le_bytes(*size_field),
            data: data.to_vec(),
        })
    }

    /// Encode as an `ALLOC` payload (without the command prefix).
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ALLOC_SIZE_FIELD_LEN + self.data.len());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// A fully validated request. Field widths are checked here, before any
/// registry state is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Create { id: String },
    Delete { id: String },
    Use { id: String },
    Alloc(AllocRequest),
    Free { id: String },
    Read { id: String },
    HeapInfo,
    Shutdown,
}

impl Request {
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (name, payload) = split_frame(frame);
        let Some(command) = Command::parse(&name) else {
            return Err(ProtocolError::UnknownCommand(name));
        };
        let request = match command {
            Command::Create => Self::Create { id: decode_id(payload) },
            Command::Delete => Self::Delete { id: decode_id(payload) },
            Command::Use => Self::Use { id: decode_id(payload) },
            Command::Alloc => Self::Alloc(AllocRequest::parse(payload)?),
            Command::Free => Self::Free { id: decode_id(payload) },
            Command::Read => Self::Read { id: decode_id(payload) },
            Command::HeapInfo => Self::HeapInfo,
            Command::Shutdown => Self::Shutdown,
        };
        Ok(request)
    }

    /// Encode into a frame. `decode(encode(r)) == r` for ids that are
    /// already ASCII and within [`MAX_ID_LEN`].
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let command = self.command().as_str().as_bytes();
        let payload = match self {
            Self::Create { id }
            | Self::Delete { id }
            | Self::Use { id }
            | Self::Free { id }
            | Self::Read { id } => id.as_bytes().to_vec(),
            Self::Alloc(alloc) => alloc.to_payload(),
            Self::HeapInfo | Self::Shutdown => return command.to_vec(),
        };
        let mut frame = Vec::with_capacity(command.len() + 1 + payload.len());
        frame.extend_from_slice(command);
        frame.push(b':');
        frame.extend_from_slice(&payload);
        frame
    }

    #[must_use]
    pub const fn command(&self) -> Command {
        match self {
            Self::Create { .. } => Command::Create,
            Self::Delete { .. } => Command::Delete,
            Self::Use { .. } => Command::Use,
            Self::Alloc(_) => Command::Alloc,
            Self::Free { .. } => Command::Free,
            Self::Read { .. } => Command::Read,
            Self::HeapInfo => Command::HeapInfo,
            Self::Shutdown => Command::Shutdown,
        }
    }
}

/// Split a frame on its first `:`. The command part is ASCII-decoded with
/// non-ASCII bytes dropped and surrounding whitespace trimmed; the payload is
/// returned untouched (empty when there is no `:`).
#[must_use]
pub fn split_frame(frame: &[u8]) -> (String, &[u8]) {
    let (head, payload) = match frame.iter().position(|&b| b == b':') {
        Some(at) => (&frame[..at], &frame[at + 1..]),
        None => (frame, &frame[frame.len()..]),
    };
    (ascii_lossy(head).trim().to_owned(), payload)
}

/// First [`MAX_ID_LEN`] payload bytes, ASCII-decoded with non-ASCII bytes
/// dropped. Not trimmed: `"obj1\n"` and `"obj1"` are different ids.
#[must_use]
pub fn decode_id(payload: &[u8]) -> String {
    ascii_lossy(&payload[..payload.len().min(MAX_ID_LEN)])
}

fn ascii_lossy(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| char::from(b))
        .collect()
}

/// Typed reply, encoded onto the wire by [`Response::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Created(ChunkId),
    Allocated(ChunkId),
    AllocFailed,
    Deleted,
    Freed,
    DoubleFreeDetected,
    /// `DELETE` miss.
    NotFound,
    /// `USE` miss.
    ObjectNotFound,
    /// `FREE` / `READ` miss.
    ChunkNotFound,
    Payload(Vec<u8>),
    UafDetected { sentinel: [u8; 8], leaked: Vec<u8> },
    ReadAfterFree(Vec<u8>),
    HeapInfo(Snapshot),
    ServerShutdown,
    UnknownCommand,
    Error(String),
}

impl Response {
    /// Map a decode or dispatch failure onto its wire reply.
    #[must_use]
    pub fn from_error(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::MalformedRequest {
                command: Command::Alloc,
                ..
            } => Self::AllocFailed,
            ProtocolError::UnknownCommand(_) => Self::UnknownCommand,
            other => Self::Error(other.to_string()),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Created(id) => format!("CREATED:{id}").into_bytes(),
            Self::Allocated(id) => format!("ALLOCATED:{id}").into_bytes(),
            Self::AllocFailed => b"ALLOC_FAILED".to_vec(),
            Self::Deleted => b"DELETED".to_vec(),
            Self::Freed => b"FREED".to_vec(),
            Self::DoubleFreeDetected => b"DOUBLE_FREE_DETECTED".to_vec(),
            Self::NotFound => b"NOT_FOUND".to_vec(),
            Self::ObjectNotFound => b"OBJECT_NOT_FOUND".to_vec(),
            Self::ChunkNotFound => b"CHUNK_NOT_FOUND".to_vec(),
            Self::Payload(bytes) => bytes.clone(),
            Self::UafDetected { sentinel, leaked } => {
                let mut out = b"UAF_DETECTED:".to_vec();
                out.extend_from_slice(sentinel);
                out.extend_from_slice(leaked);
                out
            }
            Self::ReadAfterFree(leaked) => {
                let mut out = b"READ_AFTER_FREE:".to_vec();
                out.extend_from_slice(leaked);
                out
            }
            Self::HeapInfo(snap) => {
                format!("Chunks: {}, Freed: {}", snap.chunks, snap.freed_ids).into_bytes()
            }
            Self::ServerShutdown => b"SERVER_SHUTDOWN".to_vec(),
            Self::UnknownCommand => b"UNKNOWN_COMMAND".to_vec(),
            Self::Error(message) => format!("ERROR: {message}").into_bytes(),
        }
    }

    /// Short outcome tag for structured logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Allocated(_) => "allocated",
            Self::AllocFailed => "alloc_failed",
            Self::Deleted => "deleted",
            Self::Freed => "freed",
            Self::DoubleFreeDetected => "double_free",
            Self::NotFound | Self::ObjectNotFound | Self::ChunkNotFound => "not_found",
            Self::Payload(_) => "payload",
            Self::UafDetected { .. } => "uaf_detected",
            Self::ReadAfterFree(_) => "read_after_free",
            Self::HeapInfo(_) => "heap_info",
            Self::ServerShutdown => "shutdown",
            Self::UnknownCommand => "unknown_command",
            Self::Error(_) => "error",
        }
    }

    /// True for the unsafe-sequence reports a triage workflow looks for.
    #[must_use]
    pub const fn is_detection(&self) -> bool {
        matches!(
            self,
            Self::DoubleFreeDetected | Self::UafDetected { .. } | Self::ReadAfterFree(_)
        )
    }
}

/// Render bytes for humans: printable ASCII as-is, everything else `\xNN`.
#[must_use]
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(char::from(b)),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}
