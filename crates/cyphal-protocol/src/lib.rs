//! Cyphal Protocol -- envelope model, wire codec, clock.
//!
//! UDP multicast between nodes. One datagram per envelope.
//! 13-byte little-endian header + raw payload bytes.

pub mod clock;
pub mod codec;
pub mod envelope;
pub mod payload;
pub mod types;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use codec::EnvelopeCodec;
pub use envelope::Envelope;
pub use payload::{decode_heartbeat, decode_node_info, HeartbeatPayload, NodeInfoPayload};
pub use types::{Health, Mode, NodeId, Priority};

/// Subject ID of `node.Heartbeat`.
pub const HEARTBEAT_SUBJECT_ID: u16 = 7509;

/// Subject ID of the node-info announcement.
pub const NODE_INFO_SUBJECT_ID: u16 = 430;

/// Highest valid subject ID (13 bits).
pub const SUBJECT_ID_MAX: u16 = 8191;

/// Maximum payload carried by one envelope.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Maximum node name length in a node-info payload.
pub const MAX_NODE_NAME_LEN: usize = 50;

/// Fixed header size of the wire envelope.
pub const ENVELOPE_HEADER_SIZE: usize = 13;

/// Largest datagram a conforming envelope can occupy.
pub const MAX_ENVELOPE_SIZE: usize = ENVELOPE_HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Heartbeat payload size.
pub const HEARTBEAT_PAYLOAD_SIZE: usize = 8;

/// Domain error kinds shared by every crate in the workspace.
///
/// `Ok(..)` stands in for the "no error" kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidParameter,
    OutOfMemory,
    Timeout,
    QueueFull,
    Failure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::Timeout => "timeout",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::Failure => "failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("subject id {0} out of range (max {SUBJECT_ID_MAX})")]
    SubjectIdOutOfRange(u32),
    #[error("invalid priority {0} (expected 0..=7)")]
    InvalidPriority(u8),
    #[error("invalid node id {0} (expected 1..=127 or 255)")]
    InvalidNodeId(u8),
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("node name too long: {len} bytes (max {MAX_NODE_NAME_LEN})")]
    NameTooLong { len: usize },
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("truncated envelope: {len} bytes")]
    Truncated { len: usize },
    #[error("malformed {what} payload")]
    MalformedPayload { what: &'static str },
    #[error("envelope fails field validation")]
    InvalidEnvelope,
    #[error("payload allocation of {size} bytes failed")]
    OutOfMemory { size: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            ProtocolError::Io(_) => ErrorKind::Failure,
            _ => ErrorKind::InvalidParameter,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
