//! Owned message envelope and its fixed little-endian wire form.
//!
//! Wire layout (13-byte header, then payload):
//!
//! | off | size | field                         |
//! |----:|-----:|-------------------------------|
//! |   0 |    4 | subject_id (u32)              |
//! |   4 |    1 | priority (0..=7)              |
//! |   5 |    1 | source node id (255 = unset)  |
//! |   6 |    1 | destination node id           |
//! |   7 |    1 | is_service_request (0/1)      |
//! |   8 |    1 | is_anonymous (0/1)            |
//! |   9 |    4 | payload_size (u32)            |
//! |  13 |    N | payload                       |

use bytes::{BufMut, BytesMut};
use std::fmt;

use crate::clock;
use crate::types::{NodeId, Priority};
use crate::{ProtocolError, Result, ENVELOPE_HEADER_SIZE, MAX_PAYLOAD_SIZE, SUBJECT_ID_MAX};

/// One message with header fields and exclusively owned payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub subject_id: u16,
    pub priority: Priority,
    pub source_node_id: NodeId,
    pub destination_node_id: NodeId,
    pub is_service_request: bool,
    pub is_anonymous: bool,
    payload: Vec<u8>,
    pub timestamp_usec: u64,
}

impl Envelope {
    /// Empty envelope: NOMINAL priority, unset node ids, no payload, timestamp 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a validated envelope owning a copy of `payload`, stamped now.
    pub fn create(subject_id: u16, priority: Priority, payload: &[u8]) -> Result<Self> {
        if subject_id > SUBJECT_ID_MAX {
            return Err(ProtocolError::SubjectIdOutOfRange(u32::from(subject_id)));
        }
        let mut envelope = Envelope {
            subject_id,
            priority,
            ..Envelope::default()
        };
        envelope.copy_payload(payload)?;
        envelope.timestamp_usec = clock::now_usec();
        Ok(envelope)
    }

    /// Replace the payload with a copy of `bytes`.
    ///
    /// On failure the existing payload is left untouched.
    pub fn copy_payload(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let mut fresh = Vec::new();
        fresh
            .try_reserve_exact(bytes.len())
            .map_err(|_| ProtocolError::OutOfMemory { size: bytes.len() })?;
        fresh.extend_from_slice(bytes);
        self.payload = fresh;
        Ok(())
    }

    /// Release the payload and return every field to its initial value.
    /// Calling it again is a no-op.
    pub fn reset(&mut self) {
        *self = Envelope::default();
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Give up the envelope and keep its payload bytes.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Full field-consistency check.
    pub fn validate(&self) -> bool {
        self.subject_id <= SUBJECT_ID_MAX
            && self.payload.len() <= MAX_PAYLOAD_SIZE
            && self.source_node_id.is_valid()
            && self.destination_node_id.is_valid()
    }

    /// Field equality ignoring `timestamp_usec`.
    pub fn same_content(&self, other: &Envelope) -> bool {
        self.subject_id == other.subject_id
            && self.priority == other.priority
            && self.source_node_id == other.source_node_id
            && self.destination_node_id == other.destination_node_id
            && self.is_service_request == other.is_service_request
            && self.is_anonymous == other.is_anonymous
            && self.payload == other.payload
    }

    /// Bytes this envelope occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        ENVELOPE_HEADER_SIZE + self.payload.len()
    }

    /// Write the wire form into `buf`, returning the number of bytes used.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        let needed = self.encoded_len();
        if buf.len() < needed {
            return Err(ProtocolError::BufferTooSmall {
                needed,
                available: buf.len(),
            });
        }
        let mut cursor = &mut buf[..needed];
        self.put_wire(&mut cursor);
        Ok(needed)
    }

    /// Append the wire form to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        self.put_wire(dst);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.put_wire(&mut out);
        out
    }

    fn put_wire<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32_le(u32::from(self.subject_id));
        dst.put_u8(self.priority.as_u8());
        dst.put_u8(self.source_node_id.get());
        dst.put_u8(self.destination_node_id.get());
        dst.put_u8(u8::from(self.is_service_request));
        dst.put_u8(u8::from(self.is_anonymous));
        dst.put_u32_le(self.payload.len() as u32);
        dst.put_slice(&self.payload);
    }

    /// Parse one envelope from the front of `buf` and stamp it now.
    ///
    /// Node-id bytes are taken as-is; a 0 source is accepted here and only
    /// flagged by [`Envelope::validate`].
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let header = Header::parse(buf)?;
        let end = ENVELOPE_HEADER_SIZE + header.payload_size;
        if buf.len() < end {
            return Err(ProtocolError::Truncated { len: buf.len() });
        }
        let mut envelope = header.into_envelope();
        envelope.copy_payload(&buf[ENVELOPE_HEADER_SIZE..end])?;
        envelope.timestamp_usec = clock::now_usec();
        Ok(envelope)
    }
}

/// Decoded and range-checked envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub subject_id: u16,
    pub priority: Priority,
    pub source: NodeId,
    pub destination: NodeId,
    pub is_service_request: bool,
    pub is_anonymous: bool,
    pub payload_size: usize,
}

impl Header {
    pub(crate) fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < ENVELOPE_HEADER_SIZE {
            return Err(ProtocolError::Truncated { len: buf.len() });
        }
        let subject = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if subject > u32::from(SUBJECT_ID_MAX) {
            return Err(ProtocolError::SubjectIdOutOfRange(subject));
        }
        let priority = Priority::try_from(buf[4])?;
        let payload_size = u32::from_le_bytes([buf[9], buf[10], buf[11], buf[12]]) as usize;
        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Header {
            subject_id: subject as u16,
            priority,
            source: NodeId::from_raw(buf[5]),
            destination: NodeId::from_raw(buf[6]),
            is_service_request: buf[7] != 0,
            is_anonymous: buf[8] != 0,
            payload_size,
        })
    }

    fn into_envelope(self) -> Envelope {
        Envelope {
            subject_id: self.subject_id,
            priority: self.priority,
            source_node_id: self.source,
            destination_node_id: self.destination,
            is_service_request: self.is_service_request,
            is_anonymous: self.is_anonymous,
            payload: Vec::new(),
            timestamp_usec: 0,
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subject={} priority={} src={} dst={} service={} anonymous={} payload={}B ts={}us",
            self.subject_id,
            self.priority,
            self.source_node_id,
            self.destination_node_id,
            self.is_service_request,
            self.is_anonymous,
            self.payload.len(),
            self.timestamp_usec,
        )
    }
}
