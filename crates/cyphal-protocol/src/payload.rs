//! Well-known payloads: heartbeat and node info.
//!
//! Heartbeat (8 bytes): `u32 uptime_sec || u8 health || u8 mode || u16 reserved`.
//! Node info: `u32 sw_version || u32 hw_version || u8 name_len || name`.

use bytes::{Buf, BufMut};

use crate::envelope::Envelope;
use crate::types::{Health, Mode, Priority};
use crate::{
    ProtocolError, Result, HEARTBEAT_PAYLOAD_SIZE, HEARTBEAT_SUBJECT_ID, MAX_NODE_NAME_LEN,
    NODE_INFO_SUBJECT_ID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub uptime_sec: u32,
    pub health: Health,
    pub mode: Mode,
}

impl HeartbeatPayload {
    pub fn encode(&self) -> [u8; HEARTBEAT_PAYLOAD_SIZE] {
        let mut out = [0u8; HEARTBEAT_PAYLOAD_SIZE];
        let mut cursor = &mut out[..];
        cursor.put_u32_le(self.uptime_sec);
        cursor.put_u8(self.health as u8);
        cursor.put_u8(self.mode as u8);
        cursor.put_u16_le(0);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfoPayload {
    pub sw_version: u32,
    pub hw_version: u32,
    pub name: String,
}

impl NodeInfoPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = self.name.as_bytes();
        if name.len() > MAX_NODE_NAME_LEN {
            return Err(ProtocolError::NameTooLong { len: name.len() });
        }
        let mut out = Vec::with_capacity(9 + name.len());
        out.put_u32_le(self.sw_version);
        out.put_u32_le(self.hw_version);
        out.put_u8(name.len() as u8);
        out.put_slice(name);
        Ok(out)
    }
}

/// Parse a heartbeat payload. The reserved field is ignored.
pub fn decode_heartbeat(payload: &[u8]) -> Result<HeartbeatPayload> {
    if payload.len() < HEARTBEAT_PAYLOAD_SIZE {
        return Err(ProtocolError::MalformedPayload { what: "heartbeat" });
    }
    let mut cursor = payload;
    let uptime_sec = cursor.get_u32_le();
    let health = Health::try_from(cursor.get_u8())?;
    let mode = Mode::try_from(cursor.get_u8())?;
    Ok(HeartbeatPayload {
        uptime_sec,
        health,
        mode,
    })
}

pub fn decode_node_info(payload: &[u8]) -> Result<NodeInfoPayload> {
    let malformed = ProtocolError::MalformedPayload { what: "node info" };
    if payload.len() < 9 {
        return Err(malformed);
    }
    let mut cursor = payload;
    let sw_version = cursor.get_u32_le();
    let hw_version = cursor.get_u32_le();
    let name_len = usize::from(cursor.get_u8());
    if name_len > MAX_NODE_NAME_LEN {
        return Err(ProtocolError::NameTooLong { len: name_len });
    }
    if cursor.len() < name_len {
        return Err(malformed);
    }
    let name = std::str::from_utf8(&cursor[..name_len])
        .map_err(|_| ProtocolError::MalformedPayload { what: "node name" })?
        .to_string();
    Ok(NodeInfoPayload {
        sw_version,
        hw_version,
        name,
    })
}

impl Envelope {
    /// Heartbeat envelope: subject 7509, NOMINAL priority, unset source.
    pub fn create_heartbeat(health: Health, mode: Mode, uptime_sec: u32) -> Result<Envelope> {
        let payload = HeartbeatPayload {
            uptime_sec,
            health,
            mode,
        };
        Envelope::create(HEARTBEAT_SUBJECT_ID, Priority::Nominal, &payload.encode())
    }

    /// Node-info envelope: subject 430, LOW priority.
    pub fn create_node_info(name: &str, sw_version: u32, hw_version: u32) -> Result<Envelope> {
        let payload = NodeInfoPayload {
            sw_version,
            hw_version,
            name: name.to_string(),
        }
        .encode()?;
        Envelope::create(NODE_INFO_SUBJECT_ID, Priority::Low, &payload)
    }
}
