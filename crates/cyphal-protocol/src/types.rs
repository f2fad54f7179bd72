//! Scalar wire types: priority, node ID, health, mode.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ProtocolError;

/// Transfer priority. Lower value = more urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Priority {
    Exceptional = 0,
    Immediate = 1,
    Fast = 2,
    High = 3,
    #[default]
    Nominal = 4,
    Low = 5,
    Slow = 6,
    Optional = 7,
}

impl Priority {
    pub const ALL: [Priority; 8] = [
        Priority::Exceptional,
        Priority::Immediate,
        Priority::Fast,
        Priority::High,
        Priority::Nominal,
        Priority::Low,
        Priority::Slow,
        Priority::Optional,
    ];

    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Priority::Exceptional => "exceptional",
            Priority::Immediate => "immediate",
            Priority::Fast => "fast",
            Priority::High => "high",
            Priority::Nominal => "nominal",
            Priority::Low => "low",
            Priority::Slow => "slow",
            Priority::Optional => "optional",
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(ProtocolError::InvalidPriority(value))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Node identifier on the bus: 1..=127, or the UNSET sentinel 255.
///
/// Wire decoding keeps whatever byte arrived (including 0); use
/// [`NodeId::is_valid`] or [`crate::Envelope::validate`] to check it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u8);

impl NodeId {
    pub const UNSET: NodeId = NodeId(255);
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 127;

    /// Checked constructor: accepts 1..=127 and 255.
    pub const fn new(raw: u8) -> Option<NodeId> {
        if (raw >= Self::MIN && raw <= Self::MAX) || raw == 255 {
            Some(NodeId(raw))
        } else {
            None
        }
    }

    /// Unchecked constructor used by the wire decoder.
    pub const fn from_raw(raw: u8) -> NodeId {
        NodeId(raw)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn is_unset(self) -> bool {
        self.0 == 255
    }

    /// True for an assigned id in 1..=127.
    pub const fn is_assigned(self) -> bool {
        self.0 >= Self::MIN && self.0 <= Self::MAX
    }

    /// True when the value is either assigned or UNSET.
    pub const fn is_valid(self) -> bool {
        self.is_assigned() || self.is_unset()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::UNSET
    }
}

impl TryFrom<u8> for NodeId {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        NodeId::new(value).ok_or(ProtocolError::InvalidNodeId(value))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unset() {
            f.write_str("unset")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Abstract node health reported in the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Health {
    #[default]
    Nominal = 0,
    Advisory = 1,
    Caution = 2,
    Warning = 3,
}

impl Health {
    pub fn name(&self) -> &'static str {
        match self {
            Health::Nominal => "nominal",
            Health::Advisory => "advisory",
            Health::Caution => "caution",
            Health::Warning => "warning",
        }
    }
}

impl TryFrom<u8> for Health {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Health::Nominal),
            1 => Ok(Health::Advisory),
            2 => Ok(Health::Caution),
            3 => Ok(Health::Warning),
            _ => Err(ProtocolError::MalformedPayload { what: "health" }),
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operating mode reported in the heartbeat.
///
/// `Offline` keeps the legacy UAVCAN v0 code 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Mode {
    #[default]
    Operational = 0,
    Initialization = 1,
    Maintenance = 2,
    SoftwareUpdate = 3,
    Offline = 7,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Operational => "operational",
            Mode::Initialization => "initialization",
            Mode::Maintenance => "maintenance",
            Mode::SoftwareUpdate => "software_update",
            Mode::Offline => "offline",
        }
    }
}

impl TryFrom<u8> for Mode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Mode::Operational),
            1 => Ok(Mode::Initialization),
            2 => Ok(Mode::Maintenance),
            3 => Ok(Mode::SoftwareUpdate),
            7 => Ok(Mode::Offline),
            _ => Err(ProtocolError::MalformedPayload { what: "mode" }),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bounds() {
        assert_eq!(Priority::try_from(7).unwrap(), Priority::Optional);
        assert!(matches!(
            Priority::try_from(8),
            Err(ProtocolError::InvalidPriority(8))
        ));
        assert_eq!(Priority::default(), Priority::Nominal);
        assert!(Priority::Exceptional < Priority::Optional);
    }

    #[test]
    fn test_node_id_bounds() {
        assert!(NodeId::new(1).is_some());
        assert!(NodeId::new(127).is_some());
        assert!(NodeId::new(0).is_none());
        assert!(NodeId::new(128).is_none());
        assert!(NodeId::new(255).unwrap().is_unset());
        assert_eq!(NodeId::default(), NodeId::UNSET);
    }

    #[test]
    fn test_node_id_from_raw_is_permissive() {
        let zero = NodeId::from_raw(0);
        assert_eq!(zero.get(), 0);
        assert!(!zero.is_valid());
        assert!(!zero.is_assigned());
    }

    #[test]
    fn test_mode_offline_code() {
        assert_eq!(Mode::Offline as u8, 7);
        assert_eq!(Mode::try_from(7).unwrap(), Mode::Offline);
        assert!(Mode::try_from(4).is_err());
    }

    #[test]
    fn test_health_codes() {
        for (code, health) in [
            (0, Health::Nominal),
            (1, Health::Advisory),
            (2, Health::Caution),
            (3, Health::Warning),
        ] {
            assert_eq!(Health::try_from(code).unwrap(), health);
            assert_eq!(health as u8, code);
        }
        assert!(Health::try_from(4).is_err());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(NodeId::UNSET.to_string(), "unset");
        assert_eq!(NodeId::new(42).unwrap().to_string(), "42");
        assert_eq!(Mode::SoftwareUpdate.to_string(), "software_update");
        assert_eq!(Priority::High.to_string(), "high");
    }
}
