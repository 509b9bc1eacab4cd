//! Closed enumerations of the group protocol.
//!
//! Every enum here crosses the wire as a single byte; discriminants are
//! stable across versions for wire compatibility.

use serde::{Deserialize, Serialize};

/// A peer's role within a group, ordered from most to least privileged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Role {
    Founder = 0,
    Moderator = 1,
    User = 2,
    Observer = 3,
    /// Not yet validated via peer-info exchange.
    Invalid = 4,
}

impl Role {
    /// Decode a wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Role::Founder),
            1 => Some(Role::Moderator),
            2 => Some(Role::User),
            3 => Some(Role::Observer),
            4 => Some(Role::Invalid),
            _ => None,
        }
    }

    /// True for founder or moderator.
    pub fn is_privileged(self) -> bool {
        matches!(self, Role::Founder | Role::Moderator)
    }
}

/// A peer's self-reported user status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PeerStatus {
    #[default]
    None = 0,
    Away = 1,
    Busy = 2,
}

impl PeerStatus {
    /// Decode a wire byte. Values at or above the invalid bound are rejected.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PeerStatus::None),
            1 => Some(PeerStatus::Away),
            2 => Some(PeerStatus::Busy),
            _ => None,
        }
    }
}

/// Connection state of a chat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Slot is unused.
    None,
    /// We know peers but have no live connection.
    Disconnected,
    /// Actively trying to establish connections.
    Connecting,
    /// At least one confirmed peer.
    Connected,
    /// Join failed permanently (e.g. rejected invite).
    Failed,
    /// Exit requested; deleted on the next tick.
    Closing,
}

/// Privacy state of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Privacy {
    /// Discoverable by chat id via announces.
    Public = 0,
    /// Joinable only through a friend invite.
    Private = 1,
}

impl Privacy {
    /// Decode a wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Privacy::Public),
            1 => Some(Privacy::Private),
            _ => None,
        }
    }
}

/// How we joined (or are joining) a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JoinType {
    /// Discovered via the announce store by chat id.
    Public = 0,
    /// Introduced through a friend invite.
    Private = 1,
}

impl JoinType {
    /// Decode a wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(JoinType::Public),
            1 => Some(JoinType::Private),
            _ => None,
        }
    }
}
