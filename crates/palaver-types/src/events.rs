//! Host-facing event types delivered through session callbacks.

use serde::{Deserialize, Serialize};

/// Why a join attempt was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RejectReason {
    /// The group is at its peer limit.
    GroupFull = 0,
    /// The supplied password did not match.
    InvalidPassword = 1,
    /// The requested nick is already taken.
    NickTaken = 2,
    /// The invite could not be processed.
    InviteFailed = 3,
}

impl RejectReason {
    /// Decode a wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RejectReason::GroupFull),
            1 => Some(RejectReason::InvalidPassword),
            2 => Some(RejectReason::NickTaken),
            3 => Some(RejectReason::InviteFailed),
            _ => None,
        }
    }
}

/// Moderation events surfaced to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ModerationEvent {
    Kick = 0,
    Ban = 1,
    Observer = 2,
    User = 3,
    Moderator = 4,
}

impl ModerationEvent {
    /// Decode a wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ModerationEvent::Kick),
            1 => Some(ModerationEvent::Ban),
            2 => Some(ModerationEvent::Observer),
            3 => Some(ModerationEvent::User),
            4 => Some(ModerationEvent::Moderator),
            _ => None,
        }
    }
}

/// Kind of a user-visible chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MessageType {
    Plain = 0,
    Action = 1,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_round_trip() {
        for value in 0..=3u8 {
            let reason = RejectReason::from_u8(value).expect("reason");
            assert_eq!(reason as u8, value);
        }
        assert!(RejectReason::from_u8(4).is_none());
    }

    #[test]
    fn moderation_event_round_trip() {
        for value in 0..=4u8 {
            let event = ModerationEvent::from_u8(value).expect("event");
            assert_eq!(event as u8, value);
        }
        assert!(ModerationEvent::from_u8(5).is_none());
    }
}
