//! Wire protocol types for presenced.
//!
//! Covers: the broker payload (announce/leave), the outbound client
//! events (arrival/departure), and the identifiers they carry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::PresenceError;

/// Opaque user payload carried by announce messages. The protocol stores
/// and forwards it without inspecting its contents.
pub type UserDescriptor = serde_json::Map<String, Value>;

// ═══════════════════════════════════════════════════════════════
// Session identity
// ═══════════════════════════════════════════════════════════════

/// Ephemeral per-connection identity. Generated at session start, valid
/// for the connection's lifetime, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ═══════════════════════════════════════════════════════════════
// Broker payload
// ═══════════════════════════════════════════════════════════════

/// A presence broadcast. Exactly one variant per message.
///
/// Wire shape (JSON object):
/// - announce: `{"uuid": "<session-id>", "user": {...}}`
/// - leave:    `{"uuid": "<session-id>", "status": "leaving"}`
///
/// Anything else — missing sender, both or neither payload field, an
/// unknown status — is rejected at deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WirePresence", into = "WirePresence")]
pub enum PresenceMessage {
    Announce {
        sender: SessionId,
        descriptor: UserDescriptor,
    },
    Leave {
        sender: SessionId,
    },
}

impl PresenceMessage {
    pub fn sender(&self) -> SessionId {
        match self {
            Self::Announce { sender, .. } | Self::Leave { sender } => *sender,
        }
    }
}

const STATUS_LEAVING: &str = "leaving";

/// Loose wire shape. Validated into [`PresenceMessage`] so the rest of
/// the code never sees a half-populated record.
#[derive(Serialize, Deserialize)]
struct WirePresence {
    uuid: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<UserDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}

impl TryFrom<WirePresence> for PresenceMessage {
    type Error = PresenceError;

    fn try_from(wire: WirePresence) -> Result<Self, Self::Error> {
        match (wire.user, wire.status) {
            (Some(descriptor), None) => Ok(Self::Announce {
                sender: wire.uuid,
                descriptor,
            }),
            (None, Some(status)) if status == STATUS_LEAVING => {
                Ok(Self::Leave { sender: wire.uuid })
            }
            (None, Some(status)) => Err(PresenceError::Protocol(format!(
                "unknown status: {status:?}"
            ))),
            (Some(_), Some(_)) => Err(PresenceError::Protocol(
                "ambiguous message: both user and status present".into(),
            )),
            (None, None) => Err(PresenceError::Protocol(
                "empty message: neither user nor status present".into(),
            )),
        }
    }
}

impl From<PresenceMessage> for WirePresence {
    fn from(msg: PresenceMessage) -> Self {
        match msg {
            PresenceMessage::Announce { sender, descriptor } => Self {
                uuid: sender,
                user: Some(descriptor),
                status: None,
            },
            PresenceMessage::Leave { sender } => Self {
                uuid: sender,
                user: None,
                status: Some(STATUS_LEAVING.into()),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Outbound client events
// ═══════════════════════════════════════════════════════════════

/// Event delivered to the connected client: a peer entered or left the
/// page. Sent exactly once per roster insertion/removal.
///
/// Wire shape: `{"arrival": {...}}` / `{"departure": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEvent {
    Arrival(UserDescriptor),
    Departure(UserDescriptor),
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════
