//! Shared data model: messages, connection events, discovered peers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One relief status message. `to_id` is `None` for locally authored
/// entries; inbound messages get the local identity as recipient on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "fromId")]
    pub from_id: String,
    #[serde(rename = "toId", default, skip_serializing_if = "Option::is_none")]
    pub to_id: Option<String>,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
}

/// Category of an operational audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Scan,
    Advertise,
    ServerEvent,
    ClientEvent,
    Permission,
    Error,
    MessageReceived,
    MessageSent,
}

/// One operational audit entry. Never pruned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: String,
    pub timestamp: i64,
}

impl ConnectionEvent {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            message: message.into(),
            timestamp: now_ms(),
        }
    }
}

/// A device seen while scanning. `address` is empty when the host's
/// permission level hides transport addresses; the digest is always visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub address: String,
    pub device_id_hex: String,
    pub name: Option<String>,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
