//! Wire types shared between convobridge and transport sidecars.
//!
//! A transport sidecar hosts the real messaging-network client for one or more
//! tenants. Convobridge talks to it over plain HTTP (JSON bodies) and receives
//! session events as Server-Sent Events whose `data:` lines are JSON encoded
//! [`TransportEvent`] values.
//!
//! # Event shapes
//!
//! ```text
//! {"code": "2@AbC...=="}          pairing challenge issued
//! {"code": "2@AbC...==", "qr_ascii": "...", "qr_image": "data:image/png;base64,..."}
//! {"event": "success"}            pairing approved on the device
//! {"event": "timeout"}            pairing challenge expired upstream
//! {"event": "disconnected", "reason": "stream error"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Events (Sidecar → Convobridge)
// ============================================================================

/// Event emitted by a tenant's transport session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportEvent {
    /// A pairing challenge that must be approved on the user's device.
    Challenge {
        code: String,
        /// ASCII art representation of the code's QR for text-only displays.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        qr_ascii: Option<String>,
        /// QR image of the code as an RFC 2397 data URL.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        qr_image: Option<String>,
    },

    /// A lifecycle notification for the session.
    Status {
        event: SessionEventKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Lifecycle event kinds carried by [`TransportEvent::Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    /// Pairing completed and the session is authenticated.
    Success,
    /// The outstanding pairing challenge expired.
    Timeout,
    /// Socket connected to the network.
    Connected,
    /// Socket dropped.
    Disconnected,
    /// Credentials were revoked or the device was unlinked.
    LoggedOut,
}

impl TransportEvent {
    /// Build a challenge event.
    pub fn challenge(code: impl Into<String>) -> Self {
        Self::Challenge {
            code: code.into(),
            qr_ascii: None,
            qr_image: None,
        }
    }

    /// Build a status event without a reason.
    pub fn status(event: SessionEventKind) -> Self {
        Self::Status {
            event,
            reason: None,
        }
    }

    /// The challenge code, if this is a challenge event.
    pub fn challenge_code(&self) -> Option<&str> {
        match self {
            Self::Challenge { code, .. } => Some(code),
            Self::Status { .. } => None,
        }
    }

    /// The lifecycle kind, if this is a status event.
    pub fn kind(&self) -> Option<SessionEventKind> {
        match self {
            Self::Status { event, .. } => Some(*event),
            Self::Challenge { .. } => None,
        }
    }
}

// ============================================================================
// Requests and State (Convobridge ↔ Sidecar)
// ============================================================================

/// Connectivity snapshot returned by `GET /sessions/{tenant}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub tenant_id: String,
    pub connected: bool,
    pub logged_in: bool,
    /// Network address of the authenticated account, once paired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<DateTime<Utc>>,
}

impl SessionState {
    /// True when the session can carry traffic.
    pub fn is_healthy(&self) -> bool {
        self.connected && self.logged_in
    }
}

/// Body of `POST /sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub tenant_id: String,
    pub identity: String,
    pub auth_token: String,
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

/// Body of `POST /sessions/{tenant}/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundText {
    /// Recipient network address.
    pub to: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Response of `POST /sessions/{tenant}/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Well-known event subscriptions requested when a session is created.
pub mod subscriptions {
    /// Incoming chat messages.
    pub const MESSAGE: &str = "message";
    /// Delivery and read receipts.
    pub const RECEIPT: &str = "receipt";
    /// Connection and pairing lifecycle events.
    pub const CONNECTION: &str = "connection";
    /// Presence updates.
    pub const PRESENCE: &str = "presence";

    /// Subscriptions used when a tenant does not configure its own.
    pub fn defaults() -> Vec<String> {
        vec![MESSAGE.to_string(), RECEIPT.to_string(), CONNECTION.to_string()]
    }
}
