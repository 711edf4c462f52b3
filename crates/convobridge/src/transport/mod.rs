//! Transport session boundary.
//!
//! A tenant's messaging-network session lives outside this process. The
//! bridge reaches it through a [`SessionRegistry`] that hands out
//! [`TransportSession`] handles. The production implementation talks to a
//! sidecar over HTTP; tests script sessions in memory.

mod sidecar;
pub mod sse;

pub use sidecar::SidecarRegistry;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use convobridge_transport_protocol::{
    CreateSessionRequest, OutboundText, SendReceipt, SessionState, TransportEvent,
};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Session events, in the order the session emitted them.
pub type EventStream = BoxStream<'static, TransportEvent>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transport rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("no transport session for tenant '{0}'")]
    NoSession(String),

    #[error("transport session is not connected")]
    NotConnected,

    #[error("invalid transport response: {0}")]
    InvalidResponse(String),
}

/// Handle to one tenant's live transport session.
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn tenant_id(&self) -> &str;

    /// Current connectivity snapshot.
    async fn state(&self) -> Result<SessionState>;

    async fn is_connected(&self) -> Result<bool> {
        Ok(self.state().await?.connected)
    }

    async fn is_logged_in(&self) -> Result<bool> {
        Ok(self.state().await?.logged_in)
    }

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Drop the session's credentials. The next connect issues a fresh challenge.
    async fn logout(&self) -> Result<()>;

    async fn send_text(&self, message: &OutboundText) -> Result<SendReceipt>;

    /// Upload media and return the transport's handle for it.
    async fn upload(&self, file_name: &str, mime_type: &str, data: Vec<u8>) -> Result<String>;

    /// Subscribe to session events. Only events emitted after the call are seen.
    async fn events(&self) -> Result<EventStream>;
}

/// Lookup and creation of transport sessions.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// The tenant's session, or `None` when the transport has none.
    async fn get_session(&self, tenant_id: &str) -> Result<Option<Arc<dyn TransportSession>>>;

    async fn create_session(&self, request: &CreateSessionRequest) -> Result<()>;
}
