//! Helpdesk console boundary.
//!
//! The bridge only needs a handful of operations from the agent console:
//! resolving contacts and conversations, posting messages (public or private
//! notes), toggling conversation priority and listing inboxes. They are
//! expressed as the [`ConsoleApi`] trait so the reliability core can be driven
//! against a recording fake in tests and against [`HttpConsoleClient`] in
//! production.

mod client;
mod error;

pub use client::HttpConsoleClient;
pub use error::{ConsoleError, Result};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// Tenant console configuration
// ============================================================================

/// Per-tenant console coordinates.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ConsoleConfig {
    pub base_url: String,
    pub account_id: u64,
    pub auth_token: String,
    /// Name of the inbox the tenant's conversations live in.
    pub inbox_name: String,
}

impl ConsoleConfig {
    /// Reject configs no request could succeed with.
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConsoleError::InvalidConfig(format!(
                "base_url '{}' must be an http(s) URL",
                self.base_url
            )));
        }
        if self.account_id == 0 {
            return Err(ConsoleError::InvalidConfig(
                "account_id must be set".to_string(),
            ));
        }
        if self.auth_token.is_empty() {
            return Err(ConsoleError::InvalidConfig(
                "auth_token must be set".to_string(),
            ));
        }
        if self.inbox_name.trim().is_empty() {
            return Err(ConsoleError::InvalidConfig(
                "inbox_name must be set".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ConsoleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleConfig")
            .field("base_url", &self.base_url)
            .field("account_id", &self.account_id)
            .field("auth_token", &"<redacted>")
            .field("inbox_name", &self.inbox_name)
            .finish()
    }
}

// ============================================================================
// Domain types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

/// Data used when a contact has to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    /// Transport address of the contact, used as the lookup key.
    pub identifier: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: u64,
    pub inbox_id: u64,
    #[serde(default)]
    pub status: Option<String>,
}

impl Conversation {
    /// True once an agent has closed the conversation.
    pub fn is_resolved(&self) -> bool {
        self.status.as_deref() == Some("resolved")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbox {
    pub id: u64,
    pub name: String,
}

/// Direction of a message as the console records it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Written by the end user.
    Incoming,
    /// Written by the bridge or an agent.
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    /// RFC 2397 data URL with the file contents.
    pub data_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: String,
    pub message_type: MessageType,
    /// Private notes are only visible to agents.
    pub private: bool,
    pub attachments: Vec<Attachment>,
}

impl OutgoingMessage {
    /// A message relayed from the end user.
    pub fn incoming(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: MessageType::Incoming,
            private: false,
            attachments: Vec::new(),
        }
    }

    /// A public message written by the bridge.
    pub fn outgoing(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: MessageType::Outgoing,
            private: false,
            attachments: Vec::new(),
        }
    }

    /// An agent-only note.
    pub fn private_note(content: impl Into<String>) -> Self {
        Self {
            private: true,
            ..Self::outgoing(content)
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Conversation priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
    None,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::None => "none",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ConsoleApi
// ============================================================================

/// Operation set of the remote console.
#[async_trait]
pub trait ConsoleApi: Send + Sync {
    /// Find a contact by identifier, creating it in `inbox_id` if absent.
    async fn find_or_create_contact(
        &self,
        config: &ConsoleConfig,
        inbox_id: u64,
        contact: &NewContact,
    ) -> Result<Contact>;

    /// Find the contact's open conversation in `inbox_id`, creating one if absent.
    async fn find_or_create_conversation(
        &self,
        config: &ConsoleConfig,
        inbox_id: u64,
        contact_id: u64,
    ) -> Result<Conversation>;

    /// Post a message to a conversation. Returns the console's message id.
    async fn send_message(
        &self,
        config: &ConsoleConfig,
        conversation_id: u64,
        message: &OutgoingMessage,
    ) -> Result<u64>;

    async fn set_conversation_priority(
        &self,
        config: &ConsoleConfig,
        conversation_id: u64,
        priority: Priority,
    ) -> Result<()>;

    async fn list_inboxes(&self, config: &ConsoleConfig) -> Result<Vec<Inbox>>;

    /// The inbox named by `config.inbox_name`, matched case-insensitively.
    async fn find_inbox_by_name(&self, config: &ConsoleConfig) -> Result<Option<Inbox>> {
        let wanted = config.inbox_name.trim();
        Ok(self
            .list_inboxes(config)
            .await?
            .into_iter()
            .find(|inbox| inbox.name.trim().eq_ignore_ascii_case(wanted)))
    }
}
