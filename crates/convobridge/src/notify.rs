//! Console-facing notices about a tenant's transport health.
//!
//! Outage notices go to the tenant's self-notification channel: a console
//! conversation with the tenant's own address, resolved lazily and cached in
//! the lookup store. Pairing notices go to the conversation the operator
//! asked from. Every notice is posted as a private note so nothing is ever
//! relayed back over the transport.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{LookupCache, SelfChannel, ThrottleStore};
use crate::console::{
    Attachment, ConsoleApi, ConsoleConfig, ConsoleError, NewContact, OutgoingMessage, Priority,
};
use crate::sync::KeyedLocks;
use crate::tenant::{TenantError, TenantRecord, TenantStore};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error(transparent)]
    Tenant(#[from] TenantError),
}

pub type Result<T> = std::result::Result<T, NotifyError>;

// ============================================================================
// Notice catalogue
// ============================================================================

/// A message the bridge posts about a tenant's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// First detection of an outage.
    OutageStarted,
    /// Periodic reminder while the outage lasts.
    OutageOngoing {
        down_for: Duration,
        attempts: u32,
        max_attempts: u32,
    },
    /// The transport is healthy again.
    Recovered,
    /// A pairing challenge to approve on the device.
    PairingChallenge {
        code: String,
        attempt: u32,
        max_attempts: u32,
        valid_for: Duration,
        /// QR rendering supplied by the transport, shown under the code.
        qr_ascii: Option<String>,
        /// QR image data URL, posted as an attachment.
        qr_image: Option<String>,
    },
    /// No challenge could be obtained for `attempt`.
    PairingFailed {
        attempt: u32,
        max_attempts: u32,
        reason: String,
    },
    /// The challenge of `attempt` expired unused.
    PairingExpired { attempt: u32, max_attempts: u32 },
    /// The episode's pairing budget is spent.
    LimitExceeded { attempts: u32, max_attempts: u32 },
    /// The device approved the challenge.
    PairingSucceeded,
    /// An agent reply could not be sent because the transport is down.
    Undelivered,
}

impl Notice {
    /// Message text for a tenant called `name`.
    pub fn render(&self, name: &str) -> String {
        match self {
            Self::OutageStarted => format!(
                "{name} lost its messaging connection. Customer messages are not \
                 being delivered. Send /pair in any conversation to reconnect."
            ),
            Self::OutageOngoing {
                down_for,
                attempts,
                max_attempts,
            } if attempts >= max_attempts => format!(
                "{name} is still disconnected after {}. Pairing attempts \
                 {attempts}/{max_attempts}, limit exceeded. Manual intervention \
                 is required on the transport host.",
                human_duration(*down_for)
            ),
            Self::OutageOngoing {
                down_for,
                attempts,
                max_attempts,
            } => format!(
                "{name} is still disconnected after {}. Pairing attempts \
                 {attempts}/{max_attempts}. Send /pair to request a code.",
                human_duration(*down_for)
            ),
            Self::Recovered => {
                format!("{name} is connected again. Message forwarding has resumed.")
            }
            Self::PairingChallenge {
                code,
                attempt,
                max_attempts,
                valid_for,
                qr_ascii,
                ..
            } => {
                let mut text = format!(
                    "Pairing code for {name} (attempt {attempt}/{max_attempts}), valid for {}:\n\n{code}",
                    human_duration(*valid_for)
                );
                if let Some(qr) = qr_ascii {
                    text.push_str(&format!("\n\n```\n{qr}\n```"));
                }
                text
            }
            Self::PairingFailed {
                attempt,
                max_attempts,
                reason,
            } if attempt >= max_attempts => format!(
                "Pairing for {name} failed at attempt {attempt}/{max_attempts}, limit \
                 exceeded ({reason}). Manual intervention is required on the transport host."
            ),
            Self::PairingFailed {
                attempt,
                max_attempts,
                reason,
            } => format!(
                "Pairing for {name} failed at attempt {attempt}/{max_attempts} ({reason}). \
                 Send /pair to try again."
            ),
            Self::PairingExpired {
                attempt,
                max_attempts,
            } => format!(
                "Pairing code for {name} expired (attempt {attempt}/{max_attempts}). \
                 Send /pair to request a new one."
            ),
            Self::LimitExceeded {
                attempts,
                max_attempts,
            } => format!(
                "Pairing for {name} stopped at attempt {attempts}/{max_attempts}, limit \
                 exceeded. Manual intervention is required on the transport host."
            ),
            Self::PairingSucceeded => format!(
                "Pairing for {name} was approved. Forwarding resumes once the \
                 connection check confirms it."
            ),
            Self::Undelivered => format!(
                "This reply was not delivered: {name} is disconnected from the \
                 messaging network. Resend it once the connection is back."
            ),
        }
    }

    /// Files posted with the notice.
    pub fn attachments(&self) -> Vec<Attachment> {
        match self {
            Self::PairingChallenge {
                qr_image: Some(data_url),
                ..
            } => vec![Attachment {
                file_name: "pairing-code.png".to_string(),
                data_url: data_url.clone(),
            }],
            _ => Vec::new(),
        }
    }

    /// Priority the target conversation should get alongside the notice.
    pub fn priority(&self) -> Option<Priority> {
        match self {
            Self::OutageStarted => Some(Priority::Urgent),
            Self::Recovered => Some(Priority::None),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OutageStarted => "outage_started",
            Self::OutageOngoing { .. } => "outage_ongoing",
            Self::Recovered => "recovered",
            Self::PairingChallenge { .. } => "pairing_challenge",
            Self::PairingFailed { .. } => "pairing_failed",
            Self::PairingExpired { .. } => "pairing_expired",
            Self::LimitExceeded { .. } => "limit_exceeded",
            Self::PairingSucceeded => "pairing_succeeded",
            Self::Undelivered => "undelivered",
        }
    }
}

fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 120 {
        format!("{secs} seconds")
    } else if secs < 7200 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{} hours", secs / 3600)
    }
}

// ============================================================================
// ConsoleNotifier
// ============================================================================

/// Posts [`Notice`]s to the console.
#[derive(Clone)]
pub struct ConsoleNotifier {
    console: Arc<dyn ConsoleApi>,
    tenants: Arc<dyn TenantStore>,
    lookups: LookupCache,
    throttle: ThrottleStore,
    resolve_locks: KeyedLocks,
}

impl ConsoleNotifier {
    /// Create a notifier that resolves channels through `lookups`.
    pub fn new(
        console: Arc<dyn ConsoleApi>,
        tenants: Arc<dyn TenantStore>,
        lookups: LookupCache,
        throttle: ThrottleStore,
    ) -> Self {
        Self {
            console,
            tenants,
            lookups,
            throttle,
            resolve_locks: KeyedLocks::new(),
        }
    }

    /// The console client notices are posted through.
    pub fn console(&self) -> &Arc<dyn ConsoleApi> {
        &self.console
    }

    /// Post `notice` to the tenant's self-notification channel.
    pub async fn notify_tenant(&self, tenant_id: &str, notice: &Notice) -> Result<()> {
        let tenant = self.tenants.get(tenant_id).await?;
        let channel = self.self_channel(&tenant).await?;

        let sent = self
            .deliver(&tenant, &tenant.console, channel.conversation_id, notice)
            .await;
        if let Err(NotifyError::Console(e)) = &sent
            && e.is_not_found()
        {
            // The conversation was deleted in the console; resolve again next time.
            self.lookups.forget_self_channel(tenant_id);
        }
        sent
    }

    /// Post `notice` to a specific conversation.
    pub async fn notify_conversation(
        &self,
        tenant_id: &str,
        console: &ConsoleConfig,
        conversation_id: u64,
        notice: &Notice,
    ) -> Result<()> {
        let tenant = self.tenants.get(tenant_id).await?;
        self.deliver(&tenant, console, conversation_id, notice).await
    }

    /// Like [`notify_conversation`](Self::notify_conversation), at most once per
    /// throttle window for `key`. Returns whether the notice was posted.
    pub async fn notify_conversation_throttled(
        &self,
        tenant_id: &str,
        console: &ConsoleConfig,
        conversation_id: u64,
        key: &str,
        notice: &Notice,
    ) -> Result<bool> {
        let key = format!("{tenant_id}/{key}");
        if !self.throttle.try_acquire(&key) {
            debug!(tenant = %tenant_id, notice = notice.kind(), "Notice throttled");
            return Ok(false);
        }
        match self
            .notify_conversation(tenant_id, console, conversation_id, notice)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                self.throttle.reset(&key);
                Err(e)
            }
        }
    }

    async fn deliver(
        &self,
        tenant: &TenantRecord,
        console: &ConsoleConfig,
        conversation_id: u64,
        notice: &Notice,
    ) -> Result<()> {
        let message = OutgoingMessage::private_note(notice.render(tenant.display_name()))
            .with_attachments(notice.attachments());
        self.console
            .send_message(console, conversation_id, &message)
            .await?;

        if let Some(priority) = notice.priority()
            && let Err(e) = self
                .console
                .set_conversation_priority(console, conversation_id, priority)
                .await
        {
            warn!(
                tenant = %tenant.id,
                conversation_id,
                priority = %priority,
                error = %e,
                "Failed to set conversation priority"
            );
        }

        debug!(
            tenant = %tenant.id,
            conversation_id,
            notice = notice.kind(),
            "Notice posted"
        );
        Ok(())
    }

    /// The tenant's own console conversation, created on first use.
    pub async fn self_channel(&self, tenant: &TenantRecord) -> Result<SelfChannel> {
        if let Some(channel) = self.lookups.self_channel(&tenant.id) {
            return Ok(channel);
        }

        let _guard = self.resolve_locks.lock(&tenant.id).await;
        if let Some(channel) = self.lookups.self_channel(&tenant.id) {
            return Ok(channel);
        }

        let identity = self.tenants.identity(&tenant.id).await?;
        let inbox_id = self.inbox_id(tenant).await?;
        let contact = self
            .console
            .find_or_create_contact(
                &tenant.console,
                inbox_id,
                &NewContact {
                    identifier: identity,
                    name: tenant.display_name().to_string(),
                },
            )
            .await?;
        let conversation = self
            .console
            .find_or_create_conversation(&tenant.console, inbox_id, contact.id)
            .await?;

        let channel = SelfChannel {
            contact_id: contact.id,
            conversation_id: conversation.id,
        };
        self.lookups.put_self_channel(&tenant.id, channel);
        debug!(
            tenant = %tenant.id,
            conversation_id = channel.conversation_id,
            "Resolved self-notification channel"
        );
        Ok(channel)
    }

    /// The tenant's inbox id, cached after the first lookup.
    pub async fn inbox_id(&self, tenant: &TenantRecord) -> Result<u64> {
        if let Some(id) = self.lookups.inbox(&tenant.id) {
            return Ok(id);
        }
        let inbox = self
            .console
            .find_inbox_by_name(&tenant.console)
            .await?
            .ok_or_else(|| ConsoleError::InboxNotFound(tenant.console.inbox_name.clone()))?;
        self.lookups.put_inbox(&tenant.id, inbox.id);
        Ok(inbox.id)
    }
}
