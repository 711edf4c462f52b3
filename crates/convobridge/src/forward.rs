//! Gated forwarding between the transport and the console.
//!
//! Inbound messages become console messages in the sender's conversation;
//! agent replies become transport messages. Both directions pass through the
//! [`ForwardingGate`] so a redelivered event never repeats its side effect,
//! and contact/conversation creation for one sender is serialized so two
//! different events cannot race to create duplicates.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use convobridge_transport_protocol::OutboundText;

use crate::cache::LookupCache;
use crate::console::{Attachment, ConsoleApi, ConsoleError, NewContact, OutgoingMessage};
use crate::gate::{Fingerprint, ForwardingGate};
use crate::notify::{ConsoleNotifier, Notice, NotifyError};
use crate::reliability::MonitorSupervisor;
use crate::sync::KeyedLocks;
use crate::tenant::{TenantError, TenantRecord, TenantStore};
use crate::transport::{SessionRegistry, TransportError, TransportSession};

// ============================================================================
// Events
// ============================================================================

fn default_kind() -> String {
    "message".to_string()
}

/// A message received on the transport, already parsed by the ingestion layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Upstream event id, stable across redeliveries.
    pub event_id: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Sender's transport address.
    pub sender: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// An agent reply written in the console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEvent {
    /// Console message id, stable across webhook retries.
    pub message_id: String,
    pub conversation_id: u64,
    /// Recipient's transport address.
    pub recipient: String,
    pub text: String,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// What happened to a forwarded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ForwardOutcome {
    /// The side effect ran.
    Forwarded { reference: String },
    /// The fingerprint was already claimed inside its TTL window.
    Duplicate,
    /// The transport is down; monitoring was ensured and the agent notified.
    Deferred,
}

impl ForwardOutcome {
    /// True if the event reached the other side in this call.
    pub fn forwarded(&self) -> bool {
        matches!(self, Self::Forwarded { .. })
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("unknown tenant '{0}'")]
    UnknownTenant(String),

    #[error(transparent)]
    Tenant(TenantError),

    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<TenantError> for ForwardError {
    fn from(e: TenantError) -> Self {
        match e {
            TenantError::NotFound(id) => Self::UnknownTenant(id),
            other => Self::Tenant(other),
        }
    }
}

impl From<NotifyError> for ForwardError {
    fn from(e: NotifyError) -> Self {
        match e {
            NotifyError::Console(e) => Self::Console(e),
            NotifyError::Tenant(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ForwardError>;

// ============================================================================
// Forwarder
// ============================================================================

#[derive(Clone)]
pub struct Forwarder {
    gate: ForwardingGate,
    lookups: LookupCache,
    console: Arc<dyn ConsoleApi>,
    registry: Arc<dyn SessionRegistry>,
    tenants: Arc<dyn TenantStore>,
    notifier: ConsoleNotifier,
    supervisor: MonitorSupervisor,
    sender_locks: KeyedLocks,
    marker_ttl: Duration,
}

impl Forwarder {
    /// Create a forwarder. Handled events stay deduplicated for the gate's default TTL.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gate: ForwardingGate,
        lookups: LookupCache,
        console: Arc<dyn ConsoleApi>,
        registry: Arc<dyn SessionRegistry>,
        tenants: Arc<dyn TenantStore>,
        notifier: ConsoleNotifier,
        supervisor: MonitorSupervisor,
        sender_locks: KeyedLocks,
    ) -> Self {
        let marker_ttl = gate.default_ttl();
        Self {
            gate,
            lookups,
            console,
            registry,
            tenants,
            notifier,
            supervisor,
            sender_locks,
            marker_ttl,
        }
    }

    /// Relay an inbound transport message into the sender's console conversation.
    pub async fn forward_inbound(&self, tenant_id: &str, event: &InboundEvent) -> Result<ForwardOutcome> {
        let tenant = self.tenants.get(tenant_id).await?;
        let fingerprint = Fingerprint::of(tenant_id, &event.kind, &event.event_id);

        let sent = self
            .gate
            .run_once(&fingerprint, self.marker_ttl, self.deliver_inbound(&tenant, event))
            .await?;

        Ok(match sent {
            Some(message_id) => {
                debug!(tenant = %tenant_id, fingerprint = %fingerprint, message_id, "Inbound message forwarded");
                ForwardOutcome::Forwarded {
                    reference: message_id.to_string(),
                }
            }
            None => ForwardOutcome::Duplicate,
        })
    }

    async fn deliver_inbound(&self, tenant: &TenantRecord, event: &InboundEvent) -> Result<u64> {
        let inbox_id = self.notifier.inbox_id(tenant).await?;
        let name = event.sender_name.as_deref().unwrap_or(&event.sender);
        let (contact_id, conversation_id) = self
            .resolve_conversation(tenant, inbox_id, &event.sender, name)
            .await?;

        let message =
            OutgoingMessage::incoming(&event.text).with_attachments(event.attachments.clone());
        match self
            .console
            .send_message(&tenant.console, conversation_id, &message)
            .await
        {
            Ok(id) => Ok(id),
            Err(e) => {
                if e.is_not_found() {
                    // The conversation is gone; the redelivery will open a new one.
                    self.lookups.forget_conversation(&tenant.id, contact_id);
                }
                Err(e.into())
            }
        }
    }

    /// Contact and open conversation of `sender`, created at most once per sender.
    async fn resolve_conversation(
        &self,
        tenant: &TenantRecord,
        inbox_id: u64,
        sender: &str,
        name: &str,
    ) -> Result<(u64, u64)> {
        if let Some(found) = self.cached_conversation(&tenant.id, sender) {
            return Ok(found);
        }

        let _guard = self
            .sender_locks
            .lock(&format!("{}/{}", tenant.id, sender))
            .await;
        if let Some(found) = self.cached_conversation(&tenant.id, sender) {
            return Ok(found);
        }

        let contact_id = match self.lookups.contact(&tenant.id, sender) {
            Some(id) => id,
            None => {
                let contact = self
                    .console
                    .find_or_create_contact(
                        &tenant.console,
                        inbox_id,
                        &NewContact {
                            identifier: sender.to_string(),
                            name: name.to_string(),
                        },
                    )
                    .await?;
                self.lookups.put_contact(&tenant.id, sender, contact.id);
                contact.id
            }
        };

        let conversation = self
            .console
            .find_or_create_conversation(&tenant.console, inbox_id, contact_id)
            .await?;
        self.lookups
            .put_conversation(&tenant.id, contact_id, conversation.id);
        Ok((contact_id, conversation.id))
    }

    fn cached_conversation(&self, tenant_id: &str, sender: &str) -> Option<(u64, u64)> {
        let contact_id = self.lookups.contact(tenant_id, sender)?;
        let conversation_id = self.lookups.conversation(tenant_id, contact_id)?;
        Some((contact_id, conversation_id))
    }

    /// Send an agent reply over the tenant's transport session.
    pub async fn forward_outbound(
        &self,
        tenant_id: &str,
        event: &OutboundEvent,
    ) -> Result<ForwardOutcome> {
        let tenant = self.tenants.get(tenant_id).await?;
        let fingerprint = Fingerprint::of(tenant_id, "outbound", &event.message_id);
        let Some(claim) = self.gate.try_claim(&fingerprint) else {
            return Ok(ForwardOutcome::Duplicate);
        };

        let Some(session) = self.connected_session(tenant_id).await else {
            drop(claim);
            self.defer(&tenant, event).await;
            return Ok(ForwardOutcome::Deferred);
        };

        let text = OutboundText {
            to: event.recipient.clone(),
            text: event.text.clone(),
            reply_to: event.reply_to.clone(),
        };
        match session.send_text(&text).await {
            Ok(receipt) => {
                claim.commit(self.marker_ttl);
                debug!(
                    tenant = %tenant_id,
                    fingerprint = %fingerprint,
                    message_id = %receipt.message_id,
                    "Outbound message sent"
                );
                Ok(ForwardOutcome::Forwarded {
                    reference: receipt.message_id,
                })
            }
            Err(TransportError::NotConnected) => {
                drop(claim);
                self.defer(&tenant, event).await;
                Ok(ForwardOutcome::Deferred)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn connected_session(&self, tenant_id: &str) -> Option<Arc<dyn TransportSession>> {
        let session = match self.registry.get_session(tenant_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return None,
            Err(e) => {
                warn!(tenant = %tenant_id, error = %e, "Session lookup failed");
                return None;
            }
        };
        match session.is_connected().await {
            Ok(true) => Some(session),
            Ok(false) => None,
            Err(e) => {
                warn!(tenant = %tenant_id, error = %e, "Session state check failed");
                None
            }
        }
    }

    /// Transport is down: make sure it is monitored and tell the agent, throttled.
    async fn defer(&self, tenant: &TenantRecord, event: &OutboundEvent) {
        if self.supervisor.ensure_monitoring(&tenant.id).await {
            info!(tenant = %tenant.id, "Outbound send found transport offline");
        }

        let key = format!("undelivered/{}", event.conversation_id);
        if let Err(e) = self
            .notifier
            .notify_conversation_throttled(
                &tenant.id,
                &tenant.console,
                event.conversation_id,
                &key,
                &Notice::Undelivered,
            )
            .await
        {
            warn!(tenant = %tenant.id, error = %e, "Failed to post undelivered note");
        }
    }

    /// Drop every cached lookup of a tenant, e.g. after its console config changed.
    pub fn invalidate_tenant(&self, tenant_id: &str) -> usize {
        let removed = self.lookups.invalidate_tenant(tenant_id);
        debug!(tenant = %tenant_id, removed, "Lookup cache invalidated");
        removed
    }
}
