//! Operator commands typed by agents in a console conversation.

use tracing::{info, warn};

use crate::bridge::Bridge;
use crate::console::OutgoingMessage;
use crate::reliability::ReliabilityError;

/// A recognised operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Request a pairing code (`/pair`, `/connect`).
    Pair,
    /// Report monitoring state (`/status`).
    Status,
    /// Stop monitoring (`/stop`, `/stop-monitoring`).
    Stop,
}

impl OperatorCommand {
    /// Parse the first word of `text`. Anything that is not a known slash
    /// command returns `None` and is treated as a normal message.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?.strip_prefix('/')?;
        match word.to_ascii_lowercase().as_str() {
            "pair" | "connect" => Some(Self::Pair),
            "status" => Some(Self::Status),
            "stop" | "stop-monitoring" => Some(Self::Stop),
            _ => None,
        }
    }
}

// ============================================================================
// Command Handlers
// ============================================================================

impl Bridge {
    /// Run an operator command typed in `conversation_id`.
    ///
    /// Returns false if `text` is not a command. Replies are posted back to the
    /// conversation as private notes.
    pub async fn handle_command(&self, tenant_id: &str, conversation_id: u64, text: &str) -> bool {
        let Some(command) = OperatorCommand::parse(text) else {
            return false;
        };
        info!(tenant = %tenant_id, conversation_id, command = ?command, "Operator command");

        let reply = match command {
            OperatorCommand::Pair => self.handle_pair_command(tenant_id, conversation_id).await,
            OperatorCommand::Status => Some(self.handle_status_command(tenant_id).await),
            OperatorCommand::Stop => Some(self.handle_stop_command(tenant_id).await),
        };

        if let Some(reply) = reply {
            self.reply(tenant_id, conversation_id, reply).await;
        }
        true
    }

    /// Workflow notices already cover success and budget exhaustion, so only
    /// the remaining failures get a reply.
    async fn handle_pair_command(&self, tenant_id: &str, conversation_id: u64) -> Option<String> {
        let tenant = match self.tenants.get(tenant_id).await {
            Ok(tenant) => tenant,
            Err(e) => return Some(format!("Cannot pair: {e}.")),
        };

        match self
            .request_pairing(tenant_id, conversation_id, &tenant.console)
            .await
        {
            Ok(_) | Err(ReliabilityError::RetryBudgetExhausted { .. }) => None,
            Err(ReliabilityError::AlreadyConnected(_)) => {
                Some(format!("{} is already connected.", tenant.display_name()))
            }
            Err(e) => {
                warn!(tenant = %tenant_id, error = %e, "Pairing request failed");
                Some(format!("Pairing failed: {e}."))
            }
        }
    }

    async fn handle_status_command(&self, tenant_id: &str) -> String {
        let Some(status) = self.supervisor.status(tenant_id).await else {
            return "Transport is not being monitored.".to_string();
        };
        format!(
            "Transport disconnected since {} ({} min).\nPairing attempts: {}/{}{}",
            status.started_at.format("%Y-%m-%d %H:%M UTC"),
            status.down_for_seconds / 60,
            status.attempts,
            status.max_attempts,
            if status.pairing_pending {
                "\nA pairing code is waiting for approval."
            } else {
                ""
            },
        )
    }

    async fn handle_stop_command(&self, tenant_id: &str) -> String {
        if self.stop_monitoring(tenant_id).await {
            "Monitoring stopped.".to_string()
        } else {
            "Transport was not being monitored.".to_string()
        }
    }

    async fn reply(&self, tenant_id: &str, conversation_id: u64, text: String) {
        let tenant = match self.tenants.get(tenant_id).await {
            Ok(tenant) => tenant,
            Err(e) => {
                warn!(tenant = %tenant_id, error = %e, "Cannot reply to command");
                return;
            }
        };
        let note = OutgoingMessage::private_note(text);
        if let Err(e) = self
            .notifier
            .console()
            .send_message(&tenant.console, conversation_id, &note)
            .await
        {
            warn!(tenant = %tenant_id, error = %e, "Failed to post command reply");
        }
    }
}
