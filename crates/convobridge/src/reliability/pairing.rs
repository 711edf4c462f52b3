//! Credential-refresh (pairing) workflow.
//!
//! An operator asks for a pairing code from a console conversation. Each
//! request consumes one attempt of the tenant's current outage episode,
//! makes sure a transport session exists and is connecting, forwards the
//! session's challenge to the conversation and arms an expiry timer that
//! races the session's own `success`/`timeout` events.
//!
//! Pairing never tears the monitor down. Reconnection is confirmed only by
//! the disconnection monitor's poll.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, info, warn};

use convobridge_transport_protocol::{SessionEventKind, TransportEvent};

use crate::config::Timings;
use crate::console::ConsoleConfig;
use crate::notify::{ConsoleNotifier, Notice};
use crate::tenant::{TenantRecord, TenantStore};
use crate::transport::{EventStream, SessionRegistry, TransportError, TransportSession};

use super::episode::{OutageEpisode, PairingAttempt};
use super::error::{ReliabilityError, Result};
use super::supervisor::MonitorSupervisor;

/// How often the registry is re-checked while a created session comes up.
const SESSION_READY_POLL: Duration = Duration::from_millis(250);

/// Issues bounded pairing attempts within a tenant's outage episode.
#[derive(Clone)]
pub struct PairingWorkflow {
    supervisor: MonitorSupervisor,
    registry: Arc<dyn SessionRegistry>,
    notifier: ConsoleNotifier,
    tenants: Arc<dyn TenantStore>,
    timings: Timings,
}

impl PairingWorkflow {
    /// Build a workflow that opens episodes through `supervisor`.
    pub fn new(
        supervisor: MonitorSupervisor,
        registry: Arc<dyn SessionRegistry>,
        notifier: ConsoleNotifier,
        tenants: Arc<dyn TenantStore>,
    ) -> Self {
        let timings = *supervisor.timings();
        Self {
            supervisor,
            registry,
            notifier,
            tenants,
            timings,
        }
    }

    /// Issue the next pairing attempt for `tenant_id`.
    ///
    /// Notices about the attempt go to `conversation_id` using `console`.
    /// An unmonitored tenant gets a new outage episode first, so every attempt
    /// is counted against an episode budget.
    ///
    /// Once the attempt is counted, the rest of the workflow runs in its own
    /// task. Dropping the returned future does not abandon the attempt: the
    /// challenge is still forwarded and its expiry still reported, and a
    /// bootstrap failure nobody waited for is posted to the conversation.
    pub async fn request_pairing(
        &self,
        tenant_id: &str,
        conversation_id: u64,
        console: &ConsoleConfig,
    ) -> Result<PairingAttempt> {
        console.validate()?;
        let tenant = self.tenants.get(tenant_id).await?;

        let existing = self.lookup_session(tenant_id).await;
        if let Some(session) = &existing
            && matches!(session.state().await, Ok(state) if state.is_healthy())
        {
            return Err(ReliabilityError::AlreadyConnected(tenant_id.to_string()));
        }

        let (episode, _) = self.supervisor.ensure_episode(tenant_id).await;
        let attempt = self
            .begin_attempt(&episode, tenant_id, conversation_id, console)
            .await?;
        info!(
            tenant = %tenant_id,
            attempt = attempt.number(),
            max_attempts = self.timings.max_pairing_attempts,
            "Pairing attempt started"
        );

        let (reply, outcome) = oneshot::channel();
        let workflow = self.clone();
        let console = console.clone();
        tokio::spawn(async move {
            let issued = workflow
                .issue(&tenant, existing, attempt.clone(), &episode, &console)
                .await;
            if let Err(Err(e)) = reply.send(issued) {
                workflow
                    .report_unattended_failure(&attempt, &episode, &console, &e)
                    .await;
            }
        });

        match outcome.await {
            Ok(issued) => issued,
            Err(_) => Err(ReliabilityError::TransportUnavailable {
                tenant: tenant_id.to_string(),
                reason: "pairing task ended unexpectedly".to_string(),
            }),
        }
    }

    /// Obtain a challenge for `attempt`, arm its expiry timer and forward it.
    async fn issue(
        &self,
        tenant: &TenantRecord,
        existing: Option<Arc<dyn TransportSession>>,
        mut attempt: PairingAttempt,
        episode: &Arc<Mutex<OutageEpisode>>,
        console: &ConsoleConfig,
    ) -> Result<PairingAttempt> {
        let tenant_id = tenant.id.as_str();
        let session = match existing {
            Some(session) => session,
            None => self.create_session(tenant).await?,
        };

        // Subscribe before connecting so the first challenge is not missed.
        let mut events = session
            .events()
            .await
            .map_err(|e| ReliabilityError::transport(tenant_id, &e))?;
        self.prepare_session(session.as_ref()).await?;
        let challenge = self.await_challenge(&mut events, tenant_id).await?;

        // The code is valid from the moment it is handed out.
        attempt.issued_at = Instant::now();
        attempt.expires_at = attempt.issued_at + self.timings.pairing_expiry;

        let (cancel, cancel_rx) = oneshot::channel();
        if !episode.lock().await.arm(attempt.id, cancel) {
            debug!(tenant = %tenant_id, attempt = %attempt.id, "Challenge arrived for superseded attempt");
            return Err(ReliabilityError::StaleAttempt(attempt.id));
        }
        let expiry = ExpiryTimer {
            attempt: attempt.clone(),
            episode: Arc::clone(episode),
            notifier: self.notifier.clone(),
            console: console.clone(),
            max_attempts: self.timings.max_pairing_attempts,
        };
        tokio::spawn(expiry.run(events, cancel_rx));

        if let Err(e) = self
            .tenants
            .record_pairing_challenge(tenant_id, &challenge.code)
            .await
        {
            warn!(tenant = %tenant_id, error = %e, "Failed to record pairing challenge");
        }

        let notice = Notice::PairingChallenge {
            code: challenge.code,
            attempt: attempt.number(),
            max_attempts: self.timings.max_pairing_attempts,
            valid_for: self.timings.pairing_expiry,
            qr_ascii: challenge.qr_ascii,
            qr_image: challenge.qr_image,
        };
        if let Err(e) = self
            .notifier
            .notify_conversation(tenant_id, console, attempt.conversation_id, &notice)
            .await
        {
            warn!(tenant = %tenant_id, error = %e, "Failed to forward pairing challenge");
        }

        info!(
            tenant = %tenant_id,
            attempt = attempt.number(),
            "Pairing challenge forwarded"
        );
        Ok(attempt)
    }

    /// Post a bootstrap failure to the conversation when the caller is gone.
    async fn report_unattended_failure(
        &self,
        attempt: &PairingAttempt,
        episode: &Mutex<OutageEpisode>,
        console: &ConsoleConfig,
        error: &ReliabilityError,
    ) {
        if !episode.lock().await.is_current(&attempt.id) {
            return;
        }
        warn!(
            tenant = %attempt.tenant_id,
            attempt = attempt.number(),
            error = %error,
            "Pairing attempt failed after its caller left"
        );
        let notice = Notice::PairingFailed {
            attempt: attempt.number(),
            max_attempts: self.timings.max_pairing_attempts,
            reason: error.to_string(),
        };
        if let Err(e) = self
            .notifier
            .notify_conversation(&attempt.tenant_id, console, attempt.conversation_id, &notice)
            .await
        {
            warn!(tenant = %attempt.tenant_id, error = %e, "Failed to post pairing failure");
        }
    }

    async fn begin_attempt(
        &self,
        episode: &Mutex<OutageEpisode>,
        tenant_id: &str,
        conversation_id: u64,
        console: &ConsoleConfig,
    ) -> Result<PairingAttempt> {
        let begun = episode
            .lock()
            .await
            .begin_attempt(conversation_id, self.timings.pairing_expiry);

        if let Err(ReliabilityError::RetryBudgetExhausted {
            attempts,
            max_attempts,
        }) = &begun
        {
            warn!(tenant = %tenant_id, attempts, max_attempts, "Pairing budget exhausted");
            let notice = Notice::LimitExceeded {
                attempts: *attempts,
                max_attempts: *max_attempts,
            };
            let key = format!("pairing-limit/{conversation_id}");
            if let Err(e) = self
                .notifier
                .notify_conversation_throttled(tenant_id, console, conversation_id, &key, &notice)
                .await
            {
                warn!(tenant = %tenant_id, error = %e, "Failed to send limit notice");
            }
        }
        begun
    }

    async fn lookup_session(&self, tenant_id: &str) -> Option<Arc<dyn TransportSession>> {
        match self.registry.get_session(tenant_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(tenant = %tenant_id, error = %e, "Session lookup failed");
                None
            }
        }
    }

    /// Create the tenant's session and wait, bounded, until the registry has it.
    async fn create_session(&self, tenant: &TenantRecord) -> Result<Arc<dyn TransportSession>> {
        let wait = self.timings.session_create_timeout;
        let request = tenant.session_request();

        let created = timeout(wait, async {
            self.registry.create_session(&request).await?;
            loop {
                if let Some(session) = self.registry.get_session(&tenant.id).await? {
                    return Ok::<_, TransportError>(session);
                }
                sleep(SESSION_READY_POLL).await;
            }
        })
        .await;

        match created {
            Ok(Ok(session)) => {
                info!(tenant = %tenant.id, "Transport session created");
                Ok(session)
            }
            Ok(Err(e)) => Err(ReliabilityError::transport(&tenant.id, &e)),
            Err(_) => {
                warn!(tenant = %tenant.id, timeout = ?wait, "Transport session creation timed out");
                Err(ReliabilityError::SessionCreateTimeout(wait))
            }
        }
    }

    /// Get the session into a state where it issues a fresh challenge.
    ///
    /// A connected but unpaired session has already shown its code to an
    /// earlier attempt, so it is restarted to make the transport issue another.
    async fn prepare_session(&self, session: &dyn TransportSession) -> Result<()> {
        let tenant_id = session.tenant_id();
        let fail = |e: TransportError| ReliabilityError::transport(tenant_id, &e);

        let state = session.state().await.map_err(fail)?;
        let restart = state.connected && !state.logged_in;
        if state.logged_in && !state.connected {
            debug!(tenant = %tenant_id, "Logging out stale session before pairing");
            session.logout().await.map_err(fail)?;
        }
        if restart {
            debug!(tenant = %tenant_id, "Restarting unpaired session for a fresh challenge");
            session.disconnect().await.map_err(fail)?;
        }
        if !state.connected || restart {
            session.connect().await.map_err(fail)?;
        }
        Ok(())
    }

    async fn await_challenge(
        &self,
        events: &mut EventStream,
        tenant_id: &str,
    ) -> Result<IssuedChallenge> {
        let wait = self.timings.challenge_wait;
        let found = timeout(wait, async {
            while let Some(event) = events.next().await {
                if let TransportEvent::Challenge {
                    code,
                    qr_ascii,
                    qr_image,
                } = event
                {
                    return Some(IssuedChallenge {
                        code,
                        qr_ascii,
                        qr_image,
                    });
                }
            }
            None
        })
        .await;

        match found {
            Ok(Some(challenge)) => Ok(challenge),
            Ok(None) => Err(ReliabilityError::TransportUnavailable {
                tenant: tenant_id.to_string(),
                reason: "session event stream closed".to_string(),
            }),
            Err(_) => Err(ReliabilityError::ChallengeTimeout(wait)),
        }
    }
}

/// A challenge as the transport issued it, with any rendering it supplied.
struct IssuedChallenge {
    code: String,
    qr_ascii: Option<String>,
    qr_image: Option<String>,
}

// ============================================================================
// Expiry timer
// ============================================================================

/// Races an attempt's expiry against the session's pairing events.
struct ExpiryTimer {
    attempt: PairingAttempt,
    episode: Arc<Mutex<OutageEpisode>>,
    notifier: ConsoleNotifier,
    console: ConsoleConfig,
    max_attempts: u32,
}

impl ExpiryTimer {
    async fn run(self, mut events: EventStream, mut cancel: oneshot::Receiver<()>) {
        let deadline = sleep_until(self.attempt.expires_at);
        tokio::pin!(deadline);
        let mut feed_open = true;

        loop {
            tokio::select! {
                _ = &mut cancel => {
                    debug!(
                        tenant = %self.attempt.tenant_id,
                        attempt = %self.attempt.id,
                        "Pairing timer cancelled"
                    );
                    return;
                }
                _ = &mut deadline => {
                    self.expired().await;
                    return;
                }
                event = events.next(), if feed_open => match event.map(|e| e.kind()) {
                    None => feed_open = false,
                    Some(Some(SessionEventKind::Success)) => {
                        self.succeeded().await;
                        return;
                    }
                    Some(Some(SessionEventKind::Timeout)) => {
                        self.expired().await;
                        return;
                    }
                    Some(_) => {}
                },
            }
        }
    }

    async fn settle(&self, outcome: &str) -> bool {
        let settled = self.episode.lock().await.settle(&self.attempt.id);
        if !settled {
            debug!(
                tenant = %self.attempt.tenant_id,
                attempt = %self.attempt.id,
                outcome,
                "Ignoring event for superseded pairing attempt"
            );
        }
        settled
    }

    async fn succeeded(&self) {
        if !self.settle("success").await {
            return;
        }
        info!(
            tenant = %self.attempt.tenant_id,
            attempt = self.attempt.number(),
            "Pairing approved"
        );
        self.post(&Notice::PairingSucceeded).await;
    }

    async fn expired(&self) {
        if !self.settle("expired").await {
            return;
        }

        let number = self.attempt.number();
        let notice = if number >= self.max_attempts {
            warn!(
                tenant = %self.attempt.tenant_id,
                attempt = number,
                "Last pairing attempt expired"
            );
            Notice::LimitExceeded {
                attempts: number,
                max_attempts: self.max_attempts,
            }
        } else {
            info!(tenant = %self.attempt.tenant_id, attempt = number, "Pairing code expired");
            Notice::PairingExpired {
                attempt: number,
                max_attempts: self.max_attempts,
            }
        };
        self.post(&notice).await;
    }

    async fn post(&self, notice: &Notice) {
        if let Err(e) = self
            .notifier
            .notify_conversation(
                &self.attempt.tenant_id,
                &self.console,
                self.attempt.conversation_id,
                notice,
            )
            .await
        {
            warn!(
                tenant = %self.attempt.tenant_id,
                notice = notice.kind(),
                error = %e,
                "Failed to post pairing notice"
            );
        }
    }
}
