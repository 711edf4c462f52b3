//! Disconnection monitor task.
//!
//! One task per disconnected tenant. It waits on three things at once: the
//! poll timer, the reminder timer and the stop signal. Polls decide recovery;
//! reminders are dispatched to their own tasks so a slow console never delays
//! the next poll or the stop signal.

use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::Timings;
use crate::notify::{ConsoleNotifier, Notice};
use crate::transport::SessionRegistry;

use super::episode::OutageEpisode;
use super::supervisor::MonitorSupervisor;

pub(super) struct MonitorTask {
    pub(super) tenant_id: String,
    pub(super) episode_id: Ulid,
    pub(super) episode: Arc<Mutex<OutageEpisode>>,
    pub(super) registry: Arc<dyn SessionRegistry>,
    pub(super) notifier: ConsoleNotifier,
    pub(super) supervisor: MonitorSupervisor,
    pub(super) timings: Timings,
}

impl MonitorTask {
    pub(super) async fn run(self, mut stop: oneshot::Receiver<()>) {
        let start = Instant::now();
        let mut poll = interval_at(start + self.timings.poll_interval, self.timings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut remind = interval_at(
            start + self.timings.notify_interval,
            self.timings.notify_interval,
        );
        remind.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = &mut stop => {
                    debug!(tenant = %self.tenant_id, "Monitor received stop signal");
                    return;
                }

                _ = poll.tick() => {
                    let healthy = tokio::select! {
                        biased;
                        _ = &mut stop => return,
                        healthy = self.session_healthy() => healthy,
                    };
                    if healthy {
                        self.recover().await;
                        return;
                    }
                }

                _ = remind.tick() => self.dispatch_reminder().await,
            }
        }
    }

    /// Poll the registry. Anything inconclusive counts as still disconnected.
    async fn session_healthy(&self) -> bool {
        let session = match self.registry.get_session(&self.tenant_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!(tenant = %self.tenant_id, "Still no transport session");
                return false;
            }
            Err(e) => {
                warn!(tenant = %self.tenant_id, error = %e, "Session poll failed");
                return false;
            }
        };

        match session.state().await {
            Ok(state) => state.is_healthy(),
            Err(e) => {
                warn!(tenant = %self.tenant_id, error = %e, "Session state check failed");
                false
            }
        }
    }

    async fn recover(&self) {
        if !self
            .supervisor
            .finish_episode(&self.tenant_id, self.episode_id)
            .await
        {
            debug!(tenant = %self.tenant_id, "Episode already ended before recovery");
            return;
        }

        info!(tenant = %self.tenant_id, episode = %self.episode_id, "Transport reconnected");
        if let Err(e) = self
            .notifier
            .notify_tenant(&self.tenant_id, &Notice::Recovered)
            .await
        {
            warn!(tenant = %self.tenant_id, error = %e, "Failed to send recovery notice");
        }
    }

    async fn dispatch_reminder(&self) {
        let notice = {
            let episode = self.episode.lock().await;
            Notice::OutageOngoing {
                down_for: episode.down_for(),
                attempts: episode.attempts(),
                max_attempts: episode.max_attempts(),
            }
        };

        let notifier = self.notifier.clone();
        let tenant = self.tenant_id.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify_tenant(&tenant, &notice).await {
                warn!(tenant = %tenant, error = %e, "Failed to send outage reminder");
            }
        });
    }
}
