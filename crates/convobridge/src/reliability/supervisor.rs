//! Per-tenant monitor supervisor.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::Timings;
use crate::notify::{ConsoleNotifier, Notice};
use crate::transport::SessionRegistry;

use super::episode::{EpisodeStatus, OutageEpisode};
use super::monitor::MonitorTask;

/// A live disconnection monitor.
struct MonitorHandle {
    episode_id: Ulid,
    episode: Arc<Mutex<OutageEpisode>>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct SupervisorInner {
    /// Sole owner of monitor handles. Held only for lookup, insert and remove.
    monitors: RwLock<HashMap<String, MonitorHandle>>,
    registry: Arc<dyn SessionRegistry>,
    notifier: ConsoleNotifier,
    timings: Timings,
}

/// Owns at most one disconnection monitor per tenant.
#[derive(Clone)]
pub struct MonitorSupervisor {
    inner: Arc<SupervisorInner>,
}

impl MonitorSupervisor {
    /// Create a supervisor with no monitors running.
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        notifier: ConsoleNotifier,
        timings: Timings,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                monitors: RwLock::new(HashMap::new()),
                registry,
                notifier,
                timings,
            }),
        }
    }

    /// Poll, grace and expiry intervals shared with pairing.
    pub fn timings(&self) -> &Timings {
        &self.inner.timings
    }

    /// Start monitoring `tenant_id` unless a monitor already runs.
    ///
    /// Returns true if this call started the monitor, in which case exactly
    /// one initial outage notice is sent in the background.
    pub async fn ensure_monitoring(&self, tenant_id: &str) -> bool {
        self.ensure_episode(tenant_id).await.1
    }

    /// Like [`ensure_monitoring`](Self::ensure_monitoring), also returning the
    /// current episode.
    pub async fn ensure_episode(&self, tenant_id: &str) -> (Arc<Mutex<OutageEpisode>>, bool) {
        if let Some(handle) = self.inner.monitors.read().await.get(tenant_id) {
            return (Arc::clone(&handle.episode), false);
        }

        let (episode, episode_id) = {
            let mut monitors = self.inner.monitors.write().await;
            // Another caller may have won the race since the read lock was released.
            if let Some(handle) = monitors.get(tenant_id) {
                return (Arc::clone(&handle.episode), false);
            }

            let episode = OutageEpisode::new(tenant_id, self.inner.timings.max_pairing_attempts);
            let episode_id = episode.id();
            let episode = Arc::new(Mutex::new(episode));
            let (stop, stop_rx) = oneshot::channel();

            let task = MonitorTask {
                tenant_id: tenant_id.to_string(),
                episode_id,
                episode: Arc::clone(&episode),
                registry: Arc::clone(&self.inner.registry),
                notifier: self.inner.notifier.clone(),
                supervisor: self.clone(),
                timings: self.inner.timings,
            };
            let task = tokio::spawn(task.run(stop_rx));

            monitors.insert(
                tenant_id.to_string(),
                MonitorHandle {
                    episode_id,
                    episode: Arc::clone(&episode),
                    stop,
                    task,
                },
            );
            (episode, episode_id)
        };

        info!(tenant = %tenant_id, episode = %episode_id, "Monitoring started");

        let notifier = self.inner.notifier.clone();
        let tenant = tenant_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify_tenant(&tenant, &Notice::OutageStarted).await {
                warn!(tenant = %tenant, error = %e, "Failed to send outage notice");
            }
        });

        (episode, true)
    }

    /// Stop monitoring `tenant_id`. Returns false if nothing was running.
    pub async fn stop_monitoring(&self, tenant_id: &str) -> bool {
        let Some(handle) = self.inner.monitors.write().await.remove(tenant_id) else {
            debug!(tenant = %tenant_id, "Stop requested for unmonitored tenant");
            return false;
        };

        let _ = handle.stop.send(());
        handle.episode.lock().await.close();
        info!(tenant = %tenant_id, episode = %handle.episode_id, "Monitoring stopped");
        true
    }

    /// Tear down the handle of `episode_id` after the monitor saw recovery.
    ///
    /// Returns false if that episode is no longer the tenant's current one
    /// (stopped manually or already torn down).
    pub(crate) async fn finish_episode(&self, tenant_id: &str, episode_id: Ulid) -> bool {
        let handle = {
            let mut monitors = self.inner.monitors.write().await;
            match monitors.get(tenant_id) {
                Some(handle) if handle.episode_id == episode_id => monitors.remove(tenant_id),
                _ => None,
            }
        };
        let Some(handle) = handle else {
            return false;
        };

        handle.episode.lock().await.close();
        true
    }

    /// The tenant's current episode, if monitored.
    pub async fn episode(&self, tenant_id: &str) -> Option<Arc<Mutex<OutageEpisode>>> {
        self.inner
            .monitors
            .read()
            .await
            .get(tenant_id)
            .map(|h| Arc::clone(&h.episode))
    }

    /// Snapshot of the open episode, or `None` if `tenant_id` is not monitored.
    pub async fn status(&self, tenant_id: &str) -> Option<EpisodeStatus> {
        let episode = self.episode(tenant_id).await?;
        let status = episode.lock().await.status();
        Some(status)
    }

    /// True while a monitor runs for `tenant_id`.
    pub async fn is_monitoring(&self, tenant_id: &str) -> bool {
        self.inner.monitors.read().await.contains_key(tenant_id)
    }

    /// Ids of all monitored tenants, sorted.
    pub async fn monitored_tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.inner.monitors.read().await.keys().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Number of running monitors.
    pub async fn len(&self) -> usize {
        self.inner.monitors.read().await.len()
    }

    /// Stop every monitor and wait for the tasks to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, MonitorHandle)> =
            self.inner.monitors.write().await.drain().collect();
        if handles.is_empty() {
            return;
        }

        info!(count = handles.len(), "Stopping monitors");
        let mut tasks = Vec::with_capacity(handles.len());
        for (tenant, handle) in handles {
            let _ = handle.stop.send(());
            handle.episode.lock().await.close();
            tasks.push((tenant, handle.task));
        }
        for (tenant, task) in tasks {
            if let Err(e) = task.await {
                warn!(tenant = %tenant, error = %e, "Monitor task ended abnormally");
            }
        }
    }
}
