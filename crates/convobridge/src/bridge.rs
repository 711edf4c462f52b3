//! The bridge context: every long-lived component, built once at startup.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::cache::Caches;
use crate::config::Timings;
use crate::console::{ConsoleApi, ConsoleConfig};
use crate::forward::Forwarder;
use crate::gate::{Fingerprint, ForwardingGate};
use crate::notify::ConsoleNotifier;
use crate::reliability::{MonitorSupervisor, PairingAttempt, PairingWorkflow, Result};
use crate::sync::{DEFAULT_IDLE_AGE, KeyedLocks};
use crate::tenant::TenantStore;
use crate::transport::SessionRegistry;

/// Shared handle to the bridge's components.
///
/// Cloning is cheap; every clone drives the same supervisor and caches.
#[derive(Clone)]
pub struct Bridge {
    pub caches: Caches,
    pub gate: ForwardingGate,
    pub notifier: ConsoleNotifier,
    pub supervisor: MonitorSupervisor,
    pub pairing: PairingWorkflow,
    pub forwarder: Forwarder,
    pub tenants: Arc<dyn TenantStore>,
    pub registry: Arc<dyn SessionRegistry>,
    sender_locks: KeyedLocks,
}

impl Bridge {
    /// Wire the forwarder, supervisor and pairing workflow over shared caches.
    pub fn new(
        console: Arc<dyn ConsoleApi>,
        registry: Arc<dyn SessionRegistry>,
        tenants: Arc<dyn TenantStore>,
        caches: Caches,
        timings: Timings,
    ) -> Self {
        let gate = ForwardingGate::new(caches.idempotency.clone());
        let notifier = ConsoleNotifier::new(
            Arc::clone(&console),
            Arc::clone(&tenants),
            caches.lookups.clone(),
            caches.throttle.clone(),
        );
        let supervisor = MonitorSupervisor::new(Arc::clone(&registry), notifier.clone(), timings);
        let pairing = PairingWorkflow::new(
            supervisor.clone(),
            Arc::clone(&registry),
            notifier.clone(),
            Arc::clone(&tenants),
        );
        let sender_locks = KeyedLocks::new();
        let forwarder = Forwarder::new(
            gate.clone(),
            caches.lookups.clone(),
            console,
            Arc::clone(&registry),
            Arc::clone(&tenants),
            notifier.clone(),
            supervisor.clone(),
            sender_locks.clone(),
        );

        Self {
            caches,
            gate,
            notifier,
            supervisor,
            pairing,
            forwarder,
            tenants,
            registry,
            sender_locks,
        }
    }

    // ------------------------------------------------------------------------
    // Ingestion-facing operations
    // ------------------------------------------------------------------------

    /// Call when a registry lookup for `tenant_id` found no session.
    pub async fn ensure_monitoring(&self, tenant_id: &str) -> bool {
        self.supervisor.ensure_monitoring(tenant_id).await
    }

    /// Stop the monitor of `tenant_id`. Returns false if none was running.
    pub async fn stop_monitoring(&self, tenant_id: &str) -> bool {
        self.supervisor.stop_monitoring(tenant_id).await
    }

    /// Issue a pairing challenge for `tenant_id` into `conversation_id`.
    pub async fn request_pairing(
        &self,
        tenant_id: &str,
        conversation_id: u64,
        console: &ConsoleConfig,
    ) -> Result<PairingAttempt> {
        self.pairing
            .request_pairing(tenant_id, conversation_id, console)
            .await
    }

    /// Claim `fingerprint`. False for a duplicate.
    pub fn should_process(&self, fingerprint: &Fingerprint) -> bool {
        self.gate.should_process(fingerprint)
    }

    /// Keep `fingerprint` marked as handled for `ttl`.
    pub fn mark_processed(&self, fingerprint: &Fingerprint, ttl: Duration) {
        self.gate.mark_processed(fingerprint, ttl)
    }

    /// Forget cached console ids and throttle windows of a tenant, e.g. after
    /// its console configuration changed. Returns the number of entries dropped.
    pub fn invalidate_tenant(&self, tenant_id: &str) -> usize {
        self.forwarder.invalidate_tenant(tenant_id) + self.caches.throttle.reset_tenant(tenant_id)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start cache sweepers and lock pruning.
    pub fn spawn_maintenance(&self, sweep_interval: Duration) -> Vec<JoinHandle<()>> {
        let mut tasks = self.caches.spawn_sweepers(sweep_interval);
        tasks.push(
            self.sender_locks
                .spawn_pruner(sweep_interval, DEFAULT_IDLE_AGE, "sender_locks"),
        );
        tasks
    }

    /// Stop every monitor and wait for the tasks.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}
