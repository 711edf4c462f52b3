//! Idempotent forwarding gate.
//!
//! Every side-effecting forward (contact/conversation creation, message send)
//! is keyed by a [`Fingerprint`] of the upstream event's natural keys. The gate
//! lets a fingerprint through once per TTL window; redeliveries inside the
//! window are dropped.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::IdempotencyStore;

// ============================================================================
// Fingerprint
// ============================================================================

/// Deterministic identifier of an inbound event.
///
/// Derived only from keys the upstream source assigns (tenant, event kind,
/// event id), never from ids generated while processing the event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash the natural keys of an event.
    pub fn of(tenant: &str, kind: &str, event_id: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [tenant, kind, event_id] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines.
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

// ============================================================================
// ForwardingGate
// ============================================================================

/// At-most-once gate in front of side-effecting forwards.
#[derive(Clone)]
pub struct ForwardingGate {
    store: IdempotencyStore,
}

impl ForwardingGate {
    pub fn new(store: IdempotencyStore) -> Self {
        Self { store }
    }

    /// Claim `fingerprint`. Returns true exactly once per TTL window.
    ///
    /// A successful claim leaves an in-flight marker behind, so concurrent
    /// deliveries of the same event see `false` while the first one runs.
    pub fn should_process(&self, fingerprint: &Fingerprint) -> bool {
        let claimed = self.store.claim(fingerprint);
        if !claimed {
            debug!(fingerprint = %fingerprint, "Duplicate delivery suppressed");
        }
        claimed
    }

    /// Record that the side effect for `fingerprint` completed.
    pub fn mark_processed(&self, fingerprint: &Fingerprint, ttl: Duration) {
        self.store.mark(fingerprint, ttl);
    }

    /// Give up a claim after the side effect failed, so a redelivery can retry.
    pub fn release(&self, fingerprint: &Fingerprint) {
        self.store.release(fingerprint);
    }

    /// Claim `fingerprint` for a side effect that may be cancelled midway.
    ///
    /// Returns `None` for a duplicate. The claim is released when the
    /// returned guard is dropped without [`Claim::commit`].
    pub fn try_claim<'a>(&'a self, fingerprint: &'a Fingerprint) -> Option<Claim<'a>> {
        self.should_process(fingerprint).then_some(Claim {
            gate: self,
            fingerprint,
            committed: false,
        })
    }

    /// TTL used for markers when the caller has no better window.
    pub fn default_ttl(&self) -> Duration {
        self.store.default_ttl()
    }

    /// Run `forward` at most once per fingerprint per TTL window.
    ///
    /// Returns `Ok(None)` when the event was already handled. On error, or
    /// when the returned future is dropped before `forward` finishes, the
    /// claim is released.
    pub async fn run_once<F, T, E>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        forward: F,
    ) -> Result<Option<T>, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let Some(claim) = self.try_claim(fingerprint) else {
            return Ok(None);
        };
        let value = forward.await?;
        claim.commit(ttl);
        Ok(Some(value))
    }
}

/// An in-flight claim on a fingerprint.
#[must_use = "dropping a claim releases it"]
pub struct Claim<'a> {
    gate: &'a ForwardingGate,
    fingerprint: &'a Fingerprint,
    committed: bool,
}

impl Claim<'_> {
    /// The side effect happened: keep the fingerprint marked for `ttl`.
    pub fn commit(mut self, ttl: Duration) {
        self.gate.mark_processed(self.fingerprint, ttl);
        self.committed = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            debug!(fingerprint = %self.fingerprint, "Releasing unfinished claim");
            self.gate.release(self.fingerprint);
        }
    }
}
