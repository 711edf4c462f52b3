//! Typed cache stores, one per purpose.
//!
//! Each store owns its own [`TtlCache`] so key spaces never collide and each
//! TTL policy can be tuned (and tested) on its own.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::CacheConfig;
use crate::gate::Fingerprint;

use super::{CachePolicy, TtlCache};

// ============================================================================
// Lookup cache
// ============================================================================

/// The tenant's own outage-notification channel in the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfChannel {
    pub contact_id: u64,
    pub conversation_id: u64,
}

/// A cached console entity reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Contact(u64),
    Conversation(u64),
    Inbox(u64),
    SelfChannel(SelfChannel),
}

/// Cache of console entity ids resolved for a tenant.
///
/// Keys are laid out as `{tenant}/{kind}/{natural key}` so that every entry of a
/// tenant can be dropped with one prefix scan.
#[derive(Clone)]
pub struct LookupCache {
    entries: TtlCache<String, Lookup>,
}

impl LookupCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            entries: TtlCache::new("lookups", policy),
        }
    }

    fn key(tenant: &str, kind: &str, natural: &str) -> String {
        format!("{tenant}/{kind}/{natural}")
    }

    /// Contact id for a sender address.
    pub fn contact(&self, tenant: &str, sender: &str) -> Option<u64> {
        match self.entries.get(&Self::key(tenant, "contact", sender))? {
            Lookup::Contact(id) => Some(id),
            _ => None,
        }
    }

    pub fn put_contact(&self, tenant: &str, sender: &str, contact_id: u64) {
        self.entries.insert(
            Self::key(tenant, "contact", sender),
            Lookup::Contact(contact_id),
        );
    }

    /// Open conversation id for a contact.
    pub fn conversation(&self, tenant: &str, contact_id: u64) -> Option<u64> {
        match self
            .entries
            .get(&Self::key(tenant, "conversation", &contact_id.to_string()))?
        {
            Lookup::Conversation(id) => Some(id),
            _ => None,
        }
    }

    pub fn put_conversation(&self, tenant: &str, contact_id: u64, conversation_id: u64) {
        self.entries.insert(
            Self::key(tenant, "conversation", &contact_id.to_string()),
            Lookup::Conversation(conversation_id),
        );
    }

    pub fn forget_conversation(&self, tenant: &str, contact_id: u64) {
        self.entries
            .delete(&Self::key(tenant, "conversation", &contact_id.to_string()));
    }

    /// Inbox id resolved from the tenant's configured inbox name.
    pub fn inbox(&self, tenant: &str) -> Option<u64> {
        match self.entries.get(&Self::key(tenant, "inbox", "default"))? {
            Lookup::Inbox(id) => Some(id),
            _ => None,
        }
    }

    pub fn put_inbox(&self, tenant: &str, inbox_id: u64) {
        self.entries
            .insert(Self::key(tenant, "inbox", "default"), Lookup::Inbox(inbox_id));
    }

    /// The tenant's self-notification channel.
    pub fn self_channel(&self, tenant: &str) -> Option<SelfChannel> {
        match self.entries.get(&Self::key(tenant, "self", "channel"))? {
            Lookup::SelfChannel(channel) => Some(channel),
            _ => None,
        }
    }

    pub fn put_self_channel(&self, tenant: &str, channel: SelfChannel) {
        self.entries.insert(
            Self::key(tenant, "self", "channel"),
            Lookup::SelfChannel(channel),
        );
    }

    pub fn forget_self_channel(&self, tenant: &str) {
        self.entries.delete(&Self::key(tenant, "self", "channel"));
    }

    /// Drop every cached lookup of a tenant. Returns the number removed.
    pub fn invalidate_tenant(&self, tenant: &str) -> usize {
        self.entries.remove_prefix(&format!("{tenant}/"))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn raw(&self) -> &TtlCache<String, Lookup> {
        &self.entries
    }
}

// ============================================================================
// Idempotency store
// ============================================================================

/// Markers recording that a fingerprint's side effect ran or is in flight.
#[derive(Clone)]
pub struct IdempotencyStore {
    markers: TtlCache<Fingerprint, ()>,
}

impl IdempotencyStore {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            markers: TtlCache::new("idempotency", policy),
        }
    }

    /// Claim a fingerprint for the default TTL. True if nobody holds it.
    pub fn claim(&self, fingerprint: &Fingerprint) -> bool {
        self.markers.insert_if_absent(
            fingerprint.clone(),
            (),
            self.markers.policy().default_ttl,
        )
    }

    /// Record (or refresh) a marker with an explicit TTL.
    pub fn mark(&self, fingerprint: &Fingerprint, ttl: Duration) {
        self.markers.set(fingerprint.clone(), (), ttl);
    }

    /// Drop a marker so the fingerprint can be processed again.
    pub fn release(&self, fingerprint: &Fingerprint) -> bool {
        self.markers.delete(fingerprint)
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.markers.contains(fingerprint)
    }

    pub fn default_ttl(&self) -> Duration {
        self.markers.policy().default_ttl
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub(crate) fn raw(&self) -> &TtlCache<Fingerprint, ()> {
        &self.markers
    }
}

// ============================================================================
// Throttle store
// ============================================================================

/// Rate-limits repeated notices: one acquisition per key per window.
#[derive(Clone)]
pub struct ThrottleStore {
    markers: TtlCache<String, ()>,
}

impl ThrottleStore {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            markers: TtlCache::new("throttle", policy),
        }
    }

    /// Acquire `key` for the default window. False while a previous window is open.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_for(key, self.markers.policy().default_ttl)
    }

    pub fn try_acquire_for(&self, key: &str, window: Duration) -> bool {
        self.markers.insert_if_absent(key.to_string(), (), window)
    }

    /// Reopen a key before its window closes.
    pub fn reset(&self, key: &str) {
        self.markers.delete(key);
    }

    /// Drop every throttle marker of a tenant.
    pub fn reset_tenant(&self, tenant: &str) -> usize {
        self.markers.remove_prefix(&format!("{tenant}/"))
    }

    pub(crate) fn raw(&self) -> &TtlCache<String, ()> {
        &self.markers
    }
}

// ============================================================================
// Caches (bundle)
// ============================================================================

/// The three stores, built together from configuration.
#[derive(Clone)]
pub struct Caches {
    pub lookups: LookupCache,
    pub idempotency: IdempotencyStore,
    pub throttle: ThrottleStore,
}

impl Caches {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            lookups: LookupCache::new(config.lookups.policy()),
            idempotency: IdempotencyStore::new(config.idempotency.policy()),
            throttle: ThrottleStore::new(config.throttle.policy()),
        }
    }

    /// Spawn one sweeper per store.
    pub fn spawn_sweepers(&self, interval: Duration) -> Vec<JoinHandle<()>> {
        vec![
            self.lookups.raw().spawn_sweeper(interval),
            self.idempotency.raw().spawn_sweeper(interval),
            self.throttle.raw().spawn_sweeper(interval),
        ]
    }
}
