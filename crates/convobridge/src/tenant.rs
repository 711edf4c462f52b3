//! Tenant records.
//!
//! Tenant configuration is owned elsewhere (a config file here, a database in
//! larger deployments). The reliability core only reads the tenant's identity
//! and console coordinates and writes back the last issued pairing challenge.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use convobridge_transport_protocol::CreateSessionRequest;

use crate::config::TenantConfig;
use crate::console::ConsoleConfig;

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("unknown tenant '{0}'")]
    NotFound(String),

    #[error("tenant store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, TenantError>;

/// Everything the bridge knows about one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantRecord {
    pub id: String,
    /// The tenant's own transport address.
    pub identity: String,
    pub display_name: Option<String>,
    pub transport_token: String,
    pub subscriptions: Vec<String>,
    pub console: ConsoleConfig,
    pub last_pairing_challenge: Option<String>,
}

impl TenantRecord {
    pub fn from_config(config: &TenantConfig) -> Self {
        Self {
            id: config.id.clone(),
            identity: config.identity.clone(),
            display_name: config.display_name.clone(),
            transport_token: config.transport_token.clone(),
            subscriptions: config.subscriptions.clone(),
            console: config.console.clone(),
            last_pairing_challenge: None,
        }
    }

    /// Name shown on the tenant's self-notification contact.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    /// Request used to (re)create the tenant's transport session.
    pub fn session_request(&self) -> CreateSessionRequest {
        CreateSessionRequest {
            tenant_id: self.id.clone(),
            identity: self.identity.clone(),
            auth_token: self.transport_token.clone(),
            subscriptions: self.subscriptions.clone(),
        }
    }
}

/// Read-mostly access to tenant records.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get(&self, tenant_id: &str) -> Result<TenantRecord>;

    /// The tenant's own address, used to reach its self-notification channel.
    async fn identity(&self, tenant_id: &str) -> Result<String> {
        Ok(self.get(tenant_id).await?.identity)
    }

    async fn record_pairing_challenge(&self, tenant_id: &str, code: &str) -> Result<()>;

    async fn tenant_ids(&self) -> Vec<String>;
}

/// In-memory tenant store seeded from configuration.
#[derive(Debug, Default)]
pub struct MemoryTenantStore {
    tenants: DashMap<String, TenantRecord>,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[TenantConfig]) -> Self {
        let store = Self::new();
        for config in configs {
            store.upsert(TenantRecord::from_config(config));
        }
        store
    }

    /// Insert or replace a tenant. Returns the previous record.
    pub fn upsert(&self, record: TenantRecord) -> Option<TenantRecord> {
        self.tenants.insert(record.id.clone(), record)
    }
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
    async fn get(&self, tenant_id: &str) -> Result<TenantRecord> {
        self.tenants
            .get(tenant_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| TenantError::NotFound(tenant_id.to_string()))
    }

    async fn record_pairing_challenge(&self, tenant_id: &str, code: &str) -> Result<()> {
        let mut record = self
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| TenantError::NotFound(tenant_id.to_string()))?;
        record.last_pairing_challenge = Some(code.to_string());
        Ok(())
    }

    async fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tenants.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }
}
