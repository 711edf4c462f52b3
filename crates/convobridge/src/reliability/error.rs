//! Reliability core error types.

use std::time::Duration;

use thiserror::Error;

use crate::console::ConsoleError;
use crate::notify::NotifyError;
use crate::tenant::TenantError;
use crate::transport::TransportError;

use super::episode::AttemptId;

pub type Result<T> = std::result::Result<T, ReliabilityError>;

#[derive(Debug, Error)]
pub enum ReliabilityError {
    /// The transport has no usable session for the tenant.
    #[error("transport unavailable for tenant '{tenant}': {reason}")]
    TransportUnavailable { tenant: String, reason: String },

    /// A console call failed.
    #[error("console call failed: {0}")]
    RemoteApi(#[from] NotifyError),

    /// The episode's pairing budget is spent.
    #[error("pairing budget exhausted ({attempts}/{max_attempts})")]
    RetryBudgetExhausted { attempts: u32, max_attempts: u32 },

    /// The attempt was superseded before it could complete.
    #[error("pairing attempt {0} was superseded")]
    StaleAttempt(AttemptId),

    /// The session is already connected and authenticated.
    #[error("tenant '{0}' is already connected")]
    AlreadyConnected(String),

    #[error("transport session was not created within {0:?}")]
    SessionCreateTimeout(Duration),

    #[error("transport session issued no pairing challenge within {0:?}")]
    ChallengeTimeout(Duration),

    #[error("invalid console config: {0}")]
    InvalidConfig(String),

    #[error("unknown tenant '{0}'")]
    UnknownTenant(String),
}

impl ReliabilityError {
    pub(crate) fn transport(tenant: &str, error: &TransportError) -> Self {
        Self::TransportUnavailable {
            tenant: tenant.to_string(),
            reason: error.to_string(),
        }
    }
}

impl From<TenantError> for ReliabilityError {
    fn from(e: TenantError) -> Self {
        match e {
            TenantError::NotFound(id) => Self::UnknownTenant(id),
            other => Self::RemoteApi(NotifyError::Tenant(other)),
        }
    }
}

impl From<ConsoleError> for ReliabilityError {
    fn from(e: ConsoleError) -> Self {
        match e {
            ConsoleError::InvalidConfig(msg) => Self::InvalidConfig(msg),
            other => Self::RemoteApi(NotifyError::Console(other)),
        }
    }
}
