//! Console error types.

use thiserror::Error;

/// Result type for console operations.
pub type Result<T> = std::result::Result<T, ConsoleError>;

/// Errors returned by a console backend.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// HTTP request failed before a response arrived.
    #[error("console request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The console answered with a non-success status.
    #[error("console rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The response body did not have the expected shape.
    #[error("unexpected console response: {0}")]
    UnexpectedResponse(String),

    /// No inbox matches the tenant's configured inbox name.
    #[error("inbox '{0}' not found")]
    InboxNotFound(String),

    /// Tenant console configuration is unusable.
    #[error("invalid console config: {0}")]
    InvalidConfig(String),
}

impl ConsoleError {
    /// True when the console reports the target entity as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Rejected { status: 404, .. })
    }
}
