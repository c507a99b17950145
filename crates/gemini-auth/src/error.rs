//! Error types for credential resolution and token derivation

/// Errors from credential resolution and token derivation.
///
/// `Clone` so a failed single-flight refresh can hand the same error to
/// every caller that was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("no credentials found: {0}")]
    NoCredentials(String),

    #[error("malformed credentials: {0}")]
    MalformedCredentials(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("token exchange failed ({status}): {message}")]
    TokenExchange { status: u16, message: String },

    #[error("metadata server error: {0}")]
    Metadata(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
