//! Dispatch error types

use std::time::Duration;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Auth(#[from] gemini_auth::Error),

    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    /// Attempts exhausted against a rate-limiting server. `retry_after` is
    /// the server's hint when one was sent, otherwise the local backoff.
    #[error("rate limited after {attempts} attempts, retry in {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        attempts: u32,
    },

    /// Attempts exhausted on transient failures.
    #[error("gave up after {attempts} attempts: {last_cause}")]
    TransientFailure { attempts: u32, last_cause: String },

    /// Non-retryable server response.
    #[error("request rejected with status {status}: {body}")]
    Fatal { status: u16, body: String },

    /// The caller's overall deadline elapsed before a verdict.
    #[error("deadline of {deadline:?} exceeded")]
    DeadlineExceeded { deadline: Duration },
}
