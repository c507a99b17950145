//! Retry coordination with exponential backoff and server-directed delays
//!
//! The coordinator drives one logical call through up to `max_attempts`
//! transport attempts:
//!
//! 1. Success returns immediately.
//! 2. A 429 sleeps for the server's `Retry-After`/`RetryInfo` hint when one
//!    was sent, otherwise for the jittered exponential delay.
//! 3. A 401 triggers one credential refresh and an immediate re-attempt;
//!    a second 401 is treated as fatal.
//! 4. Transient statuses and transport failures back off exponentially.
//! 5. Other 4xx statuses abort without retrying, as do failures outside the
//!    transport (credential derivation).
//!
//! Exhaustion is structured: rate-limit exhaustion carries the delay a caller
//! should wait before trying again, transient exhaustion carries the attempt
//! count and last observed cause.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tracing::{debug, info, warn};

use crate::classify::{classify_response, ErrorClass};
use crate::error::{Error, Result};
use crate::transport::ApiResponse;

/// Backoff schedule for one resource. Delays follow
/// `initial_delay * base^(attempt - 1)`, capped at `max_delay`, with
/// `jitter_fraction` of symmetric random spread.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub base: f64,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(1),
            base: 2.0,
            max_delay: Duration::from_secs(32),
            jitter_fraction: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Deterministic delay for the given 1-based attempt, before jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.base.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Backoff delay with jitter applied, clamped to `[0, max_delay]`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt).as_secs_f64();
        let spread = base * self.jitter_fraction;
        let secs = if spread > 0.0 {
            rand::rng().random_range(base - spread..=base + spread)
        } else {
            base
        };
        let clamped = secs.clamp(0.0, self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(clamped).unwrap_or(self.max_delay)
    }
}

/// Drives transport attempts for one logical call.
pub struct RetryCoordinator {
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails fatally, or attempts are exhausted.
    ///
    /// `op` receives the 1-based attempt number so the caller can rebuild the
    /// request (fresh auth headers) on every attempt. Transport failures are
    /// retried; any other error from `op` aborts the loop. `refresh` is
    /// invoked at most once, when a 401 indicates the cached token went
    /// stale.
    pub async fn run<Op, OpFut, Refresh, RefreshFut>(
        &self,
        mut op: Op,
        mut refresh: Refresh,
    ) -> Result<ApiResponse>
    where
        Op: FnMut(u32) -> OpFut,
        OpFut: Future<Output = Result<ApiResponse>>,
        Refresh: FnMut() -> RefreshFut,
        RefreshFut: Future<Output = Result<()>>,
    {
        let mut refreshed = false;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let response = match op(attempt).await {
                Ok(response) => response,
                Err(Error::Transport(e)) => {
                    if attempt >= self.policy.max_attempts {
                        warn!(attempt, error = %e, "transport failed, attempts exhausted");
                        return Err(Error::TransientFailure {
                            attempts: attempt,
                            last_cause: e.to_string(),
                        });
                    }
                    let delay = self.policy.jittered_delay(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transport failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(other) => return Err(other),
            };

            if response.is_success() {
                return Ok(response);
            }

            let class = classify_response(response.status, response.retry_after(), &response.body);
            match class {
                ErrorClass::Fatal => {
                    return Err(Error::Fatal {
                        status: response.status,
                        body: response.body,
                    });
                }
                ErrorClass::AuthExpired => {
                    if refreshed || attempt >= self.policy.max_attempts {
                        return Err(Error::Fatal {
                            status: response.status,
                            body: response.body,
                        });
                    }
                    info!(attempt, "credentials rejected, refreshing token");
                    refresh().await?;
                    refreshed = true;
                    // A fresh token is immediately usable, so no backoff
                }
                ErrorClass::RateLimited { retry_hint } => {
                    let delay = retry_hint.unwrap_or_else(|| self.policy.jittered_delay(attempt));
                    if attempt >= self.policy.max_attempts {
                        warn!(
                            attempt,
                            retry_after_ms = delay.as_millis() as u64,
                            "rate limited, attempts exhausted"
                        );
                        return Err(Error::RateLimited {
                            retry_after: delay,
                            attempts: attempt,
                        });
                    }
                    info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        hinted = retry_hint.is_some(),
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                ErrorClass::Transient => {
                    if attempt >= self.policy.max_attempts {
                        warn!(
                            attempt,
                            status = response.status,
                            "transient failures exhausted attempts"
                        );
                        return Err(Error::TransientFailure {
                            attempts: attempt,
                            last_cause: format!("status {}", response.status),
                        });
                    }
                    let delay = self.policy.jittered_delay(attempt);
                    debug!(
                        attempt,
                        status = response.status,
                        delay_ms = delay.as_millis() as u64,
                        "transient status, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
