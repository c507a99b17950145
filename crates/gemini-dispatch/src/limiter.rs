//! Adaptive client-side rate limiting with permits and a rolling token budget
//!
//! Each resource key gets independent state created lazily on first use:
//!
//! 1. A bounded pool of permits caps in-flight requests.
//! 2. A token budget replenishes continuously over a rolling window and is
//!    charged only when a request actually dispatched successfully.
//! 3. Server retry hints are stored on release and override locally computed
//!    waits until they expire.
//!
//! `acquire` never blocks: a denied caller gets back the suggested wait and
//! decides for itself whether to sleep and retry or give up. Repeated denials
//! widen the suggested wait so a crowd of blocked callers spreads out instead
//! of stampeding the moment capacity frees up.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

/// Limits applied to every resource key.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Maximum concurrent in-flight requests per resource
    pub max_permits: u32,
    /// Token budget replenished per rolling window
    pub budget_per_window: f64,
    pub window: Duration,
    /// Suggested wait after the first denial
    pub base_wait: Duration,
    /// Cap on suggested waits
    pub max_wait: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_permits: 8,
            budget_per_window: 100_000.0,
            window: Duration::from_secs(60),
            base_wait: Duration::from_millis(500),
            max_wait: Duration::from_secs(32),
        }
    }
}

impl LimiterConfig {
    /// Suggested wait for the nth consecutive denial. Doubles each time,
    /// capped at `max_wait`, so it never decreases within a denial streak.
    pub fn denial_wait(&self, streak: u32) -> Duration {
        let exponent = streak.saturating_sub(1).min(63) as i32;
        let secs = self.base_wait.as_secs_f64() * 2f64.powi(exponent);
        let capped = secs.min(self.max_wait.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_wait)
    }
}

/// How a dispatched request ended. Drives the accounting on release.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Request reached the server and succeeded; the estimated cost is charged
    Success,
    /// Server said to slow down; the hint (if any) overrides local waits
    RateLimited { retry_hint: Option<Duration> },
    /// Request failed without consuming server-side quota
    Failed,
    /// Caller abandoned the request before a verdict
    Cancelled,
}

/// Result of a non-blocking acquire.
#[derive(Debug)]
pub enum Acquired {
    Ready(Permit),
    Wait(Duration),
}

#[derive(Debug)]
struct Inner {
    available_permits: u32,
    budget: f64,
    last_refill: Instant,
    hint: Option<Duration>,
    hint_until: Option<Instant>,
    denial_streak: u32,
}

impl Inner {
    fn refill(&mut self, config: &LimiterConfig, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        let replenished =
            config.budget_per_window * elapsed.as_secs_f64() / config.window.as_secs_f64();
        self.budget = (self.budget + replenished).min(config.budget_per_window);
        self.last_refill = now;
        if self.hint_until.is_some_and(|until| now >= until) {
            self.hint = None;
            self.hint_until = None;
        }
    }
}

#[derive(Debug)]
struct ResourceState {
    config: LimiterConfig,
    inner: Mutex<Inner>,
}

impl ResourceState {
    fn new(config: LimiterConfig) -> Self {
        let inner = Inner {
            available_permits: config.max_permits,
            budget: config.budget_per_window,
            last_refill: Instant::now(),
            hint: None,
            hint_until: None,
            denial_streak: 0,
        };
        Self {
            config,
            inner: Mutex::new(inner),
        }
    }

    // A poisoned lock still holds consistent counters
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Reservation for one in-flight request. Dropping an unsettled permit
/// releases its capacity as `Cancelled`, so abandoned requests cannot leak
/// permits.
#[derive(Debug)]
pub struct Permit {
    resource: String,
    cost: f64,
    state: Arc<ResourceState>,
    settled: bool,
}

impl Permit {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn estimated_cost(&self) -> f64 {
        self.cost
    }

    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        let mut inner = self.state.lock();
        inner.available_permits =
            (inner.available_permits + 1).min(self.state.config.max_permits);
        match outcome {
            Outcome::Success => {
                inner.budget = (inner.budget - self.cost).max(0.0);
                debug!(
                    resource = %self.resource,
                    charged = self.cost,
                    budget = inner.budget,
                    "permit released after successful dispatch"
                );
            }
            Outcome::RateLimited { retry_hint } => {
                if let Some(hint) = retry_hint {
                    inner.hint = Some(hint);
                    inner.hint_until = Some(Instant::now() + hint);
                    info!(
                        resource = %self.resource,
                        hint_ms = hint.as_millis() as u64,
                        "storing server retry hint"
                    );
                }
            }
            Outcome::Failed | Outcome::Cancelled => {}
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(Outcome::Cancelled);
        }
    }
}

/// Per-resource rate limiter keyed by resource name.
pub struct RateLimiterManager {
    config: LimiterConfig,
    resources: DashMap<String, Arc<ResourceState>>,
}

impl RateLimiterManager {
    pub fn new(mut config: LimiterConfig) -> Self {
        // A zero window would divide every refill by zero
        if config.window.is_zero() {
            warn!("refill window of zero clamped to 1ms");
            config.window = Duration::from_millis(1);
        }
        Self {
            config,
            resources: DashMap::new(),
        }
    }

    fn resource(&self, key: &str) -> Arc<ResourceState> {
        self.resources
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(ResourceState::new(self.config.clone())))
            .clone()
    }

    /// Try to reserve capacity for one request. Never blocks: a denial
    /// returns the wait the caller should observe before trying again.
    ///
    /// While a server retry hint is active the hint itself is returned,
    /// whatever the local permit and budget situation says.
    ///
    /// Resource state lives as long as the manager, so keys must come from
    /// a bounded set (model/region identities), never per-request values.
    pub fn acquire(&self, resource_key: &str, estimated_cost: f64) -> Acquired {
        let state = self.resource(resource_key);
        let now = Instant::now();
        let mut inner = state.lock();
        inner.refill(&state.config, now);

        if let (Some(hint), Some(until)) = (inner.hint, inner.hint_until) {
            if now < until {
                debug!(
                    resource = resource_key,
                    wait_ms = hint.as_millis() as u64,
                    "holding for server retry hint"
                );
                return Acquired::Wait(hint);
            }
        }

        if inner.available_permits == 0 {
            inner.denial_streak += 1;
            let wait = state.config.denial_wait(inner.denial_streak);
            debug!(
                resource = resource_key,
                streak = inner.denial_streak,
                wait_ms = wait.as_millis() as u64,
                "no permits available"
            );
            return Acquired::Wait(wait);
        }

        if inner.budget < estimated_cost {
            if estimated_cost > state.config.budget_per_window {
                warn!(
                    resource = resource_key,
                    estimated_cost,
                    budget_per_window = state.config.budget_per_window,
                    "estimated cost exceeds the whole window budget"
                );
            }
            inner.denial_streak += 1;
            let wait = state.config.denial_wait(inner.denial_streak);
            debug!(
                resource = resource_key,
                estimated_cost,
                budget = inner.budget,
                wait_ms = wait.as_millis() as u64,
                "budget exhausted"
            );
            return Acquired::Wait(wait);
        }

        inner.available_permits -= 1;
        inner.denial_streak = 0;
        drop(inner);
        Acquired::Ready(Permit {
            resource: resource_key.to_string(),
            cost: estimated_cost,
            state,
            settled: false,
        })
    }

    /// Acquire with the suggested waits observed, sleeping until capacity
    /// frees up. Callers with a deadline should wrap this in a timeout.
    pub async fn acquire_when_ready(&self, resource_key: &str, estimated_cost: f64) -> Permit {
        loop {
            match self.acquire(resource_key, estimated_cost) {
                Acquired::Ready(permit) => return permit,
                Acquired::Wait(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Settle a permit with the outcome of its request.
    pub fn release(&self, mut permit: Permit, outcome: Outcome) {
        permit.settle(outcome);
    }

    /// Point-in-time view of every tracked resource.
    pub fn health(&self) -> serde_json::Value {
        let now = Instant::now();
        let resources: serde_json::Map<String, serde_json::Value> = self
            .resources
            .iter()
            .map(|entry| {
                let inner = entry.value().lock();
                let snapshot = serde_json::json!({
                    "available_permits": inner.available_permits,
                    "budget": inner.budget,
                    "denial_streak": inner.denial_streak,
                    "hint_active": inner.hint_until.is_some_and(|until| now < until),
                });
                (entry.key().clone(), snapshot)
            })
            .collect();
        serde_json::json!({ "resources": resources })
    }
}

impl Default for RateLimiterManager {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}
