//! Single-flight gate for token derivation
//!
//! Concurrent misses on one cache key must not fan out into N identical
//! token exchanges. Each key gets a flight record; whoever holds the
//! record's lock derives while everyone else queues on the same lock, then
//! either finds the fresh token in the cache or receives a clone of the
//! holder's error. A failure reaches exactly the callers that were queued
//! behind it — the next caller after that starts a fresh derivation.
//! Records are dropped when their last caller leaves, so the table only
//! holds keys with work in flight.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

#[derive(Default)]
struct Flight {
    /// Finished derivations under this key; bumped once per attempt
    generation: AtomicU64,
    slot: Mutex<FlightSlot>,
}

#[derive(Default)]
struct FlightSlot {
    /// Error of the most recently finished derivation, `None` on success
    last_failure: Option<Error>,
}

/// Per-key single-flight table.
#[derive(Default)]
pub struct FlightTable {
    flights: DashMap<String, Arc<Flight>>,
}

impl FlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `derive` for `key` unless an equivalent derivation is already in
    /// flight. `check` re-reads the cache once the key's lock is held, so
    /// callers queued behind a successful derivation pick up its token
    /// without deriving again.
    pub async fn run<C, F, Fut>(&self, key: &str, check: C, derive: F) -> Result<String>
    where
        C: Fn() -> Option<String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let flight = self.flights.entry(key.to_string()).or_default().clone();
        let result = Self::fly(&flight, check, derive).await;
        drop(flight);

        // Last one out drops the record: every caller sheds its clone before
        // checking, so the final check sees only the map's reference. A
        // racing newcomer that lands on a fresh record still hits the cache
        // through `check`.
        self.flights
            .remove_if(key, |_, flight| Arc::strong_count(flight) <= 1);
        result
    }

    async fn fly<C, F, Fut>(flight: &Flight, check: C, derive: F) -> Result<String>
    where
        C: Fn() -> Option<String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let entered_at = flight.generation.load(Ordering::Acquire);
        let mut slot = flight.slot.lock().await;

        if let Some(token) = check() {
            return Ok(token);
        }
        if flight.generation.load(Ordering::Acquire) != entered_at {
            // A derivation finished while we queued, yet the cache is still
            // cold: that derivation failed, and its error is ours too.
            if let Some(err) = slot.last_failure.clone() {
                return Err(err);
            }
        }

        let result = derive().await;
        slot.last_failure = result.as_ref().err().cloned();
        flight.generation.fetch_add(1, Ordering::Release);
        result
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.flights.len()
    }
}
