//! Process-wide access-token cache
//!
//! Maps a derivation key to `(token, expires_at)` where `expires_at`
//! already has the refresh buffer subtracted: validity is the single
//! comparison `now < expires_at`, and entries become refreshable before
//! the token actually lapses. Expired entries are evicted by whichever
//! read finds them. Nothing is ever persisted.
//!
//! Backed by a sharded concurrent map so refreshes of unrelated keys never
//! serialize against each other.

use dashmap::DashMap;

use common::unix_now_secs;

use crate::constants::DEFAULT_REFRESH_BUFFER_SECS;

/// One cached access token.
#[derive(Debug, Clone)]
struct CacheEntry {
    token: String,
    /// Unix seconds, already net of the refresh buffer
    expires_at: u64,
}

/// Concurrent token cache, shared via `Arc` across all authenticators.
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: DashMap<String, CacheEntry>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `key` if still valid now.
    pub fn get(&self, key: &str) -> Option<String> {
        self.get_at(key, unix_now_secs())
    }

    /// Token for `key` if still valid at `now` (unix seconds). An expired
    /// entry is treated exactly like a missing one and removed.
    pub fn get_at(&self, key: &str, now: u64) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) if now < entry.expires_at => return Some(entry.token.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            // Re-check under the entry lock so a concurrent fresh put wins
            self.entries.remove_if(key, |_, entry| now >= entry.expires_at);
        }
        None
    }

    /// Store with the standard refresh buffer.
    pub fn put(&self, key: impl Into<String>, token: impl Into<String>, ttl_secs: u64) {
        self.put_with_buffer(key, token, ttl_secs, DEFAULT_REFRESH_BUFFER_SECS);
    }

    /// Store with an explicit refresh buffer.
    pub fn put_with_buffer(
        &self,
        key: impl Into<String>,
        token: impl Into<String>,
        ttl_secs: u64,
        buffer_secs: u64,
    ) {
        self.put_at(key, token, ttl_secs, buffer_secs, unix_now_secs());
    }

    /// Store against an explicit clock. A ttl at or below the buffer
    /// floors to zero effective lifetime, so the entry is born expired.
    /// The expiry saturates: `ttl_secs` comes straight from a server's
    /// `expires_in` field, so an absurd value pins the entry to the far
    /// future instead of overflowing.
    pub fn put_at(
        &self,
        key: impl Into<String>,
        token: impl Into<String>,
        ttl_secs: u64,
        buffer_secs: u64,
        now: u64,
    ) {
        let entry = CacheEntry {
            token: token.into(),
            expires_at: now.saturating_add(ttl_secs.saturating_sub(buffer_secs)),
        };
        self.entries.insert(key.into(), entry);
    }

    /// Drop `key` so the next read forces a re-derivation.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
