//! Shared state backends.
//!
//! Every operation on [`RateLimitStore`] is a single atomic read-modify-write
//! against the store; the limiter never splits an update across calls.

use async_trait::async_trait;
use moka::{future::Cache, Expiry};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::trace;

use crate::{
    error::Result,
    utils::{Clock, SystemClock},
};

/// Parameters of one token bucket evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketParams {
    /// Bucket size
    pub capacity: u64,
    /// Tokens refilled per refresh interval
    pub limit: u64,
    /// Refresh interval in milliseconds
    pub refresh_millis: u64,
    /// Take a token if one is available
    pub consume: bool,
}

impl BucketParams {
    /// Time for an empty bucket to fill up again; the state is useless after that.
    pub fn ttl_millis(&self) -> u64 {
        let limit = self.limit.max(1);
        let full = (self.capacity as u128 * self.refresh_millis as u128).div_ceil(limit as u128);
        (full as u64).max(self.refresh_millis / limit).max(1)
    }
}

/// Result of a token bucket evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Tokens left after the evaluation, `-1` when a token was requested but none was left
    pub remaining: i64,
    /// Store time the bucket was last credited, in Unix milliseconds
    pub last_refill_millis: u64,
    /// Store time of this evaluation, in Unix milliseconds
    pub store_now_millis: u64,
}

/// Persisted token bucket, as held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucket {
    pub tokens: u64,
    pub last_refill_millis: u64,
}

impl TokenBucket {
    /// Credit tokens earned since the last refill, then optionally consume one.
    ///
    /// Returns the updated bucket and the remaining count to report. The Lua
    /// script in [`crate::redis`] performs the same steps server-side.
    pub fn evaluate(current: Option<TokenBucket>, params: &BucketParams, now: u64) -> (TokenBucket, i64) {
        let mut bucket = match current {
            Some(bucket) => bucket,
            None => TokenBucket {
                tokens: params.capacity,
                last_refill_millis: now,
            },
        };

        if now > bucket.last_refill_millis && params.refresh_millis > 0 {
            let elapsed = (now - bucket.last_refill_millis) as u128;
            let gained = elapsed * params.limit as u128 / params.refresh_millis as u128;
            if gained > 0 {
                let tokens = (bucket.tokens as u128 + gained).min(params.capacity as u128) as u64;
                bucket.tokens = tokens;
                bucket.last_refill_millis = if tokens >= params.capacity {
                    now
                } else {
                    bucket.last_refill_millis
                        + (gained * params.refresh_millis as u128 / params.limit as u128) as u64
                };
            }
        }
        // Capacity may have been lowered since the state was written
        bucket.tokens = bucket.tokens.min(params.capacity);

        let remaining = if params.consume {
            if bucket.tokens >= 1 {
                bucket.tokens -= 1;
                bucket.tokens as i64
            } else {
                -1
            }
        } else {
            bucket.tokens as i64
        };

        (bucket, remaining)
    }
}

/// Atomic operations the limiter requires from shared state.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Refill and optionally consume from the bucket at `key`, using the store's clock.
    async fn refill_bucket(&self, key: &str, params: BucketParams) -> Result<BucketState>;

    /// Add `usage_millis` to the quota counter at `key` and return the new total.
    ///
    /// The first non-zero usage of a window sets its expiry to `window`;
    /// zero usage only reads the counter.
    async fn add_quota_usage(&self, key: &str, usage_millis: u64, window: Duration) -> Result<u64>;

    /// Health check for the store
    async fn health_check(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Bucket(TokenBucket),
    Counter(u64),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    slot: Slot,
    /// Clock time after which the entry is gone, in Unix milliseconds
    expires_at: u64,
}

/// Evicts each entry once its own deadline passes, touched or not.
struct EntryExpiry {
    clock: Arc<dyn Clock>,
}

impl EntryExpiry {
    fn time_to_live(&self, entry: &Entry) -> Option<Duration> {
        Some(Duration::from_millis(
            entry.expires_at.saturating_sub(self.clock.now_millis()),
        ))
    }
}

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, _current_time: Instant) -> Option<Duration> {
        self.time_to_live(value)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        self.time_to_live(value)
    }
}

/// Single-process store.
///
/// The mutex serializes every read-modify-write, which makes it a faithful
/// stand-in for the remote store in tests and a usable backend for
/// single-instance deployments. Entries live in a `moka` cache that drops
/// them at their deadline.
pub struct InMemoryStore {
    entries: Cache<String, Entry>,
    write_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let entries = Cache::builder()
            .expire_after(EntryExpiry { clock: clock.clone() })
            .build();

        Self {
            entries,
            write_lock: Mutex::new(()),
            clock,
        }
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key)
            .collect();
        for key in expired {
            self.entries.invalidate(key.as_str()).await;
        }
        self.entries.run_pending_tasks().await;
        self.entries.entry_count() as usize
    }

    async fn live(&self, key: &str, now: u64) -> Option<Entry> {
        let entry = self.entries.get(key).await?;
        if entry.expires_at <= now {
            self.entries.invalidate(key).await;
            return None;
        }
        Some(entry)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn refill_bucket(&self, key: &str, params: BucketParams) -> Result<BucketState> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now_millis();

        let current = match self.live(key, now).await {
            Some(Entry {
                slot: Slot::Bucket(bucket),
                ..
            }) => Some(bucket),
            _ => None,
        };
        let (bucket, remaining) = TokenBucket::evaluate(current, &params, now);
        self.entries
            .insert(
                key.to_string(),
                Entry {
                    slot: Slot::Bucket(bucket),
                    expires_at: now + params.ttl_millis(),
                },
            )
            .await;

        trace!(key, remaining, tokens = bucket.tokens, "Evaluated in-memory bucket");
        Ok(BucketState {
            remaining,
            last_refill_millis: bucket.last_refill_millis,
            store_now_millis: now,
        })
    }

    async fn add_quota_usage(&self, key: &str, usage_millis: u64, window: Duration) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now_millis();

        let (current, expires_at) = match self.live(key, now).await {
            Some(Entry {
                slot: Slot::Counter(value),
                expires_at,
            }) => (value, Some(expires_at)),
            _ => (0, None),
        };
        if usage_millis == 0 {
            return Ok(current);
        }

        let total = current.saturating_add(usage_millis);
        let expires_at = expires_at.unwrap_or(now + window.as_millis() as u64);
        self.entries
            .insert(
                key.to_string(),
                Entry {
                    slot: Slot::Counter(total),
                    expires_at,
                },
            )
            .await;
        Ok(total)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
