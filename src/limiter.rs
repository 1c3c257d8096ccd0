//! Burst and quota evaluation against the shared store.
//!
//! Store failures never deny a request: they go to the [`ErrorHandler`] and
//! the limiter answers with fail-open values instead.

use std::{future::Future, sync::Arc, time::{Duration, Instant}};
use tracing::{debug, trace};

use crate::{
    error::{ErrorHandler, LoggingErrorHandler, RateLimitError, Result},
    metrics::Metrics,
    policy::Policy,
    rate::{Rate, EXHAUSTED},
    store::{BucketParams, RateLimitStore},
    utils::ceil_secs,
};

/// Suffix distinguishing a policy's quota counter from its bucket
pub const QUOTA_SUFFIX: &str = "-quota";

/// Default bound on a single store round trip
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Burst evaluation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstOutcome {
    pub remaining: i64,
    /// Time until the bucket gains its next token
    pub reset: Duration,
}

/// Quota evaluation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaOutcome {
    pub remaining_millis: i64,
    /// Length of the quota window
    pub reset: Duration,
}

/// Evaluates policies against a [`RateLimitStore`].
pub struct Limiter {
    store: Arc<dyn RateLimitStore>,
    error_handler: Arc<dyn ErrorHandler>,
    timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl Limiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            error_handler: Arc::new(LoggingErrorHandler),
            timeout: DEFAULT_STORE_TIMEOUT,
            metrics: None,
        }
    }

    pub fn with_error_handler(mut self, error_handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = error_handler;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    /// Evaluate a policy for `key`.
    ///
    /// Without `request_time` this is the pre-request check: the bucket gives
    /// up a token and the quota is only read. With it, the request has
    /// finished: the bucket is only inspected and the quota is charged.
    pub async fn consume(&self, policy: &Policy, key: &str, request_time: Option<Duration>) -> Rate {
        let mut rate = Rate::new(key);

        if let (Some(limit), Some(capacity)) = (policy.limit, policy.bucket_capacity()) {
            let outcome = self
                .evaluate_burst(key, capacity, limit, policy.refresh_interval, request_time.is_none())
                .await;
            rate.remaining = Some(outcome.remaining);
            rate.reset_secs = Some(ceil_secs(outcome.reset));
        }

        if let Some(quota) = policy.quota {
            let usage = request_time.unwrap_or_default();
            let quota_key = format!("{}{}", key, QUOTA_SUFFIX);
            let outcome = self
                .evaluate_quota(&quota_key, quota, policy.refresh_interval, usage)
                .await;
            rate.remaining_quota_millis = Some(outcome.remaining_millis);
            rate.reset_quota_millis = Some(outcome.reset.as_millis() as u64);
        }

        trace!(?rate, "Evaluated policy");
        rate
    }

    /// Refill the bucket at `key` and optionally consume one token.
    pub async fn evaluate_burst(
        &self,
        key: &str,
        capacity: u64,
        limit: u64,
        refresh_interval: Duration,
        consume: bool,
    ) -> BurstOutcome {
        let params = BucketParams {
            capacity,
            limit,
            refresh_millis: refresh_interval.as_millis() as u64,
            consume,
        };
        let per_token = Duration::from_millis(params.refresh_millis / limit.max(1));

        match self.call("burst", self.store.refill_bucket(key, params)).await {
            Ok(state) => {
                // Store clock is authoritative; a clock that went backwards gets no correction
                let since_refill = state.store_now_millis.saturating_sub(state.last_refill_millis);
                let reset = per_token.saturating_sub(Duration::from_millis(since_refill));
                debug!(key, remaining = state.remaining, ?reset, "Burst evaluated");
                BurstOutcome {
                    remaining: state.remaining,
                    reset,
                }
            }
            Err(e) => {
                let msg = format!("Failed retrieving rate for {}, will return the current value", key);
                self.report(&msg, "burst", &e);
                BurstOutcome {
                    remaining: 0,
                    reset: per_token,
                }
            }
        }
    }

    /// Add `usage` to the quota counter at `key`.
    pub async fn evaluate_quota(
        &self,
        key: &str,
        quota: Duration,
        refresh_interval: Duration,
        usage: Duration,
    ) -> QuotaOutcome {
        let usage_millis = usage.as_millis() as u64;
        let current = match self
            .call("quota", self.store.add_quota_usage(key, usage_millis, refresh_interval))
            .await
        {
            Ok(current) => current,
            Err(e) => {
                let msg = format!("Failed retrieving rate for {}, will return the current value", key);
                self.report(&msg, "quota", &e);
                0
            }
        };

        let quota_millis = quota.as_millis() as u64;
        let remaining_millis = if current >= quota_millis {
            EXHAUSTED
        } else {
            (quota_millis - current) as i64
        };
        debug!(key, current, remaining_millis, "Quota evaluated");

        QuotaOutcome {
            remaining_millis,
            reset: refresh_interval,
        }
    }

    /// Run one store operation under the configured timeout.
    async fn call<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RateLimitError::Timeout(self.timeout)),
        };
        if let Some(metrics) = &self.metrics {
            let outcome = if result.is_ok() { "success" } else { "error" };
            metrics.record_store_operation(operation, outcome, started.elapsed().as_secs_f64());
        }
        result
    }

    fn report(&self, message: &str, operation: &str, cause: &RateLimitError) {
        if let Some(metrics) = &self.metrics {
            metrics.record_backend_failure(operation);
        }
        self.error_handler.handle_error(message, cause);
    }
}
