use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::request::Request;

/// Name reported for requests without an authenticated user
pub const ANONYMOUS_USER: &str = "anonymous";

const X_FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Source of wall-clock time in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Resolves caller identity attributes from a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitUtils {
    behind_proxy: bool,
}

impl RateLimitUtils {
    pub fn new(behind_proxy: bool) -> Self {
        Self { behind_proxy }
    }

    /// Authenticated user, or [`ANONYMOUS_USER`].
    pub fn user<'a>(&self, request: &'a Request) -> &'a str {
        request.user.as_deref().unwrap_or(ANONYMOUS_USER)
    }

    /// Client address; the first `X-Forwarded-For` hop when behind a proxy.
    pub fn remote_address<'a>(&self, request: &'a Request) -> &'a str {
        if self.behind_proxy {
            if let Some(forwarded) = request.header(X_FORWARDED_FOR_HEADER) {
                if let Some(first) = forwarded.split(',').next() {
                    let first = first.trim();
                    if !first.is_empty() {
                        return first;
                    }
                }
            }
        }
        &request.remote_addr
    }

    /// Roles sorted and deduplicated, so the order they arrive in never matters.
    pub fn roles(&self, request: &Request) -> Vec<String> {
        let mut roles = request.roles.clone();
        roles.sort();
        roles.dedup();
        roles
    }
}

/// Whole seconds covering the duration, rounding up.
pub fn ceil_secs(duration: Duration) -> u64 {
    let millis = duration.as_millis() as u64;
    millis.div_ceil(1000)
}
