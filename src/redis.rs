use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    error::{RateLimitError, Result},
    store::{BucketParams, BucketState, RateLimitStore},
};

/// Token bucket refill and consume, timed by the server clock.
///
/// KEYS[1] bucket hash; ARGV: consume (0|1), limit, refresh ms, capacity, ttl ms.
/// Returns `{remaining, last refill ms, server now ms}`. Needs Redis 5+ so
/// that `TIME` may precede writes in a script.
const BURST_SCRIPT: &str = r#"
local key = KEYS[1]
local consume = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local refresh = tonumber(ARGV[3])
local capacity = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

if now > ts and refresh > 0 then
  local gained = math.floor((now - ts) * limit / refresh)
  if gained > 0 then
    tokens = math.min(capacity, tokens + gained)
    if tokens >= capacity then
      ts = now
    else
      ts = ts + math.floor(gained * refresh / limit)
    end
  end
end
tokens = math.min(tokens, capacity)

local remaining = tokens
if consume == 1 then
  if tokens >= 1 then
    tokens = tokens - 1
    remaining = tokens
  else
    remaining = -1
  end
end

redis.call('HSET', key, 'tokens', string.format('%.0f', tokens), 'ts', string.format('%.0f', ts))
redis.call('PEXPIRE', key, ttl)
return {remaining, ts, now}
"#;

/// Quota counter increment; the expiry is only set when the key has none.
///
/// KEYS[1] counter; ARGV: usage ms, window ms. Zero usage only reads.
const QUOTA_SCRIPT: &str = r#"
local key = KEYS[1]
local usage = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

if usage == 0 then
  return tonumber(redis.call('GET', key) or '0')
end

local current = redis.call('INCRBY', key, usage)
if redis.call('PTTL', key) < 0 then
  redis.call('PEXPIRE', key, window)
end
return current
"#;

/// Redis client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}

fn default_command_timeout_ms() -> u64 {
    1_000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Redis-backed shared rate limit state
pub struct RedisStore {
    connection: ConnectionManager,
    burst_script: Script,
    quota_script: Script,
}

impl RedisStore {
    /// Connect to Redis and verify the connection
    pub async fn new(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::Redis(e)
        })?;

        let connection_result =
            tokio::time::timeout(config.connection_timeout(), client.get_connection_manager()).await;

        let connection = match connection_result {
            Ok(Ok(conn)) => {
                info!("Connection manager established successfully");
                conn
            }
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(RateLimitError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}ms)",
                    config.connection_timeout_ms
                );
                return Err(RateLimitError::Timeout(config.connection_timeout()));
            }
        };

        let mut conn = connection.clone();
        let ping_result = tokio::time::timeout(
            config.command_timeout(),
            redis::cmd("PING").query_async::<_, ()>(&mut conn),
        )
        .await;

        match ping_result {
            Ok(Ok(())) => info!("Redis PING successful"),
            Ok(Err(e)) => {
                warn!("Redis PING failed: {}", e);
                return Err(RateLimitError::Redis(e));
            }
            Err(_) => {
                warn!("Redis PING timeout ({}ms)", config.command_timeout_ms);
                return Err(RateLimitError::Timeout(config.command_timeout()));
            }
        }

        Ok(Self {
            connection,
            burst_script: Script::new(BURST_SCRIPT),
            quota_script: Script::new(QUOTA_SCRIPT),
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn refill_bucket(&self, key: &str, params: BucketParams) -> Result<BucketState> {
        let mut conn = self.connection.clone();
        let result: Vec<i64> = self
            .burst_script
            .key(key)
            .arg(u8::from(params.consume))
            .arg(params.limit)
            .arg(params.refresh_millis)
            .arg(params.capacity)
            .arg(params.ttl_millis())
            .invoke_async(&mut conn)
            .await?;

        match result.as_slice() {
            [remaining, last_refill, now] => {
                debug!(key, remaining, "Evaluated Redis bucket");
                Ok(BucketState {
                    remaining: *remaining,
                    last_refill_millis: (*last_refill).max(0) as u64,
                    store_now_millis: (*now).max(0) as u64,
                })
            }
            other => Err(RateLimitError::Store(format!(
                "unexpected burst script reply with {} values",
                other.len()
            ))),
        }
    }

    async fn add_quota_usage(&self, key: &str, usage_millis: u64, window: Duration) -> Result<u64> {
        let mut conn = self.connection.clone();
        let current: i64 = self
            .quota_script
            .key(key)
            .arg(usage_millis)
            .arg(window.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(current.max(0) as u64)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(RateLimitError::Redis)?;
        Ok(())
    }
}
