use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, time::Duration};

use crate::{
    error::{RateLimitError, Result},
    policy::{MatchRule, Policy, PolicyStore, DEFAULT_REFRESH_INTERVAL},
    redis::RedisConfig,
    request::{Route, RouteTable},
};

/// Prefix of environment variables overriding file settings, e.g. `RATELIMIT__KEY_PREFIX`
pub const ENV_PREFIX: &str = "RATELIMIT";

/// A policy as written in configuration; durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    pub limit: Option<u64>,
    pub capacity: Option<u64>,
    pub quota: Option<u64>,
    #[serde(default)]
    pub break_on_match: bool,
    #[serde(default, rename = "type")]
    pub match_types: Vec<String>,
}

fn default_refresh_interval() -> u64 {
    DEFAULT_REFRESH_INTERVAL.as_secs()
}

impl TryFrom<PolicyConfig> for Policy {
    type Error = RateLimitError;

    fn try_from(config: PolicyConfig) -> Result<Self> {
        let match_rules = config
            .match_types
            .iter()
            .map(|s| s.parse::<MatchRule>())
            .collect::<Result<Vec<_>>>()?;

        let policy = Policy {
            refresh_interval: Duration::from_secs(config.refresh_interval),
            limit: config.limit,
            capacity: config.capacity,
            quota: config.quota.map(Duration::from_secs),
            break_on_match: config.break_on_match,
            match_rules,
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// Which shared state backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repository {
    #[default]
    Redis,
    InMemory,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Identifies the deployment in every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Take the origin from `X-Forwarded-For` when present
    #[serde(default)]
    pub behind_proxy: bool,
    #[serde(default)]
    pub repository: Repository,
    #[serde(default)]
    pub redis: RedisConfig,
    /// Bound on each store round trip before failing open
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub default_policy_list: Vec<PolicyConfig>,
    #[serde(default)]
    pub policy_list: HashMap<String, Vec<PolicyConfig>>,
}

fn default_key_prefix() -> String {
    "rate-limit-application".to_string()
}

fn default_store_timeout_ms() -> u64 {
    500
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            behind_proxy: false,
            repository: Repository::default(),
            redis: RedisConfig::default(),
            store_timeout_ms: default_store_timeout_ms(),
            server: ServerConfig::default(),
            routes: Vec::new(),
            default_policy_list: Vec::new(),
            policy_list: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file, with `RATELIMIT__*` environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut settings = load_settings_from_yaml(&content)?;
        SettingsOverrides::from_env()?.apply(&mut settings);
        Ok(settings)
    }

    /// Default settings with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut settings = Settings::default();
        SettingsOverrides::from_env()?.apply(&mut settings);
        Ok(settings)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Validate and compile the configured policies
    pub fn policy_store(&self) -> Result<PolicyStore> {
        let defaults = compile_policies(&self.default_policy_list)?;
        let mut store = PolicyStore::new(defaults)?;
        for (route_id, policies) in &self.policy_list {
            let compiled = compile_policies(policies).map_err(|e| {
                RateLimitError::Config(format!("route '{}': {}", route_id, e))
            })?;
            store.insert_route(route_id.clone(), compiled)?;
        }
        Ok(store)
    }

    pub fn route_table(&self) -> RouteTable {
        RouteTable::new(self.routes.clone())
    }
}

/// Scalar settings that may be overridden from the environment.
///
/// Policies and routes only come from the file, where key case is kept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsOverrides {
    pub key_prefix: Option<String>,
    pub behind_proxy: Option<bool>,
    pub repository: Option<Repository>,
    pub store_timeout_ms: Option<u64>,
    pub redis_url: Option<String>,
    pub http_addr: Option<SocketAddr>,
}

impl SettingsOverrides {
    pub fn from_env() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
    }

    pub fn from_source<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let overrides = config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()?;
        Ok(overrides)
    }

    pub fn apply(self, settings: &mut Settings) {
        if let Some(key_prefix) = self.key_prefix {
            settings.key_prefix = key_prefix;
        }
        if let Some(behind_proxy) = self.behind_proxy {
            settings.behind_proxy = behind_proxy;
        }
        if let Some(repository) = self.repository {
            settings.repository = repository;
        }
        if let Some(store_timeout_ms) = self.store_timeout_ms {
            settings.store_timeout_ms = store_timeout_ms;
        }
        if let Some(redis_url) = self.redis_url {
            settings.redis.url = redis_url;
        }
        if let Some(http_addr) = self.http_addr {
            settings.server.http_addr = http_addr;
        }
    }
}

fn compile_policies(configs: &[PolicyConfig]) -> Result<Vec<Policy>> {
    configs.iter().cloned().map(Policy::try_from).collect()
}

/// Load settings from a YAML string
pub fn load_settings_from_yaml(yaml: &str) -> Result<Settings> {
    serde_yaml::from_str(yaml)
        .map_err(|e| RateLimitError::Config(format!("Failed to parse YAML: {}", e)))
}

/// Load a bare policy list from a YAML string
pub fn load_policies_from_yaml(yaml: &str) -> Result<Vec<Policy>> {
    let configs: Vec<PolicyConfig> = serde_yaml::from_str(yaml)
        .map_err(|e| RateLimitError::Config(format!("Failed to parse YAML: {}", e)))?;
    compile_policies(&configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MatchType;

    const SETTINGS_YAML: &str = r#"
key_prefix: gateway
behind_proxy: true
repository: in_memory
store_timeout_ms: 250
routes:
  - id: serviceA
    path: /serviceA
default_policy_list:
  - limit: 100
    refresh_interval: 60
    type:
      - origin
policy_list:
  serviceA:
    - limit: 2
      capacity: 5
      quota: 30
      refresh_interval: 10
      break_on_match: true
      type:
        - user
        - role=admin
        - http_method=GET
"#;

    #[test]
    fn test_load_settings_from_yaml() {
        let settings = load_settings_from_yaml(SETTINGS_YAML).unwrap();
        assert_eq!(settings.key_prefix, "gateway");
        assert!(settings.behind_proxy);
        assert_eq!(settings.repository, Repository::InMemory);
        assert_eq!(settings.store_timeout(), Duration::from_millis(250));
        assert_eq!(settings.redis.url, "redis://localhost:6379");
        assert_eq!(settings.route_table().resolve("/serviceA/x").unwrap().id, "serviceA");
    }

    #[test]
    fn test_compile_policy_store() {
        let store = load_settings_from_yaml(SETTINGS_YAML)
            .unwrap()
            .policy_store()
            .unwrap();

        let policy = &store.policies_for(Some("serviceA"))[0];
        assert_eq!(policy.limit, Some(2));
        assert_eq!(policy.bucket_capacity(), Some(5));
        assert_eq!(policy.quota, Some(Duration::from_secs(30)));
        assert_eq!(policy.refresh_interval, Duration::from_secs(10));
        assert!(policy.break_on_match);
        assert_eq!(policy.match_rules.len(), 3);
        assert_eq!(policy.match_rules[1], MatchRule::with_matcher(MatchType::Role, "admin"));

        let default = &store.policies_for(Some("other"))[0];
        assert_eq!(default.limit, Some(100));
        assert_eq!(default.refresh_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_defaults_when_empty() {
        let settings = load_settings_from_yaml("{}").unwrap();
        assert_eq!(settings.key_prefix, "rate-limit-application");
        assert_eq!(settings.repository, Repository::Redis);
        assert!(settings.policy_store().unwrap().default_policies().is_empty());
    }

    #[test]
    fn test_invalid_policy_fails_at_load() {
        let yaml = r#"
policy_list:
  serviceA:
    - limit: 0
"#;
        let err = load_settings_from_yaml(yaml).unwrap().policy_store().unwrap_err();
        assert!(matches!(err, RateLimitError::Config(ref msg) if msg.contains("serviceA")));

        assert!(load_policies_from_yaml("- type: [planet]").is_err());
        assert!(load_policies_from_yaml("- type: [http_header]").is_err());
    }

    #[test]
    fn test_load_policies_from_yaml() {
        let policies = load_policies_from_yaml(
            r#"
- limit: 10
  type: [origin]
- quota: 5
"#,
        )
        .unwrap();
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[1].quota, Some(Duration::from_secs(5)));
        assert!(policies[1].match_rules.is_empty());
    }

    #[test]
    fn test_overrides_replace_scalars_only() {
        let overrides = SettingsOverrides::from_source(
            config::File::from_str(
                "key_prefix: edge\nrepository: redis\nstore_timeout_ms: 40\nredis_url: redis://cache:6379",
                config::FileFormat::Yaml,
            ),
        )
        .unwrap();

        let mut settings = load_settings_from_yaml(SETTINGS_YAML).unwrap();
        overrides.apply(&mut settings);

        assert_eq!(settings.key_prefix, "edge");
        assert_eq!(settings.repository, Repository::Redis);
        assert_eq!(settings.store_timeout_ms, 40);
        assert_eq!(settings.redis.url, "redis://cache:6379");
        assert!(settings.behind_proxy);
        assert!(settings.policy_list.contains_key("serviceA"));
    }

    #[test]
    fn test_load_settings_file() {
        let path = std::env::temp_dir().join(format!("ratelimit-settings-{}.yaml", std::process::id()));
        std::fs::write(&path, SETTINGS_YAML).unwrap();

        let settings = Settings::load(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.key_prefix, "gateway");
        assert_eq!(settings.policy_store().unwrap().route_count(), 1);

        std::fs::remove_file(&path).unwrap();
    }
}
