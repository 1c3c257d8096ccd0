//! Policy data model and the per-route policy store.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use crate::error::{RateLimitError, Result};

/// Default refresh interval applied when a policy does not set one.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Request dimension a rule matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    /// Remote address of the caller
    Origin,
    /// Route (downstream service) the request is routed to
    Service,
    /// Request path prefix
    Url,
    /// Authenticated user, `anonymous` otherwise
    User,
    /// Role granted to the authenticated user
    Role,
    /// HTTP method
    HttpMethod,
    /// Value of a named request header
    HttpHeader,
    /// Every request
    Global,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::Origin => "origin",
            MatchType::Service => "service",
            MatchType::Url => "url",
            MatchType::User => "user",
            MatchType::Role => "role",
            MatchType::HttpMethod => "http_method",
            MatchType::HttpHeader => "http_header",
            MatchType::Global => "global",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "origin" => Ok(MatchType::Origin),
            "service" | "route" => Ok(MatchType::Service),
            "url" => Ok(MatchType::Url),
            "user" => Ok(MatchType::User),
            "role" => Ok(MatchType::Role),
            "http_method" | "method" => Ok(MatchType::HttpMethod),
            "http_header" | "header" => Ok(MatchType::HttpHeader),
            "global" => Ok(MatchType::Global),
            _ => Err(RateLimitError::InvalidPolicy(format!(
                "unknown match type '{}'",
                s
            ))),
        }
    }
}

/// A single match rule of a policy: a type, optionally narrowed by a matcher.
///
/// Written in configuration as `type` or `type=matcher`, e.g. `origin` or
/// `role=admin`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchRule {
    pub match_type: MatchType,
    pub matcher: Option<String>,
}

impl MatchRule {
    pub fn new(match_type: MatchType) -> Self {
        Self {
            match_type,
            matcher: None,
        }
    }

    pub fn with_matcher(match_type: MatchType, matcher: impl Into<String>) -> Self {
        let matcher = matcher.into();
        Self {
            match_type,
            matcher: if matcher.is_empty() { None } else { Some(matcher) },
        }
    }

    /// Matcher, treating an empty string as absent.
    pub fn matcher(&self) -> Option<&str> {
        self.matcher.as_deref().filter(|m| !m.is_empty())
    }

    fn validate(&self) -> Result<()> {
        match (self.match_type, self.matcher()) {
            (MatchType::HttpHeader, None) => Err(RateLimitError::InvalidPolicy(
                "http_header rule requires a header name matcher".to_string(),
            )),
            (MatchType::Global, Some(matcher)) => Err(RateLimitError::InvalidPolicy(format!(
                "global rule does not take a matcher, got '{}'",
                matcher
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.matcher() {
            Some(matcher) => write!(f, "{}={}", self.match_type, matcher),
            None => write!(f, "{}", self.match_type),
        }
    }
}

impl FromStr for MatchRule {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((kind, matcher)) => Ok(MatchRule::with_matcher(kind.parse()?, matcher.trim())),
            None => Ok(MatchRule::new(s.parse()?)),
        }
    }
}

impl TryFrom<String> for MatchRule {
    type Error = RateLimitError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MatchRule> for String {
    fn from(rule: MatchRule) -> Self {
        rule.to_string()
    }
}

/// A configured rate limit policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    /// Window length for quota and steady refill period for the bucket
    pub refresh_interval: Duration,
    /// Requests refilled per refresh interval
    pub limit: Option<u64>,
    /// Bucket size; falls back to `limit`
    pub capacity: Option<u64>,
    /// Request processing time allowed per refresh interval
    pub quota: Option<Duration>,
    /// Stop evaluating later policies once this one applies
    pub break_on_match: bool,
    /// Rules that must all hold for the policy to apply
    pub match_rules: Vec<MatchRule>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            limit: None,
            capacity: None,
            quota: None,
            break_on_match: false,
            match_rules: Vec::new(),
        }
    }
}

impl Policy {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_quota(mut self, quota: Duration) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn with_break_on_match(mut self, break_on_match: bool) -> Self {
        self.break_on_match = break_on_match;
        self
    }

    pub fn with_rule(mut self, rule: MatchRule) -> Self {
        self.match_rules.push(rule);
        self
    }

    /// Effective bucket size.
    pub fn bucket_capacity(&self) -> Option<u64> {
        self.capacity.or(self.limit)
    }

    /// Whether the policy limits anything at all.
    pub fn is_noop(&self) -> bool {
        self.limit.is_none() && self.quota.is_none()
    }

    /// Reject configurations the limiter algorithms cannot evaluate.
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval.as_millis() == 0 {
            return Err(RateLimitError::InvalidPolicy(
                "refresh interval must be positive".to_string(),
            ));
        }
        if self.limit == Some(0) {
            return Err(RateLimitError::InvalidPolicy(
                "limit must be positive".to_string(),
            ));
        }
        if self.capacity.is_some() && self.limit.is_none() {
            return Err(RateLimitError::InvalidPolicy(
                "capacity requires a limit".to_string(),
            ));
        }
        for rule in &self.match_rules {
            rule.validate()?;
        }
        Ok(())
    }
}

/// Policies per route id, with a default list for routes without their own.
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    default_policies: Vec<Policy>,
    route_policies: HashMap<String, Vec<Policy>>,
}

impl PolicyStore {
    pub fn new(default_policies: Vec<Policy>) -> Result<Self> {
        for policy in &default_policies {
            policy.validate()?;
        }
        Ok(Self {
            default_policies,
            route_policies: HashMap::new(),
        })
    }

    /// Register the policy list for a route, replacing any previous one.
    pub fn insert_route(&mut self, route_id: impl Into<String>, policies: Vec<Policy>) -> Result<()> {
        for policy in &policies {
            policy.validate()?;
        }
        self.route_policies.insert(route_id.into(), policies);
        Ok(())
    }

    /// Policies that apply to the given route, in configured order.
    pub fn policies_for(&self, route_id: Option<&str>) -> &[Policy] {
        route_id
            .and_then(|id| self.route_policies.get(id))
            .map(Vec::as_slice)
            .unwrap_or(&self.default_policies)
    }

    pub fn default_policies(&self) -> &[Policy] {
        &self.default_policies
    }

    pub fn route_count(&self) -> usize {
        self.route_policies.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_match_rules() {
        let rule: MatchRule = "origin".parse().unwrap();
        assert_eq!(rule, MatchRule::new(MatchType::Origin));

        let rule: MatchRule = "role=admin".parse().unwrap();
        assert_eq!(rule.match_type, MatchType::Role);
        assert_eq!(rule.matcher(), Some("admin"));

        let rule: MatchRule = "HTTP_METHOD=GET".parse().unwrap();
        assert_eq!(rule.match_type, MatchType::HttpMethod);
        assert_eq!(rule.to_string(), "http_method=GET");

        let rule: MatchRule = "user=".parse().unwrap();
        assert_eq!(rule.matcher(), None);

        assert!("planet".parse::<MatchRule>().is_err());
    }

    #[test]
    fn test_capacity_defaults_to_limit() {
        let policy = Policy::default().with_limit(10);
        assert_eq!(policy.bucket_capacity(), Some(10));

        let policy = policy.with_capacity(25);
        assert_eq!(policy.bucket_capacity(), Some(25));

        // Lower than limit is tolerated
        let policy = Policy::default().with_limit(10).with_capacity(3);
        assert!(policy.validate().is_ok());
        assert_eq!(policy.bucket_capacity(), Some(3));
    }

    #[test]
    fn test_policy_validation() {
        assert!(Policy::default().validate().is_ok());
        assert!(Policy::default().is_noop());
        assert!(Policy::new(Duration::ZERO).with_limit(1).validate().is_err());
        assert!(Policy::default().with_limit(0).validate().is_err());
        assert!(Policy::default().with_capacity(5).validate().is_err());
        assert!(Policy::default()
            .with_rule(MatchRule::new(MatchType::HttpHeader))
            .validate()
            .is_err());
        assert!(Policy::default()
            .with_rule(MatchRule::with_matcher(MatchType::Global, "x"))
            .validate()
            .is_err());
    }

    #[test]
    fn test_policies_for_route_falls_back_to_default() {
        let default = vec![Policy::default().with_limit(100)];
        let mut store = PolicyStore::new(default).unwrap();
        store
            .insert_route("serviceA", vec![Policy::default().with_limit(5)])
            .unwrap();

        assert_eq!(store.policies_for(Some("serviceA"))[0].limit, Some(5));
        assert_eq!(store.policies_for(Some("serviceB"))[0].limit, Some(100));
        assert_eq!(store.policies_for(None)[0].limit, Some(100));
        assert_eq!(store.route_count(), 1);
    }

    #[test]
    fn test_insert_route_rejects_invalid_policy() {
        let mut store = PolicyStore::default();
        let result = store.insert_route("serviceA", vec![Policy::default().with_limit(0)]);
        assert!(matches!(result, Err(RateLimitError::InvalidPolicy(_))));
        assert!(store.policies_for(Some("serviceA")).is_empty());
    }
}
