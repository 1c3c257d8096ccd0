//! Rate limit key derivation.
//!
//! A key is `prefix:route:fragment...`, one fragment per match rule in the
//! order the policy lists them. Identical requests under identical
//! configuration always produce identical keys, which is what shards the
//! shared state in the store.

use crate::{
    policy::{MatchRule, MatchType, Policy},
    request::{Request, Route},
    utils::RateLimitUtils,
};

/// Separator between key segments
pub const KEY_SEPARATOR: &str = ":";

/// Outcome of evaluating a policy's rules against a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMatch {
    pub applies: bool,
    pub key: String,
}

/// Builds rate limit keys for a deployment.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    key_prefix: String,
    utils: RateLimitUtils,
}

impl KeyBuilder {
    pub fn new(key_prefix: impl Into<String>, utils: RateLimitUtils) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            utils,
        }
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Whether the policy applies, and the key it would be counted under.
    pub fn build_key(&self, request: &Request, route: Option<&Route>, policy: &Policy) -> KeyMatch {
        KeyMatch {
            applies: self.applies(request, route, policy),
            key: self.key(request, route, policy),
        }
    }

    /// Key for the policy, only if every rule holds.
    pub fn matching_key(
        &self,
        request: &Request,
        route: Option<&Route>,
        policy: &Policy,
    ) -> Option<String> {
        self.applies(request, route, policy)
            .then(|| self.key(request, route, policy))
    }

    pub fn applies(&self, request: &Request, route: Option<&Route>, policy: &Policy) -> bool {
        policy
            .match_rules
            .iter()
            .all(|rule| self.rule_applies(request, route, rule))
    }

    pub fn key(&self, request: &Request, route: Option<&Route>, policy: &Policy) -> String {
        let mut parts = Vec::with_capacity(policy.match_rules.len() + 2);
        parts.push(self.key_prefix.clone());
        if let Some(route) = route {
            parts.push(route.id.clone());
        }
        for rule in &policy.match_rules {
            parts.push(self.fragment(request, route, rule));
        }
        parts.join(KEY_SEPARATOR)
    }

    fn rule_applies(&self, request: &Request, route: Option<&Route>, rule: &MatchRule) -> bool {
        let Some(matcher) = rule.matcher() else {
            return true;
        };
        match rule.match_type {
            MatchType::Origin => self.utils.remote_address(request) == matcher,
            MatchType::Service => route.is_some_and(|r| r.id == matcher),
            MatchType::Url => request.path.starts_with(matcher),
            MatchType::User => self.utils.user(request) == matcher,
            MatchType::Role => request.roles.iter().any(|role| role == matcher),
            MatchType::HttpMethod => request.method.as_str().eq_ignore_ascii_case(matcher),
            MatchType::HttpHeader => request.headers.contains_key(matcher),
            MatchType::Global => true,
        }
    }

    fn fragment(&self, request: &Request, route: Option<&Route>, rule: &MatchRule) -> String {
        let value = match rule.match_type {
            MatchType::Origin => self.utils.remote_address(request).to_string(),
            MatchType::Service => route.map(|r| r.id.clone()).unwrap_or_default(),
            MatchType::Url => request.path.clone(),
            MatchType::User => self.utils.user(request).to_string(),
            MatchType::Role => match rule.matcher() {
                Some(_) => MatchType::Role.to_string(),
                None => self.utils.roles(request).join(","),
            },
            MatchType::HttpMethod => request.method.as_str().to_string(),
            MatchType::HttpHeader => rule
                .matcher()
                .and_then(|name| request.header(name))
                .unwrap_or_default()
                .to_string(),
            MatchType::Global => MatchType::Global.to_string(),
        };
        match rule.matcher() {
            Some(matcher) => format!("{}{}{}", value, KEY_SEPARATOR, matcher),
            None => value,
        }
    }
}
