//! Combines the results of every applicable policy into one decision.

use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

use crate::{
    key::KeyBuilder,
    limiter::Limiter,
    metrics::Metrics,
    policy::{Policy, PolicyStore},
    rate::{Decision, Rate},
    request::{Request, Route},
};

/// Route label used when a request matched no route
const UNROUTED: &str = "none";

/// Evaluates policies for requests.
///
/// Policies run in configured order and a matching `break_on_match` policy
/// ends the walk, so the first match wins rather than the most restrictive.
pub struct RateAggregator {
    policies: PolicyStore,
    key_builder: KeyBuilder,
    limiter: Limiter,
    metrics: Option<Arc<Metrics>>,
}

impl RateAggregator {
    pub fn new(policies: PolicyStore, key_builder: KeyBuilder, limiter: Limiter) -> Self {
        Self {
            policies,
            key_builder,
            limiter,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        metrics.set_configured_routes(self.policies.route_count());
        self.metrics = Some(metrics);
        self
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    /// Decide on a request using the policies configured for its route.
    pub async fn decide_route(&self, request: &Request, route: Option<&Route>) -> Decision {
        let policies = self.policies.policies_for(route.map(|r| r.id.as_str()));
        self.decide(request, route, policies).await
    }

    /// Decide on a request against an explicit policy list, consuming burst tokens.
    pub async fn decide(&self, request: &Request, route: Option<&Route>, policies: &[Policy]) -> Decision {
        let _timer = self.metrics.as_ref().map(|m| m.start_decision_timer());

        let rates = self.evaluate(request, route, policies, None).await;
        let decision = Decision::from_rates(rates);

        let route_label = route.map(|r| r.id.as_str()).unwrap_or(UNROUTED);
        if let Some(metrics) = &self.metrics {
            metrics.record_decision(route_label, decision.allowed);
        }
        match decision.denied_rate() {
            Some(rate) => info!(
                route = route_label,
                key = %rate.key,
                remaining = ?rate.remaining,
                remaining_quota_millis = ?rate.remaining_quota_millis,
                "Request over limit"
            ),
            None => debug!(route = route_label, rates = decision.rates.len(), "Request within limits"),
        }
        decision
    }

    /// Charge the time a finished request took against its quotas.
    ///
    /// Selects policies exactly as [`decide_route`](Self::decide_route) does;
    /// burst buckets are reported but not consumed.
    pub async fn record_usage(&self, request: &Request, route: Option<&Route>, elapsed: Duration) -> Decision {
        let policies = self.policies.policies_for(route.map(|r| r.id.as_str()));
        let rates = self.evaluate(request, route, policies, Some(elapsed)).await;
        debug!(
            route = route.map(|r| r.id.as_str()).unwrap_or(UNROUTED),
            elapsed_ms = elapsed.as_millis() as u64,
            "Recorded request usage"
        );
        Decision::from_rates(rates)
    }

    async fn evaluate(
        &self,
        request: &Request,
        route: Option<&Route>,
        policies: &[Policy],
        request_time: Option<Duration>,
    ) -> Vec<Rate> {
        let route_label = route.map(|r| r.id.as_str()).unwrap_or(UNROUTED);
        let mut rates = Vec::new();

        for policy in policies {
            let Some(key) = self.key_builder.matching_key(request, route, policy) else {
                continue;
            };

            if let Some(metrics) = &self.metrics {
                let kind = match (policy.limit.is_some(), policy.quota.is_some()) {
                    (true, true) => "burst+quota",
                    (true, false) => "burst",
                    (false, true) => "quota",
                    (false, false) => "noop",
                };
                metrics.record_policy_evaluation(route_label, kind);
            }

            rates.push(self.limiter.consume(policy, &key, request_time).await);

            if policy.break_on_match {
                break;
            }
        }
        rates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        policy::{MatchRule, MatchType},
        rate::EXHAUSTED,
        store::InMemoryStore,
        utils::{ManualClock, RateLimitUtils},
    };
    use http::Method;

    fn aggregator(policies: PolicyStore) -> (Arc<ManualClock>, RateAggregator) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let aggregator = RateAggregator::new(
            policies,
            KeyBuilder::new("gateway", RateLimitUtils::default()),
            Limiter::new(store),
        );
        (clock, aggregator)
    }

    fn request(origin: &str) -> Request {
        Request::new(Method::GET, "/serviceA").with_remote_addr(origin)
    }

    fn route() -> Route {
        Route::new("serviceA", "/serviceA")
    }

    #[tokio::test]
    async fn test_origin_limit_scenario() {
        let policy = Policy::new(Duration::from_secs(60))
            .with_limit(2)
            .with_rule(MatchRule::new(MatchType::Origin));
        let (clock, aggregator) = aggregator(PolicyStore::new(vec![policy]).unwrap());
        let req = request("10.0.0.100");

        let first = aggregator.decide_route(&req, Some(&route())).await;
        assert!(first.allowed);
        assert_eq!(first.rates[0].remaining, Some(1));
        assert_eq!(first.rates[0].key, "gateway:serviceA:10.0.0.100");

        let second = aggregator.decide_route(&req, Some(&route())).await;
        assert!(second.allowed);
        assert_eq!(second.rates[0].remaining, Some(0));

        let third = aggregator.decide_route(&req, Some(&route())).await;
        assert!(!third.allowed);
        assert_eq!(third.rates[0].remaining, Some(EXHAUSTED));
        assert_eq!(third.denied_by.as_deref(), Some("gateway:serviceA:10.0.0.100"));

        // Another origin has its own bucket
        assert!(aggregator.decide_route(&request("10.0.0.7"), Some(&route())).await.allowed);

        clock.advance(Duration::from_secs(30));
        let refilled = aggregator.decide_route(&req, Some(&route())).await;
        assert!(refilled.allowed);
        assert_eq!(refilled.rates[0].remaining, Some(0));
    }

    #[tokio::test]
    async fn test_break_on_match_stops_evaluation() {
        let a = Policy::default()
            .with_limit(5)
            .with_break_on_match(true)
            .with_rule(MatchRule::new(MatchType::Origin));
        let b = Policy::default()
            .with_limit(5)
            .with_rule(MatchRule::new(MatchType::HttpMethod));
        let (_clock, aggregator) = aggregator(PolicyStore::default());

        let decision = aggregator
            .decide(&request("10.0.0.1"), Some(&route()), &[a.clone(), b.clone()])
            .await;
        assert_eq!(decision.rates.len(), 1);
        assert_eq!(decision.rates[0].key, "gateway:serviceA:10.0.0.1");
        assert!(decision.rate("gateway:serviceA:GET").is_none());

        // Without break_on_match both contribute
        let a = a.with_break_on_match(false);
        let decision = aggregator.decide(&request("10.0.0.1"), Some(&route()), &[a, b]).await;
        assert_eq!(decision.rates.len(), 2);
        assert!(decision.rate("gateway:serviceA:GET").is_some());
    }

    #[tokio::test]
    async fn test_non_matching_break_policy_does_not_stop() {
        let a = Policy::default()
            .with_limit(5)
            .with_break_on_match(true)
            .with_rule(MatchRule::with_matcher(MatchType::User, "alice"));
        let b = Policy::default().with_limit(5).with_rule(MatchRule::new(MatchType::Origin));
        let (_clock, aggregator) = aggregator(PolicyStore::default());

        let decision = aggregator.decide(&request("10.0.0.1"), Some(&route()), &[a, b]).await;
        assert_eq!(decision.rates.len(), 1);
        assert_eq!(decision.rates[0].key, "gateway:serviceA:10.0.0.1");
    }

    #[tokio::test]
    async fn test_any_exhausted_rate_denies() {
        let narrow = Policy::default().with_limit(1).with_rule(MatchRule::new(MatchType::Origin));
        let wide = Policy::default().with_limit(100).with_rule(MatchRule::new(MatchType::Global));
        let (_clock, aggregator) = aggregator(PolicyStore::new(vec![wide, narrow]).unwrap());

        assert!(aggregator.decide_route(&request("10.0.0.1"), None).await.allowed);
        let decision = aggregator.decide_route(&request("10.0.0.1"), None).await;
        assert!(!decision.allowed);
        assert_eq!(decision.denied_by.as_deref(), Some("gateway:10.0.0.1"));
        assert_eq!(decision.rate("gateway:global").unwrap().remaining, Some(98));
    }

    #[tokio::test]
    async fn test_quota_usage_denies_next_request() {
        let policy = Policy::new(Duration::from_secs(60)).with_quota(Duration::from_secs(5));
        let (clock, aggregator) = aggregator(PolicyStore::new(vec![policy]).unwrap());
        let req = request("10.0.0.1");

        let mut remaining = Vec::new();
        for _ in 0..3 {
            assert!(aggregator.decide_route(&req, Some(&route())).await.allowed);
            let usage = aggregator
                .record_usage(&req, Some(&route()), Duration::from_secs(2))
                .await;
            remaining.push(usage.rates[0].remaining_quota_millis);
        }
        assert_eq!(remaining, vec![Some(3_000), Some(1_000), Some(EXHAUSTED)]);

        let decision = aggregator.decide_route(&req, Some(&route())).await;
        assert!(!decision.allowed);
        assert_eq!(decision.denied_by.as_deref(), Some("gateway:serviceA"));

        clock.advance(Duration::from_secs(60));
        let decision = aggregator.decide_route(&req, Some(&route())).await;
        assert!(decision.allowed);
        assert_eq!(decision.rates[0].remaining_quota_millis, Some(5_000));
    }

    #[tokio::test]
    async fn test_no_applicable_policy_allows() {
        let policy = Policy::default()
            .with_limit(1)
            .with_rule(MatchRule::with_matcher(MatchType::HttpMethod, "POST"));
        let (_clock, aggregator) = aggregator(PolicyStore::new(vec![policy]).unwrap());

        for _ in 0..3 {
            let decision = aggregator.decide_route(&request("10.0.0.1"), None).await;
            assert!(decision.allowed);
            assert!(decision.rates.is_empty());
        }
    }

    #[tokio::test]
    async fn test_route_policies_override_defaults() {
        let mut store = PolicyStore::new(vec![Policy::default().with_limit(100)]).unwrap();
        store
            .insert_route("serviceA", vec![Policy::default().with_limit(1)])
            .unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let (_clock, aggregator) = aggregator(store);
        let aggregator = aggregator.with_metrics(metrics.clone());

        let decision = aggregator.decide_route(&request("10.0.0.1"), Some(&route())).await;
        assert_eq!(decision.rates[0].remaining, Some(0));

        let other = Route::new("serviceB", "/serviceB");
        let decision = aggregator.decide_route(&request("10.0.0.1"), Some(&other)).await;
        assert_eq!(decision.rates[0].remaining, Some(99));

        let families = metrics.registry().gather();
        assert!(families.iter().any(|f| f.get_name() == "ratelimit_total_requests"));
    }
}
