use prometheus::{
    Counter, CounterVec, Histogram, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector for the rate limit engine
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    total_requests: CounterVec,
    over_limit_requests: CounterVec,
    within_limit_requests: CounterVec,
    policy_evaluations: CounterVec,

    // Store metrics
    store_operations: CounterVec,
    store_operation_duration: HistogramVec,
    backend_failures: CounterVec,

    // Service metrics
    configured_routes: IntGauge,
    config_load_success: Counter,
    config_load_error: Counter,
    decision_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let total_requests = CounterVec::new(
            Opts::new(
                "ratelimit_total_requests",
                "Total number of rate limit decisions",
            ),
            &["route"],
        )?;

        let over_limit_requests = CounterVec::new(
            Opts::new(
                "ratelimit_over_limit_requests",
                "Number of requests denied by an exhausted bucket or quota",
            ),
            &["route"],
        )?;

        let within_limit_requests = CounterVec::new(
            Opts::new(
                "ratelimit_within_limit_requests",
                "Number of requests that are within rate limits",
            ),
            &["route"],
        )?;

        let policy_evaluations = CounterVec::new(
            Opts::new(
                "ratelimit_policy_evaluations",
                "Number of policies evaluated, by kind of limit",
            ),
            &["route", "kind"],
        )?;

        let store_operations = CounterVec::new(
            Opts::new(
                "ratelimit_store_operations",
                "Number of store operations by type",
            ),
            &["operation", "result"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ratelimit_store_operation_duration_seconds",
                "Duration of store operations in seconds",
            ),
            &["operation"],
        )?;

        let backend_failures = CounterVec::new(
            Opts::new(
                "ratelimit_backend_failures",
                "Store failures answered with fail-open values",
            ),
            &["operation"],
        )?;

        let configured_routes = IntGauge::new(
            "ratelimit_configured_routes",
            "Number of routes with their own policy list",
        )?;

        let config_load_success = Counter::new(
            "ratelimit_config_load_success",
            "Number of successful configuration loads",
        )?;

        let config_load_error = Counter::new(
            "ratelimit_config_load_error",
            "Number of failed configuration loads",
        )?;

        let decision_duration = Histogram::with_opts(HistogramOpts::new(
            "ratelimit_decision_duration_seconds",
            "Duration of rate limit decisions in seconds",
        ))?;

        // Register all metrics
        registry.register(Box::new(total_requests.clone()))?;
        registry.register(Box::new(over_limit_requests.clone()))?;
        registry.register(Box::new(within_limit_requests.clone()))?;
        registry.register(Box::new(policy_evaluations.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(backend_failures.clone()))?;
        registry.register(Box::new(configured_routes.clone()))?;
        registry.register(Box::new(config_load_success.clone()))?;
        registry.register(Box::new(config_load_error.clone()))?;
        registry.register(Box::new(decision_duration.clone()))?;

        Ok(Self {
            registry,
            total_requests,
            over_limit_requests,
            within_limit_requests,
            policy_evaluations,
            store_operations,
            store_operation_duration,
            backend_failures,
            configured_routes,
            config_load_success,
            config_load_error,
            decision_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of a decision
    pub fn record_decision(&self, route: &str, allowed: bool) {
        self.total_requests.with_label_values(&[route]).inc();
        if allowed {
            self.within_limit_requests.with_label_values(&[route]).inc();
        } else {
            self.over_limit_requests.with_label_values(&[route]).inc();
        }
    }

    /// Record one policy evaluation; `kind` is `burst`, `quota` or `noop`
    pub fn record_policy_evaluation(&self, route: &str, kind: &str) {
        self.policy_evaluations.with_label_values(&[route, kind]).inc();
    }

    /// Record a store operation and its duration
    pub fn record_store_operation(&self, operation: &str, result: &str, duration_seconds: f64) {
        self.store_operations.with_label_values(&[operation, result]).inc();
        self.store_operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Record a store failure that fell back to fail-open values
    pub fn record_backend_failure(&self, operation: &str) {
        self.backend_failures.with_label_values(&[operation]).inc();
    }

    /// Set the number of routes with a dedicated policy list
    pub fn set_configured_routes(&self, count: usize) {
        self.configured_routes.set(count as i64);
    }

    /// Record successful configuration load
    pub fn record_config_load_success(&self) {
        self.config_load_success.inc();
    }

    /// Record failed configuration load
    pub fn record_config_load_error(&self) {
        self.config_load_error.inc();
    }

    /// Create a timer for measuring decision duration
    pub fn start_decision_timer(&self) -> prometheus::HistogramTimer {
        self.decision_duration.start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
