use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use policy_ratelimit::{
    config::{Repository, Settings},
    error::LoggingErrorHandler,
    key::KeyBuilder,
    limiter::Limiter,
    metrics::Metrics,
    redis::RedisStore,
    server::{serve, AppState},
    store::{InMemoryStore, RateLimitStore},
    utils::RateLimitUtils,
    RateAggregator,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "policy_ratelimit=debug,ratelimit_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Policy Rate Limit Service");

    let metrics = Arc::new(Metrics::new()?);
    let settings = match load_settings() {
        Ok(settings) => {
            metrics.record_config_load_success();
            settings
        }
        Err(e) => {
            metrics.record_config_load_error();
            return Err(e);
        }
    };

    let state = create_state(&settings, metrics).await?;
    let http_addr = settings.server.http_addr;
    let http_server = serve(state, http_addr);

    // Wait for shutdown signal
    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Service stopped");
    Ok(())
}

fn load_settings() -> Result<Settings> {
    let settings = match std::env::var("CONFIG_PATH") {
        Ok(path) => {
            info!("Loading configuration from: {}", path);
            Settings::load(&path)?
        }
        Err(_) => {
            warn!("CONFIG_PATH not set, running without policies");
            Settings::from_env()?
        }
    };
    Ok(settings)
}

async fn create_state(settings: &Settings, metrics: Arc<Metrics>) -> Result<AppState> {
    // Compile policies before touching the store so a bad file fails fast
    let policies = settings.policy_store()?;
    let routes = Arc::new(settings.route_table());

    let store: Arc<dyn RateLimitStore> = match settings.repository {
        Repository::Redis => Arc::new(RedisStore::new(settings.redis.clone()).await?),
        Repository::InMemory => {
            warn!("Using the in-memory repository; limits are not shared between instances");
            Arc::new(InMemoryStore::new())
        }
    };

    let limiter = Limiter::new(store)
        .with_error_handler(Arc::new(LoggingErrorHandler))
        .with_timeout(settings.store_timeout())
        .with_metrics(metrics.clone());
    let key_builder = KeyBuilder::new(
        settings.key_prefix.clone(),
        RateLimitUtils::new(settings.behind_proxy),
    );
    let aggregator = RateAggregator::new(policies, key_builder, limiter).with_metrics(metrics.clone());

    info!(
        routes = routes.len(),
        route_policies = aggregator.policies().route_count(),
        default_policies = aggregator.policies().default_policies().len(),
        "Configuration loaded successfully"
    );

    Ok(AppState {
        aggregator: Arc::new(aggregator),
        routes,
        metrics,
    })
}
