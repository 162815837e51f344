pub mod api;
pub mod clock;
pub mod config;
pub mod counters;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod hotreload;
pub mod metrics;
pub mod middleware;
pub mod response;
pub mod tiers;

use crate::api::ApiState;
use crate::clock::{Clock, SystemClock};
use crate::config::{GatewayConfig, LogFormat};
use crate::counters::{spawn_sweeper, RateCounters};
use crate::credentials::CredentialExtractor;
use crate::engine::AdmissionEngine;
use crate::error::{GatewayError, Result};
use crate::hotreload::{watch_tier_sources, ReloadHandle};
use crate::metrics::MetricsService;
use crate::tiers::TierStore;
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Running admission core: the engine plus its background tasks
pub struct Gateway {
    pub engine: Arc<AdmissionEngine>,
    pub reload: Option<ReloadHandle>,
}

/// Build the engine from configuration and start the watcher and the sweeper.
///
/// A tier source that fails to load leaves the built-in snapshot in place;
/// the watcher keeps looking for a valid one.
pub fn build_gateway(config: &GatewayConfig) -> Result<Gateway> {
    config.validate()?;

    let store = Arc::new(TierStore::new(
        config.tiers.sources(),
        config.tiers.test_prefix(),
    ));
    match store.reload() {
        Ok(version) => info!(version, "Tier configuration loaded"),
        Err(e) => warn!(error = %e, "Starting with built-in tier limits"),
    }

    let counters = Arc::new(RateCounters::new(config.counters.settings()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    spawn_sweeper(counters.clone(), clock.clone(), config.counters.sweep_interval());

    let reload = if config.hot_reload.enabled {
        match watch_tier_sources(store.clone(), &config.hot_reload) {
            Ok((handle, _task)) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Hot reload disabled");
                None
            }
        }
    } else {
        None
    };

    let engine = Arc::new(AdmissionEngine::new(
        CredentialExtractor::new(&config.credentials.fallback_headers),
        store,
        counters,
        clock,
    ));

    Ok(Gateway { engine, reload })
}

/// Initialize the decision service and serve until `shutdown` resolves
pub async fn init_gateway(
    config: GatewayConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<Gateway> {
    info!("Starting s3gate");

    let gateway = build_gateway(&config)?;
    let metrics = MetricsService::new()?;

    if let Some(handle) = gateway.reload.clone() {
        reload_on_hangup(handle);
    }

    let app = api::router(ApiState::new(gateway.engine.clone()), metrics)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(GatewayError::Io)?;

    info!(address = %addr, "Decision service ready to accept connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    Ok(gateway)
}

/// Queue a tier reload on every SIGHUP
#[cfg(unix)]
fn reload_on_hangup(handle: ReloadHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGHUP");
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading tier configuration");
            if !handle.trigger() {
                break;
            }
        }
    });
}

#[cfg(not(unix))]
fn reload_on_hangup(_handle: ReloadHandle) {}

/// Initialize tracing/logging
pub fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "s3gate=info,tower_http=info".into());

    match format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
    }
}
