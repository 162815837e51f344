use crate::error::{GatewayError, Result};
use crate::response::DenyReason;
use crate::tiers::TierName;
use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::IntoResponse,
};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the global Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            GatewayError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// A renderer that is not installed as the global recorder.
    ///
    /// Used when a recorder is already installed, e.g. several routers in one
    /// test binary. It renders an empty registry.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: Arc::new(recorder.handle()),
        }
    }

    fn register_metrics() {
        describe_counter!(
            "s3gate_admissions_total",
            "Requests admitted, by tier and method"
        );
        describe_counter!(
            "s3gate_rejections_total",
            "Requests rejected, by tier and violated dimension"
        );
        describe_counter!(
            "s3gate_config_reloads_total",
            "Tier configuration reload attempts, by outcome"
        );
        describe_gauge!(
            "s3gate_config_version",
            "Version of the tier configuration snapshot in use"
        );
        describe_counter!(
            "s3gate_counter_evictions_total",
            "Rate counter entries evicted by the sweeper or the capacity cap"
        );
        describe_gauge!("s3gate_counter_entries", "Live rate counter entries");

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.render(),
    )
}

fn method_label(method: &Method) -> &'static str {
    if method == Method::GET {
        "GET"
    } else if method == Method::PUT {
        "PUT"
    } else {
        "other"
    }
}

/// Record an admitted request
pub fn record_admission(tier: TierName, method: &Method) {
    let labels = [
        ("tier", tier.as_str().to_string()),
        ("method", method_label(method).to_string()),
    ];
    counter!("s3gate_admissions_total", &labels).increment(1);
}

/// Record a rejected request
pub fn record_rejection(tier: TierName, reason: DenyReason) {
    let labels = [
        ("tier", tier.as_str().to_string()),
        ("reason", reason.as_str().to_string()),
    ];
    counter!("s3gate_rejections_total", &labels).increment(1);
}

/// Record a reload attempt and the version now in use
pub fn record_config_reload(success: bool, version: u64) {
    let labels = [(
        "outcome",
        if success { "success" } else { "rejected" }.to_string(),
    )];
    counter!("s3gate_config_reloads_total", &labels).increment(1);
    gauge!("s3gate_config_version").set(version as f64);
}

/// Record the result of a counter sweep
pub fn record_counter_sweep(evicted: usize, entries: usize) {
    counter!("s3gate_counter_evictions_total").increment(evicted as u64);
    gauge!("s3gate_counter_entries").set(entries as f64);
}
