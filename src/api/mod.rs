//! HTTP decision service
//!
//! Lets a proxy that is not built on axum ask for admission decisions over
//! HTTP, report measured transfers, and force a tier reload.

use crate::engine::{bandwidth_dimension, AdmissionEngine, Decision, RequestDescriptor};
use crate::error::{GatewayError, Result};
use crate::metrics::{metrics_handler, MetricsService};
use crate::tiers::{TierLimits, TierName, UnmappedPolicy};
use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

/// Shared state of the decision service
#[derive(Clone)]
pub struct ApiState {
    engine: Arc<AdmissionEngine>,
}

impl ApiState {
    pub fn new(engine: Arc<AdmissionEngine>) -> Self {
        Self { engine }
    }
}

/// Request descriptor as sent over the wire
#[derive(Debug, Clone, Deserialize)]
pub struct CheckRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    /// Declared request size, e.g. the `Content-Length` of a `PUT`
    #[serde(default)]
    pub bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferRequest {
    pub identity: String,
    pub method: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferResponse {
    pub identity: String,
    pub dimension: &'static str,
    pub window_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadResponse {
    pub status: &'static str,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotResponse {
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    pub identities: usize,
    pub unmapped_policy: UnmappedPolicy,
    pub tiers: BTreeMap<TierName, TierLimits>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub config_version: u64,
    pub counter_entries: usize,
}

/// Build the decision service router
pub fn router(state: ApiState, metrics: MetricsService) -> Router {
    let api = Router::new()
        .route("/v1/admission/check", post(check))
        .route("/v1/admission/transfer", post(transfer))
        .route("/v1/admission/reload", post(reload))
        .route("/v1/admission/snapshot", get(snapshot))
        .route("/health", get(health))
        .with_state(state);

    let metrics = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    api.merge(metrics)
}

fn parse_method(method: &str) -> Result<Method> {
    Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| GatewayError::InvalidRequest(format!("Invalid HTTP method '{}'", method)))
}

fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| GatewayError::InvalidRequest(format!("Invalid header name '{}'", name)))?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            GatewayError::InvalidRequest(format!("Invalid value for header '{}'", name))
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

async fn check(
    State(state): State<ApiState>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<Decision>> {
    let method = parse_method(&request.method)?;
    let headers = header_map(&request.headers)?;
    let request_id = match request.request_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => id,
        None => crate::engine::request_id(&headers),
    };

    let decision = state.engine.evaluate(&RequestDescriptor {
        method: &method,
        path: &request.path,
        headers: &headers,
        query: request.query.as_deref(),
        request_id: &request_id,
        bytes: request.bytes,
    });

    Ok(Json(decision))
}

async fn transfer(
    State(state): State<ApiState>,
    Json(request): Json<TransferRequest>,
) -> Result<Json<TransferResponse>> {
    let method = parse_method(&request.method)?;
    let dimension = bandwidth_dimension(&method).ok_or_else(|| {
        GatewayError::InvalidRequest(format!("Method {} is not bandwidth limited", method))
    })?;

    let window_total = state
        .engine
        .record_transfer(&request.identity, &method, request.bytes)
        .unwrap_or(0);

    Ok(Json(TransferResponse {
        identity: request.identity,
        dimension: dimension.as_str(),
        window_total,
    }))
}

async fn reload(State(state): State<ApiState>) -> Result<Json<ReloadResponse>> {
    let store = state.engine.store().clone();
    let version = tokio::task::spawn_blocking(move || store.reload())
        .await
        .map_err(|e| GatewayError::Internal(format!("Reload task failed: {}", e)))??;

    info!(version, "Tier configuration reloaded on request");

    Ok(Json(ReloadResponse {
        status: "reloaded",
        version,
    }))
}

async fn snapshot(State(state): State<ApiState>) -> Json<SnapshotResponse> {
    let snapshot = state.engine.store().snapshot();
    let tiers = TierName::ALL
        .into_iter()
        .map(|tier| (tier, snapshot.limits(tier).clone()))
        .collect();

    Json(SnapshotResponse {
        version: snapshot.version,
        loaded_at: snapshot.loaded_at,
        identities: snapshot.identity_count(),
        unmapped_policy: snapshot.unmapped_policy(),
        tiers,
    })
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        config_version: state.engine.store().snapshot().version,
        counter_entries: state.engine.counters().len(),
    })
}
