use crate::engine::{content_length, request_id, AdmissionEngine, Decision, RequestDescriptor};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

/// Admission middleware state
#[derive(Clone)]
pub struct AdmissionState {
    engine: Arc<AdmissionEngine>,
    expose_headers: bool,
}

impl AdmissionState {
    pub fn new(engine: Arc<AdmissionEngine>, expose_headers: bool) -> Self {
        Self {
            engine,
            expose_headers,
        }
    }

    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }
}

/// Axum middleware that admits or rejects S3 requests.
///
/// Install with `axum::middleware::from_fn_with_state(state, admission_middleware)`.
/// Denials are answered here with an S3 `SlowDown` error; admitted requests
/// go to the inner service, and the `Content-Length` of a `GET` response is
/// billed as bytes out.
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let id = request_id(request.headers());
    let declared = if method == Method::PUT {
        content_length(request.headers()).unwrap_or(0)
    } else {
        0
    };

    let decision = state.engine.evaluate(&RequestDescriptor {
        method: &method,
        path: request.uri().path(),
        headers: request.headers(),
        query: request.uri().query(),
        request_id: &id,
        bytes: declared,
    });

    if let Some(rejection) = decision.rejection() {
        return rejection.clone().into_response();
    }

    let mut response = next.run(request).await;

    if decision.is_limited() && method == Method::GET {
        if let Some(bytes) = content_length(response.headers()) {
            state.engine.record_transfer(&decision.identity, &method, bytes);
        }
    }

    if state.expose_headers && decision.is_limited() {
        add_limit_headers(response.headers_mut(), &decision);
    }

    response
}

/// Informational headers for an admitted request
pub fn add_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    let limits = &decision.limits;

    headers.insert(
        "X-RateLimit-Group",
        HeaderValue::from_static(decision.tier.as_str()),
    );
    headers.insert(
        "X-RateLimit-Limit-Per-Minute",
        HeaderValue::from(limits.requests_per_minute),
    );
    headers.insert(
        "X-RateLimit-Limit-Per-Second",
        HeaderValue::from(limits.requests_per_second),
    );
    headers.insert(
        "X-Bandwidth-Limit-Upload",
        HeaderValue::from(limits.bytes_in_per_minute),
    );
    headers.insert(
        "X-Bandwidth-Limit-Download",
        HeaderValue::from(limits.bytes_out_per_minute),
    );
    if let Some(usage) = decision.usage {
        headers.insert(
            "X-RateLimit-Current-Per-Minute",
            HeaderValue::from(usage.per_minute),
        );
        headers.insert(
            "X-RateLimit-Current-Per-Second",
            HeaderValue::from(usage.per_second),
        );
    }
    headers.insert(
        "X-Auth-Method",
        HeaderValue::from_static(decision.auth_method.as_str()),
    );

    debug!(tier = %decision.tier, "Added limit headers");
}
