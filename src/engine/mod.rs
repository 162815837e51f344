//! Admission decisions
//!
//! The engine ties credential extraction, tier resolution and the rate
//! counters together. Every request goes through the same sequence:
//!
//! 1. Methods other than `PUT` and `GET` are admitted without counting.
//! 2. The anonymous caller is admitted unless its tier lists it in
//!    `limit_anonymous`.
//! 3. Unmapped identities are admitted when the policy is `exempt`.
//! 4. Requests per minute, then requests per second, then bytes
//!    (`PUT` counts bytes in, `GET` bytes out) are observed in that order.
//!    The first dimension whose window total is strictly greater than the
//!    limit decides the denial.
//!
//! The snapshot is loaded once per request, so the tier and the limits
//! always come from the same configuration generation.

use crate::clock::Clock;
use crate::counters::{Dimension, RateCounters};
use crate::credentials::{AuthMethod, CredentialExtractor};
use crate::metrics;
use crate::response::{format_rejection, RejectionBody};
use crate::tiers::{TierLimits, TierName, TierSource, TierStore, UnmappedPolicy};
use axum::http::{header, HeaderMap, Method};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

pub use crate::response::DenyReason;

/// Everything the engine needs to know about one request
#[derive(Debug, Clone, Copy)]
pub struct RequestDescriptor<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub query: Option<&'a str>,
    pub request_id: &'a str,
    /// Bytes declared up front, usually the `Content-Length` of a `PUT`
    pub bytes: u64,
}

/// Why a request was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmitBasis {
    /// Method is not rate limited
    Unlimited,
    /// Anonymous caller on a tier that does not limit it
    Anonymous,
    /// Unmapped identity under the `exempt` policy
    Exempt,
    /// Every dimension is at or below its limit
    WithinLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Verdict {
    Admit { basis: AdmitBasis },
    Deny { rejection: RejectionBody },
}

/// Request totals of the current windows after an admitted request was counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub per_minute: u64,
    pub per_second: u64,
}

/// Outcome of evaluating one request
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub identity: String,
    pub auth_method: AuthMethod,
    pub tier: TierName,
    pub tier_source: TierSource,
    pub config_version: u64,
    pub limits: TierLimits,
    /// Present only when an admitted request went through the counters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub verdict: Verdict,
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self.verdict, Verdict::Admit { .. })
    }

    /// True when the request went through the counters
    pub fn is_limited(&self) -> bool {
        match &self.verdict {
            Verdict::Admit { basis } => *basis == AdmitBasis::WithinLimits,
            Verdict::Deny { .. } => true,
        }
    }

    pub fn rejection(&self) -> Option<&RejectionBody> {
        match &self.verdict {
            Verdict::Deny { rejection } => Some(rejection),
            Verdict::Admit { .. } => None,
        }
    }
}

/// Byte dimension billed for a rate limited method, `None` for the rest
pub fn bandwidth_dimension(method: &Method) -> Option<Dimension> {
    if method == Method::PUT {
        Some(Dimension::BytesIn)
    } else if method == Method::GET {
        Some(Dimension::BytesOut)
    } else {
        None
    }
}

/// Request id from `x-amz-request-id` or `x-request-id`, generated when absent
pub fn request_id(headers: &HeaderMap) -> String {
    ["x-amz-request-id", "x-request-id"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Parsed `Content-Length`, if present and valid
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// The admission decision core
pub struct AdmissionEngine {
    extractor: CredentialExtractor,
    store: Arc<TierStore>,
    counters: Arc<RateCounters>,
    clock: Arc<dyn Clock>,
}

impl AdmissionEngine {
    pub fn new(
        extractor: CredentialExtractor,
        store: Arc<TierStore>,
        counters: Arc<RateCounters>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            extractor,
            store,
            counters,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<TierStore> {
        &self.store
    }

    pub fn counters(&self) -> &Arc<RateCounters> {
        &self.counters
    }

    /// Decide whether a request is admitted
    pub fn evaluate(&self, request: &RequestDescriptor<'_>) -> Decision {
        let credential = self.extractor.extract(request.headers, request.query);
        let snapshot = self.store.snapshot();
        let resolution = snapshot.resolve(&credential.identity);
        let limits = resolution.limits;

        let mut usage = None;
        let verdict = match bandwidth_dimension(request.method) {
            None => Verdict::Admit {
                basis: AdmitBasis::Unlimited,
            },
            Some(_) if credential.is_anonymous() && !limits.limit_anonymous => Verdict::Admit {
                basis: AdmitBasis::Anonymous,
            },
            Some(_)
                if !credential.is_anonymous()
                    && resolution.source == TierSource::Fallback
                    && snapshot.unmapped_policy() == UnmappedPolicy::Exempt =>
            {
                Verdict::Admit {
                    basis: AdmitBasis::Exempt,
                }
            }
            Some(bytes_dimension) => {
                match self.check_limits(&credential.identity, limits, bytes_dimension, request.bytes) {
                    Ok(observed) => {
                        usage = Some(observed);
                        Verdict::Admit {
                            basis: AdmitBasis::WithinLimits,
                        }
                    }
                    Err((reason, limit)) => Verdict::Deny {
                        rejection: format_rejection(
                            reason,
                            &limits.message,
                            request.path,
                            request.request_id,
                            &credential.identity,
                            limit,
                        ),
                    },
                }
            }
        };

        match &verdict {
            Verdict::Admit { basis } => {
                metrics::record_admission(resolution.tier, request.method);
                debug!(
                    identity = %credential.identity,
                    tier = %resolution.tier,
                    basis = ?basis,
                    method = %request.method,
                    "Request admitted"
                );
            }
            Verdict::Deny { rejection } => {
                metrics::record_rejection(resolution.tier, rejection.reason);
                warn!(
                    identity = %credential.identity,
                    tier = %resolution.tier,
                    reason = %rejection.reason,
                    limit = rejection.limit,
                    request_id = %request.request_id,
                    "Request rejected"
                );
            }
        }

        Decision {
            identity: credential.identity,
            auth_method: credential.method,
            tier: resolution.tier,
            tier_source: resolution.source,
            config_version: snapshot.version,
            limits: limits.clone(),
            usage,
            verdict,
        }
    }

    /// Observe every dimension in priority order. The first violated one is
    /// returned with the limit it crossed.
    fn check_limits(
        &self,
        identity: &str,
        limits: &TierLimits,
        bytes_dimension: Dimension,
        bytes: u64,
    ) -> Result<Usage, (DenyReason, u64)> {
        let now = self.clock.now();

        let per_minute = self.counters.observe(identity, Dimension::ReqPerMinute, 1, now);
        if per_minute > u64::from(limits.requests_per_minute) {
            return Err((DenyReason::Minute, u64::from(limits.requests_per_minute)));
        }

        let per_second = self.counters.observe(identity, Dimension::ReqPerSecond, 1, now);
        if per_second > u64::from(limits.requests_per_second) {
            return Err((DenyReason::Second, u64::from(limits.requests_per_second)));
        }

        let byte_limit = match bytes_dimension {
            Dimension::BytesIn => limits.bytes_in_per_minute,
            _ => limits.bytes_out_per_minute,
        };
        let transferred = self.counters.observe(identity, bytes_dimension, bytes, now);
        if transferred > byte_limit {
            return Err((DenyReason::Bandwidth, byte_limit));
        }

        Ok(Usage {
            per_minute,
            per_second,
        })
    }

    /// Add bytes measured after admission to the identity's byte window.
    ///
    /// Returns the new window total, or `None` for methods that are not
    /// rate limited.
    pub fn record_transfer(&self, identity: &str, method: &Method, bytes: u64) -> Option<u64> {
        let dimension = bandwidth_dimension(method)?;
        let total = self
            .counters
            .observe(identity, dimension, bytes, self.clock.now());
        debug!(identity, dimension = %dimension, bytes, total, "Transfer recorded");
        Some(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::tiers::{parse_identity_map, LimitsFile};
    use axum::http::HeaderValue;
    use std::time::Duration;

    const MAPPING: &str = "AKIA-PREMIUM-1 premium\nAKIA-BASIC-1 basic\n";

    const LIMITS: &str = r#"
requests_per_minute: { premium: 1000, standard: 500, basic: 100, default: 50 }
requests_per_second: { premium: 50, standard: 25, basic: 10, default: 5 }
bytes_in_per_minute: { premium: 1000000, default: 1000 }
bytes_out_per_minute: { premium: 2000000, default: 2000 }
messages: { default: "Rate limit exceeded" }
"#;

    struct Harness {
        engine: AdmissionEngine,
        clock: ManualClock,
    }

    fn harness(limits: &str) -> Harness {
        let store = Arc::new(TierStore::in_memory(Some("test-".to_string())));
        store.publish(
            parse_identity_map(MAPPING, "mem").unwrap(),
            LimitsFile::from_yaml(limits).unwrap(),
        );
        let clock = ManualClock::default();
        let engine = AdmissionEngine::new(
            CredentialExtractor::default(),
            store,
            Arc::new(RateCounters::default()),
            Arc::new(clock.clone()),
        );
        Harness { engine, clock }
    }

    fn sigv4(identity: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let value = format!(
            "AWS4-HMAC-SHA256 Credential={}/20240101/us-east-1/s3/aws4_request, SignedHeaders=host, Signature=abc",
            identity
        );
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        headers
    }

    fn evaluate(engine: &AdmissionEngine, method: &Method, headers: &HeaderMap, bytes: u64) -> Decision {
        engine.evaluate(&RequestDescriptor {
            method,
            path: "/bucket/object",
            headers,
            query: None,
            request_id: "req-1",
            bytes,
        })
    }

    fn deny_reason(decision: &Decision) -> Option<DenyReason> {
        decision.rejection().map(|r| r.reason)
    }

    #[test]
    fn test_premium_burst_denied_on_51st_get() {
        let h = harness(LIMITS);
        let headers = sigv4("AKIA-PREMIUM-1");

        for i in 1..=50 {
            let decision = evaluate(&h.engine, &Method::GET, &headers, 0);
            assert!(decision.is_admitted(), "request {i} should be admitted");
            assert_eq!(decision.tier, TierName::Premium);
        }

        let decision = evaluate(&h.engine, &Method::GET, &headers, 0);
        assert_eq!(deny_reason(&decision), Some(DenyReason::Second));
        assert_eq!(decision.rejection().unwrap().limit, 50);
    }

    #[test]
    fn test_unknown_identity_denied_on_51st_put_per_minute() {
        let h = harness(LIMITS);
        let headers = sigv4("AKIA-UNKNOWN");

        for i in 1..=50 {
            let decision = evaluate(&h.engine, &Method::PUT, &headers, 0);
            assert!(decision.is_admitted(), "request {i} should be admitted");
            assert_eq!(decision.tier, TierName::Default);
            // Four requests per second stays under the burst limit
            h.clock.advance(Duration::from_millis(250));
        }

        let decision = evaluate(&h.engine, &Method::PUT, &headers, 0);
        let rejection = decision.rejection().unwrap();
        assert_eq!(rejection.reason, DenyReason::Minute);
        assert_eq!(rejection.code, "SlowDown");
        assert_eq!(rejection.identity, "AKIA-UNKNOWN");
        assert_eq!(rejection.resource, "/bucket/object");
        assert_eq!(rejection.limit, 50);
    }

    #[test]
    fn test_admitted_decision_reports_usage() {
        let h = harness(LIMITS);
        let headers = sigv4("AKIA-BASIC-1");

        let first = evaluate(&h.engine, &Method::GET, &headers, 0);
        assert_eq!(first.usage, Some(Usage { per_minute: 1, per_second: 1 }));

        h.clock.advance(Duration::from_secs(1));
        let second = evaluate(&h.engine, &Method::GET, &headers, 0);
        assert_eq!(second.usage, Some(Usage { per_minute: 2, per_second: 1 }));

        let unlimited = evaluate(&h.engine, &Method::DELETE, &headers, 0);
        assert_eq!(unlimited.usage, None);
    }

    #[test]
    fn test_minute_window_reopens() {
        let h = harness(LIMITS);
        let headers = sigv4("AKIA-UNKNOWN");

        for _ in 0..50 {
            evaluate(&h.engine, &Method::PUT, &headers, 0);
            h.clock.advance(Duration::from_millis(250));
        }
        assert!(!evaluate(&h.engine, &Method::PUT, &headers, 0).is_admitted());

        h.clock.advance(Duration::from_secs(60));
        assert!(evaluate(&h.engine, &Method::PUT, &headers, 0).is_admitted());
    }

    #[test]
    fn test_anonymous_always_admitted_by_default() {
        let h = harness(LIMITS);
        let headers = HeaderMap::new();

        for _ in 0..500 {
            let decision = evaluate(&h.engine, &Method::GET, &headers, 0);
            assert!(decision.is_admitted());
            assert_eq!(decision.identity, "anonymous");
            assert_eq!(decision.auth_method, AuthMethod::None);
            assert_eq!(decision.verdict, Verdict::Admit { basis: AdmitBasis::Anonymous });
        }
        assert!(h.engine.counters().is_empty());
    }

    #[test]
    fn test_claimed_anonymous_key_is_not_limited() {
        let h = harness(LIMITS);
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("anonymous"));

        for _ in 0..20 {
            let decision = evaluate(&h.engine, &Method::GET, &headers, 0);
            assert_eq!(decision.verdict, Verdict::Admit { basis: AdmitBasis::Anonymous });
            assert_eq!(decision.auth_method, AuthMethod::None);
        }
        assert!(h.engine.counters().is_empty());
    }

    #[test]
    fn test_anonymous_limited_when_configured() {
        let limits = format!("{}limit_anonymous: [default]\n", LIMITS);
        let h = harness(&limits);
        let headers = HeaderMap::new();

        for _ in 0..5 {
            assert!(evaluate(&h.engine, &Method::GET, &headers, 0).is_admitted());
        }
        let decision = evaluate(&h.engine, &Method::GET, &headers, 0);
        assert_eq!(deny_reason(&decision), Some(DenyReason::Second));
    }

    #[test]
    fn test_unlimited_methods_skip_counters() {
        let h = harness(LIMITS);
        let headers = sigv4("AKIA-UNKNOWN");

        for method in [Method::DELETE, Method::HEAD, Method::POST, Method::OPTIONS] {
            for _ in 0..100 {
                let decision = evaluate(&h.engine, &method, &headers, 0);
                assert_eq!(decision.verdict, Verdict::Admit { basis: AdmitBasis::Unlimited });
            }
        }
        assert!(h.engine.counters().is_empty());
    }

    #[test]
    fn test_exact_limit_is_admitted() {
        let h = harness(LIMITS);
        let headers = sigv4("AKIA-UNKNOWN");

        // 1000 bytes in against a 1000 byte ceiling
        assert!(evaluate(&h.engine, &Method::PUT, &headers, 1000).is_admitted());
        h.clock.advance(Duration::from_secs(1));
        let decision = evaluate(&h.engine, &Method::PUT, &headers, 1);
        assert_eq!(deny_reason(&decision), Some(DenyReason::Bandwidth));
        assert_eq!(decision.rejection().unwrap().limit, 1000);
    }

    #[test]
    fn test_minute_reported_before_second() {
        let limits = "requests_per_minute: { default: 2 }\nrequests_per_second: { default: 2 }\n";
        let h = harness(limits);
        let headers = sigv4("AKIA-UNKNOWN");

        evaluate(&h.engine, &Method::GET, &headers, 0);
        evaluate(&h.engine, &Method::GET, &headers, 0);
        let decision = evaluate(&h.engine, &Method::GET, &headers, 0);
        assert_eq!(deny_reason(&decision), Some(DenyReason::Minute));
    }

    #[test]
    fn test_get_denied_after_reported_downloads() {
        let h = harness(LIMITS);
        let headers = sigv4("AKIA-UNKNOWN");

        assert!(evaluate(&h.engine, &Method::GET, &headers, 0).is_admitted());
        assert_eq!(h.engine.record_transfer("AKIA-UNKNOWN", &Method::GET, 2500), Some(2500));
        h.clock.advance(Duration::from_secs(1));

        let decision = evaluate(&h.engine, &Method::GET, &headers, 0);
        assert_eq!(deny_reason(&decision), Some(DenyReason::Bandwidth));
        assert_eq!(decision.rejection().unwrap().limit, 2000);
    }

    #[test]
    fn test_record_transfer_dimensions() {
        let h = harness(LIMITS);
        let counters = h.engine.counters().clone();
        let now = Clock::now(&h.clock);

        h.engine.record_transfer("id", &Method::PUT, 10);
        h.engine.record_transfer("id", &Method::GET, 20);
        assert_eq!(h.engine.record_transfer("id", &Method::DELETE, 30), None);

        assert_eq!(counters.current("id", Dimension::BytesIn, now), 10);
        assert_eq!(counters.current("id", Dimension::BytesOut, now), 20);
    }

    #[test]
    fn test_exempt_policy_admits_unmapped_only() {
        let limits = format!("{}unmapped_policy: exempt\n", LIMITS);
        let h = harness(&limits);

        let unknown = sigv4("AKIA-UNKNOWN");
        for _ in 0..100 {
            let decision = evaluate(&h.engine, &Method::PUT, &unknown, 0);
            assert_eq!(decision.verdict, Verdict::Admit { basis: AdmitBasis::Exempt });
        }

        // Test-prefix identities resolve to basic and stay limited
        let test_key = sigv4("test-user");
        for _ in 0..10 {
            assert!(evaluate(&h.engine, &Method::PUT, &test_key, 0).is_admitted());
        }
        let decision = evaluate(&h.engine, &Method::PUT, &test_key, 0);
        assert_eq!(decision.tier, TierName::Basic);
        assert_eq!(deny_reason(&decision), Some(DenyReason::Second));
    }

    #[test]
    fn test_decision_uses_published_generation() {
        let h = harness(LIMITS);
        let headers = sigv4("AKIA-BASIC-1");
        let first = evaluate(&h.engine, &Method::GET, &headers, 0);
        assert_eq!(first.tier, TierName::Basic);

        h.engine.store().publish(
            parse_identity_map("AKIA-BASIC-1 premium\n", "mem").unwrap(),
            LimitsFile::from_yaml(LIMITS).unwrap(),
        );
        let second = evaluate(&h.engine, &Method::GET, &headers, 0);
        assert_eq!(second.tier, TierName::Premium);
        assert_eq!(second.limits.requests_per_minute, 1000);
        assert!(second.config_version > first.config_version);
    }

    #[test]
    fn test_request_id_fallbacks() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id(&headers).len(), 36);

        headers.insert("x-request-id", HeaderValue::from_static("plain"));
        assert_eq!(request_id(&headers), "plain");

        headers.insert("x-amz-request-id", HeaderValue::from_static("amz"));
        assert_eq!(request_id(&headers), "amz");
    }

    #[test]
    fn test_content_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("512"));
        assert_eq!(content_length(&headers), Some(512));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("nope"));
        assert_eq!(content_length(&headers), None);
    }

    #[test]
    fn test_decision_json() {
        let h = harness(LIMITS);
        let decision = evaluate(&h.engine, &Method::GET, &sigv4("AKIA-PREMIUM-1"), 0);
        let json = serde_json::to_value(&decision).unwrap();

        assert_eq!(json["outcome"], "admit");
        assert_eq!(json["basis"], "within_limits");
        assert_eq!(json["tier"], "premium");
        assert_eq!(json["auth_method"], "sigv4");
        assert_eq!(json["tier_source"], "mapped");
    }
}
