//! Rejection payloads
//!
//! A denied request gets an S3-style `SlowDown` error. The payload carries
//! the resource, request id, identity and the limit that was crossed, never
//! the counter value itself.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};
use std::fmt;

/// S3 error code used for every rate rejection
pub const SLOW_DOWN: &str = "SlowDown";

/// Status returned with a rejection
pub const REJECTION_STATUS: StatusCode = StatusCode::TOO_MANY_REQUESTS;

/// Which dimension caused a denial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DenyReason {
    Minute,
    Second,
    Bandwidth,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Minute => "minute",
            DenyReason::Second => "second",
            DenyReason::Bandwidth => "bandwidth",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured rejection body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub code: String,
    pub message: String,
    pub resource: String,
    pub request_id: String,
    pub identity: String,
    pub reason: DenyReason,
    pub limit: u64,
}

/// Build the rejection body for a denial
pub fn format_rejection(
    reason: DenyReason,
    tier_message: &str,
    path: &str,
    request_id: &str,
    identity: &str,
    limit: u64,
) -> RejectionBody {
    let detail = match reason {
        DenyReason::Minute => format!(
            "Please reduce your request rate. Limit is {} requests per minute.",
            limit
        ),
        DenyReason::Second => format!(
            "Please reduce your request burst. Limit is {} requests per second.",
            limit
        ),
        DenyReason::Bandwidth => format!(
            "Please reduce your transfer volume. Limit is {} bytes per minute.",
            limit
        ),
    };

    let message = if tier_message.is_empty() {
        detail
    } else {
        format!("{}. {}", tier_message.trim_end_matches('.'), detail)
    };

    RejectionBody {
        code: SLOW_DOWN.to_string(),
        message,
        resource: path.to_string(),
        request_id: request_id.to_string(),
        identity: identity.to_string(),
        reason,
        limit,
    }
}

impl RejectionBody {
    /// Render as an S3 `<Error>` document
    pub fn to_xml(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error><Code>{}</Code><Message>{}</Message><Resource>{}</Resource><RequestId>{}</RequestId><Identity>{}</Identity><Reason>{}</Reason><Limit>{}</Limit></Error>",
            escape(&self.code),
            escape(&self.message),
            escape(&self.resource),
            escape(&self.request_id),
            escape(&self.identity),
            self.reason,
            self.limit,
        )
    }
}

impl IntoResponse for RejectionBody {
    fn into_response(self) -> Response {
        let mut response = (REJECTION_STATUS, self.to_xml()).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml"),
        );
        if let Ok(request_id) = HeaderValue::from_str(&self.request_id) {
            headers.insert("x-amz-request-id", request_id);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_rejection_fields() {
        let body = format_rejection(
            DenyReason::Minute,
            "Default tier limit reached",
            "/bucket/key.txt",
            "req-1",
            "AKIA-UNKNOWN",
            50,
        );

        assert_eq!(body.code, "SlowDown");
        assert_eq!(body.resource, "/bucket/key.txt");
        assert_eq!(body.request_id, "req-1");
        assert_eq!(body.identity, "AKIA-UNKNOWN");
        assert_eq!(body.reason, DenyReason::Minute);
        assert_eq!(body.limit, 50);
        assert_eq!(
            body.message,
            "Default tier limit reached. Please reduce your request rate. Limit is 50 requests per minute."
        );
    }

    #[test]
    fn test_wording_differs_by_reason() {
        let minute = format_rejection(DenyReason::Minute, "", "/", "r", "i", 10);
        let second = format_rejection(DenyReason::Second, "", "/", "r", "i", 10);
        let bandwidth = format_rejection(DenyReason::Bandwidth, "", "/", "r", "i", 10);

        assert!(minute.message.contains("per minute"));
        assert!(second.message.contains("per second"));
        assert!(bandwidth.message.contains("bytes per minute"));
        assert_ne!(minute.message, second.message);
    }

    #[test]
    fn test_format_is_deterministic() {
        let a = format_rejection(DenyReason::Second, "Premium", "/b/k", "r", "AKIA", 50);
        let b = format_rejection(DenyReason::Second, "Premium", "/b/k", "r", "AKIA", 50);
        assert_eq!(a, b);
    }

    #[test]
    fn test_xml_rendering_escapes() {
        let body = format_rejection(DenyReason::Bandwidth, "A & B", "/b/<k>", "r\"1", "id'", 1);
        let xml = body.to_xml();

        assert!(xml.contains("<Code>SlowDown</Code>"));
        assert!(xml.contains("<Resource>/b/&lt;k&gt;</Resource>"));
        assert!(xml.contains("<RequestId>r&quot;1</RequestId>"));
        assert!(xml.contains("<Identity>id&apos;</Identity>"));
        assert!(xml.contains("A &amp; B"));
        assert!(xml.contains("<Reason>bandwidth</Reason>"));
    }

    #[test]
    fn test_into_response() {
        let body = format_rejection(DenyReason::Minute, "", "/b", "req-9", "AKIA", 5);
        let response = body.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/xml"
        );
        assert_eq!(response.headers().get("x-amz-request-id").unwrap(), "req-9");
    }

    #[test]
    fn test_json_shape() {
        let body = format_rejection(DenyReason::Second, "", "/b", "r", "AKIA", 50);
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["code"], "SlowDown");
        assert_eq!(json["reason"], "second");
        assert_eq!(json["limit"], 50);
    }
}
