//! Caller identity extraction
//!
//! Turns the authentication material of an S3 request into an identity
//! string. Only syntactic extraction happens here; signatures are verified
//! by the storage backend. Matchers run in priority order and the first one
//! that yields an identity wins:
//!
//! 1. SigV4 `Authorization` header (`Credential=<key>/...`)
//! 2. SigV2 `Authorization` header (`AWS <key>:<signature>`)
//! 3. SigV4 pre-signed query (`X-Amz-Credential=<key>/...`)
//! 4. SigV2 pre-signed query (`AWSAccessKeyId=<key>`)
//! 5. Fallback headers such as `X-Api-Key`
//!
//! Anything malformed or missing degrades to [`ANONYMOUS`].

pub mod matchers;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{trace, warn};

pub use matchers::{
    FallbackHeader, PresignedV2Query, PresignedV4Query, SigV2Header, SigV4Header,
};

/// Identity assigned when no credential can be extracted
pub const ANONYMOUS: &str = "anonymous";

/// How the identity was presented by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMethod {
    #[serde(rename = "sigv4")]
    SigV4,
    #[serde(rename = "sigv2")]
    SigV2,
    #[serde(rename = "presigned-v4")]
    PresignedV4,
    #[serde(rename = "presigned-v2")]
    PresignedV2,
    #[serde(rename = "api-key")]
    ApiKey,
    #[serde(rename = "none")]
    None,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::SigV4 => "sigv4",
            AuthMethod::SigV2 => "sigv2",
            AuthMethod::PresignedV4 => "presigned-v4",
            AuthMethod::PresignedV2 => "presigned-v2",
            AuthMethod::ApiKey => "api-key",
            AuthMethod::None => "none",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extracted caller identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub identity: String,
    pub method: AuthMethod,
}

impl Credential {
    pub fn new(identity: impl Into<String>, method: AuthMethod) -> Self {
        Self {
            identity: identity.into(),
            method,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS, AuthMethod::None)
    }

    pub fn is_anonymous(&self) -> bool {
        self.method == AuthMethod::None
    }
}

/// Authentication material of one request
#[derive(Debug, Clone, Copy)]
pub struct RequestAuth<'a> {
    pub headers: &'a HeaderMap,
    pub query: Option<&'a str>,
}

/// One way of finding a credential in a request
pub trait CredentialMatcher: Send + Sync {
    /// The auth method reported when this matcher succeeds
    fn method(&self) -> AuthMethod;

    /// Return the claimed identity, or `None` if this scheme is absent or malformed
    fn try_extract(&self, auth: &RequestAuth<'_>) -> Option<String>;
}

/// Ordered list of matchers, first match wins
pub struct CredentialExtractor {
    matchers: Vec<Box<dyn CredentialMatcher>>,
}

impl CredentialExtractor {
    /// Standard S3 matchers followed by one matcher per fallback header
    pub fn new(fallback_headers: &[String]) -> Self {
        let mut matchers: Vec<Box<dyn CredentialMatcher>> = vec![
            Box::new(SigV4Header),
            Box::new(SigV2Header),
            Box::new(PresignedV4Query),
            Box::new(PresignedV2Query),
        ];

        for name in fallback_headers {
            match FallbackHeader::new(name) {
                Some(matcher) => matchers.push(Box::new(matcher)),
                None => warn!(header = %name, "Ignoring invalid fallback header name"),
            }
        }

        Self { matchers }
    }

    /// Build an extractor from an explicit matcher list
    pub fn with_matchers(matchers: Vec<Box<dyn CredentialMatcher>>) -> Self {
        Self { matchers }
    }

    /// Extract the caller identity, degrading to anonymous
    pub fn extract(&self, headers: &HeaderMap, query: Option<&str>) -> Credential {
        let auth = RequestAuth { headers, query };

        for matcher in &self.matchers {
            if let Some(identity) = matcher.try_extract(&auth) {
                trace!(method = %matcher.method(), identity = %identity, "Credential extracted");
                return Credential::new(identity, matcher.method());
            }
        }

        Credential::anonymous()
    }
}

impl Default for CredentialExtractor {
    fn default() -> Self {
        Self::new(&["X-Api-Key".to_string()])
    }
}

/// An identity must be usable as a single token in the identity map.
/// A claimed [`ANONYMOUS`] is no identity at all.
pub(crate) fn clean_identity(raw: &str) -> Option<String> {
    let identity = raw.trim();
    if identity.is_empty()
        || identity == ANONYMOUS
        || identity.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return None;
    }
    Some(identity.to_string())
}
