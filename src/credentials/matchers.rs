use super::{clean_identity, AuthMethod, CredentialMatcher, RequestAuth};
use axum::http::{header::AUTHORIZATION, HeaderName};

const CREDENTIAL_FIELD: &str = "Credential=";
const SIGV2_PREFIX: &str = "AWS ";
const PRESIGNED_V4_PARAM: &str = "X-Amz-Credential";
const PRESIGNED_V2_PARAM: &str = "AWSAccessKeyId";

fn authorization<'a>(auth: &RequestAuth<'a>) -> Option<&'a str> {
    auth.headers.get(AUTHORIZATION)?.to_str().ok()
}

fn query_param(auth: &RequestAuth<'_>, name: &str) -> Option<String> {
    let query = auth.query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// The access key of a SigV4 credential scope: `<key>/<date>/<region>/...`
fn scope_access_key(scope: &str) -> Option<String> {
    let (key, _) = scope.split_once('/')?;
    clean_identity(key)
}

/// `Authorization: AWS4-HMAC-SHA256 Credential=<key>/<scope>, ...`
#[derive(Debug, Clone, Copy, Default)]
pub struct SigV4Header;

impl CredentialMatcher for SigV4Header {
    fn method(&self) -> AuthMethod {
        AuthMethod::SigV4
    }

    fn try_extract(&self, auth: &RequestAuth<'_>) -> Option<String> {
        let value = authorization(auth)?;
        let start = value.find(CREDENTIAL_FIELD)? + CREDENTIAL_FIELD.len();
        // The scope ends at the next field separator
        let scope = value[start..]
            .split(|c: char| c == ',' || c.is_whitespace())
            .next()?;
        scope_access_key(scope)
    }
}

/// `Authorization: AWS <key>:<signature>`
#[derive(Debug, Clone, Copy, Default)]
pub struct SigV2Header;

impl CredentialMatcher for SigV2Header {
    fn method(&self) -> AuthMethod {
        AuthMethod::SigV2
    }

    fn try_extract(&self, auth: &RequestAuth<'_>) -> Option<String> {
        let value = authorization(auth)?;
        let rest = value.strip_prefix(SIGV2_PREFIX)?;
        let (key, _signature) = rest.split_once(':')?;
        clean_identity(key)
    }
}

/// `?X-Amz-Credential=<key>%2F<scope>`
#[derive(Debug, Clone, Copy, Default)]
pub struct PresignedV4Query;

impl CredentialMatcher for PresignedV4Query {
    fn method(&self) -> AuthMethod {
        AuthMethod::PresignedV4
    }

    fn try_extract(&self, auth: &RequestAuth<'_>) -> Option<String> {
        let scope = query_param(auth, PRESIGNED_V4_PARAM)?;
        scope_access_key(&scope)
    }
}

/// `?AWSAccessKeyId=<key>`
#[derive(Debug, Clone, Copy, Default)]
pub struct PresignedV2Query;

impl CredentialMatcher for PresignedV2Query {
    fn method(&self) -> AuthMethod {
        AuthMethod::PresignedV2
    }

    fn try_extract(&self, auth: &RequestAuth<'_>) -> Option<String> {
        let key = query_param(auth, PRESIGNED_V2_PARAM)?;
        clean_identity(&key)
    }
}

/// A plain header carrying the identity verbatim, e.g. `X-Api-Key`
#[derive(Debug, Clone)]
pub struct FallbackHeader {
    name: HeaderName,
}

impl FallbackHeader {
    /// `None` if `name` is not a valid header name
    pub fn new(name: &str) -> Option<Self> {
        HeaderName::from_bytes(name.as_bytes())
            .ok()
            .map(|name| Self { name })
    }
}

impl CredentialMatcher for FallbackHeader {
    fn method(&self) -> AuthMethod {
        AuthMethod::ApiKey
    }

    fn try_extract(&self, auth: &RequestAuth<'_>) -> Option<String> {
        let value = auth.headers.get(&self.name)?.to_str().ok()?;
        clean_identity(value)
    }
}
