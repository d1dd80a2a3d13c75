use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};
use tracing::error;
use uuid::Uuid;

use crate::poller::ResourceKind;

/// The headers the remote service echoes a correlation identifier in, in order of preference.
const CORRELATION_HEADERS: &[&str] = &["x-correlation-id", "request-id"];

/// Headers whose values must never reach the logs.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "proxy-authorization", "cookie", "set-cookie"];

/// The details of a non-success response returned by the remote service.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    /// The HTTP status code.
    pub status: u16,

    /// The error message.
    pub message: String,

    /// The correlation identifier echoed in the response, if any.
    pub correlation_id: Option<String>,
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status={}, message={}", self.status, self.message)?;
        if let Some(correlation_id) = &self.correlation_id {
            write!(f, ", correlation_id={correlation_id}")?;
        }
        Ok(())
    }
}

/// The body of an error response.
///
/// The remote service is not consistent about which field carries the message, so every known shape is accepted.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub error_description: Option<String>,

    /// The raw text of the body when it isn't json.
    #[serde(skip)]
    pub raw: Option<String>,
}

impl ErrorBody {
    /// Parse an error body, keeping the raw text when it isn't a json object.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<ErrorBody>(text) {
            Ok(body) => body,
            Err(_) => Self { raw: Some(text.to_string()).filter(|t| !t.trim().is_empty()), ..Default::default() },
        }
    }

    pub(crate) fn into_message(self, status: u16) -> String {
        self.message
            .or(self.error_description)
            .or(self.error)
            .or(self.raw)
            .unwrap_or_else(|| format!("request failed with status {status}"))
    }
}

/// An error when fetching an OAuth2 access token.
///
/// Cloneable so that every caller waiting on the same token fetch gets its outcome.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AuthFetchError {
    /// An Http request to the token endpoint failed.
    #[error("http: {0}")]
    Http(#[source] Arc<reqwest::Error>),

    /// The token endpoint refused to issue a token.
    #[error("token request rejected: status={status}, message={message}")]
    Rejected {
        /// The HTTP status code.
        status: u16,

        /// The error message.
        message: String,
    },

    /// The issued token could not be interpreted.
    #[error("malformed token: {0}")]
    MalformedToken(String),
}

impl From<reqwest::Error> for AuthFetchError {
    fn from(error: reqwest::Error) -> Self {
        Self::Http(Arc::new(error))
    }
}

/// An error when loading the client configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is missing.
    #[error("missing setting: {0}")]
    Missing(String),

    /// A setting has a value that can't be used.
    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// The setting's name.
        name: String,

        /// Why the value was rejected.
        reason: String,
    },
}

/// An error when building a client.
#[derive(Debug, thiserror::Error)]
pub enum ClientBuildError {
    /// The configuration is unusable.
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// The Http client could not be built.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

/// An error when interacting with the payments API.
///
/// Every non-success response is turned into exactly one of these before leaving this crate.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request was not authorised (401, and 422 business rule failures).
    #[error("unauthorised: {0}")]
    Unauthorised(ErrorResponse),

    /// The caller is not allowed to access the resource.
    #[error("forbidden: {0}")]
    Forbidden(ErrorResponse),

    /// The resource does not exist.
    #[error("not found: {0}")]
    NotFound(ErrorResponse),

    /// The request timed out.
    #[error("request timeout: {0}")]
    RequestTimeout(ErrorResponse),

    /// The request was rejected before being sent.
    #[error("unprocessable request: {0}")]
    UnprocessableRequest(String),

    /// Too many requests were made.
    #[error("rate limited: {0}")]
    RateLimited(ErrorResponse),

    /// The operation is not implemented by the service.
    #[error("not implemented: {0}")]
    NotImplemented(ErrorResponse),

    /// Any other client side error.
    #[error("client error: {0}")]
    ClientError(ErrorResponse),

    /// The service is unavailable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(ErrorResponse),

    /// The resource was rejected, revoked, or timed out at the bank's gateway.
    #[error("{kind} {id} was rejected or revoked: {reason}")]
    ConsentRejectedOrRevoked {
        /// The kind of resource.
        kind: ResourceKind,

        /// The resource identifier.
        id: Uuid,

        /// The status the resource ended in.
        reason: String,
    },

    /// The resource did not reach a terminal state in time.
    #[error("{kind} {id} did not complete within {waited:?}{}", revoke_suffix(.revoke_failure))]
    ConsentOrPaymentTimedOut {
        /// The kind of resource.
        kind: ResourceKind,

        /// The resource identifier.
        id: Uuid,

        /// How long we were willing to wait.
        waited: Duration,

        /// The error raised while revoking the resource after giving up on it.
        revoke_failure: Option<Box<ApiError>>,
    },

    /// The resource hasn't reached a terminal state yet.
    #[error("{kind} {id} is still pending: {status}")]
    StillPending {
        /// The kind of resource.
        kind: ResourceKind,

        /// The resource identifier.
        id: Uuid,

        /// The current status.
        status: String,
    },

    /// The caller cancelled the wait.
    #[error("waiting for {kind} {id} was cancelled")]
    Cancelled {
        /// The kind of resource.
        kind: ResourceKind,

        /// The resource identifier.
        id: Uuid,
    },

    /// A connection to the service could not be established.
    #[error("connection: {0}")]
    Connection(String),

    /// Any other Http transport failure.
    #[error("transport: {0}")]
    Transport(String),

    /// A success response could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// An access token could not be obtained.
    #[error("fetching access token: {0}")]
    Auth(#[from] AuthFetchError),
}

fn revoke_suffix(revoke_failure: &Option<Box<ApiError>>) -> String {
    match revoke_failure {
        Some(e) => format!(" (revoking it also failed: {e})"),
        None => String::new(),
    }
}

impl ApiError {
    /// The response details, when this error came from a non-success response.
    pub fn response(&self) -> Option<&ErrorResponse> {
        match self {
            Self::Unauthorised(r)
            | Self::Forbidden(r)
            | Self::NotFound(r)
            | Self::RequestTimeout(r)
            | Self::RateLimited(r)
            | Self::NotImplemented(r)
            | Self::ClientError(r)
            | Self::ServiceUnavailable(r) => Some(r),
            _ => None,
        }
    }

    /// The HTTP status that caused this error, if any.
    pub fn status(&self) -> Option<u16> {
        self.response().map(|r| r.status)
    }

    /// The correlation identifier echoed by the service, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.response().and_then(|r| r.correlation_id.as_deref())
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            Self::Connection(e.to_string())
        } else if e.is_timeout() {
            let response = ErrorResponse { status: 408, message: e.to_string(), correlation_id: None };
            Self::RequestTimeout(response)
        } else if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Map a response status to an error.
///
/// Returns `None` for anything below 400. Every error is logged along with the sanitised headers.
pub fn classify(status: u16, body: ErrorBody, headers: &HeaderMap) -> Option<ApiError> {
    if status < 400 {
        return None;
    }
    let correlation_id = correlation_id(headers);
    let response = ErrorResponse { status, message: body.into_message(status), correlation_id };
    error!(
        "Request failed: status={status}, headers={:?}, message={}",
        sanitize_headers(headers),
        response.message
    );

    let error = match status {
        401 => ApiError::Unauthorised(response),
        403 => ApiError::Forbidden(response),
        404 => ApiError::NotFound(response),
        408 => ApiError::RequestTimeout(response),
        // Business rule failures share the 401 kind, callers depend on this.
        422 => ApiError::Unauthorised(response),
        429 => ApiError::RateLimited(response),
        501 => ApiError::NotImplemented(response),
        502 => ApiError::ServiceUnavailable(response),
        400..=499 => ApiError::ClientError(response),
        _ => ApiError::ServiceUnavailable(response),
    };
    Some(error)
}

/// Find the correlation identifier in a set of response headers.
pub fn correlation_id(headers: &HeaderMap) -> Option<String> {
    CORRELATION_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .find_map(|value| value.to_str().ok())
        .map(ToString::to_string)
}

/// Render headers for logging with credentials masked.
pub fn sanitize_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let name = name.as_str().to_lowercase();
            let value = if SENSITIVE_HEADERS.contains(&name.as_str()) { "***".to_string() } else { printable(value) };
            (name, value)
        })
        .collect()
}

fn printable(value: &HeaderValue) -> String {
    value.to_str().map(ToString::to_string).unwrap_or_else(|_| "<binary>".to_string())
}
