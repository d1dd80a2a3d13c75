//! OAuth2 client credentials tokens and their caching.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeDelta, Utc};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{AuthFetchError, ErrorBody};

const DEFAULT_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// A bearer credential used to authenticate requests.
#[derive(Clone, Debug, PartialEq)]
pub struct BearerCredential {
    /// The authorization scheme, e.g. `Bearer`.
    pub scheme: String,

    /// The access token.
    pub value: String,

    /// The instant the token stops being accepted.
    pub expires_at: DateTime<Utc>,
}

impl BearerCredential {
    /// Whether this credential can still be used at `now`, keeping `margin` in reserve.
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: TimeDelta) -> bool {
        self.expires_at.checked_sub_signed(margin).is_some_and(|usable_until| usable_until > now)
    }

    /// The value of the `Authorization` header for this credential.
    pub fn header_value(&self) -> String {
        format!("{} {}", self.scheme, self.value)
    }
}

/// A response from an OAuth2 token endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenResponse {
    /// The access token.
    pub access_token: String,

    /// The token type.
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// The lifetime of the token in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

fn default_token_type() -> String {
    "Bearer".into()
}

/// Something that can issue access tokens.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    /// Request a new access token.
    async fn fetch_token(&self) -> Result<TokenResponse, AuthFetchError>;
}

/// Fetches tokens using the OAuth2 client credentials grant.
pub struct ClientCredentialsFetcher {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl ClientCredentialsFetcher {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self { client, token_url: token_url.into(), client_id: client_id.into(), client_secret: client_secret.into() }
    }
}

#[derive(Serialize)]
struct ClientCredentialsRequest<'a> {
    grant_type: &'static str,
    client_id: &'a str,
    client_secret: &'a str,
}

#[async_trait]
impl TokenFetcher for ClientCredentialsFetcher {
    async fn fetch_token(&self) -> Result<TokenResponse, AuthFetchError> {
        let request = ClientCredentialsRequest {
            grant_type: "client_credentials",
            client_id: &self.client_id,
            client_secret: &self.client_secret,
        };
        debug!("Requesting access token from {}", self.token_url);
        let response = self.client.post(&self.token_url).form(&request).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            let text = response.text().await?;
            let message = ErrorBody::parse(&text).into_message(status.as_u16());
            Err(AuthFetchError::Rejected { status: status.as_u16(), message })
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<BearerCredential, AuthFetchError>>>;

/// Hands out a valid bearer credential, fetching a new one when the cached one is missing or about to expire.
///
/// Concurrent callers that find the credential unusable share a single fetch, and all of them get its outcome,
/// failures included.
pub struct TokenManager {
    fetcher: Arc<dyn TokenFetcher>,
    credential: RwLock<Option<BearerCredential>>,
    in_flight: Mutex<Option<SharedFetch>>,
    expiry_margin: TimeDelta,
}

impl TokenManager {
    pub fn new<F: TokenFetcher + 'static>(fetcher: F) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            credential: RwLock::new(None),
            in_flight: Mutex::new(None),
            expiry_margin: to_time_delta(DEFAULT_EXPIRY_MARGIN),
        }
    }

    /// Treat credentials as expired this long before they actually expire.
    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = to_time_delta(margin);
        self
    }

    /// Get the value of the `Authorization` header to use, fetching a new token if needed.
    pub async fn authorization_header(&self) -> Result<String, AuthFetchError> {
        if let Some(header) = self.cached_header().await {
            return Ok(header);
        }

        let fetch = {
            let mut in_flight = self.in_flight.lock().await;
            // A fetch may have completed while we were waiting for the lock.
            if let Some(header) = self.cached_header().await {
                return Ok(header);
            }
            in_flight.get_or_insert_with(|| self.start_fetch()).clone()
        };
        let result = fetch.clone().await;

        let mut in_flight = self.in_flight.lock().await;
        if in_flight.as_ref().is_some_and(|current| current.ptr_eq(&fetch)) {
            if let Ok(credential) = &result {
                *self.credential.write().await = Some(credential.clone());
            }
            *in_flight = None;
        }
        result.map(|credential| credential.header_value())
    }

    fn start_fetch(&self) -> SharedFetch {
        let fetcher = self.fetcher.clone();
        async move {
            let response = fetcher.fetch_token().await?;
            let credential = to_credential(response, Utc::now())?;
            info!("Fetched access token expiring at {}", credential.expires_at);
            Ok(credential)
        }
        .boxed()
        .shared()
    }

    /// The currently cached credential, if any.
    pub async fn credential(&self) -> Option<BearerCredential> {
        self.credential.read().await.clone()
    }

    /// Drop the cached credential so the next call fetches a new one.
    pub async fn invalidate(&self) {
        if self.credential.write().await.take().is_some() {
            debug!("Invalidated cached access token");
        }
    }

    async fn cached_header(&self) -> Option<String> {
        let credential = self.credential.read().await;
        credential
            .as_ref()
            .filter(|c| c.is_usable_at(Utc::now(), self.expiry_margin))
            .map(BearerCredential::header_value)
    }
}

fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::weeks(52))
}

fn to_credential(response: TokenResponse, now: DateTime<Utc>) -> Result<BearerCredential, AuthFetchError> {
    let expires_at = match jwt_expiry(&response.access_token) {
        Some(expires_at) => expires_at,
        None => {
            let expires_in = response.expires_in.ok_or_else(|| {
                AuthFetchError::MalformedToken("token has no expiry claim and no expires_in".into())
            })?;
            TimeDelta::try_seconds(expires_in)
                .and_then(|lifetime| now.checked_add_signed(lifetime))
                .ok_or_else(|| AuthFetchError::MalformedToken(format!("invalid expires_in: {expires_in}")))?
        }
    };
    let scheme = if response.token_type.eq_ignore_ascii_case("bearer") {
        "Bearer".to_string()
    } else {
        response.token_type
    };
    Ok(BearerCredential { scheme, value: response.access_token, expires_at })
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: Option<i64>,
}

/// Read the `exp` claim out of a JWT without verifying it.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claim: ExpiryClaim = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claim.exp?, 0)
}
