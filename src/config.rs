use serde::Deserialize;
use std::{env, str::FromStr, time::Duration};
use url::Url;

use crate::{error::ConfigError, retry::RetryPolicy};

const ENV_PREFIX: &str = "PAYMENT_CONSENT_";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// The configuration of a payments client.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// The base url of the payments API.
    pub base_url: String,

    /// The OAuth2 token endpoint, defaults to `<base_url>/oauth2/token`.
    pub token_url: Option<String>,

    /// The OAuth2 client identifier.
    pub client_id: String,

    /// The OAuth2 client secret.
    pub client_secret: String,

    /// An access token to use instead of fetching tokens with the client credentials.
    pub access_token: Option<String>,

    /// Whether transient failures are retried.
    pub retry_enabled: bool,

    /// The number of retries after the first attempt.
    pub max_retries: u32,

    /// The timeout of every individual request.
    #[serde(with = "seconds")]
    pub timeout: Duration,

    /// How long before their expiry access tokens are replaced.
    #[serde(with = "seconds")]
    pub token_expiry_margin: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token_url: None,
            client_id: String::new(),
            client_secret: String::new(),
            access_token: None,
            retry_enabled: true,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            token_expiry_margin: DEFAULT_TOKEN_EXPIRY_MARGIN,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            ..Default::default()
        }
    }

    /// Load the configuration from `PAYMENT_CONSENT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load the configuration using the given variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        let access_token = get("ACCESS_TOKEN");
        let required = |name: &str| match (get(name), &access_token) {
            (Some(value), _) => Ok(value),
            (None, Some(_)) => Ok(String::new()),
            (None, None) => Err(ConfigError::Missing(format!("{ENV_PREFIX}{name}"))),
        };
        let client_id = required("CLIENT_ID")?;
        let client_secret = required("CLIENT_SECRET")?;
        let timeout_secs = parse_or(get("TIMEOUT_SECS"), "TIMEOUT_SECS", defaults.timeout.as_secs())?;
        let config = Self {
            base_url: get("API_URL").ok_or_else(|| ConfigError::Missing(format!("{ENV_PREFIX}API_URL")))?,
            token_url: get("TOKEN_URL"),
            client_id,
            client_secret,
            retry_enabled: parse_or(get("RETRY_ENABLED"), "RETRY_ENABLED", defaults.retry_enabled)?,
            max_retries: parse_or(get("MAX_RETRIES"), "MAX_RETRIES", defaults.max_retries)?,
            timeout: Duration::from_secs(timeout_secs),
            access_token,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = Some(token_url.into());
        self
    }

    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    pub fn with_retry_enabled(mut self, retry_enabled: bool) -> Self {
        self.retry_enabled = retry_enabled;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_token_expiry_margin(mut self, margin: Duration) -> Self {
        self.token_expiry_margin = margin;
        self
    }

    /// The OAuth2 token endpoint.
    pub fn token_url(&self) -> String {
        match &self.token_url {
            Some(token_url) => token_url.clone(),
            None => format!("{}/oauth2/token", self.base_url.trim_end_matches('/')),
        }
    }

    /// The retry policy described by this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::default().with_max_retries(self.max_retries);
        if self.retry_enabled {
            policy
        } else {
            RetryPolicy { enabled: false, ..policy }
        }
    }

    /// Check that the configuration can be used to build a client.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("base_url", &self.base_url)?;
        if let Some(token_url) = &self.token_url {
            check_url("token_url", token_url)?;
        }
        if self.access_token.is_none() {
            if self.client_id.trim().is_empty() {
                return Err(ConfigError::Missing("client_id".into()));
            }
            if self.client_secret.trim().is_empty() {
                return Err(ConfigError::Missing("client_secret".into()));
            }
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid { name: "timeout".into(), reason: "must be positive".into() });
        }
        Ok(())
    }
}

fn check_url(name: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::Invalid { name: name.into(), reason: e.to_string() })?;
    if !matches!(url.scheme(), "http" | "https") {
        let reason = format!("unsupported scheme {}", url.scheme());
        return Err(ConfigError::Invalid { name: name.into(), reason });
    }
    Ok(())
}

fn parse_or<T>(value: Option<String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid { name: format!("{ENV_PREFIX}{name}"), reason: e.to_string() }),
        None => Ok(default),
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
