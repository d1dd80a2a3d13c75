use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::{classify, ApiError, ErrorBody},
    token::TokenManager,
};

/// The way to send requests to the payments API.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the resource at the given path.
    async fn get(&self, path: &str) -> Result<Value, ApiError>;

    /// Post a body to the given path, returning the created resource.
    ///
    /// Retries of the same logical request must reuse its idempotency key.
    async fn post(&self, path: &str, body: &Value, idempotency_key: Uuid) -> Result<Value, ApiError>;

    /// Delete the resource at the given path.
    async fn delete(&self, path: &str) -> Result<(), ApiError>;
}

/// Where the `Authorization` header comes from.
#[derive(Clone)]
pub enum Authenticator {
    /// A preconfigured access token.
    Static(String),

    /// Tokens fetched, and refreshed, on demand.
    Managed(Arc<TokenManager>),
}

impl Authenticator {
    async fn header(&self) -> Result<String, ApiError> {
        match self {
            Self::Static(token) => Ok(format!("Bearer {token}")),
            Self::Managed(manager) => Ok(manager.authorization_header().await?),
        }
    }

    async fn reject(&self) {
        if let Self::Managed(manager) = self {
            manager.invalidate().await;
        }
    }
}

/// A transport that talks to the actual service over Http.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    authenticator: Authenticator,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, authenticator: Authenticator) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url, authenticator }
    }

    fn make_url(&self, path: &str) -> String {
        let base_url = &self.base_url;
        format!("{base_url}{path}")
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let authorization = self.authenticator.header().await?;
        let request_id = Uuid::new_v4().to_string();
        let response = request
            .header("Authorization", authorization)
            .header("request-id", &request_id)
            .header("x-correlation-id", Uuid::new_v4().to_string())
            .send()
            .await?;
        debug!("Request {request_id} to {} returned {}", response.url().path(), response.status());
        self.check_status(response).await
    }

    async fn check_status(&self, response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let headers = response.headers().clone();
        let body = error_body(status, response.text().await);
        let error = classify(status.as_u16(), body, &headers)
            .unwrap_or_else(|| ApiError::InvalidResponse(format!("unexpected status {status}")));
        if status == StatusCode::UNAUTHORIZED {
            self.authenticator.reject().await;
        }
        Err(error)
    }

    async fn parse_response(response: Response) -> Result<Value, ApiError> {
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

fn error_body(status: StatusCode, text: Result<String, reqwest::Error>) -> ErrorBody {
    match text {
        Ok(text) => ErrorBody::parse(&text),
        Err(e) => {
            warn!("Failed to read the body of a {status} response: {e}");
            ErrorBody { raw: Some(format!("unreadable response body: {e}")), ..Default::default() }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        let url = self.make_url(path);
        let response = self.send(self.client.get(url)).await?;
        Self::parse_response(response).await
    }

    async fn post(&self, path: &str, body: &Value, idempotency_key: Uuid) -> Result<Value, ApiError> {
        let url = self.make_url(path);
        let request = self.client.post(url).json(body).header("idempotency-key", idempotency_key.to_string());
        let response = self.send(request).await?;
        Self::parse_response(response).await
    }

    async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let url = self.make_url(path);
        self.send(self.client.delete(url)).await?;
        Ok(())
    }
}
