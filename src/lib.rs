//! A resilient client for a payment consent API.
//!
//! The client creates and inspects single and enduring consents, quick payments, payments and refunds, and waits
//! for them to reach a terminal state. Underneath it:
//!
//! * fetches OAuth2 client credential tokens on demand, with concurrent callers sharing a single refresh;
//! * retries transient failures with exponential backoff and jitter;
//! * maps HTTP failures onto typed [`ApiError`]s;
//! * revokes consents it gave up waiting on.
//!
//! # Getting Started
//!
//! The primary entry point is the [`PaymentsClient`] trait and its default implementation,
//! [`DefaultPaymentsClient`].
//!
//! ```no_run
//! use payment_consent_client::{ClientConfig, DefaultPaymentsClient, PaymentsClient};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("https://api.example.com", "merchant", "secret");
//!     let client = DefaultPaymentsClient::new(config)?;
//!
//!     let request = json!({
//!         "amount": { "currency": "NZD", "total": "1.00" },
//!         "flow": { "detail": { "type": "redirect", "redirect_uri": "https://merchant.example.com/return" } },
//!     });
//!     let created = client.create_quick_payment(&request).await?;
//!     if let Some(redirect_uri) = &created.redirect_uri {
//!         println!("Send the customer to {redirect_uri}");
//!     }
//!
//!     let max_wait = Duration::from_secs(60);
//!     let quick_payment = client.await_successful_quick_payment(created.quick_payment_id, max_wait).await?;
//!     println!("Quick payment is {}", quick_payment.consent.status);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod poller;
pub mod retry;
pub mod token;
pub mod transport;

pub use client::{DefaultPaymentsClient, PaymentsClient};
pub use config::ClientConfig;
pub use error::{ApiError, AuthFetchError, ClientBuildError, ConfigError, ErrorResponse};
pub use models::{
    Consent, ConsentStatus, CreateConsentResponse, CreatePaymentResponse, CreateQuickPaymentResponse,
    CreateRefundResponse, Payment, PaymentStatus, QuickPayment, Refund, RefundStatus,
};
pub use poller::{AwaitStrategy, DeadlineMode, ResourceKind, StatusPoller};
pub use retry::RetryPolicy;
pub use tokio_util::sync::CancellationToken;
