use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub use crate::{
    config::ClientConfig,
    error::{ApiError, ClientBuildError},
    models::{
        Consent, ConsentStatus, CreateConsentResponse, CreatePaymentResponse, CreateQuickPaymentResponse,
        CreateRefundResponse, Payment, PaymentStatus, QuickPayment, Refund,
    },
    poller::{AwaitStrategy, DeadlineMode, ResourceKind},
};
use crate::{
    poller::{classify_consent, classify_payment, classify_quick_payment, RevokeFn, StatusPoller},
    retry::RetryPolicy,
    token::{ClientCredentialsFetcher, TokenManager},
    transport::{Authenticator, HttpTransport, Transport},
};

const SINGLE_CONSENTS_PATH: &str = "/payments/v1/single-consents";
const ENDURING_CONSENTS_PATH: &str = "/payments/v1/enduring-consents";
const QUICK_PAYMENTS_PATH: &str = "/payments/v1/quick-payments";
const PAYMENTS_PATH: &str = "/payments/v1/payments";
const REFUNDS_PATH: &str = "/payments/v1/refunds";
const META_PATH: &str = "/payments/v1/meta";

/// An interface to interact with the payments API.
///
/// The `await_authorised_*` and `await_completed_payment` operations only stop on the single success status and
/// otherwise wait out the whole budget, rejections included. The `await_successful_*` operations also accept
/// consumed consents and fail as soon as the resource is rejected or revoked.
#[async_trait]
pub trait PaymentsClient {
    /// Create a single consent.
    async fn create_single_consent(&self, request: &Value) -> Result<CreateConsentResponse, ApiError>;

    /// Get a single consent.
    async fn get_single_consent(&self, id: Uuid) -> Result<Consent, ApiError>;

    /// Revoke a single consent.
    async fn revoke_single_consent(&self, id: Uuid) -> Result<(), ApiError>;

    /// Wait for a single consent to be authorised.
    async fn await_authorised_single_consent(&self, id: Uuid, max_wait: Duration) -> Result<Consent, ApiError>;

    /// Wait for a single consent to be authorised or consumed, failing early if it's rejected.
    async fn await_successful_single_consent(&self, id: Uuid, max_wait: Duration) -> Result<Consent, ApiError>;

    /// Create an enduring consent.
    async fn create_enduring_consent(&self, request: &Value) -> Result<CreateConsentResponse, ApiError>;

    /// Get an enduring consent.
    async fn get_enduring_consent(&self, id: Uuid) -> Result<Consent, ApiError>;

    /// Revoke an enduring consent.
    async fn revoke_enduring_consent(&self, id: Uuid) -> Result<(), ApiError>;

    /// Wait for an enduring consent to be authorised.
    async fn await_authorised_enduring_consent(&self, id: Uuid, max_wait: Duration) -> Result<Consent, ApiError>;

    /// Wait for an enduring consent to be authorised or consumed, failing early if it's rejected.
    async fn await_successful_enduring_consent(&self, id: Uuid, max_wait: Duration) -> Result<Consent, ApiError>;

    /// Create a quick payment.
    async fn create_quick_payment(&self, request: &Value) -> Result<CreateQuickPaymentResponse, ApiError>;

    /// Get a quick payment.
    async fn get_quick_payment(&self, id: Uuid) -> Result<QuickPayment, ApiError>;

    /// Revoke a quick payment.
    async fn revoke_quick_payment(&self, id: Uuid) -> Result<(), ApiError>;

    /// Wait for a quick payment to be authorised.
    async fn await_authorised_quick_payment(&self, id: Uuid, max_wait: Duration) -> Result<QuickPayment, ApiError>;

    /// Wait for a quick payment to be authorised or consumed, failing early if it's rejected.
    async fn await_successful_quick_payment(&self, id: Uuid, max_wait: Duration) -> Result<QuickPayment, ApiError>;

    /// Create a payment under an authorised consent.
    async fn create_payment(&self, request: &Value) -> Result<CreatePaymentResponse, ApiError>;

    /// Get a payment.
    async fn get_payment(&self, id: Uuid) -> Result<Payment, ApiError>;

    /// Wait for a payment to settle.
    async fn await_completed_payment(&self, id: Uuid, max_wait: Duration) -> Result<Payment, ApiError>;

    /// Wait for a payment to settle, failing early if it's rejected.
    async fn await_successful_payment(&self, id: Uuid, max_wait: Duration) -> Result<Payment, ApiError>;

    /// Create a refund.
    async fn create_refund(&self, request: &Value) -> Result<CreateRefundResponse, ApiError>;

    /// Get a refund.
    async fn get_refund(&self, id: Uuid) -> Result<Refund, ApiError>;

    /// Get the metadata of the banks that can be paid from.
    async fn get_meta(&self) -> Result<Vec<Value>, ApiError>;
}

/// The default payments client.
///
/// Every call goes through the client's retry policy, and waits through its status poller.
pub struct DefaultPaymentsClient<T = HttpTransport> {
    transport: T,
    retry: RetryPolicy,
    poller: StatusPoller,
}

impl DefaultPaymentsClient<HttpTransport> {
    /// Build a client that hits the actual service.
    pub fn new(config: ClientConfig) -> Result<Self, ClientBuildError> {
        config.validate()?;
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        let authenticator = match &config.access_token {
            Some(access_token) => Authenticator::Static(access_token.clone()),
            None => {
                let fetcher = ClientCredentialsFetcher::new(
                    client.clone(),
                    config.token_url(),
                    &config.client_id,
                    &config.client_secret,
                );
                let manager = TokenManager::new(fetcher).with_expiry_margin(config.token_expiry_margin);
                Authenticator::Managed(Arc::new(manager))
            }
        };
        let transport = HttpTransport::new(client, &config.base_url, authenticator);
        Ok(Self::with_transport(transport, config.retry_policy()))
    }
}

impl<T: Transport> DefaultPaymentsClient<T> {
    /// Build a client on top of the given transport.
    pub fn with_transport(transport: T, retry: RetryPolicy) -> Self {
        let poller = StatusPoller::new(retry.clone());
        Self { transport, retry, poller }
    }

    /// Replace the status poller, e.g. to change the poll interval or the deadline mode.
    ///
    /// The poller keeps its own retry policy.
    pub fn with_poller(mut self, poller: StatusPoller) -> Self {
        self.poller = poller;
        self
    }

    /// Wait for a single consent, with a choice of strategy and an optional way to cancel the wait.
    pub async fn await_single_consent_with(
        &self,
        id: Uuid,
        max_wait: Duration,
        strategy: AwaitStrategy,
        cancel: Option<&CancellationToken>,
    ) -> Result<Consent, ApiError> {
        self.await_consent(SINGLE_CONSENTS_PATH, id, max_wait, strategy, cancel).await
    }

    /// Wait for an enduring consent, with a choice of strategy and an optional way to cancel the wait.
    pub async fn await_enduring_consent_with(
        &self,
        id: Uuid,
        max_wait: Duration,
        strategy: AwaitStrategy,
        cancel: Option<&CancellationToken>,
    ) -> Result<Consent, ApiError> {
        self.await_consent(ENDURING_CONSENTS_PATH, id, max_wait, strategy, cancel).await
    }

    /// Wait for a quick payment, with a choice of strategy and an optional way to cancel the wait.
    pub async fn await_quick_payment_with(
        &self,
        id: Uuid,
        max_wait: Duration,
        strategy: AwaitStrategy,
        cancel: Option<&CancellationToken>,
    ) -> Result<QuickPayment, ApiError> {
        let session = self.poller.session(id, ResourceKind::QuickPayment, max_wait);
        let fetch = |id: Uuid| self.fetch_once(format!("{QUICK_PAYMENTS_PATH}/{id}"));
        let classify = move |quick_payment: &QuickPayment| classify_quick_payment(strategy, quick_payment);
        let revoke = self.revoker(format!("{QUICK_PAYMENTS_PATH}/{id}"));
        self.poller.await_terminal(session, fetch, classify, Some(revoke), cancel).await
    }

    /// Wait for a payment, with a choice of strategy and an optional way to cancel the wait.
    ///
    /// Payments can't be revoked, so giving up on one leaves it as is.
    pub async fn await_payment_with(
        &self,
        id: Uuid,
        max_wait: Duration,
        strategy: AwaitStrategy,
        cancel: Option<&CancellationToken>,
    ) -> Result<Payment, ApiError> {
        let session = self.poller.session(id, ResourceKind::Payment, max_wait);
        let fetch = |id: Uuid| self.fetch_once(format!("{PAYMENTS_PATH}/{id}"));
        let classify = move |payment: &Payment| classify_payment(strategy, payment.status);
        self.poller.await_terminal(session, fetch, classify, None, cancel).await
    }

    async fn await_consent(
        &self,
        collection: &'static str,
        id: Uuid,
        max_wait: Duration,
        strategy: AwaitStrategy,
        cancel: Option<&CancellationToken>,
    ) -> Result<Consent, ApiError> {
        let session = self.poller.session(id, ResourceKind::Consent, max_wait);
        let fetch = |id: Uuid| self.fetch_once(format!("{collection}/{id}"));
        let classify = move |consent: &Consent| classify_consent(strategy, consent.status);
        let revoke = self.revoker(format!("{collection}/{id}"));
        self.poller.await_terminal(session, fetch, classify, Some(revoke), cancel).await
    }

    fn revoker(&self, path: String) -> RevokeFn<'_> {
        Box::new(move || async move { self.delete(&path).await }.boxed())
    }

    /// A single, unretried, fetch of a resource. The poller does its own retrying.
    async fn fetch_once<O: DeserializeOwned>(&self, path: String) -> Result<O, ApiError> {
        let value = self.transport.get(&path).await?;
        decode(value)
    }

    async fn get<O: DeserializeOwned>(&self, path: &str) -> Result<O, ApiError> {
        let value = self.retry.execute(|| self.transport.get(path)).await?;
        decode(value)
    }

    async fn post<O: DeserializeOwned>(&self, path: &str, request: &Value) -> Result<O, ApiError> {
        if !request.is_object() {
            return Err(ApiError::UnprocessableRequest(format!("request to {path} must be a json object")));
        }
        let idempotency_key = Uuid::new_v4();
        let value = self.retry.execute(|| self.transport.post(path, request, idempotency_key)).await?;
        decode(value)
    }

    async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.retry.execute(|| self.transport.delete(path)).await
    }
}

fn decode<O: DeserializeOwned>(value: Value) -> Result<O, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl<T: Transport> PaymentsClient for DefaultPaymentsClient<T> {
    async fn create_single_consent(&self, request: &Value) -> Result<CreateConsentResponse, ApiError> {
        let response: CreateConsentResponse = self.post(SINGLE_CONSENTS_PATH, request).await?;
        info!("Created single consent {}", response.consent_id);
        Ok(response)
    }

    async fn get_single_consent(&self, id: Uuid) -> Result<Consent, ApiError> {
        self.get(&format!("{SINGLE_CONSENTS_PATH}/{id}")).await
    }

    async fn revoke_single_consent(&self, id: Uuid) -> Result<(), ApiError> {
        self.delete(&format!("{SINGLE_CONSENTS_PATH}/{id}")).await?;
        info!("Revoked single consent {id}");
        Ok(())
    }

    async fn await_authorised_single_consent(&self, id: Uuid, max_wait: Duration) -> Result<Consent, ApiError> {
        self.await_single_consent_with(id, max_wait, AwaitStrategy::Legacy, None).await
    }

    async fn await_successful_single_consent(&self, id: Uuid, max_wait: Duration) -> Result<Consent, ApiError> {
        self.await_single_consent_with(id, max_wait, AwaitStrategy::Strict, None).await
    }

    async fn create_enduring_consent(&self, request: &Value) -> Result<CreateConsentResponse, ApiError> {
        let response: CreateConsentResponse = self.post(ENDURING_CONSENTS_PATH, request).await?;
        info!("Created enduring consent {}", response.consent_id);
        Ok(response)
    }

    async fn get_enduring_consent(&self, id: Uuid) -> Result<Consent, ApiError> {
        self.get(&format!("{ENDURING_CONSENTS_PATH}/{id}")).await
    }

    async fn revoke_enduring_consent(&self, id: Uuid) -> Result<(), ApiError> {
        self.delete(&format!("{ENDURING_CONSENTS_PATH}/{id}")).await?;
        info!("Revoked enduring consent {id}");
        Ok(())
    }

    async fn await_authorised_enduring_consent(&self, id: Uuid, max_wait: Duration) -> Result<Consent, ApiError> {
        self.await_enduring_consent_with(id, max_wait, AwaitStrategy::Legacy, None).await
    }

    async fn await_successful_enduring_consent(&self, id: Uuid, max_wait: Duration) -> Result<Consent, ApiError> {
        self.await_enduring_consent_with(id, max_wait, AwaitStrategy::Strict, None).await
    }

    async fn create_quick_payment(&self, request: &Value) -> Result<CreateQuickPaymentResponse, ApiError> {
        let response: CreateQuickPaymentResponse = self.post(QUICK_PAYMENTS_PATH, request).await?;
        info!("Created quick payment {}", response.quick_payment_id);
        Ok(response)
    }

    async fn get_quick_payment(&self, id: Uuid) -> Result<QuickPayment, ApiError> {
        self.get(&format!("{QUICK_PAYMENTS_PATH}/{id}")).await
    }

    async fn revoke_quick_payment(&self, id: Uuid) -> Result<(), ApiError> {
        self.delete(&format!("{QUICK_PAYMENTS_PATH}/{id}")).await?;
        info!("Revoked quick payment {id}");
        Ok(())
    }

    async fn await_authorised_quick_payment(&self, id: Uuid, max_wait: Duration) -> Result<QuickPayment, ApiError> {
        self.await_quick_payment_with(id, max_wait, AwaitStrategy::Legacy, None).await
    }

    async fn await_successful_quick_payment(&self, id: Uuid, max_wait: Duration) -> Result<QuickPayment, ApiError> {
        self.await_quick_payment_with(id, max_wait, AwaitStrategy::Strict, None).await
    }

    async fn create_payment(&self, request: &Value) -> Result<CreatePaymentResponse, ApiError> {
        let response: CreatePaymentResponse = self.post(PAYMENTS_PATH, request).await?;
        info!("Created payment {}", response.payment_id);
        Ok(response)
    }

    async fn get_payment(&self, id: Uuid) -> Result<Payment, ApiError> {
        self.get(&format!("{PAYMENTS_PATH}/{id}")).await
    }

    async fn await_completed_payment(&self, id: Uuid, max_wait: Duration) -> Result<Payment, ApiError> {
        self.await_payment_with(id, max_wait, AwaitStrategy::Legacy, None).await
    }

    async fn await_successful_payment(&self, id: Uuid, max_wait: Duration) -> Result<Payment, ApiError> {
        self.await_payment_with(id, max_wait, AwaitStrategy::Strict, None).await
    }

    async fn create_refund(&self, request: &Value) -> Result<CreateRefundResponse, ApiError> {
        let response: CreateRefundResponse = self.post(REFUNDS_PATH, request).await?;
        info!("Created refund {}", response.refund_id);
        Ok(response)
    }

    async fn get_refund(&self, id: Uuid) -> Result<Refund, ApiError> {
        self.get(&format!("{REFUNDS_PATH}/{id}")).await
    }

    async fn get_meta(&self) -> Result<Vec<Value>, ApiError> {
        self.get(META_PATH).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorResponse;
    use serde_json::json;
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex,
    };

    const ID: Uuid = Uuid::from_u128(0x0b4e_8a38_0c0d_4a52_9d2f_6c3b_5e8a_1f77);

    #[derive(Clone, Debug, PartialEq)]
    enum Call {
        Get(String),
        Post(String, Uuid),
        Delete(String),
    }

    /// Answers each path with queued responses, repeating the last one.
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<HashMap<String, VecDeque<Result<Value, u16>>>>,
        calls: Mutex<Vec<Call>>,
    }

    impl ScriptedTransport {
        fn respond(self, path: &str, responses: Vec<Result<Value, u16>>) -> Self {
            self.responses.lock().unwrap().insert(path.to_string(), responses.into());
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn answer(&self, path: &str) -> Result<Value, ApiError> {
            let mut responses = self.responses.lock().unwrap();
            let queue = responses.get_mut(path).unwrap_or_else(|| panic!("unexpected request to {path}"));
            let response = if queue.len() > 1 { queue.pop_front().unwrap() } else { queue[0].clone() };
            response.map_err(|status| {
                let response = ErrorResponse { status, message: "scripted".into(), correlation_id: None };
                match status {
                    404 => ApiError::NotFound(response),
                    _ => ApiError::ServiceUnavailable(response),
                }
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(&self, path: &str) -> Result<Value, ApiError> {
            self.calls.lock().unwrap().push(Call::Get(path.to_string()));
            self.answer(path)
        }

        async fn post(&self, path: &str, _body: &Value, idempotency_key: Uuid) -> Result<Value, ApiError> {
            self.calls.lock().unwrap().push(Call::Post(path.to_string(), idempotency_key));
            self.answer(path)
        }

        async fn delete(&self, path: &str) -> Result<(), ApiError> {
            self.calls.lock().unwrap().push(Call::Delete(path.to_string()));
            self.answer(path).map(|_| ())
        }
    }

    fn client(transport: ScriptedTransport) -> DefaultPaymentsClient<ScriptedTransport> {
        let retry = RetryPolicy::default().with_backoff(Duration::from_millis(10), Duration::ZERO);
        DefaultPaymentsClient::with_transport(transport, retry)
    }

    fn consent(status: &str) -> Value {
        json!({ "consent_id": ID, "status": status, "detail": { "type": "single" } })
    }

    #[tokio::test]
    async fn create_retries_with_the_same_idempotency_key() {
        let path = QUICK_PAYMENTS_PATH;
        let created = json!({ "quick_payment_id": ID, "redirect_uri": "https://bank.example.com/auth" });
        let client = client(ScriptedTransport::default().respond(path, vec![Err(503), Ok(created)]));

        let response = client.create_quick_payment(&json!({ "flow": {} })).await.expect("created");

        assert_eq!(response.quick_payment_id, ID);
        let calls = client.transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
        assert!(matches!(&calls[0], Call::Post(p, _) if p == path));
    }

    #[tokio::test]
    async fn non_object_bodies_are_rejected_locally() {
        let client = client(ScriptedTransport::default());
        let result = client.create_single_consent(&json!(["not", "an", "object"])).await;
        assert!(matches!(result, Err(ApiError::UnprocessableRequest(_))));
        assert!(client.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn undecodable_responses_are_invalid() {
        let path = format!("{PAYMENTS_PATH}/{ID}");
        let client = client(ScriptedTransport::default().respond(&path, vec![Ok(json!({ "unexpected": true }))]));
        let result = client.get_payment(ID).await;
        assert!(matches!(result, Err(ApiError::InvalidResponse(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_consent_is_revoked() {
        let path = format!("{ENDURING_CONSENTS_PATH}/{ID}");
        let transport = ScriptedTransport::default().respond(&path, vec![Ok(consent("AwaitingAuthorisation"))]);
        let client = client(transport);

        let result = client.await_successful_enduring_consent(ID, Duration::from_secs(2)).await;

        assert!(matches!(result, Err(ApiError::ConsentOrPaymentTimedOut { revoke_failure: None, .. })));
        let calls = client.transport.calls();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Get(_))).count(), 3);
        assert_eq!(calls.last(), Some(&Call::Delete(path)));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_payment_is_left_alone() {
        let path = format!("{PAYMENTS_PATH}/{ID}");
        let payment = json!({ "payment_id": ID, "status": "AcceptedSettlementInProcess" });
        let client = client(ScriptedTransport::default().respond(&path, vec![Ok(payment)]));

        let result = client.await_successful_payment(ID, Duration::from_secs(1)).await;

        match result {
            Err(ApiError::ConsentOrPaymentTimedOut { kind, .. }) => assert_eq!(kind, ResourceKind::Payment),
            other => panic!("unexpected {other:?}"),
        }
        assert!(client.transport.calls().iter().all(|c| matches!(c, Call::Get(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn quick_payment_follows_its_consent() {
        let path = format!("{QUICK_PAYMENTS_PATH}/{ID}");
        let quick_payment = |status: &str| json!({ "quick_payment_id": ID, "consent": consent(status) });
        let transport = ScriptedTransport::default().respond(
            &path,
            vec![Ok(quick_payment("GatewayAwaitingSubmission")), Ok(quick_payment("Consumed"))],
        );
        let client = client(transport);

        let quick_payment = client.await_successful_quick_payment(ID, Duration::from_secs(5)).await.expect("consumed");

        assert_eq!(quick_payment.consent.status, ConsentStatus::Consumed);
        assert_eq!(client.transport.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_and_strict_waits_differ_on_rejection() {
        let path = format!("{SINGLE_CONSENTS_PATH}/{ID}");
        let transport = ScriptedTransport::default().respond(&path, vec![Ok(consent("Rejected"))]);
        let client = client(transport);

        let strict = client.await_successful_single_consent(ID, Duration::from_secs(3)).await;
        assert!(matches!(strict, Err(ApiError::ConsentRejectedOrRevoked { .. })));

        let legacy = client.await_authorised_single_consent(ID, Duration::from_secs(3)).await;
        assert!(matches!(legacy, Err(ApiError::ConsentOrPaymentTimedOut { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_resource_aborts_the_wait() {
        let path = format!("{SINGLE_CONSENTS_PATH}/{ID}");
        let client = client(ScriptedTransport::default().respond(&path, vec![Err(404)]));

        let result = client.await_successful_single_consent(ID, Duration::from_secs(30)).await;

        assert!(matches!(result, Err(ApiError::NotFound(_))));
        assert_eq!(client.transport.calls(), vec![Call::Get(path)]);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_can_be_cancelled() {
        let path = format!("{SINGLE_CONSENTS_PATH}/{ID}");
        let client = client(ScriptedTransport::default().respond(&path, vec![Ok(consent("AwaitingAuthorisation"))]));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let result =
            client.await_single_consent_with(ID, Duration::from_secs(30), AwaitStrategy::Strict, Some(&cancel)).await;

        assert!(matches!(result, Err(ApiError::Cancelled { .. })));
        assert!(client.transport.calls().iter().all(|c| matches!(c, Call::Get(_))));
    }

    #[tokio::test]
    async fn meta_is_returned_as_is() {
        let banks = json!([{ "name": "PNZ", "features": { "decoupled_flow": { "enabled": true } } }]);
        let client = client(ScriptedTransport::default().respond(META_PATH, vec![Ok(banks)]));
        let meta = client.get_meta().await.expect("meta");
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0]["name"], "PNZ");
    }
}
