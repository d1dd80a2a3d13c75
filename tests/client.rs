use futures::future::join_all;
use payment_consent_client::{
    token::{ClientCredentialsFetcher, TokenManager},
    transport::{Authenticator, HttpTransport},
    ApiError, ClientConfig, ConsentStatus, DefaultPaymentsClient, PaymentStatus, PaymentsClient, ResourceKind,
    RetryPolicy, StatusPoller,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;
use wiremock::{
    matchers::{body_string_contains, header, header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

const ID: Uuid = Uuid::from_u128(0x5f1d_2c3a_44b6_4e0f_8a9d_1b2c_3d4e_5f60);
const STATIC_TOKEN: &str = "static-token";

fn fast_retry() -> RetryPolicy {
    RetryPolicy::default().with_backoff(Duration::from_millis(10), Duration::ZERO)
}

fn fast_poller(retry: RetryPolicy) -> StatusPoller {
    StatusPoller::new(retry).with_poll_interval(Duration::from_millis(50))
}

fn static_client(server: &MockServer, retry: RetryPolicy) -> DefaultPaymentsClient {
    let transport =
        HttpTransport::new(reqwest::Client::new(), server.uri(), Authenticator::Static(STATIC_TOKEN.to_string()));
    DefaultPaymentsClient::with_transport(transport, retry.clone()).with_poller(fast_poller(retry))
}

fn managed_client(server: &MockServer) -> DefaultPaymentsClient {
    let config = ClientConfig::new(server.uri(), "merchant", "secret");
    DefaultPaymentsClient::new(config).expect("client")
}

fn consent(status: &str) -> Value {
    json!({
        "consent_id": ID,
        "status": status,
        "creation_timestamp": "2026-01-05T09:30:00Z",
        "detail": { "type": "single", "amount": { "currency": "NZD", "total": "1.00" } }
    })
}

fn payment(status: &str) -> Value {
    json!({ "payment_id": ID, "status": status, "consent_id": ID })
}

async fn mount_token(server: &MockServer, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "managed-token",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(expected)
        .mount(server)
        .await;
}

#[tokio::test]
async fn consent_that_never_authorises_is_revoked() {
    let server = MockServer::start().await;
    let consent_path = format!("/payments/v1/single-consents/{ID}");
    Mock::given(method("POST"))
        .and(path("/payments/v1/single-consents"))
        .and(header("Authorization", "Bearer static-token"))
        .and(header_exists("idempotency-key"))
        .and(header_exists("request-id"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({ "consent_id": ID, "redirect_uri": "https://bank.example.com/authorise" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(consent_path.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(consent("AwaitingAuthorisation")))
        .expect(5)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(consent_path.as_str()))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let client = static_client(&server, fast_retry());

    let created = client.create_single_consent(&json!({ "type": "single" })).await.expect("created");
    assert_eq!(created.consent_id, ID);
    assert_eq!(created.redirect_uri.as_deref(), Some("https://bank.example.com/authorise"));

    let result = client.await_successful_single_consent(ID, Duration::from_millis(200)).await;
    match result {
        Err(ApiError::ConsentOrPaymentTimedOut { kind, id, revoke_failure, .. }) => {
            assert_eq!(kind, ResourceKind::Consent);
            assert_eq!(id, ID);
            assert!(revoke_failure.is_none());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn failed_revoke_is_reported_with_the_timeout() {
    let server = MockServer::start().await;
    let consent_path = format!("/payments/v1/enduring-consents/{ID}");
    Mock::given(method("GET"))
        .and(path(consent_path.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(consent("GatewayAwaitingSubmission")))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(consent_path.as_str()))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({ "message": "not yours" })))
        .expect(1)
        .mount(&server)
        .await;
    let client = static_client(&server, fast_retry());

    let result = client.await_successful_enduring_consent(ID, Duration::from_millis(100)).await;

    match result {
        Err(ApiError::ConsentOrPaymentTimedOut { revoke_failure: Some(failure), .. }) => {
            assert!(matches!(*failure, ApiError::Forbidden(ref response) if response.message == "not yours"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn authorised_consent_is_returned() {
    let server = MockServer::start().await;
    let consent_path = format!("/payments/v1/single-consents/{ID}");
    Mock::given(method("GET"))
        .and(path(consent_path.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(consent("AwaitingAuthorisation")))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(consent_path.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(consent("Authorised")))
        .expect(1)
        .mount(&server)
        .await;
    let client = static_client(&server, fast_retry());

    let consent = client.await_authorised_single_consent(ID, Duration::from_secs(5)).await.expect("authorised");

    assert_eq!(consent.status, ConsentStatus::Authorised);
    assert_eq!(consent.details["detail"]["type"], "single");
}

#[tokio::test]
async fn token_is_fetched_once_for_concurrent_calls() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("GET"))
        .and(path(format!("/payments/v1/payments/{ID}")))
        .and(header("Authorization", "Bearer managed-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(payment("AcceptedSettlementCompleted")))
        .expect(8)
        .mount(&server)
        .await;
    let client = managed_client(&server);

    let results = join_all((0..8).map(|_| client.get_payment(ID))).await;

    for result in results {
        assert_eq!(result.expect("payment").status, PaymentStatus::AcceptedSettlementCompleted);
    }
}

#[tokio::test]
async fn rejected_token_is_fetched_again() {
    let server = MockServer::start().await;
    mount_token(&server, 2).await;
    Mock::given(method("GET"))
        .and(path(format!("/payments/v1/refunds/{ID}")))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": "invalid_token" })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/payments/v1/refunds/{ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "refund_id": ID,
            "status": "Completed",
            "payment_id": ID
        })))
        .mount(&server)
        .await;
    let client = managed_client(&server);

    let first = client.get_refund(ID).await;
    assert!(matches!(first, Err(ApiError::Unauthorised(ref response)) if response.message == "invalid_token"));

    let refund = client.get_refund(ID).await.expect("refund");
    assert_eq!(refund.refund_id, ID);
}

#[tokio::test]
async fn token_endpoint_failures_surface_as_auth_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_client" })))
        .expect(1)
        .mount(&server)
        .await;
    let client = managed_client(&server);

    let result = client.get_meta().await;

    assert!(matches!(result, Err(ApiError::Auth(_))));
    let requests = server.received_requests().await.expect("recorded");
    assert!(requests.iter().all(|request| request.url.path() == "/oauth2/token"));
}

#[tokio::test]
async fn token_endpoint_outage_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_token(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/payments/v1/meta"))
        .and(header("Authorization", "Bearer managed-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;
    let http = reqwest::Client::new();
    let fetcher = ClientCredentialsFetcher::new(http.clone(), format!("{}/oauth2/token", server.uri()), "id", "secret");
    let authenticator = Authenticator::Managed(Arc::new(TokenManager::new(fetcher)));
    let transport = HttpTransport::new(http, server.uri(), authenticator);
    let client = DefaultPaymentsClient::with_transport(transport, fast_retry());

    let banks = client.get_meta().await.expect("meta");

    assert!(banks.is_empty());
}

#[tokio::test]
async fn static_token_skips_the_token_endpoint() {
    let server = MockServer::start().await;
    mount_token(&server, 0).await;
    Mock::given(method("GET"))
        .and(path("/payments/v1/meta"))
        .and(header("Authorization", "Bearer static-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "name": "Westpac" }, { "name": "ASB" }])))
        .expect(1)
        .mount(&server)
        .await;
    let config = ClientConfig::new(server.uri(), "", "").with_access_token(STATIC_TOKEN);
    let client = DefaultPaymentsClient::new(config).expect("client");

    let banks = client.get_meta().await.expect("meta");

    assert_eq!(banks.len(), 2);
}

#[tokio::test]
async fn bad_gateway_carries_the_correlation_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/payments/v1/payments/{ID}")))
        .respond_with(
            ResponseTemplate::new(502)
                .insert_header("x-correlation-id", "corr-42")
                .set_body_json(json!({ "message": "upstream bank unavailable" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    let client = static_client(&server, RetryPolicy::disabled());

    let error = client.get_payment(ID).await.expect_err("bad gateway");

    assert!(matches!(error, ApiError::ServiceUnavailable(_)));
    assert_eq!(error.status(), Some(502));
    assert_eq!(error.correlation_id(), Some("corr-42"));
    assert_eq!(error.response().map(|r| r.message.as_str()), Some("upstream bank unavailable"));
}

#[tokio::test]
async fn not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/payments/v1/quick-payments/{ID}")))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such quick payment"))
        .expect(1)
        .mount(&server)
        .await;
    let client = static_client(&server, fast_retry());

    let result = client.get_quick_payment(ID).await;

    assert!(matches!(result, Err(ApiError::NotFound(ref response)) if response.message == "no such quick payment"));
}

#[tokio::test]
async fn unavailable_service_is_retried_with_the_same_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payments/v1/payments"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/payments/v1/payments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "payment_id": ID })))
        .expect(1)
        .mount(&server)
        .await;
    let client = static_client(&server, fast_retry());

    let created = client.create_payment(&json!({ "consent_id": ID })).await.expect("created");

    assert_eq!(created.payment_id, ID);
    let requests = server.received_requests().await.expect("recorded");
    let keys: Vec<_> = requests.iter().map(|request| request.headers.get("idempotency-key").cloned()).collect();
    assert_eq!(keys.len(), 3);
    assert!(keys[0].is_some());
    assert!(keys.iter().all(|key| key == &keys[0]));
}

#[tokio::test]
async fn unprocessable_entity_maps_to_unauthorised() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payments/v1/refunds"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({ "message": "amount exceeds payment" })))
        .expect(1)
        .mount(&server)
        .await;
    let client = static_client(&server, fast_retry());

    let result = client.create_refund(&json!({ "payment_id": ID })).await;

    match result {
        Err(ApiError::Unauthorised(response)) => {
            assert_eq!(response.status, 422);
            assert_eq!(response.message, "amount exceeds payment");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn rejected_payment_fails_the_strict_wait() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/payments/v1/payments/{ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(payment("Rejected")))
        .expect(1)
        .mount(&server)
        .await;
    let client = static_client(&server, fast_retry());

    let result = client.await_successful_payment(ID, Duration::from_secs(5)).await;

    match result {
        Err(ApiError::ConsentRejectedOrRevoked { kind, reason, .. }) => {
            assert_eq!(kind, ResourceKind::Payment);
            assert_eq!(reason, "Rejected");
        }
        other => panic!("unexpected {other:?}"),
    }
}
