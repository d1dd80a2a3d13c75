use payment_consent_client::{ApiError, ClientConfig, DefaultPaymentsClient, PaymentsClient};
use serde_json::json;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    // Reads PAYMENT_CONSENT_API_URL, PAYMENT_CONSENT_CLIENT_ID and PAYMENT_CONSENT_CLIENT_SECRET
    let config = ClientConfig::from_env()?;
    let client = DefaultPaymentsClient::new(config)?;

    let request = json!({
        "amount": { "currency": "NZD", "total": "1.50" },
        "flow": {
            "detail": {
                "type": "redirect",
                "redirect_to_app": false,
                "redirect_uri": "https://merchant.example.com/return"
            }
        },
        "pcr": { "particulars": "lollipop", "code": "lolly", "reference": "demo" }
    });
    let created = client.create_quick_payment(&request).await?;
    println!("Quick payment: id={}", created.quick_payment_id);
    if let Some(redirect_uri) = &created.redirect_uri {
        println!("Authorise at: {redirect_uri}");
    }

    match client.await_successful_quick_payment(created.quick_payment_id, Duration::from_secs(120)).await {
        Ok(quick_payment) => println!("Done: status={}", quick_payment.consent.status),
        Err(ApiError::ConsentOrPaymentTimedOut { revoke_failure: None, .. }) => {
            println!("Not authorised in time, the quick payment was revoked")
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
