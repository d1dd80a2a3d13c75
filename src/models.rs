use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{self, Display};
use uuid::Uuid;

/// The status of a consent, or of the consent behind a quick payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsentStatus {
    /// Waiting for the customer to be sent through the payment gateway.
    GatewayAwaitingSubmission,

    /// The customer never completed the gateway flow.
    GatewayTimeout,

    /// Waiting for the customer to authorise the consent at their bank.
    AwaitingAuthorisation,

    /// The customer authorised the consent.
    Authorised,

    /// The consent was authorised and has been used up by a payment.
    Consumed,

    /// The customer or their bank rejected the consent.
    Rejected,

    /// The consent was revoked.
    Revoked,

    /// A status this client doesn't know about.
    #[serde(other)]
    Unknown,
}

impl Display for ConsentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The status of a payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// The payment was submitted to the bank.
    Pending,

    /// The bank accepted the payment and is settling it.
    AcceptedSettlementInProcess,

    /// The payment settled.
    AcceptedSettlementCompleted,

    /// The bank rejected the payment.
    Rejected,

    /// A status this client doesn't know about.
    #[serde(other)]
    Unknown,
}

impl Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The status of a refund.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundStatus {
    Processing,
    Completed,
    Failed,

    /// A status this client doesn't know about.
    #[serde(other)]
    Unknown,
}

/// A customer's consent to one or more payments.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Consent {
    /// The consent identifier.
    pub consent_id: Uuid,

    /// The current status.
    pub status: ConsentStatus,

    /// The timestamp at which the consent was created.
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// The timestamp at which the status last changed.
    #[serde(default)]
    pub status_updated_timestamp: Option<DateTime<Utc>>,

    /// The payments made under this consent.
    #[serde(default)]
    pub payments: Vec<Payment>,

    /// Everything else the service returned about the consent.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// A consent created and paid in one go.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QuickPayment {
    /// The quick payment identifier.
    pub quick_payment_id: Uuid,

    /// The consent behind the quick payment.
    pub consent: Consent,
}

/// A payment made under a consent.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Payment {
    /// The payment identifier.
    pub payment_id: Uuid,

    /// The current status.
    pub status: PaymentStatus,

    /// The timestamp at which the payment was created.
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// The timestamp at which the status last changed.
    #[serde(default)]
    pub status_updated_timestamp: Option<DateTime<Utc>>,

    /// The refunds made against this payment.
    #[serde(default)]
    pub refunds: Vec<Refund>,

    /// Everything else the service returned about the payment.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// A refund of a payment.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Refund {
    /// The refund identifier.
    pub refund_id: Uuid,

    /// The current status.
    pub status: RefundStatus,

    /// The timestamp at which the refund was created.
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Everything else the service returned about the refund.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// The response to creating a consent.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CreateConsentResponse {
    pub consent_id: Uuid,

    /// Where to send the customer to authorise the consent, for redirect and gateway flows.
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// The response to creating a quick payment.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CreateQuickPaymentResponse {
    pub quick_payment_id: Uuid,

    /// Where to send the customer to authorise the payment, for redirect and gateway flows.
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// The response to creating a payment.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CreatePaymentResponse {
    pub payment_id: Uuid,
}

/// The response to creating a refund.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CreateRefundResponse {
    pub refund_id: Uuid,
}
