//! Processor-agnostic payment adapter protocol.
//!
//! Each supported processor is a variant of the closed [`PaymentProcessor`]
//! enum, mapped at configuration time to exactly one client implementation.
//! The rest of the system dispatches through [`ProcessorClient`] and never
//! sees processor-specific payload shapes or header schemes.

mod paypal;
mod stripe;

pub use paypal::*;
pub use stripe::*;

use std::time::Duration;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::Currency;

/// Supported payment processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProcessor {
    Stripe,
    Paypal,
}

impl PaymentProcessor {
    pub const ALL: [PaymentProcessor; 2] = [PaymentProcessor::Stripe, PaymentProcessor::Paypal];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProcessor::Stripe => "stripe",
            PaymentProcessor::Paypal => "paypal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "stripe" => Some(PaymentProcessor::Stripe),
            "paypal" => Some(PaymentProcessor::Paypal),
            _ => None,
        }
    }

    /// Detect the sending processor from its distinct signature header.
    ///
    /// Returns `None` when no known signature header is present; the caller
    /// must treat that as a malformed request, not fall back to a default.
    pub fn detect(headers: &HeaderMap) -> Option<Self> {
        if headers.contains_key("stripe-signature") {
            Some(PaymentProcessor::Stripe)
        } else if headers.contains_key("paypal-transmission-sig") {
            Some(PaymentProcessor::Paypal)
        } else {
            None
        }
    }
}

impl std::fmt::Display for PaymentProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PaymentProcessor {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        PaymentProcessor::from_str(s).ok_or(())
    }
}

// ============ Typed adapter errors ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorCode {
    /// The payment method was declined; user-facing, not retryable.
    CardDeclined,
    /// The processor rejected the request shape; a bug or bad input.
    InvalidRequest,
    /// API credentials rejected; configuration problem.
    AuthFailed,
    /// Processor asked us to back off.
    RateLimited,
    /// Processor-side 5xx.
    ProcessorUnavailable,
    /// Transport-level failure (DNS, TLS, timeout).
    Network,
}

impl AdapterErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CardDeclined => "card_declined",
            Self::InvalidRequest => "invalid_request",
            Self::AuthFailed => "auth_failed",
            Self::RateLimited => "rate_limited",
            Self::ProcessorUnavailable => "processor_unavailable",
            Self::Network => "network",
        }
    }
}

impl std::fmt::Display for AdapterErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed failure from a processor API call.
#[derive(Debug, Clone)]
pub struct PaymentAdapterError {
    pub code: AdapterErrorCode,
    /// Processor's own error code (e.g., Stripe's `card_declined`).
    pub processor_code: Option<String>,
    /// Processor's human-readable message. Never shown to donors.
    pub processor_message: Option<String>,
}

impl PaymentAdapterError {
    pub fn network(err: &reqwest::Error) -> Self {
        Self {
            code: AdapterErrorCode::Network,
            processor_code: None,
            processor_message: Some(err.to_string()),
        }
    }

    /// Infrastructure failures are retryable; rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            AdapterErrorCode::Network
                | AdapterErrorCode::RateLimited
                | AdapterErrorCode::ProcessorUnavailable
        )
    }
}

impl std::fmt::Display for PaymentAdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(code) = &self.processor_code {
            write!(f, " [{}]", code)?;
        }
        if let Some(msg) = &self.processor_message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for PaymentAdapterError {}

// ============ Adapter request/response types ============

/// Outbound timeout for processor API calls.
pub const PROCESSOR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct CreateIntentRequest<'a> {
    /// Total to charge, including the covered fee when the donor opted in.
    pub charge_cents: i64,
    pub currency: Currency,
    /// The owning gift; the idempotency key is derived from this, so retried
    /// requests against the same gift never create two charges.
    pub gift_id: &'a str,
    pub donor_email: &'a str,
}

#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub intent_id: String,
    /// Client-side completion token (Stripe client secret, PayPal approval URL).
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub refund_id: String,
    pub status: String,
}

#[derive(Debug)]
pub struct CreateMandateRequest<'a> {
    pub amount_cents: i64,
    pub currency: Currency,
    pub donor_email: &'a str,
    /// Months between charges (1, 3, or 12).
    pub interval_months: u32,
}

#[derive(Debug, Clone)]
pub struct MandateOutcome {
    pub mandate_id: String,
    pub status: String,
}

// ============ Normalized webhook events ============

/// Payment lifecycle data shared by success/failure events.
#[derive(Debug, Clone)]
pub struct PaymentEventData {
    /// Processor's charge/intent reference; the idempotency anchor for updates.
    pub processor_ref: String,
    /// Gift ID round-tripped through intent metadata, when present.
    pub gift_id: Option<String>,
    /// Set when this payment was a recurring mandate charge.
    pub mandate_id: Option<String>,
    pub amount_cents: Option<i64>,
    /// Actual settled processor fee, authoritative over the pre-charge estimate.
    pub processor_fee_cents: Option<i64>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundEventData {
    /// Reference of the original charge/intent being refunded.
    pub processor_ref: String,
    pub refund_id: String,
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MandateEventData {
    pub mandate_id: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PayoutEventData {
    pub payout_id: String,
    pub amount_cents: Option<i64>,
}

/// Closed set of event types every adapter normalizes into.
///
/// Unknown processor event types map to `Unknown` and are acknowledged
/// without effect, so new processor features never break ingestion.
#[derive(Debug, Clone)]
pub enum NormalizedEvent {
    PaymentSucceeded(PaymentEventData),
    PaymentFailed(PaymentEventData),
    PaymentRefunded(RefundEventData),
    PaymentDisputed(RefundEventData),
    PaymentChargeback(RefundEventData),
    MandateCreated(MandateEventData),
    MandateUpdated(MandateEventData),
    MandateCancelled(MandateEventData),
    MandateFailed(MandateEventData),
    PayoutPaid(PayoutEventData),
    Unknown { event_type: String },
}

/// A verified, parsed webhook delivery.
#[derive(Debug, Clone)]
pub struct ParsedWebhook {
    /// Processor's unique event id; with the processor enum, the idempotency key.
    pub external_id: String,
    /// Raw processor event type string, kept for the ledger and audit trail.
    pub event_type: String,
    pub event: NormalizedEvent,
}

// ============ Registry & dispatch ============

/// Configured processor clients, one per enabled [`PaymentProcessor`].
pub struct ProcessorRegistry {
    stripe: Option<StripeClient>,
    paypal: Option<PayPalClient>,
}

impl ProcessorRegistry {
    pub fn new(stripe: Option<StripeClient>, paypal: Option<PayPalClient>) -> Self {
        Self { stripe, paypal }
    }

    pub fn configured(&self) -> Vec<PaymentProcessor> {
        let mut out = Vec::new();
        if self.stripe.is_some() {
            out.push(PaymentProcessor::Stripe);
        }
        if self.paypal.is_some() {
            out.push(PaymentProcessor::Paypal);
        }
        out
    }

    /// Look up the client for a processor. A gift or plan referencing a
    /// processor without credentials is a configuration error, not a 404.
    pub fn client(&self, processor: PaymentProcessor) -> Result<ProcessorClient<'_>> {
        match processor {
            PaymentProcessor::Stripe => self
                .stripe
                .as_ref()
                .map(ProcessorClient::Stripe)
                .ok_or_else(|| AppError::Config("Stripe is not configured".into())),
            PaymentProcessor::Paypal => self
                .paypal
                .as_ref()
                .map(ProcessorClient::Paypal)
                .ok_or_else(|| AppError::Config("PayPal is not configured".into())),
        }
    }
}

/// Uniform adapter contract, dispatching to the concrete processor client.
pub enum ProcessorClient<'a> {
    Stripe(&'a StripeClient),
    Paypal(&'a PayPalClient),
}

impl ProcessorClient<'_> {
    pub fn processor(&self) -> PaymentProcessor {
        match self {
            Self::Stripe(_) => PaymentProcessor::Stripe,
            Self::Paypal(_) => PaymentProcessor::Paypal,
        }
    }

    /// Create a payment intent for a gift. Idempotency-keyed on the gift id;
    /// safe to retry.
    pub async fn create_payment_intent(
        &self,
        req: &CreateIntentRequest<'_>,
    ) -> std::result::Result<PaymentIntent, PaymentAdapterError> {
        match self {
            Self::Stripe(c) => c.create_payment_intent(req).await,
            Self::Paypal(c) => c.create_order(req).await,
        }
    }

    /// Confirm a payment. Processors that auto-confirm treat this as a
    /// no-op success.
    pub async fn confirm_payment(
        &self,
        intent_id: &str,
        payment_method_token: &str,
    ) -> std::result::Result<ConfirmOutcome, PaymentAdapterError> {
        match self {
            Self::Stripe(c) => c.confirm_payment(intent_id, payment_method_token).await,
            Self::Paypal(c) => c.capture_order(intent_id).await,
        }
    }

    /// Refund a settled charge. Full refund when `amount_cents` is omitted.
    pub async fn refund_payment(
        &self,
        processor_ref: &str,
        amount_cents: Option<i64>,
        currency: Currency,
    ) -> std::result::Result<RefundOutcome, PaymentAdapterError> {
        match self {
            Self::Stripe(c) => c.refund_payment(processor_ref, amount_cents).await,
            Self::Paypal(c) => c.refund_capture(processor_ref, amount_cents, currency).await,
        }
    }

    pub async fn create_recurring_mandate(
        &self,
        req: &CreateMandateRequest<'_>,
    ) -> std::result::Result<MandateOutcome, PaymentAdapterError> {
        match self {
            Self::Stripe(c) => c.create_subscription(req).await,
            Self::Paypal(c) => c.create_billing_subscription(req).await,
        }
    }

    pub async fn update_recurring_mandate(
        &self,
        mandate_id: &str,
        amount_cents: i64,
        currency: Currency,
        interval_months: u32,
    ) -> std::result::Result<(), PaymentAdapterError> {
        match self {
            Self::Stripe(c) => {
                c.update_subscription(mandate_id, amount_cents, currency, interval_months)
                    .await
            }
            Self::Paypal(c) => {
                c.update_billing_subscription(mandate_id, amount_cents, currency, interval_months)
                    .await
            }
        }
    }

    pub async fn cancel_recurring_mandate(
        &self,
        mandate_id: &str,
    ) -> std::result::Result<(), PaymentAdapterError> {
        match self {
            Self::Stripe(c) => c.cancel_subscription(mandate_id).await,
            Self::Paypal(c) => c.cancel_billing_subscription(mandate_id).await,
        }
    }

    /// Verify the webhook signature over the raw, unparsed body bytes.
    ///
    /// `Ok(false)` means the signature did not match; the caller must reject
    /// with 401 and stop. `Err` is reserved for malformed signature headers.
    pub fn verify_webhook_signature(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<bool> {
        match self {
            Self::Stripe(c) => c.verify_webhook_signature(payload, headers),
            Self::Paypal(c) => c.verify_webhook_signature(payload, headers),
        }
    }

    /// Normalize a verified webhook payload.
    pub fn parse_webhook_event(&self, payload: &[u8]) -> Result<ParsedWebhook> {
        match self {
            Self::Stripe(c) => c.parse_webhook_event(payload),
            Self::Paypal(c) => c.parse_webhook_event(payload),
        }
    }
}

// ============ Retry policy ============

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Bounded exponential backoff for processor calls.
///
/// Only used for idempotent reads and idempotency-keyed writes; operations
/// without a safe retry key must not go through here.
pub(crate) async fn with_retry<T, F, Fut>(
    op: &str,
    f: F,
) -> std::result::Result<T, PaymentAdapterError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, PaymentAdapterError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < RETRY_ATTEMPTS => {
                tracing::warn!(
                    "{} attempt {}/{} failed ({}); retrying in {:?}",
                    op,
                    attempt,
                    RETRY_ATTEMPTS,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============ Amount helpers ============

/// Format cents as the decimal string processors expect ("320" -> "3.20").
pub(crate) fn cents_to_decimal(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, (cents % 100).abs())
}

/// Parse a processor decimal amount string into cents ("3.20" -> 320).
pub(crate) fn decimal_to_cents(s: &str) -> Option<i64> {
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    let whole: i64 = whole.parse().ok()?;
    let frac_cents: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        2 => frac.parse().ok()?,
        _ => return None,
    };
    Some(whole * 100 + frac_cents)
}
