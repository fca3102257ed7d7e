use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::StripeConfig;
use crate::error::{AppError, Result};

use super::{
    with_retry, AdapterErrorCode, ConfirmOutcome, CreateIntentRequest,
    CreateMandateRequest, MandateEventData, MandateOutcome, NormalizedEvent, ParsedWebhook,
    PaymentAdapterError, PaymentEventData, PaymentIntent, PayoutEventData, RefundEventData,
    RefundOutcome, PROCESSOR_TIMEOUT,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct StripeClient {
    client: Client,
    api_base: String,
    secret_key: String,
    webhook_secret: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateIntentResponse {
    id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct IntentStatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct CustomerResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    id: String,
    status: String,
    #[serde(default)]
    items: SubscriptionItems,
}

#[derive(Debug, Default, Deserialize)]
struct SubscriptionItems {
    #[serde(default)]
    data: Vec<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    id: String,
}

impl StripeClient {
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            client: Client::new(),
            api_base: config.api_base.clone(),
            secret_key: config.secret_key.clone(),
            webhook_secret: config.webhook_secret.clone(),
        }
    }

    /// Map a Stripe API response into a typed outcome or adapter error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> std::result::Result<T, PaymentAdapterError> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| PaymentAdapterError {
                code: AdapterErrorCode::InvalidRequest,
                processor_code: None,
                processor_message: Some(format!("failed to parse Stripe response: {}", e)),
            });
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<StripeErrorBody>(&body)
            .ok()
            .map(|b| b.error);
        let processor_code = detail.as_ref().and_then(|d| d.code.clone());
        let processor_message = detail.and_then(|d| d.message);

        let code = if processor_code.as_deref() == Some("card_declined")
            || status == reqwest::StatusCode::PAYMENT_REQUIRED
        {
            AdapterErrorCode::CardDeclined
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            AdapterErrorCode::AuthFailed
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            AdapterErrorCode::RateLimited
        } else if status.is_server_error() {
            AdapterErrorCode::ProcessorUnavailable
        } else {
            AdapterErrorCode::InvalidRequest
        };

        Err(PaymentAdapterError {
            code,
            processor_code,
            processor_message,
        })
    }

    /// Create a payment intent for a gift.
    ///
    /// The idempotency key is derived from the gift id, so a retried client
    /// request against the same gift can never create two charges.
    pub async fn create_payment_intent(
        &self,
        req: &CreateIntentRequest<'_>,
    ) -> std::result::Result<PaymentIntent, PaymentAdapterError> {
        let amount = req.charge_cents.to_string();
        let response: CreateIntentResponse = with_retry("stripe create_payment_intent", || async {
            let response = self
                .client
                .post(format!("{}/v1/payment_intents", self.api_base))
                .basic_auth(&self.secret_key, None::<&str>)
                .header("Idempotency-Key", format!("gift-{}-intent", req.gift_id))
                .timeout(PROCESSOR_TIMEOUT)
                .form(&[
                    ("amount", amount.as_str()),
                    ("currency", req.currency.as_str()),
                    ("receipt_email", req.donor_email),
                    ("metadata[gift_id]", req.gift_id),
                    ("automatic_payment_methods[enabled]", "true"),
                ])
                .send()
                .await
                .map_err(|e| PaymentAdapterError::network(&e))?;
            Self::handle_response(response).await
        })
        .await?;

        Ok(PaymentIntent {
            intent_id: response.id,
            client_secret: response.client_secret,
        })
    }

    /// Confirm a payment intent with a tokenized payment method.
    pub async fn confirm_payment(
        &self,
        intent_id: &str,
        payment_method_token: &str,
    ) -> std::result::Result<ConfirmOutcome, PaymentAdapterError> {
        let response: IntentStatusResponse = with_retry("stripe confirm_payment", || async {
            let response = self
                .client
                .post(format!(
                    "{}/v1/payment_intents/{}/confirm",
                    self.api_base, intent_id
                ))
                .basic_auth(&self.secret_key, None::<&str>)
                .header("Idempotency-Key", format!("confirm-{}", intent_id))
                .timeout(PROCESSOR_TIMEOUT)
                .form(&[("payment_method", payment_method_token)])
                .send()
                .await
                .map_err(|e| PaymentAdapterError::network(&e))?;
            Self::handle_response(response).await
        })
        .await?;

        Ok(ConfirmOutcome {
            status: response.status,
        })
    }

    /// Refund a payment intent; full refund when `amount_cents` is omitted.
    pub async fn refund_payment(
        &self,
        processor_ref: &str,
        amount_cents: Option<i64>,
    ) -> std::result::Result<RefundOutcome, PaymentAdapterError> {
        let idempotency_key = match amount_cents {
            Some(amount) => format!("refund-{}-{}", processor_ref, amount),
            None => format!("refund-{}-full", processor_ref),
        };
        let response: RefundResponse = with_retry("stripe refund_payment", || async {
            let mut form: Vec<(&str, String)> =
                vec![("payment_intent", processor_ref.to_string())];
            if let Some(amount) = amount_cents {
                form.push(("amount", amount.to_string()));
            }
            let response = self
                .client
                .post(format!("{}/v1/refunds", self.api_base))
                .basic_auth(&self.secret_key, None::<&str>)
                .header("Idempotency-Key", idempotency_key.clone())
                .timeout(PROCESSOR_TIMEOUT)
                .form(&form)
                .send()
                .await
                .map_err(|e| PaymentAdapterError::network(&e))?;
            Self::handle_response(response).await
        })
        .await?;

        Ok(RefundOutcome {
            refund_id: response.id,
            status: response.status,
        })
    }

    /// Create a recurring mandate, modelled as a Stripe subscription with an
    /// inline price. Not idempotency-keyed, so never retried automatically.
    pub async fn create_subscription(
        &self,
        req: &CreateMandateRequest<'_>,
    ) -> std::result::Result<MandateOutcome, PaymentAdapterError> {
        let customer_response = self
            .client
            .post(format!("{}/v1/customers", self.api_base))
            .basic_auth(&self.secret_key, None::<&str>)
            .timeout(PROCESSOR_TIMEOUT)
            .form(&[("email", req.donor_email)])
            .send()
            .await
            .map_err(|e| PaymentAdapterError::network(&e))?;
        let customer: CustomerResponse = Self::handle_response(customer_response).await?;

        let response = self
            .client
            .post(format!("{}/v1/subscriptions", self.api_base))
            .basic_auth(&self.secret_key, None::<&str>)
            .timeout(PROCESSOR_TIMEOUT)
            .form(&[
                ("customer", customer.id.as_str()),
                ("items[0][price_data][currency]", req.currency.as_str()),
                (
                    "items[0][price_data][unit_amount]",
                    &req.amount_cents.to_string(),
                ),
                ("items[0][price_data][recurring][interval]", "month"),
                (
                    "items[0][price_data][recurring][interval_count]",
                    &req.interval_months.to_string(),
                ),
                (
                    "items[0][price_data][product_data][name]",
                    "Recurring donation",
                ),
            ])
            .send()
            .await
            .map_err(|e| PaymentAdapterError::network(&e))?;
        let subscription: SubscriptionResponse = Self::handle_response(response).await?;

        Ok(MandateOutcome {
            mandate_id: subscription.id,
            status: subscription.status,
        })
    }

    /// Update the amount/cadence of an existing subscription in place.
    pub async fn update_subscription(
        &self,
        mandate_id: &str,
        amount_cents: i64,
        currency: crate::models::Currency,
        interval_months: u32,
    ) -> std::result::Result<(), PaymentAdapterError> {
        // The item id is needed to replace the price; reads are idempotent.
        let subscription: SubscriptionResponse = with_retry("stripe get_subscription", || async {
            let response = self
                .client
                .get(format!("{}/v1/subscriptions/{}", self.api_base, mandate_id))
                .basic_auth(&self.secret_key, None::<&str>)
                .timeout(PROCESSOR_TIMEOUT)
                .send()
                .await
                .map_err(|e| PaymentAdapterError::network(&e))?;
            Self::handle_response(response).await
        })
        .await?;

        let item_id = subscription
            .items
            .data
            .first()
            .map(|i| i.id.clone())
            .ok_or_else(|| PaymentAdapterError {
                code: AdapterErrorCode::InvalidRequest,
                processor_code: None,
                processor_message: Some(format!("subscription {} has no items", mandate_id)),
            })?;

        let response = self
            .client
            .post(format!("{}/v1/subscriptions/{}", self.api_base, mandate_id))
            .basic_auth(&self.secret_key, None::<&str>)
            .timeout(PROCESSOR_TIMEOUT)
            .form(&[
                ("items[0][id]", item_id.as_str()),
                ("items[0][price_data][currency]", currency.as_str()),
                (
                    "items[0][price_data][unit_amount]",
                    &amount_cents.to_string(),
                ),
                ("items[0][price_data][recurring][interval]", "month"),
                (
                    "items[0][price_data][recurring][interval_count]",
                    &interval_months.to_string(),
                ),
                (
                    "items[0][price_data][product_data][name]",
                    "Recurring donation",
                ),
                ("proration_behavior", "none"),
            ])
            .send()
            .await
            .map_err(|e| PaymentAdapterError::network(&e))?;
        let _: SubscriptionResponse = Self::handle_response(response).await?;
        Ok(())
    }

    /// Cancel a subscription. Deleting is idempotent in effect, so infra
    /// failures are retried.
    pub async fn cancel_subscription(
        &self,
        mandate_id: &str,
    ) -> std::result::Result<(), PaymentAdapterError> {
        with_retry("stripe cancel_subscription", || async {
            let response = self
                .client
                .delete(format!("{}/v1/subscriptions/{}", self.api_base, mandate_id))
                .basic_auth(&self.secret_key, None::<&str>)
                .timeout(PROCESSOR_TIMEOUT)
                .send()
                .await
                .map_err(|e| PaymentAdapterError::network(&e))?;
            let _: SubscriptionResponse = Self::handle_response(response).await?;
            Ok(())
        })
        .await
    }

    /// Maximum age of a webhook timestamp before it's rejected (in seconds).
    /// Stripe recommends 300 seconds (5 minutes).
    const WEBHOOK_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

    /// Verify the `Stripe-Signature` header (`t=timestamp,v1=signature`)
    /// over the raw body bytes.
    pub fn verify_webhook_signature(&self, payload: &[u8], headers: &HeaderMap) -> Result<bool> {
        let signature = headers
            .get("stripe-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::BadRequest("missing stripe-signature header".into()))?;

        let mut timestamp = None;
        let mut sig_v1 = None;

        for part in signature.split(',') {
            if let Some(t) = part.strip_prefix("t=") {
                timestamp = Some(t);
            } else if let Some(s) = part.strip_prefix("v1=") {
                sig_v1 = Some(s);
            }
        }

        let timestamp_str =
            timestamp.ok_or_else(|| AppError::BadRequest("invalid signature format".into()))?;
        let sig_v1 =
            sig_v1.ok_or_else(|| AppError::BadRequest("invalid signature format".into()))?;

        // Parse and validate timestamp to prevent replay attacks.
        let timestamp: i64 = timestamp_str
            .parse()
            .map_err(|_| AppError::BadRequest("invalid timestamp in signature".into()))?;

        let now = chrono::Utc::now().timestamp();
        let age = now - timestamp;

        if age > Self::WEBHOOK_TIMESTAMP_TOLERANCE_SECS {
            tracing::warn!(
                "Stripe webhook rejected: timestamp too old (age={}s, max={}s)",
                age,
                Self::WEBHOOK_TIMESTAMP_TOLERANCE_SECS
            );
            return Ok(false);
        }

        // Also reject timestamps from the future (clock skew tolerance: 60 seconds)
        if age < -60 {
            tracing::warn!(
                "Stripe webhook rejected: timestamp in the future (age={}s)",
                age
            );
            return Ok(false);
        }

        let signed_payload = format!("{}.{}", timestamp_str, String::from_utf8_lossy(payload));

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| AppError::Internal("invalid webhook secret".into()))?;
        mac.update(signed_payload.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        // Constant-time comparison to prevent timing attacks. Length is not
        // secret (always 64 hex chars for SHA-256), so the length check may
        // short-circuit.
        let expected_bytes = expected.as_bytes();
        let provided_bytes = sig_v1.as_bytes();

        if expected_bytes.len() != provided_bytes.len() {
            return Ok(false);
        }

        Ok(expected_bytes.ct_eq(provided_bytes).into())
    }

    /// Normalize a Stripe event payload.
    pub fn parse_webhook_event(&self, payload: &[u8]) -> Result<ParsedWebhook> {
        let event: StripeWebhookEvent = serde_json::from_slice(payload)
            .map_err(|e| AppError::BadRequest(format!("invalid Stripe webhook JSON: {}", e)))?;

        let normalized = match event.event_type.as_str() {
            "payment_intent.succeeded" => {
                let intent: StripePaymentIntent = serde_json::from_value(event.data.object)?;
                NormalizedEvent::PaymentSucceeded(intent.into_payment_data())
            }
            "payment_intent.payment_failed" => {
                let intent: StripePaymentIntent = serde_json::from_value(event.data.object)?;
                NormalizedEvent::PaymentFailed(intent.into_payment_data())
            }
            "invoice.paid" => {
                let invoice: StripeInvoice = serde_json::from_value(event.data.object)?;
                match invoice.subscription {
                    Some(subscription) => NormalizedEvent::PaymentSucceeded(PaymentEventData {
                        processor_ref: invoice
                            .payment_intent
                            .unwrap_or_else(|| invoice.id.clone()),
                        gift_id: None,
                        mandate_id: Some(subscription),
                        amount_cents: invoice.amount_paid,
                        processor_fee_cents: None,
                        failure_code: None,
                        failure_message: None,
                    }),
                    // One-off invoices are not part of the donation flow.
                    None => NormalizedEvent::Unknown {
                        event_type: event.event_type.clone(),
                    },
                }
            }
            "invoice.payment_failed" => {
                let invoice: StripeInvoice = serde_json::from_value(event.data.object)?;
                match invoice.subscription {
                    Some(subscription) => NormalizedEvent::MandateFailed(MandateEventData {
                        mandate_id: subscription,
                        status: Some("past_due".into()),
                    }),
                    None => NormalizedEvent::Unknown {
                        event_type: event.event_type.clone(),
                    },
                }
            }
            "refund.created" => {
                let refund: StripeRefund = serde_json::from_value(event.data.object)?;
                if refund.status != "succeeded" {
                    NormalizedEvent::Unknown {
                        event_type: event.event_type.clone(),
                    }
                } else {
                    let processor_ref = refund
                        .payment_intent
                        .or(refund.charge)
                        .ok_or_else(|| {
                            AppError::BadRequest("refund missing payment reference".into())
                        })?;
                    NormalizedEvent::PaymentRefunded(RefundEventData {
                        processor_ref,
                        refund_id: refund.id,
                        amount_cents: refund.amount,
                    })
                }
            }
            "charge.dispute.created" => {
                let dispute: StripeDispute = serde_json::from_value(event.data.object)?;
                NormalizedEvent::PaymentDisputed(RefundEventData {
                    processor_ref: dispute.payment_intent.unwrap_or(dispute.charge),
                    refund_id: dispute.id,
                    amount_cents: dispute.amount,
                })
            }
            "charge.dispute.funds_withdrawn" => {
                let dispute: StripeDispute = serde_json::from_value(event.data.object)?;
                NormalizedEvent::PaymentChargeback(RefundEventData {
                    processor_ref: dispute.payment_intent.unwrap_or(dispute.charge),
                    refund_id: dispute.id,
                    amount_cents: dispute.amount,
                })
            }
            "customer.subscription.created" => {
                let sub: StripeSubscription = serde_json::from_value(event.data.object)?;
                NormalizedEvent::MandateCreated(MandateEventData {
                    mandate_id: sub.id,
                    status: Some(sub.status),
                })
            }
            "customer.subscription.updated" => {
                let sub: StripeSubscription = serde_json::from_value(event.data.object)?;
                NormalizedEvent::MandateUpdated(MandateEventData {
                    mandate_id: sub.id,
                    status: Some(sub.status),
                })
            }
            "customer.subscription.deleted" => {
                let sub: StripeSubscription = serde_json::from_value(event.data.object)?;
                NormalizedEvent::MandateCancelled(MandateEventData {
                    mandate_id: sub.id,
                    status: Some(sub.status),
                })
            }
            "payout.paid" => {
                let payout: StripePayout = serde_json::from_value(event.data.object)?;
                NormalizedEvent::PayoutPaid(PayoutEventData {
                    payout_id: payout.id,
                    amount_cents: payout.amount,
                })
            }
            _ => NormalizedEvent::Unknown {
                event_type: event.event_type.clone(),
            },
        };

        Ok(ParsedWebhook {
            external_id: event.id,
            event_type: event.event_type,
            event: normalized,
        })
    }
}

/// Generic Stripe webhook event - object is parsed based on event_type
#[derive(Debug, Deserialize)]
pub struct StripeWebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

// ============ payment_intent.succeeded / payment_failed ============

#[derive(Debug, Deserialize)]
pub struct StripePaymentIntent {
    pub id: String,
    pub amount: Option<i64>,
    #[serde(default)]
    pub metadata: StripeMetadata,
    pub charges: Option<StripeChargeList>,
    pub last_payment_error: Option<StripePaymentError>,
}

impl StripePaymentIntent {
    fn into_payment_data(self) -> PaymentEventData {
        // Actual settled fee rides on the expanded balance transaction of
        // the charge; absent when the account doesn't expand it.
        let processor_fee_cents = self
            .charges
            .as_ref()
            .and_then(|c| c.data.first())
            .and_then(|c| c.balance_transaction.as_ref())
            .map(|bt| bt.fee);

        PaymentEventData {
            processor_ref: self.id,
            gift_id: self.metadata.gift_id,
            mandate_id: None,
            amount_cents: self.amount,
            processor_fee_cents,
            failure_code: self.last_payment_error.as_ref().and_then(|e| e.code.clone()),
            failure_message: self.last_payment_error.and_then(|e| e.message),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StripeMetadata {
    pub gift_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StripeChargeList {
    #[serde(default)]
    pub data: Vec<StripeCharge>,
}

#[derive(Debug, Deserialize)]
pub struct StripeCharge {
    pub id: String,
    pub balance_transaction: Option<StripeBalanceTransaction>,
}

#[derive(Debug, Deserialize)]
pub struct StripeBalanceTransaction {
    pub fee: i64,
}

#[derive(Debug, Deserialize)]
pub struct StripePaymentError {
    pub code: Option<String>,
    pub message: Option<String>,
}

// ============ invoice.paid / invoice.payment_failed ============

#[derive(Debug, Deserialize)]
pub struct StripeInvoice {
    pub id: String,
    pub subscription: Option<String>,
    pub payment_intent: Option<String>,
    pub amount_paid: Option<i64>,
}

// ============ refund.created ============

#[derive(Debug, Deserialize)]
pub struct StripeRefund {
    pub id: String,
    pub status: String,
    pub amount: Option<i64>,
    pub payment_intent: Option<String>,
    pub charge: Option<String>,
}

// ============ charge.dispute.* ============

#[derive(Debug, Deserialize)]
pub struct StripeDispute {
    pub id: String,
    pub charge: String,
    pub payment_intent: Option<String>,
    pub amount: Option<i64>,
}

// ============ customer.subscription.* ============

#[derive(Debug, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub status: String,
}

// ============ payout.paid ============

#[derive(Debug, Deserialize)]
pub struct StripePayout {
    pub id: String,
    pub amount: Option<i64>,
}
