use axum::http::HeaderMap;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::PayPalConfig;
use crate::error::{AppError, Result};
use crate::models::Currency;

use super::{
    cents_to_decimal, decimal_to_cents, with_retry, AdapterErrorCode, ConfirmOutcome,
    CreateIntentRequest, CreateMandateRequest, MandateEventData, MandateOutcome, NormalizedEvent,
    ParsedWebhook, PaymentAdapterError, PaymentEventData, PaymentIntent, PayoutEventData,
    RefundEventData, RefundOutcome, PROCESSOR_TIMEOUT,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct PayPalClient {
    client: Client,
    api_base: String,
    client_id: String,
    client_secret: String,
    /// PayPal webhook id, part of the signed transmission envelope.
    webhook_id: String,
    webhook_secret: String,
}

#[derive(Debug, Deserialize)]
struct PayPalErrorBody {
    name: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<PayPalLink>,
}

#[derive(Debug, Deserialize)]
struct PayPalLink {
    rel: String,
    href: String,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ProductResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    id: String,
    status: String,
}

impl PayPalClient {
    pub fn new(config: &PayPalConfig) -> Self {
        Self {
            client: Client::new(),
            api_base: config.api_base.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            webhook_id: config.webhook_id.clone(),
            webhook_secret: config.webhook_secret.clone(),
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> std::result::Result<T, PaymentAdapterError> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| PaymentAdapterError {
                code: AdapterErrorCode::InvalidRequest,
                processor_code: None,
                processor_message: Some(format!("failed to parse PayPal response: {}", e)),
            });
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<PayPalErrorBody>(&body).ok();
        let processor_code = detail.as_ref().and_then(|d| d.name.clone());
        let processor_message = detail.and_then(|d| d.message);

        let code = if processor_code.as_deref() == Some("INSTRUMENT_DECLINED") {
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

    /// Fetch an OAuth access token. Token fetches are idempotent reads.
    async fn access_token(&self) -> std::result::Result<String, PaymentAdapterError> {
        let token: TokenResponse = with_retry("paypal access_token", || async {
            let response = self
                .client
                .post(format!("{}/v1/oauth2/token", self.api_base))
                .basic_auth(&self.client_id, Some(&self.client_secret))
                .timeout(PROCESSOR_TIMEOUT)
                .form(&[("grant_type", "client_credentials")])
                .send()
                .await
                .map_err(|e| PaymentAdapterError::network(&e))?;
            Self::handle_response(response).await
        })
        .await?;
        Ok(token.access_token)
    }

    fn amount_body(cents: i64, currency: Currency) -> serde_json::Value {
        json!({
            "currency_code": currency.as_str().to_uppercase(),
            "value": cents_to_decimal(cents),
        })
    }

    /// Create a PayPal order for a gift. The `PayPal-Request-Id` header is
    /// derived from the gift id, so retried requests never create two orders.
    pub async fn create_order(
        &self,
        req: &CreateIntentRequest<'_>,
    ) -> std::result::Result<PaymentIntent, PaymentAdapterError> {
        let token = self.access_token().await?;
        let order: OrderResponse = with_retry("paypal create_order", || async {
            let response = self
                .client
                .post(format!("{}/v2/checkout/orders", self.api_base))
                .bearer_auth(&token)
                .header("PayPal-Request-Id", format!("gift-{}-order", req.gift_id))
                .timeout(PROCESSOR_TIMEOUT)
                .json(&json!({
                    "intent": "CAPTURE",
                    "purchase_units": [{
                        "reference_id": req.gift_id,
                        "custom_id": req.gift_id,
                        "amount": Self::amount_body(req.charge_cents, req.currency),
                    }],
                }))
                .send()
                .await
                .map_err(|e| PaymentAdapterError::network(&e))?;
            Self::handle_response(response).await
        })
        .await?;

        // The approval URL plays the role of Stripe's client secret: the
        // client-side token needed to complete the payment.
        let approve_url = order
            .links
            .iter()
            .find(|l| l.rel == "approve")
            .map(|l| l.href.clone())
            .unwrap_or_default();

        Ok(PaymentIntent {
            intent_id: order.id,
            client_secret: approve_url,
        })
    }

    /// Capture an approved order. PayPal's equivalent of confirmation.
    pub async fn capture_order(
        &self,
        order_id: &str,
    ) -> std::result::Result<ConfirmOutcome, PaymentAdapterError> {
        let token = self.access_token().await?;
        let order: OrderResponse = with_retry("paypal capture_order", || async {
            let response = self
                .client
                .post(format!(
                    "{}/v2/checkout/orders/{}/capture",
                    self.api_base, order_id
                ))
                .bearer_auth(&token)
                .header("PayPal-Request-Id", format!("capture-{}", order_id))
                .timeout(PROCESSOR_TIMEOUT)
                .json(&json!({}))
                .send()
                .await
                .map_err(|e| PaymentAdapterError::network(&e))?;
            Self::handle_response(response).await
        })
        .await?;

        Ok(ConfirmOutcome {
            status: order.status,
        })
    }

    /// Refund a capture; full refund when `amount_cents` is omitted.
    pub async fn refund_capture(
        &self,
        capture_id: &str,
        amount_cents: Option<i64>,
        currency: Currency,
    ) -> std::result::Result<RefundOutcome, PaymentAdapterError> {
        let token = self.access_token().await?;
        let request_id = match amount_cents {
            Some(amount) => format!("refund-{}-{}", capture_id, amount),
            None => format!("refund-{}-full", capture_id),
        };
        let body = match amount_cents {
            Some(amount) => json!({ "amount": Self::amount_body(amount, currency) }),
            None => json!({}),
        };
        let refund: RefundResponse = with_retry("paypal refund_capture", || async {
            let response = self
                .client
                .post(format!(
                    "{}/v2/payments/captures/{}/refund",
                    self.api_base, capture_id
                ))
                .bearer_auth(&token)
                .header("PayPal-Request-Id", request_id.clone())
                .timeout(PROCESSOR_TIMEOUT)
                .json(&body)
                .send()
                .await
                .map_err(|e| PaymentAdapterError::network(&e))?;
            Self::handle_response(response).await
        })
        .await?;

        Ok(RefundOutcome {
            refund_id: refund.id,
            status: refund.status,
        })
    }

    fn billing_cycles(cents: i64, currency: Currency, interval_months: u32) -> serde_json::Value {
        json!([{
            "frequency": {
                "interval_unit": "MONTH",
                "interval_count": interval_months,
            },
            "tenure_type": "REGULAR",
            "sequence": 1,
            "total_cycles": 0,
            "pricing_scheme": {
                "fixed_price": Self::amount_body(cents, currency),
            },
        }])
    }

    /// Create a recurring mandate: catalog product -> billing plan ->
    /// subscription. Not idempotency-keyed, so never retried automatically.
    pub async fn create_billing_subscription(
        &self,
        req: &CreateMandateRequest<'_>,
    ) -> std::result::Result<MandateOutcome, PaymentAdapterError> {
        let token = self.access_token().await?;

        let product_response = self
            .client
            .post(format!("{}/v1/catalogs/products", self.api_base))
            .bearer_auth(&token)
            .timeout(PROCESSOR_TIMEOUT)
            .json(&json!({ "name": "Recurring donation", "type": "SERVICE" }))
            .send()
            .await
            .map_err(|e| PaymentAdapterError::network(&e))?;
        let product: ProductResponse = Self::handle_response(product_response).await?;

        let plan_response = self
            .client
            .post(format!("{}/v1/billing/plans", self.api_base))
            .bearer_auth(&token)
            .timeout(PROCESSOR_TIMEOUT)
            .json(&json!({
                "product_id": product.id,
                "name": "Recurring donation",
                "billing_cycles": Self::billing_cycles(
                    req.amount_cents,
                    req.currency,
                    req.interval_months,
                ),
                "payment_preferences": { "auto_bill_outstanding": true },
            }))
            .send()
            .await
            .map_err(|e| PaymentAdapterError::network(&e))?;
        let plan: PlanResponse = Self::handle_response(plan_response).await?;

        let subscription_response = self
            .client
            .post(format!("{}/v1/billing/subscriptions", self.api_base))
            .bearer_auth(&token)
            .timeout(PROCESSOR_TIMEOUT)
            .json(&json!({
                "plan_id": plan.id,
                "subscriber": { "email_address": req.donor_email },
            }))
            .send()
            .await
            .map_err(|e| PaymentAdapterError::network(&e))?;
        let subscription: SubscriptionResponse =
            Self::handle_response(subscription_response).await?;

        Ok(MandateOutcome {
            mandate_id: subscription.id,
            status: subscription.status,
        })
    }

    /// Revise the price/cadence of an existing subscription.
    pub async fn update_billing_subscription(
        &self,
        mandate_id: &str,
        amount_cents: i64,
        currency: Currency,
        interval_months: u32,
    ) -> std::result::Result<(), PaymentAdapterError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(format!(
                "{}/v1/billing/subscriptions/{}/revise",
                self.api_base, mandate_id
            ))
            .bearer_auth(&token)
            .timeout(PROCESSOR_TIMEOUT)
            .json(&json!({
                "plan": {
                    "billing_cycles": Self::billing_cycles(amount_cents, currency, interval_months),
                },
            }))
            .send()
            .await
            .map_err(|e| PaymentAdapterError::network(&e))?;

        if response.status().is_success() {
            return Ok(());
        }
        Self::handle_response::<serde_json::Value>(response)
            .await
            .map(|_| ())
    }

    /// Cancel a subscription. Cancellation is idempotent in effect, so infra
    /// failures are retried.
    pub async fn cancel_billing_subscription(
        &self,
        mandate_id: &str,
    ) -> std::result::Result<(), PaymentAdapterError> {
        let token = self.access_token().await?;
        with_retry("paypal cancel_billing_subscription", || async {
            let response = self
                .client
                .post(format!(
                    "{}/v1/billing/subscriptions/{}/cancel",
                    self.api_base, mandate_id
                ))
                .bearer_auth(&token)
                .timeout(PROCESSOR_TIMEOUT)
                .json(&json!({ "reason": "Cancelled by donor" }))
                .send()
                .await
                .map_err(|e| PaymentAdapterError::network(&e))?;
            if response.status().is_success() {
                return Ok(());
            }
            Self::handle_response::<serde_json::Value>(response)
                .await
                .map(|_| ())
        })
        .await
    }

    /// Verify the PayPal transmission envelope over the raw body bytes.
    ///
    /// PayPal spreads the signature over several headers: the transmission
    /// id, its timestamp, and the signature itself. The signed message is
    /// `transmission_id|transmission_time|webhook_id|sha256(body)` and the
    /// signature header carries the base64 MAC.
    pub fn verify_webhook_signature(&self, payload: &[u8], headers: &HeaderMap) -> Result<bool> {
        let transmission_id = Self::header(headers, "paypal-transmission-id")?;
        let transmission_time = Self::header(headers, "paypal-transmission-time")?;
        let transmission_sig = Self::header(headers, "paypal-transmission-sig")?;

        if let Some(algo) = headers
            .get("paypal-auth-algo")
            .and_then(|v| v.to_str().ok())
        {
            if !algo.eq_ignore_ascii_case("hmac-sha256") {
                tracing::warn!("PayPal webhook rejected: unsupported auth algo {}", algo);
                return Ok(false);
            }
        }

        let body_digest = hex::encode(Sha256::digest(payload));
        let signed_message = format!(
            "{}|{}|{}|{}",
            transmission_id, transmission_time, self.webhook_id, body_digest
        );

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| AppError::Internal("invalid webhook secret".into()))?;
        mac.update(signed_message.as_bytes());
        let expected = mac.finalize().into_bytes();

        let provided = match base64::engine::general_purpose::STANDARD.decode(transmission_sig) {
            Ok(bytes) => bytes,
            Err(_) => {
                return Err(AppError::BadRequest(
                    "invalid base64 in transmission signature".into(),
                ))
            }
        };

        if provided.len() != expected.len() {
            return Ok(false);
        }

        Ok(expected.as_slice().ct_eq(provided.as_slice()).into())
    }

    fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::BadRequest(format!("missing {} header", name)))
    }

    /// Normalize a PayPal event payload.
    pub fn parse_webhook_event(&self, payload: &[u8]) -> Result<ParsedWebhook> {
        let event: PayPalWebhookEvent = serde_json::from_slice(payload)
            .map_err(|e| AppError::BadRequest(format!("invalid PayPal webhook JSON: {}", e)))?;

        let normalized = match event.event_type.as_str() {
            "PAYMENT.CAPTURE.COMPLETED" => {
                let capture: PayPalCapture = serde_json::from_value(event.resource)?;
                NormalizedEvent::PaymentSucceeded(capture.into_payment_data())
            }
            "PAYMENT.CAPTURE.DENIED" => {
                let capture: PayPalCapture = serde_json::from_value(event.resource)?;
                let mut data = capture.into_payment_data();
                data.failure_code = Some("capture_denied".into());
                NormalizedEvent::PaymentFailed(data)
            }
            "PAYMENT.SALE.COMPLETED" => {
                // Recurring mandate charges arrive as sales tied to a
                // billing agreement.
                let sale: PayPalSale = serde_json::from_value(event.resource)?;
                NormalizedEvent::PaymentSucceeded(PaymentEventData {
                    processor_ref: sale.id,
                    gift_id: sale.custom,
                    mandate_id: sale.billing_agreement_id,
                    amount_cents: sale.amount.as_ref().and_then(|a| decimal_to_cents(&a.total)),
                    processor_fee_cents: sale
                        .transaction_fee
                        .as_ref()
                        .and_then(|f| decimal_to_cents(&f.value)),
                    failure_code: None,
                    failure_message: None,
                })
            }
            "PAYMENT.CAPTURE.REFUNDED" => {
                let refund: PayPalRefund = serde_json::from_value(event.resource)?;
                let processor_ref = refund.capture_ref().ok_or_else(|| {
                    AppError::BadRequest("refund missing capture reference".into())
                })?;
                NormalizedEvent::PaymentRefunded(RefundEventData {
                    processor_ref,
                    refund_id: refund.id,
                    amount_cents: refund
                        .amount
                        .as_ref()
                        .and_then(|a| decimal_to_cents(&a.value)),
                })
            }
            "PAYMENT.CAPTURE.REVERSED" => {
                let refund: PayPalRefund = serde_json::from_value(event.resource)?;
                let processor_ref = refund.capture_ref().ok_or_else(|| {
                    AppError::BadRequest("reversal missing capture reference".into())
                })?;
                NormalizedEvent::PaymentChargeback(RefundEventData {
                    processor_ref,
                    refund_id: refund.id,
                    amount_cents: refund
                        .amount
                        .as_ref()
                        .and_then(|a| decimal_to_cents(&a.value)),
                })
            }
            "CUSTOMER.DISPUTE.CREATED" => {
                let dispute: PayPalDispute = serde_json::from_value(event.resource)?;
                let processor_ref = dispute
                    .disputed_transactions
                    .first()
                    .map(|t| t.seller_transaction_id.clone())
                    .ok_or_else(|| {
                        AppError::BadRequest("dispute missing transaction reference".into())
                    })?;
                NormalizedEvent::PaymentDisputed(RefundEventData {
                    processor_ref,
                    refund_id: dispute.dispute_id,
                    amount_cents: dispute
                        .dispute_amount
                        .as_ref()
                        .and_then(|a| decimal_to_cents(&a.value)),
                })
            }
            "BILLING.SUBSCRIPTION.ACTIVATED" | "BILLING.SUBSCRIPTION.CREATED" => {
                let sub: PayPalSubscription = serde_json::from_value(event.resource)?;
                NormalizedEvent::MandateCreated(MandateEventData {
                    mandate_id: sub.id,
                    status: sub.status,
                })
            }
            "BILLING.SUBSCRIPTION.UPDATED" => {
                let sub: PayPalSubscription = serde_json::from_value(event.resource)?;
                NormalizedEvent::MandateUpdated(MandateEventData {
                    mandate_id: sub.id,
                    status: sub.status,
                })
            }
            "BILLING.SUBSCRIPTION.CANCELLED" => {
                let sub: PayPalSubscription = serde_json::from_value(event.resource)?;
                NormalizedEvent::MandateCancelled(MandateEventData {
                    mandate_id: sub.id,
                    status: sub.status,
                })
            }
            "BILLING.SUBSCRIPTION.PAYMENT.FAILED" => {
                let sub: PayPalSubscription = serde_json::from_value(event.resource)?;
                NormalizedEvent::MandateFailed(MandateEventData {
                    mandate_id: sub.id,
                    status: sub.status,
                })
            }
            "PAYMENT.PAYOUTSBATCH.SUCCESS" => {
                let payout: PayPalPayoutBatch = serde_json::from_value(event.resource)?;
                NormalizedEvent::PayoutPaid(PayoutEventData {
                    payout_id: payout
                        .batch_header
                        .map(|h| h.payout_batch_id)
                        .unwrap_or_else(|| event.id.clone()),
                    amount_cents: None,
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

/// Generic PayPal webhook event - resource is parsed based on event_type
#[derive(Debug, Deserialize)]
pub struct PayPalWebhookEvent {
    pub id: String,
    pub event_type: String,
    pub resource: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct PayPalAmount {
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct PayPalSaleAmount {
    pub total: String,
}

// ============ PAYMENT.CAPTURE.COMPLETED / DENIED ============

#[derive(Debug, Deserialize)]
pub struct PayPalCapture {
    pub id: String,
    pub custom_id: Option<String>,
    pub amount: Option<PayPalAmount>,
    pub seller_receivable_breakdown: Option<PayPalSellerBreakdown>,
}

#[derive(Debug, Deserialize)]
pub struct PayPalSellerBreakdown {
    pub paypal_fee: Option<PayPalAmount>,
}

impl PayPalCapture {
    fn into_payment_data(self) -> PaymentEventData {
        PaymentEventData {
            processor_ref: self.id,
            gift_id: self.custom_id,
            mandate_id: None,
            amount_cents: self.amount.as_ref().and_then(|a| decimal_to_cents(&a.value)),
            processor_fee_cents: self
                .seller_receivable_breakdown
                .as_ref()
                .and_then(|b| b.paypal_fee.as_ref())
                .and_then(|f| decimal_to_cents(&f.value)),
            failure_code: None,
            failure_message: None,
        }
    }
}

// ============ PAYMENT.SALE.COMPLETED (recurring charges) ============

#[derive(Debug, Deserialize)]
pub struct PayPalSale {
    pub id: String,
    pub custom: Option<String>,
    pub billing_agreement_id: Option<String>,
    pub amount: Option<PayPalSaleAmount>,
    pub transaction_fee: Option<PayPalAmount>,
}

// ============ PAYMENT.CAPTURE.REFUNDED / REVERSED ============

#[derive(Debug, Deserialize)]
pub struct PayPalRefund {
    pub id: String,
    pub amount: Option<PayPalAmount>,
    #[serde(default)]
    pub links: Vec<PayPalResourceLink>,
}

#[derive(Debug, Deserialize)]
pub struct PayPalResourceLink {
    pub rel: String,
    pub href: String,
}

impl PayPalRefund {
    /// The original capture id, taken from the `up` link of the refund.
    fn capture_ref(&self) -> Option<String> {
        self.links
            .iter()
            .find(|l| l.rel == "up")
            .and_then(|l| l.href.rsplit('/').next())
            .map(|s| s.to_string())
    }
}

// ============ CUSTOMER.DISPUTE.CREATED ============

#[derive(Debug, Deserialize)]
pub struct PayPalDispute {
    pub dispute_id: String,
    #[serde(default)]
    pub disputed_transactions: Vec<PayPalDisputedTransaction>,
    pub dispute_amount: Option<PayPalAmount>,
}

#[derive(Debug, Deserialize)]
pub struct PayPalDisputedTransaction {
    pub seller_transaction_id: String,
}

// ============ BILLING.SUBSCRIPTION.* ============

#[derive(Debug, Deserialize)]
pub struct PayPalSubscription {
    pub id: String,
    pub status: Option<String>,
}

// ============ PAYMENT.PAYOUTSBATCH.SUCCESS ============

#[derive(Debug, Deserialize)]
pub struct PayPalPayoutBatch {
    pub batch_header: Option<PayPalPayoutBatchHeader>,
}

#[derive(Debug, Deserialize)]
pub struct PayPalPayoutBatchHeader {
    pub payout_batch_id: String,
}
