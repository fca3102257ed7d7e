pub mod common;

pub use common::{handle_webhook, WebhookResult};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};

use crate::db::AppState;
use crate::payments::PaymentProcessor;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhooks", post(handle_any_webhook))
        .route("/webhooks/stripe", post(handle_stripe_webhook))
        .route("/webhooks/paypal", post(handle_paypal_webhook))
}

/// Single ingestion endpoint: the sending processor is identified by its
/// distinct signature header. Undetectable senders are malformed requests.
pub async fn handle_any_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    match PaymentProcessor::detect(&headers) {
        Some(processor) => handle_webhook(&state, processor, headers, body).await,
        None => (StatusCode::BAD_REQUEST, "Unknown webhook sender"),
    }
}

/// Axum handler for Stripe webhooks.
pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    handle_webhook(&state, PaymentProcessor::Stripe, headers, body).await
}

/// Axum handler for PayPal webhooks.
pub async fn handle_paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    handle_webhook(&state, PaymentProcessor::Paypal, headers, body).await
}
