//! Gift creation, confirmation, and admin refund requests.
//!
//! Creation and refund follow the call-processor-then-commit pattern: the
//! gift row exists (pending) before the intent is created so the
//! idempotency key can be derived from it, and status transitions are only
//! ever applied by the webhook dispatcher when the processor reports the
//! outcome.

use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::audit::AuditLogBuilder;
use crate::authz::Action;
use crate::db::{queries, AppState};
use crate::error::{AppError, OptionExt, Result};
use crate::extractors::{Json, Path};
use crate::models::{ActorType, AuditAction, CreateGift, Gift, GiftStatus, Receipt};
use crate::payments::CreateIntentRequest;

use super::{require_permission, validate_amount, validate_email};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/gifts", post(create_gift))
        .route("/gifts/{gift_id}", get(get_gift))
        .route("/gifts/{gift_id}/confirm", post(confirm_gift))
        .route("/gifts/{gift_id}/refund", post(refund_gift))
        .route("/gifts/{gift_id}/receipt", get(get_gift_receipt))
}

#[derive(Debug, Deserialize)]
pub struct GiftPath {
    pub gift_id: String,
}

#[derive(Debug, Serialize)]
pub struct CreateGiftResponse {
    pub gift: Gift,
    pub intent_id: String,
    /// Client-side completion token (Stripe client secret / PayPal approval URL).
    pub client_secret: String,
    /// Estimated fee the donor agreed to cover, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_amount_cents: Option<i64>,
}

/// POST /gifts
///
/// Creates a pending gift and a payment intent at the processor. The gift
/// settles when the processor's webhook reports the outcome.
pub async fn create_gift(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateGift>,
) -> Result<Json<CreateGiftResponse>> {
    require_permission(&headers, Action::CreateGift)?;
    validate_amount(input.amount_cents)?;
    validate_email(&input.donor_email)?;

    // Verify credentials exist before writing anything.
    let _ = state.processors.client(input.processor)?;

    let fee_amount_cents = if input.donor_covers_fee {
        Some(state.fees.calculate_fee(input.processor, input.amount_cents)?)
    } else {
        None
    };

    let (donor, gift) = {
        let mut conn = state.db.get()?;
        let tx = conn.transaction()?;
        let donor =
            queries::find_or_create_donor(&tx, &input.donor_email, input.donor_name.as_deref())?;
        let gift = queries::create_gift(&tx, &donor.id, &input, fee_amount_cents)?;
        tx.commit()?;
        (donor, gift)
    };

    // Processor I/O happens outside any database transaction. The
    // idempotency key is derived from the gift id, so a retried request
    // against this gift can never double-charge.
    let charge_cents = gift.amount_cents + fee_amount_cents.unwrap_or(0);
    let client = state.processors.client(gift.processor)?;
    let intent = client
        .create_payment_intent(&CreateIntentRequest {
            charge_cents,
            currency: gift.currency,
            gift_id: &gift.id,
            donor_email: &donor.email,
        })
        .await?;

    {
        let audit_conn = state.audit.get()?;
        if let Err(e) = AuditLogBuilder::new(&audit_conn, state.audit_log_enabled, &headers)
            .actor(ActorType::Donor, Some(&donor.id))
            .action(AuditAction::CreateGift)
            .resource("gift", &gift.id)
            .details(&serde_json::json!({
                "amount_cents": gift.amount_cents,
                "currency": gift.currency.as_str(),
                "donor_covers_fee": gift.donor_covers_fee,
                "fee_amount_cents": fee_amount_cents,
                "processor": gift.processor.as_str(),
                "campaign_id": gift.campaign_id,
            }))
            .save()
        {
            tracing::warn!("Failed to write gift creation audit log: {}", e);
        }
    }

    Ok(Json(CreateGiftResponse {
        gift,
        intent_id: intent.intent_id,
        client_secret: intent.client_secret,
        fee_amount_cents,
    }))
}

/// GET /gifts/{gift_id}
pub async fn get_gift(
    State(state): State<AppState>,
    Path(path): Path<GiftPath>,
) -> Result<Json<Gift>> {
    let conn = state.db.get()?;
    let gift = queries::get_gift_by_id(&conn, &path.gift_id)?.or_not_found("gift")?;
    Ok(Json(gift))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmGiftRequest {
    pub intent_id: String,
    pub payment_method_token: String,
}

#[derive(Debug, Serialize)]
pub struct ConfirmGiftResponse {
    pub status: String,
}

/// POST /gifts/{gift_id}/confirm
///
/// Pass-through confirmation for processors that require it; auto-confirm
/// processors report success without effect. The status transition still
/// arrives via webhook.
pub async fn confirm_gift(
    State(state): State<AppState>,
    Path(path): Path<GiftPath>,
    Json(input): Json<ConfirmGiftRequest>,
) -> Result<Json<ConfirmGiftResponse>> {
    let gift = {
        let conn = state.db.get()?;
        queries::get_gift_by_id(&conn, &path.gift_id)?.or_not_found("gift")?
    };

    if gift.status != GiftStatus::Pending {
        return Err(AppError::Conflict(format!(
            "gift {} is not awaiting confirmation",
            gift.id
        )));
    }

    let client = state.processors.client(gift.processor)?;
    let outcome = client
        .confirm_payment(&input.intent_id, &input.payment_method_token)
        .await?;

    Ok(Json(ConfirmGiftResponse {
        status: outcome.status,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundGiftRequest {
    /// Partial refund amount; omitted = full refund.
    #[serde(default)]
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RefundGiftResponse {
    pub refund_id: String,
    pub status: String,
    /// Snapshot at request time; the refunded status lands via webhook.
    pub gift: Gift,
}

/// POST /gifts/{gift_id}/refund
///
/// Admin/finance action. The refund is requested at the processor here;
/// the local `success -> refunded` transition is applied when the
/// processor's refund webhook arrives and closes the loop.
pub async fn refund_gift(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<GiftPath>,
    Json(input): Json<RefundGiftRequest>,
) -> Result<Json<RefundGiftResponse>> {
    let role = require_permission(&headers, Action::RefundGift)?;

    let gift = {
        let conn = state.db.get()?;
        queries::get_gift_by_id(&conn, &path.gift_id)?.or_not_found("gift")?
    };

    if gift.status != GiftStatus::Success {
        return Err(AppError::Conflict(format!(
            "gift {} is not settled and cannot be refunded",
            gift.id
        )));
    }

    let processor_ref = gift
        .processor_ref
        .clone()
        .ok_or_else(|| AppError::Internal(format!("settled gift {} has no processor ref", gift.id)))?;

    if let Some(amount) = input.amount_cents {
        if amount <= 0 || amount > gift.amount_cents {
            return Err(AppError::BadRequest(
                "refund amount must be positive and at most the gift amount".into(),
            ));
        }
    }

    let client = state.processors.client(gift.processor)?;
    let refund = client
        .refund_payment(&processor_ref, input.amount_cents, gift.currency)
        .await?;

    {
        let audit_conn = state.audit.get()?;
        if let Err(e) = AuditLogBuilder::new(&audit_conn, state.audit_log_enabled, &headers)
            .actor(ActorType::Admin, None)
            .action(AuditAction::RequestRefund)
            .resource("gift", &gift.id)
            .details(&serde_json::json!({
                "refund_id": refund.refund_id,
                "amount_cents": input.amount_cents,
                "role": role.as_ref(),
            }))
            .save()
        {
            tracing::warn!("Failed to write refund request audit log: {}", e);
        }
    }

    Ok(Json(RefundGiftResponse {
        refund_id: refund.refund_id,
        status: refund.status,
        gift,
    }))
}

/// GET /gifts/{gift_id}/receipt
pub async fn get_gift_receipt(
    State(state): State<AppState>,
    Path(path): Path<GiftPath>,
) -> Result<Json<Receipt>> {
    let conn = state.db.get()?;
    // Ensure the gift exists (and isn't soft-deleted) before receipt lookup.
    queries::get_gift_by_id(&conn, &path.gift_id)?.or_not_found("gift")?;
    let receipt = queries::get_receipt_by_gift(&conn, &path.gift_id)?.or_not_found("receipt")?;
    Ok(Json(receipt))
}
