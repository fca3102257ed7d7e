//! Webhook dispatcher.
//!
//! Strictly ordered gates, each a precondition of the next:
//!
//! 1. processor detection (distinct signature header per processor)
//! 2. signature verification over the raw body bytes
//! 3. payload normalization
//! 4. idempotency claim: atomic insert into the webhook_events ledger
//! 5. routing to the donation / recurring state machine, in one database
//!    transaction that also marks the ledger row processed
//! 6. on error, the whole transaction rolls back — including the claim —
//!    and a 5xx asks the processor to redeliver
//!
//! Duplicate deliveries fail the claim insert and return 200 without
//! reprocessing, which makes redelivery storms safe and cheap.

use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
};
use rusqlite::Connection;

use crate::audit::AuditLogBuilder;
use crate::db::{queries, AppState};
use crate::donations::{self, Settlement, Transition};
use crate::error::AppError;
use crate::models::{ActorType, AuditAction, Gift, GiftStatus, RecurringPlan};
use crate::notify::{spawn_notification, NotificationEvent};
use crate::payments::{
    NormalizedEvent, ParsedWebhook, PaymentEventData, PaymentProcessor, RefundEventData,
};
use crate::recurring::{self, DunningOutcome, PlanTransition};

/// Result type for webhook operations.
pub type WebhookResult = (StatusCode, &'static str);

/// Effect applied by routing an event, used for post-commit audit and
/// notification fan-out.
enum Applied {
    Settled(Gift),
    Failed(Gift),
    Refunded { gift: Gift, source: RefundSource },
    RecurringCharge { plan: RecurringPlan, gift: Gift },
    MandateSynced { plan: RecurringPlan, action: AuditAction },
    DunningCounted { plan: RecurringPlan, attempts: u32 },
    DunningPaused(RecurringPlan),
    Payout(String),
    /// Replay, ordering race, unknown event type, or unmatched reference.
    NoEffect(&'static str),
}

#[derive(Debug, Clone, Copy)]
enum RefundSource {
    Refund,
    Dispute,
    Chargeback,
}

impl RefundSource {
    fn audit_action(self) -> AuditAction {
        match self {
            RefundSource::Refund => AuditAction::RefundGift,
            RefundSource::Dispute => AuditAction::DisputeGift,
            RefundSource::Chargeback => AuditAction::ChargebackGift,
        }
    }
}

/// Entry point shared by the detection endpoint and the per-processor
/// routes.
pub async fn handle_webhook(
    state: &AppState,
    processor: PaymentProcessor,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult {
    let client = match state.processors.client(processor) {
        Ok(c) => c,
        Err(_) => {
            tracing::warn!("webhook received for unconfigured processor {}", processor);
            return (StatusCode::BAD_REQUEST, "Processor not configured");
        }
    };

    // Gate 2: signature over raw bytes, before any parsing. On failure we
    // log nothing of the payload.
    match client.verify_webhook_signature(&body, &headers) {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!("{} webhook rejected: invalid signature", processor);
            return (StatusCode::UNAUTHORIZED, "Invalid signature");
        }
        Err(e) => {
            tracing::warn!("{} webhook rejected: {}", processor, e);
            return (StatusCode::BAD_REQUEST, "Invalid signature header");
        }
    }

    // Gate 3: normalize.
    let parsed = match client.parse_webhook_event(&body) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("{} webhook parse failure: {}", processor, e);
            return (StatusCode::BAD_REQUEST, "Invalid payload");
        }
    };

    let mut conn = match state.db.get() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("DB connection error: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    };

    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => {
            tracing::error!("Failed to start transaction: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    };

    // Gate 4: idempotency claim. The unique constraint is the only
    // serialization point; a lost race means someone else owns the event.
    let payload_text = String::from_utf8_lossy(&body);
    match queries::try_claim_webhook_event(
        &tx,
        processor,
        &parsed.external_id,
        &parsed.event_type,
        &payload_text,
    ) {
        Ok(true) => {}
        Ok(false) => {
            return (StatusCode::OK, "Already processed");
        }
        Err(e) => {
            tracing::error!("Failed to claim webhook event: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    }

    // Gate 5: route inside the claim's transaction.
    let applied = match route_event(&tx, state, processor, &parsed) {
        Ok(applied) => applied,
        Err(AppError::Conflict(msg)) => {
            // Integrity alarm: two different terminal claims for one gift.
            // The claim is committed so redelivery doesn't re-alarm, the
            // conflict is recorded durably, and the response is 409.
            if let Err(e) = queries::mark_webhook_processed(&tx, processor, &parsed.external_id) {
                tracing::error!("Failed to mark conflicted event: {}", e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Database error");
            }
            if let Err(e) = tx.commit() {
                tracing::error!("Failed to commit conflict claim: {}", e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Database error");
            }
            audit_conflict(state, processor, &parsed, &msg);
            return (StatusCode::CONFLICT, "Conflicting terminal state");
        }
        Err(e) => {
            // Gate 6: rollback on drop releases the idempotency claim so
            // the processor's redelivery can retry legitimately.
            tracing::error!("{} webhook processing failed: {}", processor, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Processing failed");
        }
    };

    if let Err(e) = queries::mark_webhook_processed(&tx, processor, &parsed.external_id) {
        tracing::error!("Failed to mark webhook processed: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "Database error");
    }

    if let Err(e) = tx.commit() {
        tracing::error!("Failed to commit webhook transaction: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "Database error");
    }

    // Post-commit side effects: audit trail and donor notifications.
    // Failures here are logged, never turned into a retryable response —
    // the business effect is already durable.
    finish(state, processor, &parsed, applied)
}

/// Route a normalized event to the owning state machine. Every mutation
/// happens against `tx`, the dispatcher's transaction.
fn route_event(
    tx: &Connection,
    state: &AppState,
    processor: PaymentProcessor,
    parsed: &ParsedWebhook,
) -> crate::error::Result<Applied> {
    match &parsed.event {
        NormalizedEvent::PaymentSucceeded(data) => match &data.mandate_id {
            Some(mandate_id) => route_recurring_charge(tx, state, processor, mandate_id, data),
            None => route_gift_success(tx, state, processor, data),
        },
        NormalizedEvent::PaymentFailed(data) => {
            let Some(gift) = lookup_gift(tx, processor, data)? else {
                tracing::warn!("no gift found for {} failure event", processor);
                return Ok(Applied::NoEffect("Gift not found"));
            };
            match donations::apply_failure(tx, &gift.id, Some(&data.processor_ref))? {
                Transition::Applied(gift) => Ok(Applied::Failed(gift)),
                Transition::NoOp(_) => Ok(Applied::NoEffect("Already in terminal state")),
            }
        }
        NormalizedEvent::PaymentRefunded(data) => {
            route_refund(tx, processor, data, RefundSource::Refund)
        }
        NormalizedEvent::PaymentDisputed(data) => {
            route_refund(tx, processor, data, RefundSource::Dispute)
        }
        NormalizedEvent::PaymentChargeback(data) => {
            route_refund(tx, processor, data, RefundSource::Chargeback)
        }
        NormalizedEvent::MandateCreated(data) => {
            match queries::get_plan_by_mandate(tx, processor, &data.mandate_id)? {
                Some(plan) => Ok(Applied::MandateSynced {
                    plan,
                    action: AuditAction::SyncMandate,
                }),
                // Mandates are established before the plan record exists,
                // so an unmatched creation event is expected.
                None => Ok(Applied::NoEffect("No plan for mandate yet")),
            }
        }
        NormalizedEvent::MandateUpdated(data) => {
            match queries::get_plan_by_mandate(tx, processor, &data.mandate_id)? {
                Some(plan) => Ok(Applied::MandateSynced {
                    plan,
                    action: AuditAction::SyncMandate,
                }),
                None => Ok(Applied::NoEffect("Plan not found for mandate")),
            }
        }
        NormalizedEvent::MandateCancelled(data) => {
            let Some(plan) = queries::get_plan_by_mandate(tx, processor, &data.mandate_id)? else {
                return Ok(Applied::NoEffect("Plan not found for mandate"));
            };
            match recurring::sync_mandate_cancelled(tx, &plan.id)? {
                PlanTransition::Applied(plan) => Ok(Applied::MandateSynced {
                    plan,
                    action: AuditAction::CancelPlan,
                }),
                PlanTransition::NoOp(_) => Ok(Applied::NoEffect("Plan already cancelled")),
            }
        }
        NormalizedEvent::MandateFailed(data) => {
            let Some(plan) = queries::get_plan_by_mandate(tx, processor, &data.mandate_id)? else {
                return Ok(Applied::NoEffect("Plan not found for mandate"));
            };
            match recurring::record_failed_charge(tx, &plan.id, state.dunning_max_attempts)? {
                DunningOutcome::Counted { attempts, plan } => {
                    Ok(Applied::DunningCounted { plan, attempts })
                }
                DunningOutcome::AutoPaused(plan) => Ok(Applied::DunningPaused(plan)),
                DunningOutcome::NoOp(_) => Ok(Applied::NoEffect("Plan not active")),
            }
        }
        NormalizedEvent::PayoutPaid(data) => Ok(Applied::Payout(data.payout_id.clone())),
        NormalizedEvent::Unknown { event_type } => {
            tracing::debug!("{} webhook ignored: {}", processor, event_type);
            Ok(Applied::NoEffect("Event ignored"))
        }
    }
}

fn lookup_gift(
    tx: &Connection,
    processor: PaymentProcessor,
    data: &PaymentEventData,
) -> crate::error::Result<Option<Gift>> {
    if let Some(gift_id) = &data.gift_id {
        if let Some(gift) = queries::get_gift_by_id(tx, gift_id)? {
            return Ok(Some(gift));
        }
    }
    queries::get_gift_by_processor_ref(tx, processor, &data.processor_ref)
}

fn route_gift_success(
    tx: &Connection,
    state: &AppState,
    processor: PaymentProcessor,
    data: &PaymentEventData,
) -> crate::error::Result<Applied> {
    let Some(gift) = lookup_gift(tx, processor, data)? else {
        tracing::warn!("no gift found for {} settlement event", processor);
        return Ok(Applied::NoEffect("Gift not found"));
    };

    let settlement = Settlement {
        processor_ref: data.processor_ref.clone(),
        processor_fee_cents: data.processor_fee_cents,
    };

    match donations::apply_success(tx, &state.fees, &gift.id, &settlement)? {
        Transition::Applied(gift) => Ok(Applied::Settled(gift)),
        Transition::NoOp(_) => Ok(Applied::NoEffect("Already settled")),
    }
}

fn route_recurring_charge(
    tx: &Connection,
    state: &AppState,
    processor: PaymentProcessor,
    mandate_id: &str,
    data: &PaymentEventData,
) -> crate::error::Result<Applied> {
    let Some(plan) = queries::get_plan_by_mandate(tx, processor, mandate_id)? else {
        tracing::warn!("no plan found for {} mandate charge", processor);
        return Ok(Applied::NoEffect("Plan not found for mandate"));
    };

    let settlement = Settlement {
        processor_ref: data.processor_ref.clone(),
        processor_fee_cents: data.processor_fee_cents,
    };

    match donations::record_recurring_charge(tx, &state.fees, &plan, &settlement)? {
        Some(gift) => {
            let plan = recurring::record_successful_charge(tx, &plan.id)?;
            Ok(Applied::RecurringCharge { plan, gift })
        }
        // A gift for this charge reference already exists; the schedule was
        // already advanced when it was recorded.
        None => Ok(Applied::NoEffect("Charge already recorded")),
    }
}

fn route_refund(
    tx: &Connection,
    processor: PaymentProcessor,
    data: &RefundEventData,
    source: RefundSource,
) -> crate::error::Result<Applied> {
    let Some(gift) = queries::get_gift_by_processor_ref(tx, processor, &data.processor_ref)?
    else {
        tracing::warn!("no gift found for {} refund event", processor);
        return Ok(Applied::NoEffect("Gift not found"));
    };

    match donations::apply_refund(tx, &gift.id)? {
        Transition::Applied(gift) => Ok(Applied::Refunded { gift, source }),
        Transition::NoOp(_) => Ok(Applied::NoEffect("Not refundable in current state")),
    }
}

/// Post-commit audit entries and notifications for an applied effect.
fn finish(
    state: &AppState,
    processor: PaymentProcessor,
    parsed: &ParsedWebhook,
    applied: Applied,
) -> WebhookResult {
    let audit_conn = match state.audit.get() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Audit DB connection error: {}", e);
            // The business effect is committed; report success regardless.
            return (StatusCode::OK, "OK");
        }
    };

    let base = |action: AuditAction, resource_type: &'static str, resource_id: &str, details: &serde_json::Value| {
        if let Err(e) = AuditLogBuilder::system(&audit_conn, state.audit_log_enabled)
            .actor(ActorType::Processor, Some(processor.as_str()))
            .action(action)
            .resource(resource_type, resource_id)
            .details(details)
            .save()
        {
            tracing::warn!("Failed to write webhook audit log: {}", e);
        }
    };

    match applied {
        Applied::Settled(gift) => {
            base(
                AuditAction::SettleGift,
                "gift",
                &gift.id,
                &serde_json::json!({
                    "event_id": parsed.external_id,
                    "event_type": parsed.event_type,
                    "status_before": GiftStatus::Pending.as_ref(),
                    "status_after": gift.status.as_ref(),
                    "processor_fee_cents": gift.processor_fee_cents,
                    "net_amount_cents": gift.net_amount_cents,
                }),
            );
            spawn_notification(
                state.http_client.clone(),
                state.notify_webhook_url.clone(),
                NotificationEvent::new("receipt_issued", "gift", &gift.id, &gift.donor_id)
                    .amount(gift.amount_cents),
            );
        }
        Applied::Failed(gift) => {
            base(
                AuditAction::FailGift,
                "gift",
                &gift.id,
                &serde_json::json!({
                    "event_id": parsed.external_id,
                    "event_type": parsed.event_type,
                    "status_before": GiftStatus::Pending.as_ref(),
                    "status_after": gift.status.as_ref(),
                }),
            );
        }
        Applied::Refunded { gift, source } => {
            base(
                source.audit_action(),
                "gift",
                &gift.id,
                &serde_json::json!({
                    "event_id": parsed.external_id,
                    "event_type": parsed.event_type,
                    "status_before": GiftStatus::Success.as_ref(),
                    "status_after": gift.status.as_ref(),
                }),
            );
            spawn_notification(
                state.http_client.clone(),
                state.notify_webhook_url.clone(),
                NotificationEvent::new("gift_refunded", "gift", &gift.id, &gift.donor_id)
                    .amount(gift.amount_cents),
            );
        }
        Applied::RecurringCharge { plan, gift } => {
            base(
                AuditAction::RecordPlanCharge,
                "plan",
                &plan.id,
                &serde_json::json!({
                    "event_id": parsed.external_id,
                    "event_type": parsed.event_type,
                    "gift_id": gift.id,
                    "net_amount_cents": gift.net_amount_cents,
                    "next_charge_date": plan.next_charge_date,
                }),
            );
            spawn_notification(
                state.http_client.clone(),
                state.notify_webhook_url.clone(),
                NotificationEvent::new("receipt_issued", "gift", &gift.id, &gift.donor_id)
                    .amount(gift.amount_cents),
            );
        }
        Applied::MandateSynced { plan, action } => {
            base(
                action,
                "plan",
                &plan.id,
                &serde_json::json!({
                    "event_id": parsed.external_id,
                    "event_type": parsed.event_type,
                    "status": plan.status.as_ref(),
                }),
            );
        }
        Applied::DunningCounted { plan, attempts } => {
            base(
                AuditAction::RecordChargeFailure,
                "plan",
                &plan.id,
                &serde_json::json!({
                    "event_id": parsed.external_id,
                    "event_type": parsed.event_type,
                    "failed_attempts": attempts,
                }),
            );
        }
        Applied::DunningPaused(plan) => {
            base(
                AuditAction::DunningPause,
                "plan",
                &plan.id,
                &serde_json::json!({
                    "event_id": parsed.external_id,
                    "event_type": parsed.event_type,
                    "failed_attempts": plan.failed_attempts,
                    "status_after": plan.status.as_ref(),
                }),
            );
            spawn_notification(
                state.http_client.clone(),
                state.notify_webhook_url.clone(),
                NotificationEvent::new("plan_dunning_paused", "plan", &plan.id, &plan.donor_id),
            );
        }
        Applied::Payout(payout_id) => {
            base(
                AuditAction::RecordPayout,
                "payout",
                &payout_id,
                &serde_json::json!({
                    "event_id": parsed.external_id,
                    "event_type": parsed.event_type,
                }),
            );
        }
        Applied::NoEffect(note) => {
            return (StatusCode::OK, note);
        }
    }

    (StatusCode::OK, "OK")
}

fn audit_conflict(
    state: &AppState,
    processor: PaymentProcessor,
    parsed: &ParsedWebhook,
    message: &str,
) {
    let Ok(audit_conn) = state.audit.get() else {
        tracing::error!("Audit DB unavailable for conflict record");
        return;
    };
    if let Err(e) = AuditLogBuilder::system(&audit_conn, state.audit_log_enabled)
        .actor(ActorType::Processor, Some(processor.as_str()))
        .action(AuditAction::SettleGift)
        .resource("webhook_event", &parsed.external_id)
        .details(&serde_json::json!({
            "integrity_conflict": true,
            "event_type": parsed.event_type,
            "message": message,
        }))
        .save()
    {
        tracing::warn!("Failed to write conflict audit log: {}", e);
    }
}
