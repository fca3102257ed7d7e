//! Donation (gift) state machine.
//!
//! Legal transitions: `pending -> success`, `pending -> failed`,
//! `success -> refunded`. Anything else is an ordering race from
//! at-least-once webhook delivery and resolves to a no-op returning the
//! unchanged gift — with one exception: a success event carrying a
//! *different* processor reference than the one already recorded is a data
//! integrity conflict and is surfaced, never silently accepted.
//!
//! Every function here must run inside the caller's transaction; the
//! webhook dispatcher holds one that also covers the idempotency claim.

use rusqlite::Connection;

use crate::db::queries;
use crate::error::{AppError, OptionExt, Result};
use crate::fees::{compute_net_amount, FeeCalculator};
use crate::models::{Gift, GiftStatus, RecurringPlan};

/// Settlement facts carried by a `payment.succeeded` webhook.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub processor_ref: String,
    /// Actual fee charged by the processor. Absent on events that don't
    /// carry fee breakdowns; the pre-charge estimate is used instead.
    pub processor_fee_cents: Option<i64>,
}

/// Outcome of applying a webhook-driven transition.
#[derive(Debug)]
pub enum Transition {
    /// The transition was applied and the gift mutated.
    Applied(Gift),
    /// The event was a replay or arrived out of order; nothing changed.
    NoOp(Gift),
}

impl Transition {
    pub fn gift(&self) -> &Gift {
        match self {
            Transition::Applied(g) | Transition::NoOp(g) => g,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

fn conflicting_ref(gift: &Gift, incoming_ref: &str) -> AppError {
    tracing::error!(
        "integrity conflict: gift {} in status {} has processor_ref {:?} but success event carries {}",
        gift.id,
        gift.status.as_ref(),
        gift.processor_ref,
        incoming_ref
    );
    AppError::Conflict(format!(
        "gift {} already settled with a different processor reference",
        gift.id
    ))
}

/// Apply `pending -> success`.
///
/// Sets the processor reference, the actual settled fee, the authoritative
/// net amount, and issues the receipt — exactly once, guarded inside the
/// same transaction.
pub fn apply_success(
    conn: &Connection,
    fees: &FeeCalculator,
    gift_id: &str,
    settlement: &Settlement,
) -> Result<Transition> {
    let gift = queries::get_gift_by_id(conn, gift_id)?.or_not_found("gift")?;

    match gift.status {
        GiftStatus::Pending => {
            let processor_fee = match settlement.processor_fee_cents {
                Some(fee) => fee,
                // Estimate fallback for processors that don't put the fee
                // breakdown on the event.
                None => match gift.fee_amount_cents {
                    Some(estimate) => estimate,
                    None => fees.calculate_fee(gift.processor, gift.amount_cents)?,
                },
            };
            let net = compute_net_amount(gift.amount_cents, processor_fee, gift.donor_covers_fee);
            let completed_at = chrono::Utc::now().timestamp();

            queries::settle_gift(
                conn,
                &gift.id,
                &settlement.processor_ref,
                processor_fee,
                net,
                completed_at,
            )?;

            let settled = queries::get_gift_by_id(conn, &gift.id)?.or_not_found("gift")?;

            if !queries::receipt_exists_for_gift(conn, &settled.id)? {
                queries::create_receipt(conn, &settled, completed_at)?;
            }

            tracing::info!(
                "gift settled: id={}, processor_ref={}, fee={}, net={}",
                settled.id,
                settlement.processor_ref,
                processor_fee,
                net
            );

            Ok(Transition::Applied(settled))
        }
        GiftStatus::Success => match gift.processor_ref.as_deref() {
            Some(existing) if existing == settlement.processor_ref => {
                Ok(Transition::NoOp(gift))
            }
            Some(_) => Err(conflicting_ref(&gift, &settlement.processor_ref)),
            None => Ok(Transition::NoOp(gift)),
        },
        GiftStatus::Failed | GiftStatus::Refunded => match gift.processor_ref.as_deref() {
            Some(existing) if existing != settlement.processor_ref => {
                Err(conflicting_ref(&gift, &settlement.processor_ref))
            }
            _ => Ok(Transition::NoOp(gift)),
        },
    }
}

/// Apply `pending -> failed`. Records the processor reference when the
/// event carries one; failed gifts get no receipt.
pub fn apply_failure(
    conn: &Connection,
    gift_id: &str,
    processor_ref: Option<&str>,
) -> Result<Transition> {
    let gift = queries::get_gift_by_id(conn, gift_id)?.or_not_found("gift")?;

    match gift.status {
        GiftStatus::Pending => {
            queries::fail_gift(conn, &gift.id, processor_ref)?;
            let failed = queries::get_gift_by_id(conn, &gift.id)?.or_not_found("gift")?;
            tracing::info!("gift failed: id={}, processor_ref={:?}", failed.id, processor_ref);
            Ok(Transition::Applied(failed))
        }
        // A failure event after a terminal state is a late or replayed
        // delivery; the recorded outcome stands.
        GiftStatus::Failed | GiftStatus::Success | GiftStatus::Refunded => {
            Ok(Transition::NoOp(gift))
        }
    }
}

/// Apply `success -> refunded`.
///
/// The receipt is deliberately left untouched: a refund does not
/// retroactively void a tax receipt, that reconciliation is a downstream
/// tax-year concern.
pub fn apply_refund(conn: &Connection, gift_id: &str) -> Result<Transition> {
    let gift = queries::get_gift_by_id(conn, gift_id)?.or_not_found("gift")?;

    match gift.status {
        GiftStatus::Success => {
            let refunded_at = chrono::Utc::now().timestamp();
            queries::refund_gift(conn, &gift.id, refunded_at)?;
            let refunded = queries::get_gift_by_id(conn, &gift.id)?.or_not_found("gift")?;
            tracing::info!("gift refunded: id={}", refunded.id);
            Ok(Transition::Applied(refunded))
        }
        GiftStatus::Refunded | GiftStatus::Pending | GiftStatus::Failed => {
            Ok(Transition::NoOp(gift))
        }
    }
}

/// Record a settled gift produced by a recurring plan charge.
///
/// Returns `None` when a gift for this processor reference already exists
/// (replayed charge notification). The receipt is issued in the same
/// transaction, like any other settlement.
pub fn record_recurring_charge(
    conn: &Connection,
    fees: &FeeCalculator,
    plan: &RecurringPlan,
    settlement: &Settlement,
) -> Result<Option<Gift>> {
    if queries::get_gift_by_processor_ref(conn, plan.processor, &settlement.processor_ref)?
        .is_some()
    {
        return Ok(None);
    }

    let processor_fee = match settlement.processor_fee_cents {
        Some(fee) => fee,
        None => fees.calculate_fee(plan.processor, plan.amount_cents)?,
    };
    let net = compute_net_amount(plan.amount_cents, processor_fee, plan.donor_covers_fee);
    let completed_at = chrono::Utc::now().timestamp();

    let gift = queries::create_settled_plan_gift(
        conn,
        &queries::NewPlanChargeGift {
            plan,
            processor_ref: &settlement.processor_ref,
            processor_fee_cents: processor_fee,
            net_amount_cents: net,
            completed_at,
        },
    )?;

    if !queries::receipt_exists_for_gift(conn, &gift.id)? {
        queries::create_receipt(conn, &gift, completed_at)?;
    }

    tracing::info!(
        "recurring charge recorded: plan={}, gift={}, net={}",
        plan.id,
        gift.id,
        net
    );

    Ok(Some(gift))
}
