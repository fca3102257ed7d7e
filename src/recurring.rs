//! Recurring plan state machine.
//!
//! `active <-> paused`, and `active|paused -> cancelled` (terminal,
//! never reversed — a new plan must be created to resume giving).
//!
//! Pausing is a local scheduling decision: the next charge is simply
//! skipped, the external mandate is untouched. Cancellation and term
//! updates contact the processor *before* the local transition commits;
//! a processor-side failure must leave the local record unchanged. The
//! reverse inconsistency (cancelled at the processor but not locally)
//! self-heals through the `mandate.cancelled` webhook.

use chrono::Months;
use rusqlite::Connection;

use crate::db::{queries, AppState};
use crate::error::{AppError, OptionExt, Result};
use crate::models::{Frequency, PlanStatus, RecurringPlan, UpdateRecurringPlan};

/// Deterministic next charge date: `from + 1 month | 3 months | 1 year`.
pub fn next_charge_date(frequency: Frequency, from_ts: i64) -> Result<i64> {
    let from = chrono::DateTime::<chrono::Utc>::from_timestamp(from_ts, 0)
        .ok_or_else(|| AppError::Internal("timestamp out of range".into()))?;
    let next = from
        .checked_add_months(Months::new(frequency.interval_months()))
        .ok_or_else(|| AppError::Internal("next charge date overflow".into()))?;
    Ok(next.timestamp())
}

/// Outcome of a plan transition.
#[derive(Debug)]
pub enum PlanTransition {
    Applied(RecurringPlan),
    NoOp(RecurringPlan),
}

impl PlanTransition {
    pub fn plan(&self) -> &RecurringPlan {
        match self {
            PlanTransition::Applied(p) | PlanTransition::NoOp(p) => p,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, PlanTransition::Applied(_))
    }
}

/// Dunning outcome for a failed mandate charge.
#[derive(Debug)]
pub enum DunningOutcome {
    /// Failure counted; plan still active.
    Counted { attempts: u32, plan: RecurringPlan },
    /// Retry budget exhausted; plan auto-paused so the donor can update
    /// their payment method and resume, rather than losing the mandate.
    AutoPaused(RecurringPlan),
    /// Plan not active; nothing to count.
    NoOp(RecurringPlan),
}

/// `active -> paused`. Local only; does not touch the mandate.
pub fn pause(conn: &Connection, plan_id: &str) -> Result<PlanTransition> {
    let plan = queries::get_plan_by_id(conn, plan_id)?.or_not_found("plan")?;
    match plan.status {
        PlanStatus::Active => {
            queries::pause_plan(conn, &plan.id, chrono::Utc::now().timestamp())?;
            let paused = queries::get_plan_by_id(conn, &plan.id)?.or_not_found("plan")?;
            tracing::info!("plan paused: id={}", paused.id);
            Ok(PlanTransition::Applied(paused))
        }
        PlanStatus::Paused => Ok(PlanTransition::NoOp(plan)),
        PlanStatus::Cancelled => Err(AppError::Conflict(format!(
            "plan {} is cancelled and cannot be paused",
            plan.id
        ))),
    }
}

/// `paused -> active`. Recomputes the next charge date from now so the
/// skipped window is not retro-charged.
pub fn resume(conn: &Connection, plan_id: &str) -> Result<PlanTransition> {
    let plan = queries::get_plan_by_id(conn, plan_id)?.or_not_found("plan")?;
    match plan.status {
        PlanStatus::Paused => {
            let next = next_charge_date(plan.frequency, chrono::Utc::now().timestamp())?;
            queries::resume_plan(conn, &plan.id, next)?;
            let resumed = queries::get_plan_by_id(conn, &plan.id)?.or_not_found("plan")?;
            tracing::info!("plan resumed: id={}, next_charge={}", resumed.id, next);
            Ok(PlanTransition::Applied(resumed))
        }
        PlanStatus::Active => Ok(PlanTransition::NoOp(plan)),
        PlanStatus::Cancelled => Err(AppError::Conflict(format!(
            "plan {} is cancelled and cannot be resumed",
            plan.id
        ))),
    }
}

/// Cancel a plan: cancel the mandate at the processor, then commit the
/// terminal state locally. Ordering matters — a local-only cancellation
/// with a still-live external mandate keeps charging the donor.
pub async fn cancel(state: &AppState, plan_id: &str) -> Result<RecurringPlan> {
    let plan = {
        let conn = state.db.get()?;
        queries::get_plan_by_id(&conn, plan_id)?.or_not_found("plan")?
    };

    if plan.status == PlanStatus::Cancelled {
        return Ok(plan);
    }

    // Blocking processor I/O happens outside any database transaction.
    let client = state.processors.client(plan.processor)?;
    client.cancel_recurring_mandate(&plan.mandate_id).await?;

    let conn = state.db.get()?;
    queries::cancel_plan(&conn, &plan.id, chrono::Utc::now().timestamp())?;
    let cancelled = queries::get_plan_by_id(&conn, &plan.id)?.or_not_found("plan")?;
    tracing::info!("plan cancelled: id={}, mandate={}", cancelled.id, cancelled.mandate_id);
    Ok(cancelled)
}

/// Update amount/frequency: revise the mandate at the processor first,
/// then commit the new terms with a refreshed fee estimate and — when the
/// frequency changed — a recomputed next charge date.
pub async fn update_terms(
    state: &AppState,
    plan_id: &str,
    changes: &UpdateRecurringPlan,
) -> Result<RecurringPlan> {
    let plan = {
        let conn = state.db.get()?;
        queries::get_plan_by_id(&conn, plan_id)?.or_not_found("plan")?
    };

    if plan.status == PlanStatus::Cancelled {
        return Err(AppError::Conflict(format!(
            "plan {} is cancelled and cannot be updated",
            plan.id
        )));
    }

    let amount_cents = changes.amount_cents.unwrap_or(plan.amount_cents);
    let frequency = changes.frequency.unwrap_or(plan.frequency);

    if amount_cents == plan.amount_cents && frequency == plan.frequency {
        return Ok(plan);
    }

    let client = state.processors.client(plan.processor)?;
    client
        .update_recurring_mandate(
            &plan.mandate_id,
            amount_cents,
            plan.currency,
            frequency.interval_months(),
        )
        .await?;

    let fee_amount_cents = state.fees.calculate_fee(plan.processor, amount_cents)?;
    let next = if frequency != plan.frequency {
        let base = plan
            .last_charged_at
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        next_charge_date(frequency, base)?
    } else {
        plan.next_charge_date
    };

    let conn = state.db.get()?;
    queries::update_plan_terms(&conn, &plan.id, amount_cents, frequency, fee_amount_cents, next)?;
    let updated = queries::get_plan_by_id(&conn, &plan.id)?.or_not_found("plan")?;
    tracing::info!(
        "plan updated: id={}, amount={}, frequency={}, next_charge={}",
        updated.id,
        amount_cents,
        frequency.as_ref(),
        next
    );
    Ok(updated)
}

/// Record a successful mandate charge: reset the dunning counter and
/// advance the next charge date deterministically from the charge time.
pub fn record_successful_charge(conn: &Connection, plan_id: &str) -> Result<RecurringPlan> {
    let plan = queries::get_plan_by_id(conn, plan_id)?.or_not_found("plan")?;
    let charged_at = chrono::Utc::now().timestamp();
    let next = next_charge_date(plan.frequency, charged_at)?;
    queries::record_plan_charge_success(conn, &plan.id, charged_at, next)?;
    queries::get_plan_by_id(conn, &plan.id)?.or_not_found("plan")
}

/// Dunning: count a failed mandate charge; auto-pause (never cancel) once
/// the configured budget is exhausted, preserving the donor's option to
/// fix their card and resume.
pub fn record_failed_charge(
    conn: &Connection,
    plan_id: &str,
    max_attempts: u32,
) -> Result<DunningOutcome> {
    let plan = queries::get_plan_by_id(conn, plan_id)?.or_not_found("plan")?;

    if plan.status != PlanStatus::Active {
        return Ok(DunningOutcome::NoOp(plan));
    }

    let attempts = queries::increment_plan_failed_attempts(conn, &plan.id)?;
    if attempts >= max_attempts {
        queries::pause_plan(conn, &plan.id, chrono::Utc::now().timestamp())?;
        let paused = queries::get_plan_by_id(conn, &plan.id)?.or_not_found("plan")?;
        tracing::warn!(
            "plan auto-paused after {} failed charges: id={}",
            attempts,
            paused.id
        );
        return Ok(DunningOutcome::AutoPaused(paused));
    }

    tracing::info!(
        "plan charge failure counted: id={}, attempts={}/{}",
        plan.id,
        attempts,
        max_attempts
    );
    let plan = queries::get_plan_by_id(conn, plan_id)?.or_not_found("plan")?;
    Ok(DunningOutcome::Counted { attempts, plan })
}

/// The processor reports the mandate as cancelled. A plan already
/// cancelled locally is a no-op; otherwise the local record heals to match
/// the processor's terminal state.
pub fn sync_mandate_cancelled(conn: &Connection, plan_id: &str) -> Result<PlanTransition> {
    let plan = queries::get_plan_by_id(conn, plan_id)?.or_not_found("plan")?;
    match plan.status {
        PlanStatus::Cancelled => Ok(PlanTransition::NoOp(plan)),
        PlanStatus::Active | PlanStatus::Paused => {
            queries::cancel_plan(conn, &plan.id, chrono::Utc::now().timestamp())?;
            let cancelled = queries::get_plan_by_id(conn, &plan.id)?.or_not_found("plan")?;
            tracing::info!("plan cancelled from mandate webhook: id={}", cancelled.id);
            Ok(PlanTransition::Applied(cancelled))
        }
    }
}
