//! Recurring plan lifecycle endpoints.
//!
//! The mandate is established at the processor first (`POST /mandates`),
//! then the plan record is created from the returned mandate id. Updates
//! and cancellation contact the processor before committing locally; pause
//! and resume are purely local scheduling decisions.

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
use crate::error::{AppError, Result};
use crate::extractors::{Json, Path};
use crate::models::{
    ActorType, AuditAction, CreateRecurringPlan, Currency, Frequency, RecurringPlan,
    UpdateRecurringPlan,
};
use crate::payments::{CreateMandateRequest, PaymentProcessor};
use crate::recurring;

use super::{require_permission, validate_amount, validate_email};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/mandates", post(create_mandate))
        .route("/plans", post(create_plan))
        .route(
            "/plans/{plan_id}",
            get(get_plan).patch(update_plan).delete(cancel_plan),
        )
        .route("/plans/{plan_id}/pause", post(pause_plan))
        .route("/plans/{plan_id}/resume", post(resume_plan))
}

#[derive(Debug, Deserialize)]
pub struct PlanPath {
    pub plan_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateMandateRequestBody {
    pub amount_cents: i64,
    pub currency: Currency,
    pub frequency: Frequency,
    pub donor_email: String,
    pub processor: PaymentProcessor,
}

#[derive(Debug, Serialize)]
pub struct CreateMandateResponse {
    pub mandate_id: String,
    pub status: String,
}

/// POST /mandates
///
/// Establish the external mandate. The caller passes the returned
/// `mandate_id` to `POST /plans`; the plan record never exists before the
/// mandate does.
pub async fn create_mandate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateMandateRequestBody>,
) -> Result<Json<CreateMandateResponse>> {
    require_permission(&headers, Action::CreatePlan)?;
    validate_amount(input.amount_cents)?;
    validate_email(&input.donor_email)?;

    let client = state.processors.client(input.processor)?;
    let mandate = client
        .create_recurring_mandate(&CreateMandateRequest {
            amount_cents: input.amount_cents,
            currency: input.currency,
            donor_email: &input.donor_email,
            interval_months: input.frequency.interval_months(),
        })
        .await?;

    Ok(Json(CreateMandateResponse {
        mandate_id: mandate.mandate_id,
        status: mandate.status,
    }))
}

/// POST /plans
pub async fn create_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateRecurringPlan>,
) -> Result<Json<RecurringPlan>> {
    require_permission(&headers, Action::CreatePlan)?;
    validate_amount(input.amount_cents)?;
    validate_email(&input.donor_email)?;
    if input.mandate_id.is_empty() {
        return Err(AppError::BadRequest("mandate_id is required".into()));
    }
    let _ = state.processors.client(input.processor)?;

    let fee_amount_cents = state
        .fees
        .calculate_fee(input.processor, input.amount_cents)?;
    let next_charge_date =
        recurring::next_charge_date(input.frequency, chrono::Utc::now().timestamp())?;

    let (donor, plan) = {
        let mut conn = state.db.get()?;
        let tx = conn.transaction()?;
        let donor =
            queries::find_or_create_donor(&tx, &input.donor_email, input.donor_name.as_deref())?;
        let plan = queries::create_plan(&tx, &donor.id, &input, fee_amount_cents, next_charge_date)?;
        tx.commit()?;
        (donor, plan)
    };

    {
        let audit_conn = state.audit.get()?;
        if let Err(e) = AuditLogBuilder::new(&audit_conn, state.audit_log_enabled, &headers)
            .actor(ActorType::Donor, Some(&donor.id))
            .action(AuditAction::CreatePlan)
            .resource("plan", &plan.id)
            .details(&serde_json::json!({
                "amount_cents": plan.amount_cents,
                "currency": plan.currency.as_str(),
                "frequency": plan.frequency.as_ref(),
                "processor": plan.processor.as_str(),
                "next_charge_date": plan.next_charge_date,
            }))
            .save()
        {
            tracing::warn!("Failed to write plan creation audit log: {}", e);
        }
    }

    Ok(Json(plan))
}

/// GET /plans/{plan_id}
pub async fn get_plan(
    State(state): State<AppState>,
    Path(path): Path<PlanPath>,
) -> Result<Json<RecurringPlan>> {
    let conn = state.db.get()?;
    let plan = queries::get_plan_by_id(&conn, &path.plan_id)?
        .ok_or_else(|| AppError::NotFound("plan".into()))?;
    Ok(Json(plan))
}

fn audit_plan_transition(
    state: &AppState,
    headers: &HeaderMap,
    action: AuditAction,
    plan: &RecurringPlan,
    status_before: &str,
) {
    let Ok(audit_conn) = state.audit.get() else {
        tracing::error!("Audit DB unavailable for plan transition");
        return;
    };
    if let Err(e) = AuditLogBuilder::new(&audit_conn, state.audit_log_enabled, headers)
        .actor(ActorType::Donor, Some(&plan.donor_id))
        .action(action)
        .resource("plan", &plan.id)
        .details(&serde_json::json!({
            "status_before": status_before,
            "status_after": plan.status.as_ref(),
        }))
        .save()
    {
        tracing::warn!("Failed to write plan transition audit log: {}", e);
    }
}

/// POST /plans/{plan_id}/pause
///
/// Local scheduling no-op at the processor: the next charge is skipped
/// while paused, the mandate stays live.
pub async fn pause_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<PlanPath>,
) -> Result<Json<RecurringPlan>> {
    require_permission(&headers, Action::PausePlan)?;

    let transition = {
        let mut conn = state.db.get()?;
        let tx = conn.transaction()?;
        let transition = recurring::pause(&tx, &path.plan_id)?;
        tx.commit()?;
        transition
    };

    if transition.was_applied() {
        audit_plan_transition(&state, &headers, AuditAction::PausePlan, transition.plan(), "active");
    }
    Ok(Json(transition.plan().clone()))
}

/// POST /plans/{plan_id}/resume
pub async fn resume_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<PlanPath>,
) -> Result<Json<RecurringPlan>> {
    require_permission(&headers, Action::ResumePlan)?;

    let transition = {
        let mut conn = state.db.get()?;
        let tx = conn.transaction()?;
        let transition = recurring::resume(&tx, &path.plan_id)?;
        tx.commit()?;
        transition
    };

    if transition.was_applied() {
        audit_plan_transition(&state, &headers, AuditAction::ResumePlan, transition.plan(), "paused");
    }
    Ok(Json(transition.plan().clone()))
}

/// PATCH /plans/{plan_id}
///
/// Amount/frequency update. The mandate is revised at the processor before
/// the local terms change; a processor failure leaves the plan untouched.
pub async fn update_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<PlanPath>,
    Json(input): Json<UpdateRecurringPlan>,
) -> Result<Json<RecurringPlan>> {
    require_permission(&headers, Action::UpdatePlan)?;
    if let Some(amount) = input.amount_cents {
        validate_amount(amount)?;
    }

    let plan = recurring::update_terms(&state, &path.plan_id, &input).await?;

    {
        let audit_conn = state.audit.get()?;
        if let Err(e) = AuditLogBuilder::new(&audit_conn, state.audit_log_enabled, &headers)
            .actor(ActorType::Donor, Some(&plan.donor_id))
            .action(AuditAction::UpdatePlan)
            .resource("plan", &plan.id)
            .details(&serde_json::json!({
                "amount_cents": plan.amount_cents,
                "frequency": plan.frequency.as_ref(),
                "fee_amount_cents": plan.fee_amount_cents,
                "next_charge_date": plan.next_charge_date,
            }))
            .save()
        {
            tracing::warn!("Failed to write plan update audit log: {}", e);
        }
    }

    Ok(Json(plan))
}

/// DELETE /plans/{plan_id}
///
/// Terminal. The mandate is cancelled at the processor first; only then is
/// the local terminal state committed.
pub async fn cancel_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<PlanPath>,
) -> Result<Json<RecurringPlan>> {
    require_permission(&headers, Action::CancelPlan)?;

    let status_before = {
        let conn = state.db.get()?;
        queries::get_plan_by_id(&conn, &path.plan_id)?
            .map(|p| p.status.as_ref().to_string())
            .unwrap_or_default()
    };

    let plan = recurring::cancel(&state, &path.plan_id).await?;

    audit_plan_transition(
        &state,
        &headers,
        AuditAction::CancelPlan,
        &plan,
        &status_before,
    );

    Ok(Json(plan))
}
