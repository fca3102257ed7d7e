//! Query layer over the main and audit databases.
//!
//! Every mutation of a Gift or RecurringPlan is expected to run inside a
//! caller-held transaction; functions here take `&Connection` and work
//! unchanged against a `rusqlite::Transaction` via deref.

use rusqlite::{params, Connection};

use crate::db::from_row::{
    query_all, query_one, AUDIT_LOG_COLS, DONOR_COLS, GIFT_COLS, PLAN_COLS, RECEIPT_COLS,
    WEBHOOK_EVENT_COLS,
};
use crate::error::Result;
use crate::id::EntityType;
use crate::models::*;
use crate::payments::PaymentProcessor;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============ Donors ============

/// Look a donor up by email, creating the row on first contact.
pub fn find_or_create_donor(conn: &Connection, email: &str, name: Option<&str>) -> Result<Donor> {
    if let Some(donor) = query_one::<Donor>(
        conn,
        &format!("SELECT {} FROM donors WHERE email = ?1", DONOR_COLS),
        &[&email],
    )? {
        return Ok(donor);
    }

    let id = EntityType::Donor.gen_id();
    let ts = now();
    conn.execute(
        "INSERT INTO donors (id, email, name, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, email, name, ts],
    )?;

    Ok(Donor {
        id,
        email: email.to_string(),
        name: name.map(String::from),
        created_at: ts,
    })
}

pub fn get_donor_by_id(conn: &Connection, id: &str) -> Result<Option<Donor>> {
    query_one(
        conn,
        &format!("SELECT {} FROM donors WHERE id = ?1", DONOR_COLS),
        &[&id],
    )
}

// ============ Gifts ============

/// Create a pending gift. `fee_amount_cents` is the pre-charge estimate,
/// set only when the donor covers the fee.
pub fn create_gift(
    conn: &Connection,
    donor_id: &str,
    input: &CreateGift,
    fee_amount_cents: Option<i64>,
) -> Result<Gift> {
    let id = EntityType::Gift.gen_id();
    let ts = now();
    conn.execute(
        "INSERT INTO gifts (id, donor_id, campaign_id, plan_id, amount_cents, currency,
            donor_covers_fee, fee_amount_cents, status, processor, created_at, updated_at)
         VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?9)",
        params![
            id,
            donor_id,
            input.campaign_id,
            input.amount_cents,
            input.currency.as_str(),
            input.donor_covers_fee,
            fee_amount_cents,
            input.processor.as_str(),
            ts,
        ],
    )?;

    get_gift_by_id(conn, &id)?
        .ok_or_else(|| crate::error::AppError::Internal("gift vanished after insert".into()))
}

/// Insert an already-settled gift produced by a recurring plan charge.
/// Runs inside the webhook dispatcher transaction.
pub struct NewPlanChargeGift<'a> {
    pub plan: &'a RecurringPlan,
    pub processor_ref: &'a str,
    pub processor_fee_cents: i64,
    pub net_amount_cents: i64,
    pub completed_at: i64,
}

pub fn create_settled_plan_gift(conn: &Connection, input: &NewPlanChargeGift<'_>) -> Result<Gift> {
    let id = EntityType::Gift.gen_id();
    let ts = input.completed_at;
    conn.execute(
        "INSERT INTO gifts (id, donor_id, campaign_id, plan_id, amount_cents, currency,
            donor_covers_fee, fee_amount_cents, processor_fee_cents, net_amount_cents,
            status, processor, processor_ref, completed_at, created_at, updated_at)
         VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'success', ?10, ?11, ?12, ?12, ?12)",
        params![
            id,
            input.plan.donor_id,
            input.plan.id,
            input.plan.amount_cents,
            input.plan.currency.as_str(),
            input.plan.donor_covers_fee,
            input.plan.fee_amount_cents,
            input.processor_fee_cents,
            input.net_amount_cents,
            input.plan.processor.as_str(),
            input.processor_ref,
            ts,
        ],
    )?;

    get_gift_by_id(conn, &id)?
        .ok_or_else(|| crate::error::AppError::Internal("gift vanished after insert".into()))
}

pub fn get_gift_by_id(conn: &Connection, id: &str) -> Result<Option<Gift>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM gifts WHERE id = ?1 AND deleted_at IS NULL",
            GIFT_COLS
        ),
        &[&id],
    )
}

pub fn get_gift_by_processor_ref(
    conn: &Connection,
    processor: PaymentProcessor,
    processor_ref: &str,
) -> Result<Option<Gift>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM gifts WHERE processor = ?1 AND processor_ref = ?2 AND deleted_at IS NULL",
            GIFT_COLS
        ),
        &[&processor.as_str(), &processor_ref],
    )
}

/// Apply the success transition row update. Transition legality is checked
/// by the donation state machine before this runs.
pub fn settle_gift(
    conn: &Connection,
    gift_id: &str,
    processor_ref: &str,
    processor_fee_cents: i64,
    net_amount_cents: i64,
    completed_at: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE gifts SET status = 'success', processor_ref = ?1, processor_fee_cents = ?2,
            net_amount_cents = ?3, completed_at = ?4, updated_at = ?4
         WHERE id = ?5",
        params![
            processor_ref,
            processor_fee_cents,
            net_amount_cents,
            completed_at,
            gift_id
        ],
    )?;
    Ok(())
}

pub fn fail_gift(conn: &Connection, gift_id: &str, processor_ref: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE gifts SET status = 'failed',
            processor_ref = COALESCE(?1, processor_ref), updated_at = ?2
         WHERE id = ?3",
        params![processor_ref, now(), gift_id],
    )?;
    Ok(())
}

pub fn refund_gift(conn: &Connection, gift_id: &str, refunded_at: i64) -> Result<()> {
    conn.execute(
        "UPDATE gifts SET status = 'refunded', refunded_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![refunded_at, gift_id],
    )?;
    Ok(())
}

/// Gifts are never hard-deleted; retention is an audit requirement.
pub fn soft_delete_gift(conn: &Connection, gift_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE gifts SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        params![now(), gift_id],
    )?;
    Ok(())
}

// ============ Receipts ============

pub fn receipt_exists_for_gift(conn: &Connection, gift_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM receipts WHERE gift_id = ?1",
        params![gift_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Create the receipt for a settled gift. Callers must hold the settlement
/// transaction and have checked `receipt_exists_for_gift` first; the UNIQUE
/// constraint on gift_id backstops the guard.
pub fn create_receipt(conn: &Connection, gift: &Gift, issued_at: i64) -> Result<Receipt> {
    let id = EntityType::Receipt.gen_id();
    let tax_year = chrono::DateTime::from_timestamp(issued_at, 0)
        .map(|dt| {
            use chrono::Datelike;
            dt.year()
        })
        .unwrap_or(1970);

    conn.execute(
        "INSERT INTO receipts (id, gift_id, amount_cents, currency, tax_year, issued_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            gift.id,
            gift.amount_cents,
            gift.currency.as_str(),
            tax_year,
            issued_at
        ],
    )?;

    Ok(Receipt {
        id,
        gift_id: gift.id.clone(),
        amount_cents: gift.amount_cents,
        currency: gift.currency,
        tax_year,
        issued_at,
    })
}

pub fn get_receipt_by_gift(conn: &Connection, gift_id: &str) -> Result<Option<Receipt>> {
    query_one(
        conn,
        &format!("SELECT {} FROM receipts WHERE gift_id = ?1", RECEIPT_COLS),
        &[&gift_id],
    )
}

// ============ Recurring plans ============

pub fn create_plan(
    conn: &Connection,
    donor_id: &str,
    input: &CreateRecurringPlan,
    fee_amount_cents: i64,
    next_charge_date: i64,
) -> Result<RecurringPlan> {
    let id = EntityType::RecurringPlan.gen_id();
    let ts = now();
    conn.execute(
        "INSERT INTO recurring_plans (id, donor_id, amount_cents, currency, frequency,
            donor_covers_fee, fee_amount_cents, status, processor, mandate_id,
            next_charge_date, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8, ?9, ?10, ?11, ?11)",
        params![
            id,
            donor_id,
            input.amount_cents,
            input.currency.as_str(),
            input.frequency.as_ref(),
            input.donor_covers_fee,
            fee_amount_cents,
            input.processor.as_str(),
            input.mandate_id,
            next_charge_date,
            ts,
        ],
    )?;

    get_plan_by_id(conn, &id)?
        .ok_or_else(|| crate::error::AppError::Internal("plan vanished after insert".into()))
}

pub fn get_plan_by_id(conn: &Connection, id: &str) -> Result<Option<RecurringPlan>> {
    query_one(
        conn,
        &format!("SELECT {} FROM recurring_plans WHERE id = ?1", PLAN_COLS),
        &[&id],
    )
}

pub fn get_plan_by_mandate(
    conn: &Connection,
    processor: PaymentProcessor,
    mandate_id: &str,
) -> Result<Option<RecurringPlan>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM recurring_plans WHERE processor = ?1 AND mandate_id = ?2",
            PLAN_COLS
        ),
        &[&processor.as_str(), &mandate_id],
    )
}

pub fn pause_plan(conn: &Connection, id: &str, paused_at: i64) -> Result<()> {
    conn.execute(
        "UPDATE recurring_plans SET status = 'paused', paused_at = ?1, updated_at = ?1
         WHERE id = ?2",
        params![paused_at, id],
    )?;
    Ok(())
}

pub fn resume_plan(conn: &Connection, id: &str, next_charge_date: i64) -> Result<()> {
    conn.execute(
        "UPDATE recurring_plans SET status = 'active', paused_at = NULL,
            next_charge_date = ?1, updated_at = ?2
         WHERE id = ?3",
        params![next_charge_date, now(), id],
    )?;
    Ok(())
}

pub fn cancel_plan(conn: &Connection, id: &str, cancelled_at: i64) -> Result<()> {
    conn.execute(
        "UPDATE recurring_plans SET status = 'cancelled', cancelled_at = ?1, updated_at = ?1
         WHERE id = ?2",
        params![cancelled_at, id],
    )?;
    Ok(())
}

pub fn update_plan_terms(
    conn: &Connection,
    id: &str,
    amount_cents: i64,
    frequency: Frequency,
    fee_amount_cents: i64,
    next_charge_date: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE recurring_plans SET amount_cents = ?1, frequency = ?2, fee_amount_cents = ?3,
            next_charge_date = ?4, updated_at = ?5
         WHERE id = ?6",
        params![
            amount_cents,
            frequency.as_ref(),
            fee_amount_cents,
            next_charge_date,
            now(),
            id
        ],
    )?;
    Ok(())
}

/// Record a successful mandate charge: reset the dunning counter, stamp the
/// charge time, and advance the next charge date.
pub fn record_plan_charge_success(
    conn: &Connection,
    id: &str,
    charged_at: i64,
    next_charge_date: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE recurring_plans SET failed_attempts = 0, last_charged_at = ?1,
            next_charge_date = ?2, updated_at = ?1
         WHERE id = ?3",
        params![charged_at, next_charge_date, id],
    )?;
    Ok(())
}

/// Increment the dunning counter and return the new value.
pub fn increment_plan_failed_attempts(conn: &Connection, id: &str) -> Result<u32> {
    conn.execute(
        "UPDATE recurring_plans SET failed_attempts = failed_attempts + 1, updated_at = ?1
         WHERE id = ?2",
        params![now(), id],
    )?;
    let attempts: u32 = conn.query_row(
        "SELECT failed_attempts FROM recurring_plans WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(attempts)
}

// ============ Webhook event deduplication ============

/// Atomically claim a webhook event, returning true if this delivery is the
/// first. Uses INSERT OR IGNORE against the UNIQUE(processor, external_id)
/// constraint; a duplicate delivery observes the existing row and returns
/// false without error. Must be called inside the dispatcher transaction so
/// a failed processing attempt releases the claim on rollback.
pub fn try_claim_webhook_event(
    conn: &Connection,
    processor: PaymentProcessor,
    external_id: &str,
    event_type: &str,
    payload: &str,
) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO webhook_events (id, processor, external_id, event_type, payload, processed, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![
            EntityType::WebhookEvent.gen_id(),
            processor.as_str(),
            external_id,
            event_type,
            payload,
            now()
        ],
    )?;
    Ok(affected > 0)
}

/// Mark a claimed event as fully applied. Runs in the same transaction as
/// the business effect.
pub fn mark_webhook_processed(
    conn: &Connection,
    processor: PaymentProcessor,
    external_id: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE webhook_events SET processed = 1, processed_at = ?1
         WHERE processor = ?2 AND external_id = ?3",
        params![now(), processor.as_str(), external_id],
    )?;
    Ok(())
}

pub fn get_webhook_event(
    conn: &Connection,
    processor: PaymentProcessor,
    external_id: &str,
) -> Result<Option<WebhookEvent>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM webhook_events WHERE processor = ?1 AND external_id = ?2",
            WEBHOOK_EVENT_COLS
        ),
        &[&processor.as_str(), &external_id],
    )
}

pub fn count_webhook_events(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM webhook_events", [], |row| row.get(0))
        .map_err(Into::into)
}

// ============ Audit logs ============

#[allow(clippy::too_many_arguments)]
pub fn create_audit_log(
    conn: &Connection,
    enabled: bool,
    actor_type: ActorType,
    actor_id: Option<&str>,
    action: &str,
    resource_type: &str,
    resource_id: &str,
    details: Option<&serde_json::Value>,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
) -> Result<()> {
    if !enabled {
        return Ok(());
    }

    conn.execute(
        "INSERT INTO audit_logs (id, timestamp, actor_type, actor_id, action, resource_type,
            resource_id, details, ip_address, user_agent)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            EntityType::AuditLog.gen_id(),
            now(),
            actor_type.as_ref(),
            actor_id,
            action,
            resource_type,
            resource_id,
            details.map(|d| d.to_string()),
            ip_address,
            user_agent,
        ],
    )?;
    Ok(())
}

pub fn list_audit_logs(conn: &Connection, query: &AuditLogQuery) -> Result<Vec<AuditLog>> {
    let mut sql = format!("SELECT {} FROM audit_logs WHERE 1=1", AUDIT_LOG_COLS);
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(actor_type) = query.actor_type {
        sql.push_str(" AND actor_type = ?");
        params_vec.push(Box::new(actor_type.as_ref().to_string()));
    }
    if let Some(action) = &query.action {
        sql.push_str(" AND action = ?");
        params_vec.push(Box::new(action.clone()));
    }
    if let Some(resource_type) = &query.resource_type {
        sql.push_str(" AND resource_type = ?");
        params_vec.push(Box::new(resource_type.clone()));
    }
    if let Some(resource_id) = &query.resource_id {
        sql.push_str(" AND resource_id = ?");
        params_vec.push(Box::new(resource_id.clone()));
    }
    if let Some(from) = query.from_timestamp {
        sql.push_str(" AND timestamp >= ?");
        params_vec.push(Box::new(from));
    }
    if let Some(to) = query.to_timestamp {
        sql.push_str(" AND timestamp <= ?");
        params_vec.push(Box::new(to));
    }

    sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");
    params_vec.push(Box::new(query.limit()));
    params_vec.push(Box::new(query.offset()));

    let param_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    query_all(conn, &sql, &param_refs)
}

pub fn count_audit_logs_for_resource(
    conn: &Connection,
    resource_type: &str,
    resource_id: &str,
    action: &str,
) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM audit_logs WHERE resource_type = ?1 AND resource_id = ?2 AND action = ?3",
        params![resource_type, resource_id, action],
        |row| row.get(0),
    )
    .map_err(Into::into)
}
