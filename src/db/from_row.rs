//! Row mapping trait and helpers for reducing boilerplate in queries.

use rusqlite::{Connection, OptionalExtension, Row, ToSql};

use crate::models::*;
use crate::payments::PaymentProcessor;

/// Parse a string column into an enum type, converting parse errors to
/// rusqlite errors instead of panicking on corrupted values.
fn parse_enum<T: std::str::FromStr>(row: &Row, col: usize, col_name: &str) -> rusqlite::Result<T> {
    row.get::<_, String>(col)?.parse::<T>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
    })
}

/// Trait for constructing a type from a database row.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

/// Query for a single optional result.
pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

/// Query for multiple results.
pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============ SQL SELECT Constants ============

pub const DONOR_COLS: &str = "id, email, name, created_at";

pub const GIFT_COLS: &str = "id, donor_id, campaign_id, plan_id, amount_cents, currency, donor_covers_fee, fee_amount_cents, processor_fee_cents, net_amount_cents, status, processor, processor_ref, completed_at, refunded_at, created_at, updated_at, deleted_at";

pub const PLAN_COLS: &str = "id, donor_id, amount_cents, currency, frequency, donor_covers_fee, fee_amount_cents, status, processor, mandate_id, next_charge_date, last_charged_at, failed_attempts, paused_at, cancelled_at, created_at, updated_at";

pub const RECEIPT_COLS: &str = "id, gift_id, amount_cents, currency, tax_year, issued_at";

pub const WEBHOOK_EVENT_COLS: &str =
    "id, processor, external_id, event_type, payload, processed, processed_at, created_at";

pub const AUDIT_LOG_COLS: &str = "id, timestamp, actor_type, actor_id, action, resource_type, resource_id, details, ip_address, user_agent";

// ============ FromRow implementations ============

impl FromRow for Donor {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Donor {
            id: row.get(0)?,
            email: row.get(1)?,
            name: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}

impl FromRow for Gift {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Gift {
            id: row.get(0)?,
            donor_id: row.get(1)?,
            campaign_id: row.get(2)?,
            plan_id: row.get(3)?,
            amount_cents: row.get(4)?,
            currency: parse_enum(row, 5, "currency")?,
            donor_covers_fee: row.get(6)?,
            fee_amount_cents: row.get(7)?,
            processor_fee_cents: row.get(8)?,
            net_amount_cents: row.get(9)?,
            status: parse_enum(row, 10, "status")?,
            processor: parse_enum::<PaymentProcessor>(row, 11, "processor")?,
            processor_ref: row.get(12)?,
            completed_at: row.get(13)?,
            refunded_at: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
            deleted_at: row.get(17)?,
        })
    }
}

impl FromRow for RecurringPlan {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(RecurringPlan {
            id: row.get(0)?,
            donor_id: row.get(1)?,
            amount_cents: row.get(2)?,
            currency: parse_enum(row, 3, "currency")?,
            frequency: parse_enum(row, 4, "frequency")?,
            donor_covers_fee: row.get(5)?,
            fee_amount_cents: row.get(6)?,
            status: parse_enum(row, 7, "status")?,
            processor: parse_enum::<PaymentProcessor>(row, 8, "processor")?,
            mandate_id: row.get(9)?,
            next_charge_date: row.get(10)?,
            last_charged_at: row.get(11)?,
            failed_attempts: row.get(12)?,
            paused_at: row.get(13)?,
            cancelled_at: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }
}

impl FromRow for Receipt {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Receipt {
            id: row.get(0)?,
            gift_id: row.get(1)?,
            amount_cents: row.get(2)?,
            currency: parse_enum(row, 3, "currency")?,
            tax_year: row.get(4)?,
            issued_at: row.get(5)?,
        })
    }
}

impl FromRow for WebhookEvent {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(WebhookEvent {
            id: row.get(0)?,
            processor: parse_enum::<PaymentProcessor>(row, 1, "processor")?,
            external_id: row.get(2)?,
            event_type: row.get(3)?,
            payload: row.get(4)?,
            processed: row.get(5)?,
            processed_at: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

impl FromRow for AuditLog {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let details: Option<String> = row.get(7)?;
        Ok(AuditLog {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            actor_type: parse_enum(row, 2, "actor_type")?,
            actor_id: row.get(3)?,
            action: row.get(4)?,
            resource_type: row.get(5)?,
            resource_id: row.get(6)?,
            details: details.and_then(|d| serde_json::from_str(&d).ok()),
            ip_address: row.get(8)?,
            user_agent: row.get(9)?,
        })
    }
}
