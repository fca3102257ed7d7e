use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::payments::PaymentProcessor;

use super::Currency;

/// Charge cadence for a recurring plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Frequency {
    Monthly,
    Quarterly,
    Annually,
}

impl Frequency {
    /// Months between charges.
    pub fn interval_months(&self) -> u32 {
        match self {
            Frequency::Monthly => 1,
            Frequency::Quarterly => 3,
            Frequency::Annually => 12,
        }
    }
}

/// Plan lifecycle status. Cancellation is terminal and never reversed; a
/// donor resumes giving by creating a new plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Paused,
    Cancelled,
}

/// A standing recurring-donation mandate.
///
/// The external mandate is established at the processor before the plan
/// record exists; `mandate_id` is therefore required at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringPlan {
    pub id: String,
    pub donor_id: String,

    pub amount_cents: i64,
    pub currency: Currency,
    pub frequency: Frequency,

    pub donor_covers_fee: bool,
    /// Fee estimate at the current amount; refreshed on amount updates.
    pub fee_amount_cents: i64,

    pub status: PlanStatus,
    pub processor: PaymentProcessor,
    pub mandate_id: String,

    /// Always in the future relative to the last successful charge.
    pub next_charge_date: i64,
    pub last_charged_at: Option<i64>,
    /// Consecutive failed charges since the last success (dunning counter).
    pub failed_attempts: u32,

    pub paused_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Data required to create a new recurring plan.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRecurringPlan {
    pub amount_cents: i64,
    pub currency: Currency,
    pub frequency: Frequency,
    pub donor_email: String,
    #[serde(default)]
    pub donor_name: Option<String>,
    #[serde(default)]
    pub donor_covers_fee: bool,
    pub processor: PaymentProcessor,
    /// External mandate reference, obtained from the processor beforehand.
    pub mandate_id: String,
}

/// Amount/frequency changes to an existing plan.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRecurringPlan {
    pub amount_cents: Option<i64>,
    pub frequency: Option<Frequency>,
}
