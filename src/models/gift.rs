use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::payments::PaymentProcessor;

/// Smallest accepted gift: $1.00.
pub const MIN_GIFT_CENTS: i64 = 100;
/// Largest accepted gift: $100,000.00.
pub const MAX_GIFT_CENTS: i64 = 10_000_000;

/// Currencies the platform accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Currency {
    Usd,
    Cad,
    Eur,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "usd",
            Currency::Cad => "cad",
            Currency::Eur => "eur",
        }
    }
}

/// Gift lifecycle status. Transitions are owned by the donation state
/// machine; see `donations.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GiftStatus {
    Pending,
    Success,
    Failed,
    Refunded,
}

/// A single donation transaction.
///
/// Amounts are integer cents. `net_amount_cents` is the authoritative payout
/// amount, set once at settlement from the actual processor fee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gift {
    pub id: String,
    pub donor_id: String,
    pub campaign_id: Option<String>,
    /// Set when this gift was produced by a recurring plan charge.
    pub plan_id: Option<String>,

    pub amount_cents: i64,
    pub currency: Currency,

    /// Whether the donor opted to cover the processing fee on top.
    pub donor_covers_fee: bool,
    /// Pre-charge fee estimate; only set when the donor covers the fee.
    pub fee_amount_cents: Option<i64>,
    /// Actual settled processor fee, set exactly once by the settlement webhook.
    pub processor_fee_cents: Option<i64>,
    pub net_amount_cents: Option<i64>,

    pub status: GiftStatus,
    pub processor: PaymentProcessor,
    /// Processor's charge/intent reference; the idempotency anchor for updates.
    pub processor_ref: Option<String>,

    pub completed_at: Option<i64>,
    pub refunded_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Gifts are never hard-deleted; audit retention requires the row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

/// Data required to create a new gift.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateGift {
    pub amount_cents: i64,
    pub currency: Currency,
    pub donor_email: String,
    #[serde(default)]
    pub donor_name: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub donor_covers_fee: bool,
    pub processor: PaymentProcessor,
}
