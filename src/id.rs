//! Prefixed ID generation for Giftflow entities.
//!
//! All IDs use a `gf_` brand prefix to guarantee collision avoidance with
//! payment processor IDs (Stripe's `pi_`, `re_`, `sub_`, PayPal's order ids).
//!
//! Format: `gf_{entity}_{uuid_simple}` (32 hex chars, no hyphens)

use uuid::Uuid;

/// All known entity prefixes for validation.
const ALL_PREFIXES: &[&str] = &[
    "gf_don_",
    "gf_gift_",
    "gf_plan_",
    "gf_rcpt_",
    "gf_whe_",
    "gf_aud_",
];

/// Validate that a string is a valid Giftflow prefixed ID.
///
/// This is a cheap check to reject garbage before hitting the database.
/// Validates format: `gf_{entity}_{32_hex_chars}`
pub fn is_valid_prefixed_id(s: &str) -> bool {
    let Some(prefix) = ALL_PREFIXES.iter().find(|p| s.starts_with(*p)) else {
        return false;
    };

    let hex_part = &s[prefix.len()..];

    hex_part.len() == 32 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

/// Entity types that have prefixed IDs in Giftflow.
#[derive(Debug, Clone, Copy)]
pub enum EntityType {
    Donor,
    Gift,
    RecurringPlan,
    Receipt,
    WebhookEvent,
    AuditLog,
}

impl EntityType {
    /// Returns the prefix for this entity type.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Donor => "gf_don",
            Self::Gift => "gf_gift",
            Self::RecurringPlan => "gf_plan",
            Self::Receipt => "gf_rcpt",
            Self::WebhookEvent => "gf_whe",
            Self::AuditLog => "gf_aud",
        }
    }

    /// Generates a new prefixed ID for this entity type.
    pub fn gen_id(&self) -> String {
        format!("{}_{}", self.prefix(), Uuid::new_v4().as_simple())
    }
}
