use serde::{Deserialize, Serialize};

/// Tax receipt for a settled gift. One per gift, created inside the same
/// transaction as the success transition. A later refund does not void it;
/// refund/receipt reconciliation is a downstream tax-year concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub gift_id: String,
    pub amount_cents: i64,
    pub currency: super::Currency,
    pub tax_year: i32,
    pub issued_at: i64,
}
