use serde::{Deserialize, Serialize};

use crate::payments::PaymentProcessor;

/// Idempotency ledger row for one webhook delivery.
///
/// `(processor, external_id)` is unique; inserting the row is the atomic
/// claim that makes processing exactly-once-effect. Rows are never deleted
/// while inside the processor's redelivery window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub processor: PaymentProcessor,
    pub external_id: String,
    pub event_type: String,
    /// Raw payload, kept for audit and replay diagnosis.
    pub payload: String,
    pub processed: bool,
    pub processed_at: Option<i64>,
    pub created_at: i64,
}
