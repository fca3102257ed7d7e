//! Donor notification side channel.
//!
//! When configured via `GIFTFLOW_NOTIFY_WEBHOOK_URL`, reconciliation
//! outcomes that need donor-facing follow-up (receipt issued, plan paused
//! by dunning) are emitted to an external notification service. Delivery is
//! fire-and-forget: failures are logged and never affect the transaction
//! that produced the event.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use reqwest::Client;
use serde::Serialize;

/// Retry delays in milliseconds for notification webhooks.
/// Quick retries (100ms, 200ms) to avoid holding background tasks long.
const NOTIFY_RETRY_DELAYS: &[u64] = &[100, 200];

/// Notification event payload (owned version for async spawning).
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    /// Event type: "receipt_issued", "gift_refunded", "plan_dunning_paused"
    pub event: String,
    pub resource_type: String,
    pub resource_id: String,
    pub donor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_cents: Option<i64>,
    /// Unix timestamp
    pub timestamp: i64,
    /// Unique per emission; lets the notification service deduplicate our
    /// delivery retries without collapsing distinct events.
    pub idempotency_key: String,
}

impl NotificationEvent {
    pub fn new(event: &str, resource_type: &str, resource_id: &str, donor_id: &str) -> Self {
        Self {
            event: event.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            donor_id: donor_id.to_string(),
            amount_cents: None,
            timestamp: chrono::Utc::now().timestamp(),
            idempotency_key: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn amount(mut self, amount_cents: i64) -> Self {
        self.amount_cents = Some(amount_cents);
        self
    }
}

/// Spawn a fire-and-forget notification event.
///
/// If no notification URL is configured, this is a no-op. Panics in the
/// spawned task are logged rather than silently swallowed.
pub fn spawn_notification(client: Client, notify_url: Option<String>, event: NotificationEvent) {
    if let Some(url) = notify_url {
        let event_type = event.event.clone();
        tokio::spawn(
            AssertUnwindSafe(async move {
                send_notification(&client, &url, &event).await;
            })
            .catch_unwind()
            .map(move |result| {
                if let Err(panic) = result {
                    let panic_msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(
                        "Notification task panicked for event '{}': {}",
                        event_type,
                        panic_msg
                    );
                }
            }),
        );
    }
}

/// Send a notification event to the configured webhook URL.
async fn send_notification(client: &Client, url: &str, event: &NotificationEvent) {
    for (attempt, delay_ms) in std::iter::once(&0u64)
        .chain(NOTIFY_RETRY_DELAYS.iter())
        .enumerate()
    {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
        }

        match client
            .post(url)
            .json(event)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                if attempt > 0 {
                    tracing::debug!("Notification webhook succeeded after {} retries", attempt);
                }
                return;
            }
            Ok(resp) => {
                tracing::debug!("Notification webhook returned {}", resp.status());
            }
            Err(e) => {
                tracing::debug!("Notification webhook failed: {}", e);
            }
        }
    }

    tracing::warn!(
        "Notification webhook failed after {} attempts",
        NOTIFY_RETRY_DELAYS.len() + 1
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_are_quick() {
        let total_delay: u64 = NOTIFY_RETRY_DELAYS.iter().sum();
        assert!(total_delay < 500, "Retry delays should be quick");
        assert_eq!(total_delay, 300); // 100 + 200
    }

    #[test]
    fn test_notification_event_serialization() {
        let event = NotificationEvent::new("receipt_issued", "gift", "gf_gift_abc", "gf_don_xyz")
            .amount(10_000);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"receipt_issued\""));
        assert!(json.contains("\"amount_cents\":10000"));
        assert!(json.contains("\"donor_id\":\"gf_don_xyz\""));
    }

    #[test]
    fn test_notification_event_skips_none_amount() {
        let event =
            NotificationEvent::new("plan_dunning_paused", "plan", "gf_plan_abc", "gf_don_xyz");

        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("amount_cents"));
    }

    #[test]
    fn test_idempotency_key_is_unique_per_event() {
        use std::collections::HashSet;

        let keys: HashSet<String> = (0..100)
            .map(|_| NotificationEvent::new("receipt_issued", "gift", "g", "d").idempotency_key)
            .collect();

        assert_eq!(keys.len(), 100);
    }
}
