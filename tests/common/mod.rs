//! Test utilities and fixtures for Giftflow integration tests

#![allow(dead_code)]

use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

pub use giftflow::config::{PayPalConfig, StripeConfig};
pub use giftflow::db::{init_audit_db, init_db, queries, AppState};
pub use giftflow::fees::FeeCalculator;
pub use giftflow::models::*;
pub use giftflow::payments::{PayPalClient, PaymentProcessor, ProcessorRegistry, StripeClient};

pub const TEST_STRIPE_WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const TEST_PAYPAL_WEBHOOK_ID: &str = "wh_test_id";
pub const TEST_PAYPAL_WEBHOOK_SECRET: &str = "paypal_test_secret";

/// Stripe config pointing at an unroutable API base; only signature
/// verification and parsing work against it, API calls fail fast.
pub fn test_stripe_config() -> StripeConfig {
    StripeConfig {
        secret_key: "sk_test_xxx".to_string(),
        webhook_secret: TEST_STRIPE_WEBHOOK_SECRET.to_string(),
        api_base: "http://127.0.0.1:1".to_string(),
    }
}

pub fn test_paypal_config() -> PayPalConfig {
    PayPalConfig {
        client_id: "client_test_xxx".to_string(),
        client_secret: "secret_test_xxx".to_string(),
        webhook_id: TEST_PAYPAL_WEBHOOK_ID.to_string(),
        webhook_secret: TEST_PAYPAL_WEBHOOK_SECRET.to_string(),
        api_base: "http://127.0.0.1:1".to_string(),
    }
}

/// Create an in-memory test database with schema initialized
pub fn setup_test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
    init_db(&conn).expect("Failed to initialize schema");
    conn
}

/// Create an in-memory test audit database with schema initialized
pub fn setup_test_audit_db() -> Connection {
    let conn = Connection::open_in_memory().expect("Failed to create in-memory audit database");
    init_audit_db(&conn).expect("Failed to initialize audit schema");
    conn
}

/// Create an AppState for testing with in-memory databases.
///
/// Pools are capped at one connection so every caller observes the same
/// in-memory database.
pub fn create_test_app_state() -> AppState {
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder().max_size(1).build(manager).unwrap();
    {
        let conn = pool.get().unwrap();
        init_db(&conn).unwrap();
    }

    let audit_manager = SqliteConnectionManager::memory();
    let audit_pool = Pool::builder().max_size(1).build(audit_manager).unwrap();
    {
        let conn = audit_pool.get().unwrap();
        init_audit_db(&conn).unwrap();
    }

    let registry = ProcessorRegistry::new(
        Some(StripeClient::new(&test_stripe_config())),
        Some(PayPalClient::new(&test_paypal_config())),
    );

    AppState {
        db: pool,
        audit: audit_pool,
        processors: Arc::new(registry),
        fees: Arc::new(FeeCalculator::default()),
        http_client: reqwest::Client::new(),
        notify_webhook_url: None,
        audit_log_enabled: true,
        dunning_max_attempts: 3,
    }
}

/// Create a test donor
pub fn create_test_donor(conn: &Connection, email: &str) -> Donor {
    queries::find_or_create_donor(conn, email, Some("Test Donor"))
        .expect("Failed to create test donor")
}

/// Create a pending test gift
pub fn create_test_gift(
    conn: &Connection,
    donor_id: &str,
    amount_cents: i64,
    donor_covers_fee: bool,
    processor: PaymentProcessor,
) -> Gift {
    let fees = FeeCalculator::default();
    let fee_estimate = if donor_covers_fee {
        Some(fees.calculate_fee(processor, amount_cents).unwrap())
    } else {
        None
    };
    let input = CreateGift {
        amount_cents,
        currency: Currency::Usd,
        donor_email: "unused@example.com".to_string(),
        donor_name: None,
        campaign_id: None,
        donor_covers_fee,
        processor,
    };
    queries::create_gift(conn, donor_id, &input, fee_estimate).expect("Failed to create test gift")
}

/// Create an active test plan
pub fn create_test_plan(
    conn: &Connection,
    donor_id: &str,
    amount_cents: i64,
    frequency: Frequency,
    processor: PaymentProcessor,
    mandate_id: &str,
) -> RecurringPlan {
    let fees = FeeCalculator::default();
    let fee = fees.calculate_fee(processor, amount_cents).unwrap();
    let next = giftflow::recurring::next_charge_date(frequency, chrono::Utc::now().timestamp())
        .expect("next charge date");
    let input = CreateRecurringPlan {
        amount_cents,
        currency: Currency::Usd,
        frequency,
        donor_email: "unused@example.com".to_string(),
        donor_name: None,
        donor_covers_fee: false,
        processor,
        mandate_id: mandate_id.to_string(),
    };
    queries::create_plan(conn, donor_id, &input, fee, next).expect("Failed to create test plan")
}

/// Compute a valid Stripe signature header for a payload
pub fn stripe_signature_header(payload: &[u8], secret: &str, timestamp: &str) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(signed_payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    format!("t={},v1={}", timestamp, signature)
}

/// Compute the PayPal transmission headers for a payload
pub fn paypal_transmission_headers(
    payload: &[u8],
    webhook_id: &str,
    secret: &str,
) -> Vec<(&'static str, String)> {
    use base64::Engine;
    use hmac::{Hmac, Mac};
    use sha2::{Digest, Sha256};

    type HmacSha256 = Hmac<Sha256>;

    let transmission_id = "trans-0001".to_string();
    let transmission_time = "2026-08-06T12:00:00Z".to_string();
    let body_digest = hex::encode(Sha256::digest(payload));
    let signed_message = format!(
        "{}|{}|{}|{}",
        transmission_id, transmission_time, webhook_id, body_digest
    );
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(signed_message.as_bytes());
    let sig = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    vec![
        ("paypal-transmission-id", transmission_id),
        ("paypal-transmission-time", transmission_time),
        ("paypal-transmission-sig", sig),
        ("paypal-auth-algo", "HMAC-SHA256".to_string()),
    ]
}
