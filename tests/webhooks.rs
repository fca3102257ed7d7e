//! Webhook signature verification tests

mod common;

use axum::http::HeaderMap;
use common::*;

fn create_stripe_test_client() -> StripeClient {
    StripeClient::new(&test_stripe_config())
}

fn create_paypal_test_client() -> PayPalClient {
    PayPalClient::new(&test_paypal_config())
}

/// Get current Unix timestamp as a string (for webhook signature tests)
fn current_timestamp() -> String {
    chrono::Utc::now().timestamp().to_string()
}

/// Get an old timestamp (for testing timestamp rejection)
fn old_timestamp() -> String {
    // 10 minutes ago - beyond the 5-minute tolerance
    (chrono::Utc::now().timestamp() - 600).to_string()
}

fn stripe_headers(payload: &[u8], secret: &str, timestamp: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "stripe-signature",
        stripe_signature_header(payload, secret, timestamp)
            .parse()
            .unwrap(),
    );
    headers
}

// ============ Stripe Signature Verification Tests ============

#[test]
fn test_stripe_valid_signature() {
    let client = create_stripe_test_client();
    let payload = b"{\"id\":\"evt_1\",\"type\":\"payment_intent.succeeded\"}";
    let headers = stripe_headers(payload, TEST_STRIPE_WEBHOOK_SECRET, &current_timestamp());

    let result = client
        .verify_webhook_signature(payload, &headers)
        .expect("Verification should not error");

    assert!(result, "Valid signature should be accepted");
}

#[test]
fn test_stripe_invalid_signature() {
    let client = create_stripe_test_client();
    let payload = b"{\"id\":\"evt_1\",\"type\":\"payment_intent.succeeded\"}";
    // Use wrong secret to generate invalid signature
    let headers = stripe_headers(payload, "wrong_secret", &current_timestamp());

    let result = client
        .verify_webhook_signature(payload, &headers)
        .expect("Verification should not error");

    assert!(!result, "Invalid signature should be rejected");
}

#[test]
fn test_stripe_modified_payload() {
    let client = create_stripe_test_client();
    let original_payload = b"{\"id\":\"evt_1\",\"type\":\"payment_intent.succeeded\"}";
    let modified_payload =
        b"{\"id\":\"evt_1\",\"type\":\"payment_intent.succeeded\",\"hacked\":true}";
    // Sign the original payload
    let headers = stripe_headers(
        original_payload,
        TEST_STRIPE_WEBHOOK_SECRET,
        &current_timestamp(),
    );

    // Verify with modified payload
    let result = client
        .verify_webhook_signature(modified_payload, &headers)
        .expect("Verification should not error");

    assert!(!result, "Modified payload should be rejected");
}

#[test]
fn test_stripe_old_timestamp_rejected() {
    let client = create_stripe_test_client();
    let payload = b"{\"id\":\"evt_1\",\"type\":\"payment_intent.succeeded\"}";
    // Valid signature but timestamp too old
    let headers = stripe_headers(payload, TEST_STRIPE_WEBHOOK_SECRET, &old_timestamp());

    let result = client
        .verify_webhook_signature(payload, &headers)
        .expect("Verification should not error");

    assert!(
        !result,
        "Old timestamp should be rejected (replay attack prevention)"
    );
}

#[test]
fn test_stripe_missing_timestamp() {
    let client = create_stripe_test_client();
    let payload = b"{\"id\":\"evt_1\",\"type\":\"payment_intent.succeeded\"}";
    let mut headers = HeaderMap::new();
    headers.insert("stripe-signature", "v1=somesignature".parse().unwrap());

    let result = client.verify_webhook_signature(payload, &headers);

    assert!(result.is_err(), "Missing timestamp should error");
}

#[test]
fn test_stripe_missing_header() {
    let client = create_stripe_test_client();
    let payload = b"{}";
    let headers = HeaderMap::new();

    let result = client.verify_webhook_signature(payload, &headers);

    assert!(result.is_err(), "Missing signature header should error");
}

// ============ PayPal Transmission Verification Tests ============

fn paypal_headers(payload: &[u8], webhook_id: &str, secret: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in paypal_transmission_headers(payload, webhook_id, secret) {
        headers.insert(name, value.parse().unwrap());
    }
    headers
}

#[test]
fn test_paypal_valid_signature() {
    let client = create_paypal_test_client();
    let payload = b"{\"id\":\"WH-1\",\"event_type\":\"PAYMENT.CAPTURE.COMPLETED\"}";
    let headers = paypal_headers(payload, TEST_PAYPAL_WEBHOOK_ID, TEST_PAYPAL_WEBHOOK_SECRET);

    let result = client
        .verify_webhook_signature(payload, &headers)
        .expect("Verification should not error");

    assert!(result, "Valid transmission signature should be accepted");
}

#[test]
fn test_paypal_wrong_secret() {
    let client = create_paypal_test_client();
    let payload = b"{\"id\":\"WH-1\",\"event_type\":\"PAYMENT.CAPTURE.COMPLETED\"}";
    let headers = paypal_headers(payload, TEST_PAYPAL_WEBHOOK_ID, "wrong_secret");

    let result = client
        .verify_webhook_signature(payload, &headers)
        .expect("Verification should not error");

    assert!(!result, "Signature from wrong secret should be rejected");
}

#[test]
fn test_paypal_wrong_webhook_id() {
    let client = create_paypal_test_client();
    let payload = b"{\"id\":\"WH-1\",\"event_type\":\"PAYMENT.CAPTURE.COMPLETED\"}";
    // Signed for a different webhook endpoint
    let headers = paypal_headers(payload, "wh_other", TEST_PAYPAL_WEBHOOK_SECRET);

    let result = client
        .verify_webhook_signature(payload, &headers)
        .expect("Verification should not error");

    assert!(!result, "Signature for another webhook id should be rejected");
}

#[test]
fn test_paypal_modified_payload() {
    let client = create_paypal_test_client();
    let original = b"{\"id\":\"WH-1\",\"event_type\":\"PAYMENT.CAPTURE.COMPLETED\"}";
    let modified = b"{\"id\":\"WH-1\",\"event_type\":\"PAYMENT.CAPTURE.COMPLETED\",\"x\":1}";
    let headers = paypal_headers(original, TEST_PAYPAL_WEBHOOK_ID, TEST_PAYPAL_WEBHOOK_SECRET);

    let result = client
        .verify_webhook_signature(modified, &headers)
        .expect("Verification should not error");

    assert!(!result, "Modified payload should be rejected");
}

#[test]
fn test_paypal_missing_headers() {
    let client = create_paypal_test_client();
    let payload = b"{}";
    let headers = HeaderMap::new();

    let result = client.verify_webhook_signature(payload, &headers);

    assert!(result.is_err(), "Missing transmission headers should error");
}

#[test]
fn test_paypal_unsupported_algo_rejected() {
    let client = create_paypal_test_client();
    let payload = b"{\"id\":\"WH-1\",\"event_type\":\"PAYMENT.CAPTURE.COMPLETED\"}";
    let mut headers = paypal_headers(payload, TEST_PAYPAL_WEBHOOK_ID, TEST_PAYPAL_WEBHOOK_SECRET);
    headers.insert("paypal-auth-algo", "SHA256withRSA".parse().unwrap());

    let result = client
        .verify_webhook_signature(payload, &headers)
        .expect("Verification should not error");

    assert!(!result, "Unsupported auth algo should be rejected");
}

// ============ Event Normalization Tests ============

#[test]
fn test_stripe_unknown_event_type_normalizes_to_unknown() {
    let client = create_stripe_test_client();
    let payload = br#"{"id":"evt_42","type":"terminal.reader.action_failed","data":{"object":{}}}"#;

    let parsed = client.parse_webhook_event(payload).expect("parse");

    assert_eq!(parsed.external_id, "evt_42");
    assert!(matches!(
        parsed.event,
        giftflow::payments::NormalizedEvent::Unknown { .. }
    ));
}

#[test]
fn test_stripe_settlement_event_carries_fee_and_gift_id() {
    let client = create_stripe_test_client();
    let payload = br#"{
        "id": "evt_settle",
        "type": "payment_intent.succeeded",
        "data": {
            "object": {
                "id": "pi_123",
                "amount": 10000,
                "metadata": {"gift_id": "gf_gift_00000000000000000000000000000001"},
                "charges": {"data": [{"id": "ch_1", "balance_transaction": {"fee": 320}}]}
            }
        }
    }"#;

    let parsed = client.parse_webhook_event(payload).expect("parse");

    match parsed.event {
        giftflow::payments::NormalizedEvent::PaymentSucceeded(data) => {
            assert_eq!(data.processor_ref, "pi_123");
            assert_eq!(
                data.gift_id.as_deref(),
                Some("gf_gift_00000000000000000000000000000001")
            );
            assert_eq!(data.processor_fee_cents, Some(320));
            assert_eq!(data.mandate_id, None);
        }
        other => panic!("expected PaymentSucceeded, got {:?}", other),
    }
}

#[test]
fn test_paypal_capture_completed_parses_decimal_fee() {
    let client = create_paypal_test_client();
    let payload = br#"{
        "id": "WH-7",
        "event_type": "PAYMENT.CAPTURE.COMPLETED",
        "resource": {
            "id": "CAP-1",
            "custom_id": "gf_gift_00000000000000000000000000000002",
            "amount": {"value": "100.00", "currency_code": "USD"},
            "seller_receivable_breakdown": {"paypal_fee": {"value": "3.48", "currency_code": "USD"}}
        }
    }"#;

    let parsed = client.parse_webhook_event(payload).expect("parse");

    match parsed.event {
        giftflow::payments::NormalizedEvent::PaymentSucceeded(data) => {
            assert_eq!(data.processor_ref, "CAP-1");
            assert_eq!(data.amount_cents, Some(10_000));
            assert_eq!(data.processor_fee_cents, Some(348));
        }
        other => panic!("expected PaymentSucceeded, got {:?}", other),
    }
}

#[test]
fn test_stripe_subscription_invoice_maps_to_mandate_charge() {
    let client = create_stripe_test_client();
    let payload = br#"{
        "id": "evt_inv",
        "type": "invoice.paid",
        "data": {
            "object": {
                "id": "in_1",
                "subscription": "sub_9",
                "payment_intent": "pi_inv_1",
                "amount_paid": 2500
            }
        }
    }"#;

    let parsed = client.parse_webhook_event(payload).expect("parse");

    match parsed.event {
        giftflow::payments::NormalizedEvent::PaymentSucceeded(data) => {
            assert_eq!(data.mandate_id.as_deref(), Some("sub_9"));
            assert_eq!(data.processor_ref, "pi_inv_1");
        }
        other => panic!("expected PaymentSucceeded, got {:?}", other),
    }
}
