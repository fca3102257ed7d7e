//! Webhook dispatcher pipeline tests: gate ordering, idempotency,
//! transition routing, and integrity conflicts, end to end against the
//! in-memory store.

mod common;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use common::*;
use giftflow::handlers::webhooks::handle_webhook;

fn signed_stripe_headers(payload: &[u8]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let ts = chrono::Utc::now().timestamp().to_string();
    headers.insert(
        "stripe-signature",
        stripe_signature_header(payload, TEST_STRIPE_WEBHOOK_SECRET, &ts)
            .parse()
            .unwrap(),
    );
    headers
}

fn settlement_payload(event_id: &str, gift_id: &str, intent_id: &str, fee: i64) -> Vec<u8> {
    serde_json::json!({
        "id": event_id,
        "type": "payment_intent.succeeded",
        "data": {
            "object": {
                "id": intent_id,
                "amount": 10_000,
                "metadata": { "gift_id": gift_id },
                "charges": { "data": [{ "id": "ch_1", "balance_transaction": { "fee": fee } }] }
            }
        }
    })
    .to_string()
    .into_bytes()
}

async fn deliver(state: &AppState, payload: &[u8]) -> (StatusCode, &'static str) {
    handle_webhook(
        state,
        PaymentProcessor::Stripe,
        signed_stripe_headers(payload),
        Bytes::from(payload.to_vec()),
    )
    .await
}

#[tokio::test]
async fn test_settlement_end_to_end() {
    let state = create_test_app_state();
    let gift = {
        let conn = state.db.get().unwrap();
        let donor = create_test_donor(&conn, "a@example.com");
        create_test_gift(&conn, &donor.id, 10_000, false, PaymentProcessor::Stripe)
    };

    let payload = settlement_payload("evt_1", &gift.id, "pi_1", 320);
    let (status, note) = deliver(&state, &payload).await;

    assert_eq!(status, StatusCode::OK, "{}", note);

    let conn = state.db.get().unwrap();
    let settled = queries::get_gift_by_id(&conn, &gift.id).unwrap().unwrap();
    assert_eq!(settled.status, GiftStatus::Success);
    assert_eq!(settled.net_amount_cents, Some(9_680));
    assert!(queries::get_receipt_by_gift(&conn, &gift.id).unwrap().is_some());

    // Ledger row exists and is marked processed.
    let event = queries::get_webhook_event(&conn, PaymentProcessor::Stripe, "evt_1")
        .unwrap()
        .expect("ledger row must exist");
    assert!(event.processed);
    assert_eq!(event.event_type, "payment_intent.succeeded");
}

#[tokio::test]
async fn test_duplicate_delivery_has_single_effect() {
    let state = create_test_app_state();
    let gift = {
        let conn = state.db.get().unwrap();
        let donor = create_test_donor(&conn, "b@example.com");
        create_test_gift(&conn, &donor.id, 10_000, false, PaymentProcessor::Stripe)
    };

    let payload = settlement_payload("evt_dup", &gift.id, "pi_dup", 320);

    let (first, _) = deliver(&state, &payload).await;
    assert_eq!(first, StatusCode::OK);

    // 2nd..Nth deliveries succeed without reprocessing.
    for _ in 0..3 {
        let (status, note) = deliver(&state, &payload).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(note, "Already processed");
    }

    let conn = state.db.get().unwrap();
    let receipts: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM receipts WHERE gift_id = ?1",
            [&gift.id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(receipts, 1, "exactly one receipt across N deliveries");

    let audit_conn = state.audit.get().unwrap();
    let settle_entries =
        queries::count_audit_logs_for_resource(&audit_conn, "gift", &gift.id, "settle_gift")
            .unwrap();
    assert_eq!(settle_entries, 1, "exactly one settlement audit entry");
}

#[tokio::test]
async fn test_invalid_signature_never_reaches_the_ledger() {
    let state = create_test_app_state();
    let gift = {
        let conn = state.db.get().unwrap();
        let donor = create_test_donor(&conn, "c@example.com");
        create_test_gift(&conn, &donor.id, 10_000, false, PaymentProcessor::Stripe)
    };

    let payload = settlement_payload("evt_forged", &gift.id, "pi_forged", 320);
    let ts = chrono::Utc::now().timestamp().to_string();
    let mut headers = HeaderMap::new();
    headers.insert(
        "stripe-signature",
        stripe_signature_header(&payload, "attacker_secret", &ts)
            .parse()
            .unwrap(),
    );

    let (status, _) = handle_webhook(
        &state,
        PaymentProcessor::Stripe,
        headers,
        Bytes::from(payload.clone()),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let conn = state.db.get().unwrap();
    // The signature gate precedes the idempotency ledger and the state
    // machines: nothing was written anywhere.
    assert_eq!(queries::count_webhook_events(&conn).unwrap(), 0);
    let untouched = queries::get_gift_by_id(&conn, &gift.id).unwrap().unwrap();
    assert_eq!(untouched.status, GiftStatus::Pending);
}

#[tokio::test]
async fn test_missing_signature_header_is_bad_request() {
    let state = create_test_app_state();
    let payload = br#"{"id":"evt_x","type":"payment_intent.succeeded","data":{"object":{"id":"pi_x"}}}"#;

    let (status, _) = handle_webhook(
        &state,
        PaymentProcessor::Stripe,
        HeaderMap::new(),
        Bytes::from(payload.to_vec()),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let conn = state.db.get().unwrap();
    assert_eq!(queries::count_webhook_events(&conn).unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_event_type_is_acknowledged() {
    let state = create_test_app_state();
    let payload = serde_json::json!({
        "id": "evt_unknown",
        "type": "terminal.reader.action_failed",
        "data": { "object": {} }
    })
    .to_string()
    .into_bytes();

    let (status, _) = deliver(&state, &payload).await;
    assert_eq!(status, StatusCode::OK);

    // Forward compatibility: the event is claimed so redelivery is cheap,
    // but no state machine runs.
    let conn = state.db.get().unwrap();
    assert!(queries::get_webhook_event(&conn, PaymentProcessor::Stripe, "evt_unknown")
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_conflicting_settlement_returns_conflict() {
    let state = create_test_app_state();
    let gift = {
        let conn = state.db.get().unwrap();
        let donor = create_test_donor(&conn, "d@example.com");
        create_test_gift(&conn, &donor.id, 10_000, false, PaymentProcessor::Stripe)
    };

    let first = settlement_payload("evt_a", &gift.id, "pi_first", 320);
    let (status, _) = deliver(&state, &first).await;
    assert_eq!(status, StatusCode::OK);

    // A different event claiming success with a different intent for the
    // same gift: integrity alarm, not a silent overwrite.
    let second = settlement_payload("evt_b", &gift.id, "pi_second", 320);
    let (status, _) = deliver(&state, &second).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let conn = state.db.get().unwrap();
    let unchanged = queries::get_gift_by_id(&conn, &gift.id).unwrap().unwrap();
    assert_eq!(unchanged.processor_ref.as_deref(), Some("pi_first"));

    // The conflicted event is claimed, so redelivery won't re-alarm.
    let event = queries::get_webhook_event(&conn, PaymentProcessor::Stripe, "evt_b")
        .unwrap()
        .unwrap();
    assert!(event.processed);
}

#[tokio::test]
async fn test_failure_event_routes_to_failed() {
    let state = create_test_app_state();
    let gift = {
        let conn = state.db.get().unwrap();
        let donor = create_test_donor(&conn, "e@example.com");
        create_test_gift(&conn, &donor.id, 10_000, false, PaymentProcessor::Stripe)
    };

    let payload = serde_json::json!({
        "id": "evt_fail",
        "type": "payment_intent.payment_failed",
        "data": {
            "object": {
                "id": "pi_declined",
                "metadata": { "gift_id": gift.id },
                "last_payment_error": { "code": "card_declined", "message": "Card was declined" }
            }
        }
    })
    .to_string()
    .into_bytes();

    let (status, _) = deliver(&state, &payload).await;
    assert_eq!(status, StatusCode::OK);

    let conn = state.db.get().unwrap();
    let failed = queries::get_gift_by_id(&conn, &gift.id).unwrap().unwrap();
    assert_eq!(failed.status, GiftStatus::Failed);
    assert!(queries::get_receipt_by_gift(&conn, &gift.id).unwrap().is_none());
}

#[tokio::test]
async fn test_refund_event_closes_the_loop() {
    let state = create_test_app_state();
    let gift = {
        let conn = state.db.get().unwrap();
        let donor = create_test_donor(&conn, "f@example.com");
        create_test_gift(&conn, &donor.id, 10_000, false, PaymentProcessor::Stripe)
    };

    let settle = settlement_payload("evt_s", &gift.id, "pi_refundable", 320);
    deliver(&state, &settle).await;

    let refund = serde_json::json!({
        "id": "evt_r",
        "type": "refund.created",
        "data": {
            "object": {
                "id": "re_1",
                "status": "succeeded",
                "amount": 10_000,
                "payment_intent": "pi_refundable"
            }
        }
    })
    .to_string()
    .into_bytes();

    let (status, _) = deliver(&state, &refund).await;
    assert_eq!(status, StatusCode::OK);

    let conn = state.db.get().unwrap();
    let refunded = queries::get_gift_by_id(&conn, &gift.id).unwrap().unwrap();
    assert_eq!(refunded.status, GiftStatus::Refunded);
    assert!(refunded.refunded_at.is_some());
    // Receipt survives the refund.
    assert!(queries::get_receipt_by_gift(&conn, &gift.id).unwrap().is_some());
}

#[tokio::test]
async fn test_recurring_charge_creates_gift_and_advances_schedule() {
    let state = create_test_app_state();
    let plan = {
        let conn = state.db.get().unwrap();
        let donor = create_test_donor(&conn, "g@example.com");
        create_test_plan(
            &conn,
            &donor.id,
            2_500,
            Frequency::Monthly,
            PaymentProcessor::Stripe,
            "sub_charge",
        )
    };

    let payload = serde_json::json!({
        "id": "evt_invoice",
        "type": "invoice.paid",
        "data": {
            "object": {
                "id": "in_1",
                "subscription": "sub_charge",
                "payment_intent": "pi_cycle_1",
                "amount_paid": 2_500
            }
        }
    })
    .to_string()
    .into_bytes();

    let (status, _) = deliver(&state, &payload).await;
    assert_eq!(status, StatusCode::OK);

    let conn = state.db.get().unwrap();
    let updated = queries::get_plan_by_id(&conn, &plan.id).unwrap().unwrap();
    assert_eq!(updated.failed_attempts, 0);
    assert!(updated.last_charged_at.is_some());
    // next charge is in the future relative to the successful charge
    assert!(updated.next_charge_date > updated.last_charged_at.unwrap());

    let charge_gift = queries::get_gift_by_processor_ref(&conn, PaymentProcessor::Stripe, "pi_cycle_1")
        .unwrap()
        .expect("recurring charge must create a gift");
    assert_eq!(charge_gift.plan_id.as_deref(), Some(plan.id.as_str()));
    assert_eq!(charge_gift.status, GiftStatus::Success);
    assert!(queries::get_receipt_by_gift(&conn, &charge_gift.id).unwrap().is_some());
}

#[tokio::test]
async fn test_dunning_pauses_plan_after_three_failures() {
    let state = create_test_app_state();
    let plan = {
        let conn = state.db.get().unwrap();
        let donor = create_test_donor(&conn, "h@example.com");
        create_test_plan(
            &conn,
            &donor.id,
            2_500,
            Frequency::Monthly,
            PaymentProcessor::Stripe,
            "sub_dun",
        )
    };

    for (i, expected_status) in [
        (1u32, PlanStatus::Active),
        (2, PlanStatus::Active),
        (3, PlanStatus::Paused),
    ] {
        let payload = serde_json::json!({
            "id": format!("evt_dun_{}", i),
            "type": "invoice.payment_failed",
            "data": {
                "object": { "id": format!("in_dun_{}", i), "subscription": "sub_dun" }
            }
        })
        .to_string()
        .into_bytes();

        let (status, _) = deliver(&state, &payload).await;
        assert_eq!(status, StatusCode::OK);

        let conn = state.db.get().unwrap();
        let current = queries::get_plan_by_id(&conn, &plan.id).unwrap().unwrap();
        assert_eq!(current.status, expected_status, "after failure {}", i);
        assert_eq!(current.failed_attempts, i);
    }
}

#[tokio::test]
async fn test_mandate_cancelled_webhook_cancels_plan() {
    let state = create_test_app_state();
    let plan = {
        let conn = state.db.get().unwrap();
        let donor = create_test_donor(&conn, "i@example.com");
        create_test_plan(
            &conn,
            &donor.id,
            2_500,
            Frequency::Monthly,
            PaymentProcessor::Stripe,
            "sub_gone",
        )
    };

    let payload = serde_json::json!({
        "id": "evt_sub_del",
        "type": "customer.subscription.deleted",
        "data": { "object": { "id": "sub_gone", "status": "canceled" } }
    })
    .to_string()
    .into_bytes();

    let (status, _) = deliver(&state, &payload).await;
    assert_eq!(status, StatusCode::OK);

    let conn = state.db.get().unwrap();
    let cancelled = queries::get_plan_by_id(&conn, &plan.id).unwrap().unwrap();
    assert_eq!(cancelled.status, PlanStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());
}

#[tokio::test]
async fn test_event_for_unknown_gift_is_acknowledged() {
    let state = create_test_app_state();

    // Settlement for a gift we never created: acknowledged so the
    // processor stops retrying, but nothing mutates.
    let payload = settlement_payload(
        "evt_orphan",
        "gf_gift_00000000000000000000000000000000",
        "pi_orphan",
        320,
    );
    let (status, _) = deliver(&state, &payload).await;
    assert_eq!(status, StatusCode::OK);
}
