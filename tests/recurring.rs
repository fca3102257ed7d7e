//! Recurring plan state machine tests: scheduling, pause/resume legality,
//! dunning, and processor-first cancellation ordering.

mod common;

use common::*;
use giftflow::error::AppError;
use giftflow::recurring::{self, DunningOutcome};

#[test]
fn test_next_charge_date_is_deterministic() {
    // 2024-01-15 00:00:00 UTC
    let base = 1_705_276_800;

    let monthly = recurring::next_charge_date(Frequency::Monthly, base).unwrap();
    let quarterly = recurring::next_charge_date(Frequency::Quarterly, base).unwrap();
    let annually = recurring::next_charge_date(Frequency::Annually, base).unwrap();

    let expected = |months: u32| {
        chrono::DateTime::<chrono::Utc>::from_timestamp(base, 0)
            .unwrap()
            .checked_add_months(chrono::Months::new(months))
            .unwrap()
            .timestamp()
    };

    assert_eq!(monthly, expected(1));
    assert_eq!(quarterly, expected(3));
    assert_eq!(annually, expected(12));
    assert!(monthly > base && quarterly > monthly && annually > quarterly);
}

#[test]
fn test_pause_and_resume_legality() {
    let conn = setup_test_db();
    let donor = create_test_donor(&conn, "a@example.com");
    let plan = create_test_plan(
        &conn,
        &donor.id,
        2_500,
        Frequency::Monthly,
        PaymentProcessor::Stripe,
        "sub_pause",
    );

    let paused = recurring::pause(&conn, &plan.id).unwrap();
    assert!(paused.was_applied());
    assert_eq!(paused.plan().status, PlanStatus::Paused);
    assert!(paused.plan().paused_at.is_some());

    // Pausing a paused plan: no-op.
    let again = recurring::pause(&conn, &plan.id).unwrap();
    assert!(!again.was_applied());

    let resumed = recurring::resume(&conn, &plan.id).unwrap();
    assert!(resumed.was_applied());
    assert_eq!(resumed.plan().status, PlanStatus::Active);
    assert!(resumed.plan().paused_at.is_none());
    // Resume schedules forward from now, never retro-charges the gap.
    assert!(resumed.plan().next_charge_date > chrono::Utc::now().timestamp());

    // Resuming an active plan: no-op.
    let again = recurring::resume(&conn, &plan.id).unwrap();
    assert!(!again.was_applied());
}

#[test]
fn test_cancelled_plan_rejects_pause_and_resume() {
    let conn = setup_test_db();
    let donor = create_test_donor(&conn, "b@example.com");
    let plan = create_test_plan(
        &conn,
        &donor.id,
        2_500,
        Frequency::Monthly,
        PaymentProcessor::Stripe,
        "sub_cancelled",
    );
    queries::cancel_plan(&conn, &plan.id, chrono::Utc::now().timestamp()).unwrap();

    assert!(matches!(
        recurring::pause(&conn, &plan.id).unwrap_err(),
        AppError::Conflict(_)
    ));
    assert!(matches!(
        recurring::resume(&conn, &plan.id).unwrap_err(),
        AppError::Conflict(_)
    ));
}

#[test]
fn test_dunning_counts_then_auto_pauses() {
    let conn = setup_test_db();
    let donor = create_test_donor(&conn, "c@example.com");
    let plan = create_test_plan(
        &conn,
        &donor.id,
        2_500,
        Frequency::Monthly,
        PaymentProcessor::Stripe,
        "sub_dunning",
    );

    let first = recurring::record_failed_charge(&conn, &plan.id, 3).unwrap();
    assert!(matches!(first, DunningOutcome::Counted { attempts: 1, .. }));

    let second = recurring::record_failed_charge(&conn, &plan.id, 3).unwrap();
    assert!(matches!(second, DunningOutcome::Counted { attempts: 2, .. }));

    // Third strike exhausts the budget: paused, not cancelled, so the
    // donor can fix their card and resume.
    let third = recurring::record_failed_charge(&conn, &plan.id, 3).unwrap();
    match third {
        DunningOutcome::AutoPaused(plan) => {
            assert_eq!(plan.status, PlanStatus::Paused);
            assert_eq!(plan.failed_attempts, 3);
        }
        other => panic!("expected AutoPaused, got {:?}", other),
    }

    // Further failures while paused are not counted.
    let fourth = recurring::record_failed_charge(&conn, &plan.id, 3).unwrap();
    assert!(matches!(fourth, DunningOutcome::NoOp(_)));
}

#[test]
fn test_successful_charge_resets_dunning_and_advances_schedule() {
    let conn = setup_test_db();
    let donor = create_test_donor(&conn, "d@example.com");
    let plan = create_test_plan(
        &conn,
        &donor.id,
        2_500,
        Frequency::Quarterly,
        PaymentProcessor::Stripe,
        "sub_reset",
    );

    recurring::record_failed_charge(&conn, &plan.id, 3).unwrap();
    recurring::record_failed_charge(&conn, &plan.id, 3).unwrap();

    let updated = recurring::record_successful_charge(&conn, &plan.id).unwrap();

    assert_eq!(updated.failed_attempts, 0);
    assert!(updated.last_charged_at.is_some());
    // next charge is strictly in the future relative to the charge
    assert!(updated.next_charge_date > updated.last_charged_at.unwrap());
}

#[test]
fn test_mandate_cancelled_webhook_heals_local_state() {
    let conn = setup_test_db();
    let donor = create_test_donor(&conn, "e@example.com");
    let plan = create_test_plan(
        &conn,
        &donor.id,
        2_500,
        Frequency::Monthly,
        PaymentProcessor::Stripe,
        "sub_heal",
    );

    let synced = recurring::sync_mandate_cancelled(&conn, &plan.id).unwrap();
    assert!(synced.was_applied());
    assert_eq!(synced.plan().status, PlanStatus::Cancelled);

    // Replayed cancellation: no-op.
    let replay = recurring::sync_mandate_cancelled(&conn, &plan.id).unwrap();
    assert!(!replay.was_applied());
}

#[tokio::test]
async fn test_cancel_keeps_plan_when_processor_call_fails() {
    let state = create_test_app_state();
    let plan = {
        let conn = state.db.get().unwrap();
        let donor = create_test_donor(&conn, "f@example.com");
        create_test_plan(
            &conn,
            &donor.id,
            2_500,
            Frequency::Monthly,
            PaymentProcessor::Stripe,
            "sub_unreachable",
        )
    };

    // The test registry points at an unroutable API base, so the mandate
    // cancellation at the processor fails.
    let result = recurring::cancel(&state, &plan.id).await;
    assert!(result.is_err());

    // Processor-first ordering: the local record must be unchanged, never
    // cancelled with a still-live external mandate.
    let conn = state.db.get().unwrap();
    let unchanged = queries::get_plan_by_id(&conn, &plan.id).unwrap().unwrap();
    assert_eq!(unchanged.status, PlanStatus::Active);
    assert!(unchanged.cancelled_at.is_none());
}

#[tokio::test]
async fn test_update_keeps_terms_when_processor_call_fails() {
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
            "sub_update_fail",
        )
    };

    let changes = UpdateRecurringPlan {
        amount_cents: Some(5_000),
        frequency: Some(Frequency::Annually),
    };
    let result = recurring::update_terms(&state, &plan.id, &changes).await;
    assert!(result.is_err());

    let conn = state.db.get().unwrap();
    let unchanged = queries::get_plan_by_id(&conn, &plan.id).unwrap().unwrap();
    assert_eq!(unchanged.amount_cents, 2_500);
    assert_eq!(unchanged.frequency, Frequency::Monthly);
}

#[tokio::test]
async fn test_update_without_changes_skips_processor() {
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
            "sub_noop_update",
        )
    };

    // Same terms: returns without touching the (unreachable) processor.
    let changes = UpdateRecurringPlan {
        amount_cents: Some(2_500),
        frequency: Some(Frequency::Monthly),
    };
    let unchanged = recurring::update_terms(&state, &plan.id, &changes).await.unwrap();
    assert_eq!(unchanged.amount_cents, 2_500);
}
