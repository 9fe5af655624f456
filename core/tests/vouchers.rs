//! Voucher lifecycle through the engine: issue, redeem, cancel, expire.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use wager_core::{
    clock::ManualClock,
    context::{ActorRole, TenantContext},
    engine::{IssueVoucher, IssuedVoucher, WagerEngine},
    error::CoreError,
    event::LedgerEventType,
    rng::{RngSlot, SequenceRng},
    voucher::{CapRequest, VoucherStatus},
    win_cap::SelectionSource,
};

const TENANT: &str = "club-1";

fn build(seed: u64) -> (WagerEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 7, 1, 18, 0, 0).unwrap()));
    let engine = WagerEngine::build_test(seed, clock.clone()).expect("build test engine");
    engine.create_tenant(TENANT, "Club One").expect("tenant");
    (engine, clock)
}

fn cashier() -> TenantContext {
    TenantContext::staff(TENANT, ActorRole::Cashier, "cashier-1")
}

fn player() -> TenantContext {
    TenantContext::player(TENANT, "p1")
}

fn issue(engine: &mut WagerEngine, amount: f64, bonus: f64, cap: CapRequest) -> IssuedVoucher {
    engine
        .issue_voucher(
            &cashier(),
            IssueVoucher {
                amount,
                bonus_amount: bonus,
                currency: None,
                expires_at: None,
                cap,
            },
        )
        .expect("issue voucher")
}

#[test]
fn issued_voucher_has_code_pin_and_hashed_pin() {
    let (mut engine, _) = build(1);
    let issued = issue(&mut engine, 100.0, 0.0, CapRequest::default());

    assert_eq!(issued.voucher.code.len(), 12);
    assert!(issued.voucher.code.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(issued.pin.len(), 6);
    assert_ne!(issued.voucher.pin_hash, issued.pin);
    assert_eq!(issued.voucher.status, VoucherStatus::New);
    assert_eq!(issued.voucher.currency, "FUN");

    let stored = engine
        .store()
        .get_voucher(TENANT, &issued.voucher.voucher_id)
        .unwrap()
        .expect("stored");
    assert_eq!(stored.pin_hash, issued.voucher.pin_hash);
    assert_eq!(stored.policy_state.max_cashout, 0.0, "cap is resolved at redemption");
    assert_eq!(
        engine.store().ledger_event_count(TENANT, &LedgerEventType::VoucherIssued).unwrap(),
        1
    );
}

#[test]
fn players_cannot_issue() {
    let (mut engine, _) = build(2);
    let err = engine
        .issue_voucher(
            &player(),
            IssueVoucher {
                amount: 10.0,
                bonus_amount: 0.0,
                currency: None,
                expires_at: None,
                cap: CapRequest::default(),
            },
        )
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    assert_eq!(err.http_status(), 403);
}

#[test]
fn invalid_amounts_are_rejected() {
    let (mut engine, _) = build(3);
    for (amount, bonus) in [(0.0, 0.0), (-5.0, 0.0), (10.0, -1.0), (f64::NAN, 0.0)] {
        let err = engine
            .issue_voucher(
                &cashier(),
                IssueVoucher {
                    amount,
                    bonus_amount: bonus,
                    currency: None,
                    expires_at: None,
                    cap: CapRequest::default(),
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}

#[test]
fn unknown_tenant_is_rejected() {
    let (mut engine, _) = build(4);
    let ctx = TenantContext::staff("nope", ActorRole::Owner, "o");
    let err = engine
        .issue_voucher(
            &ctx,
            IssueVoucher {
                amount: 10.0,
                bonus_amount: 0.0,
                currency: None,
                expires_at: None,
                cap: CapRequest::default(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::TenantNotFound { .. }));
}

#[test]
fn redeem_credits_wallet_and_freezes_default_cap() {
    let (mut engine, _) = build(5);
    let issued = issue(&mut engine, 100.0, 0.0, CapRequest::default());

    let redemption = engine
        .redeem_voucher(&player(), "p1", Some("s1"), &issued.voucher.code, &issued.pin)
        .expect("redeem");
    assert_eq!(redemption.wallet_balance, 100.0);
    let selection = redemption.selection.expect("voucher controlled");
    assert_eq!(selection.selected_percent, 200.0);
    assert_eq!(selection.source, SelectionSource::PolicyFixed);
    assert_eq!(redemption.policy.max_cashout, Some(200.0));
    assert_eq!(redemption.policy.tracked_balance, Some(100.0));
    assert_eq!(redemption.policy.remaining_before_cap, Some(100.0));
    assert_eq!(redemption.policy.decay_mode, Some(false));

    let stored = engine
        .store()
        .get_voucher(TENANT, &issued.voucher.voucher_id)
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, VoucherStatus::Redeemed);
    assert_eq!(stored.redeemed_by_user_id.as_deref(), Some("p1"));
    assert!(stored.redeemed_at.is_some());
    assert_eq!(stored.max_cashout(), 200.0);
    assert_eq!(engine.wallet_balance(&player(), "p1").unwrap(), 100.0);
}

#[test]
fn bonus_goes_to_pending_and_raises_the_floor() {
    let (mut engine, _) = build(6);
    let issued = issue(&mut engine, 100.0, 50.0, CapRequest::fixed(120.0));
    let redemption = engine
        .redeem_voucher(&player(), "p1", None, &issued.voucher.code, &issued.pin)
        .unwrap();
    assert_eq!(redemption.wallet_balance, 100.0);
    assert_eq!(redemption.bonus_pending, 50.0);
    assert_eq!(redemption.policy.max_cashout, Some(150.0));
}

#[test]
fn random_cap_uses_the_win_cap_stream() {
    let (mut engine, _) = build(7);
    engine.set_rng(RngSlot::WinCap, Box::new(SequenceRng::new(vec![0.0])));
    let issued = issue(&mut engine, 100.0, 0.0, CapRequest::random());
    let redemption = engine
        .redeem_voucher(&player(), "p1", None, &issued.voucher.code, &issued.pin)
        .unwrap();
    let selection = redemption.selection.unwrap();
    assert_eq!(selection.source, SelectionSource::PolicyRandom);
    assert_eq!(selection.selected_percent, 150.0);
    assert_eq!(redemption.policy.max_cashout, Some(150.0));
}

#[test]
fn tenant_policy_override_applies_at_redemption() {
    let (mut engine, _) = build(8);
    engine
        .configure_tenant(&cashier(), &json!({ "voucher_win_cap_policy": { "fixedPercent": 300 } }))
        .unwrap();
    let issued = issue(&mut engine, 50.0, 0.0, CapRequest::default());
    let redemption = engine
        .redeem_voucher(&player(), "p1", None, &issued.voucher.code, &issued.pin)
        .unwrap();
    assert_eq!(redemption.policy.max_cashout, Some(150.0));
}

#[test]
fn wrong_pin_and_unknown_code_look_the_same() {
    let (mut engine, _) = build(9);
    let issued = issue(&mut engine, 10.0, 0.0, CapRequest::default());
    let wrong_pin = if issued.pin == "000000" { "111111" } else { "000000" };

    let err = engine
        .redeem_voucher(&player(), "p1", None, &issued.voucher.code, wrong_pin)
        .unwrap_err();
    assert!(matches!(err, CoreError::VoucherNotFound));
    let err = engine
        .redeem_voucher(&player(), "p1", None, "999999999999", &issued.pin)
        .unwrap_err();
    assert!(matches!(err, CoreError::VoucherNotFound));
    assert_eq!(err.http_status(), 404);
}

#[test]
fn voucher_redeems_exactly_once() {
    let (mut engine, _) = build(10);
    let issued = issue(&mut engine, 20.0, 0.0, CapRequest::default());
    engine
        .redeem_voucher(&player(), "p1", None, &issued.voucher.code, &issued.pin)
        .unwrap();
    let err = engine
        .redeem_voucher(&player(), "p2", None, &issued.voucher.code, &issued.pin)
        .unwrap_err();
    assert_eq!(err.code(), "VOUCHER_NOT_REDEEMABLE");
    assert_eq!(err.http_status(), 409);
    assert_eq!(engine.wallet_balance(&player(), "p1").unwrap(), 20.0);
    assert_eq!(engine.wallet_balance(&player(), "p2").unwrap(), 0.0);
}

#[test]
fn expired_voucher_cannot_be_redeemed() {
    let (mut engine, clock) = build(11);
    let expires_at = engine.now() + Duration::hours(1);
    let issued = engine
        .issue_voucher(
            &cashier(),
            IssueVoucher {
                amount: 25.0,
                bonus_amount: 0.0,
                currency: None,
                expires_at: Some(expires_at),
                cap: CapRequest::default(),
            },
        )
        .unwrap();
    clock.advance(Duration::hours(2));

    let err = engine
        .redeem_voucher(&player(), "p1", None, &issued.voucher.code, &issued.pin)
        .unwrap_err();
    assert!(matches!(err, CoreError::VoucherExpired));

    let stored = engine
        .store()
        .get_voucher(TENANT, &issued.voucher.voucher_id)
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, VoucherStatus::Expired);
    assert_eq!(
        engine.store().ledger_event_count(TENANT, &LedgerEventType::VoucherExpired).unwrap(),
        1
    );
    let err = engine
        .redeem_voucher(&player(), "p1", None, &issued.voucher.code, &issued.pin)
        .unwrap_err();
    assert_eq!(err.code(), "VOUCHER_NOT_REDEEMABLE");
}

#[test]
fn expiry_sweep_only_touches_due_new_vouchers() {
    let (mut engine, clock) = build(12);
    let soon = engine.now() + Duration::minutes(10);
    let late = engine.now() + Duration::days(30);
    for expires_at in [Some(soon), Some(late), None] {
        engine
            .issue_voucher(
                &cashier(),
                IssueVoucher {
                    amount: 5.0,
                    bonus_amount: 0.0,
                    currency: None,
                    expires_at,
                    cap: CapRequest::default(),
                },
            )
            .unwrap();
    }
    assert_eq!(engine.expire_vouchers(&cashier()).unwrap(), 0);
    clock.advance(Duration::hours(1));
    assert_eq!(engine.expire_vouchers(&cashier()).unwrap(), 1);
    assert_eq!(engine.expire_vouchers(&cashier()).unwrap(), 0);
}

#[test]
fn only_new_vouchers_can_be_cancelled() {
    let (mut engine, _) = build(13);
    let issued = issue(&mut engine, 15.0, 0.0, CapRequest::default());

    let cancelled = engine
        .cancel_voucher(&cashier(), &issued.voucher.voucher_id)
        .unwrap();
    assert_eq!(cancelled.status, VoucherStatus::Cancelled);

    let err = engine
        .cancel_voucher(&cashier(), &issued.voucher.voucher_id)
        .unwrap_err();
    assert_eq!(err.code(), "VOUCHER_NOT_REDEEMABLE");

    let err = engine
        .redeem_voucher(&player(), "p1", None, &issued.voucher.code, &issued.pin)
        .unwrap_err();
    assert_eq!(err.code(), "VOUCHER_NOT_REDEEMABLE");

    let err = engine.cancel_voucher(&player(), "whatever").unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
}
