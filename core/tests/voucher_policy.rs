//! Read-only voucher policy projection and persisted-state healing.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;
use wager_core::{
    clock::ManualClock,
    context::{ActorRole, TenantContext},
    engine::{IssueVoucher, WagerEngine},
    outcome_mode::OutcomeMode,
    voucher::{CapRequest, Voucher, VoucherStatus},
    voucher_policy::{build_policy_view, CapPhase, VoucherPolicyState},
};

const TENANT: &str = "club-1";

fn voucher_with(state: VoucherPolicyState) -> Voucher {
    let at = Utc.with_ymd_and_hms(2026, 2, 1, 10, 0, 0).unwrap();
    Voucher {
        voucher_id: "v-1".to_string(),
        tenant_id: TENANT.to_string(),
        code: "123456789012".to_string(),
        pin_hash: String::new(),
        amount: 100.0,
        bonus_amount: 0.0,
        currency: "FUN".to_string(),
        status: VoucherStatus::Redeemed,
        cap_request: CapRequest::default(),
        redeemed_by_user_id: Some("p1".to_string()),
        redeemed_at: Some(at),
        expires_at: None,
        policy_state: state,
        created_by: None,
        created_at: at,
    }
}

#[test]
fn untracked_balance_falls_back_to_wallet_under_cap() {
    let state = VoucherPolicyState::from_json(&json!({ "maxCashout": 200 }), 0.0);
    let view = build_policy_view(&voucher_with(state.clone()), 80.0, OutcomeMode::VoucherControlled);
    assert_eq!(view.tracked_balance, Some(80.0));
    assert_eq!(view.remaining_before_cap, Some(120.0));
    assert_eq!(view.cap_progress, Some(0.4));
    assert_eq!(view.decay_mode, Some(false));
    assert!(view.jackpot_excluded_from_cap);

    let view = build_policy_view(&voucher_with(state), 500.0, OutcomeMode::VoucherControlled);
    assert_eq!(view.tracked_balance, Some(200.0));
    assert_eq!(view.cap_progress, Some(1.0));
}

#[test]
fn pure_rng_suppresses_cap_fields() {
    let state = VoucherPolicyState::from_json(
        &json!({ "maxCashout": 200, "trackedBalance": 150, "decayMode": true }),
        0.0,
    );
    let view = build_policy_view(&voucher_with(state), 150.0, OutcomeMode::PureRng);
    assert!(!view.outcomes_controlled_by_voucher);
    assert_eq!(view.max_cashout, None);
    assert_eq!(view.tracked_balance, None);
    assert_eq!(view.remaining_before_cap, None);
    assert_eq!(view.decay_mode, None);
    assert_eq!(view.decay_rounds, None);
    assert_eq!(view.voucher_id, "v-1");
}

#[test]
fn legacy_decay_flag_is_kept_sticky() {
    let state = VoucherPolicyState::from_json(
        &json!({ "maxCashout": 200, "trackedBalance": 180, "decayMode": true }),
        0.0,
    );
    assert!(state.decay_mode());
    assert!(matches!(state.phase(), CapPhase::Decay { .. }));
    let view = build_policy_view(&voucher_with(state), 180.0, OutcomeMode::VoucherControlled);
    assert_eq!(view.decay_mode, Some(true));
}

#[test]
fn missing_cap_uses_column_fallback() {
    let state = VoucherPolicyState::from_json(&json!({ "maxCashout": "oops" }), 150.0);
    assert_eq!(state.max_cashout, 150.0);
    assert_eq!(state.phase(), CapPhase::Normal);
}

#[test]
fn projection_follows_the_redeemed_voucher() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 1, 10, 0, 0).unwrap()));
    let mut engine = WagerEngine::build_test(11, clock).expect("engine");
    engine.create_tenant(TENANT, "Club").unwrap();
    let staff = TenantContext::staff(TENANT, ActorRole::Cashier, "c1");
    let player = TenantContext::player(TENANT, "p1");

    let first = engine
        .issue_voucher(
            &staff,
            IssueVoucher {
                amount: 40.0,
                bonus_amount: 0.0,
                currency: None,
                expires_at: None,
                cap: CapRequest::fixed(150.0),
            },
        )
        .unwrap();
    let second = engine
        .issue_voucher(
            &staff,
            IssueVoucher {
                amount: 60.0,
                bonus_amount: 0.0,
                currency: None,
                expires_at: None,
                cap: CapRequest::fixed(300.0),
            },
        )
        .unwrap();

    engine
        .redeem_voucher(&player, "p1", None, &first.voucher.code, &first.pin)
        .unwrap();
    let view = engine.wallet_voucher_state(&player, "p1").unwrap().unwrap();
    assert_eq!(view.voucher_id, first.voucher.voucher_id);
    assert_eq!(view.max_cashout, Some(60.0));

    engine
        .redeem_voucher(&player, "p1", None, &second.voucher.code, &second.pin)
        .unwrap();
    let view = engine.wallet_voucher_state(&player, "p1").unwrap().unwrap();
    assert_eq!(view.voucher_id, second.voucher.voucher_id);
    assert_eq!(view.max_cashout, Some(180.0));
    assert_eq!(view.tracked_balance, Some(60.0));
    assert_eq!(engine.wallet_balance(&player, "p1").unwrap(), 100.0);
}
