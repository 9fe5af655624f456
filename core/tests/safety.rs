//! Player safety engine: scoring from the ledger, throttled actions and
//! the loss-limit gate.

use chrono::{DateTime, Duration, TimeZone, Utc};
use wager_core::{
    error::CoreError,
    event::{LedgerEventType, NewLedgerEvent},
    safety::{
        compute_risk, enforce_loss_limit, maybe_issue_action, record_loss_limit_stop,
        set_loss_limit, RiskAssessment, RiskBand, RiskEvidence, SafetyActionType, SafetySubject,
        COOLDOWN_SECONDS, REASON_LOSS_LIMIT_HIT,
    },
    store::CoreStore,
};

const TENANT: &str = "tenant-safety";

fn store() -> CoreStore {
    let store = CoreStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    store
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 20, 0, 0).unwrap()
}

fn subject(session_id: &str) -> SafetySubject<'_> {
    SafetySubject {
        session_id,
        player_id: Some("p1"),
        game_key: Some("slots"),
    }
}

fn risk(band: RiskBand, reasons: &[&str]) -> RiskAssessment {
    RiskAssessment {
        score: match band {
            RiskBand::Calm => 0,
            RiskBand::Elevated => 25,
            RiskBand::TiltRisk => 55,
            RiskBand::Stop => 80,
        },
        band,
        reasons: reasons.iter().map(|r| r.to_string()).collect(),
        evidence: RiskEvidence::default(),
    }
}

fn record_spin(store: &CoreStore, session: &str, ts: DateTime<Utc>, game: &str, bet: i64, win: i64) {
    store
        .record_event(
            TENANT,
            &NewLedgerEvent::new(LedgerEventType::Spin, ts)
                .session(session)
                .game(game)
                .bet(bet)
                .win(win),
        )
        .expect("record spin");
}

#[test]
fn every_signal_tripped_scores_stop() {
    let store = store();
    store
        .record_event(
            TENANT,
            &NewLedgerEvent::new(LedgerEventType::Login, now() - Duration::minutes(30))
                .session("hot")
                .balance(10_000),
        )
        .unwrap();
    let games = ["a", "b", "c"];
    for i in 0..20i64 {
        let ts = now() - Duration::milliseconds((20 - i) * 900);
        record_spin(&store, "hot", ts, games[(i % 3) as usize], 500 + i * 10, 0);
    }

    let risk = compute_risk(&store, TENANT, "hot", now()).unwrap();
    assert_eq!(
        risk.reasons,
        vec!["BET_ACCEL", "SPIN_RATE", "GAME_HOP", "LOSS_STREAK", "LOSS_CLUSTER"]
    );
    assert_eq!(risk.score, 100);
    assert_eq!(risk.band, RiskBand::Stop);
    assert_eq!(risk.evidence.median_spin_ms, Some(900.0));
    assert_eq!(risk.evidence.loss_streak, Some(20));
    assert_eq!(risk.evidence.loss_5m_cents, Some(11_900));
    assert_eq!(risk.evidence.loss_cluster_threshold_cents, Some(5_000.0));
}

#[test]
fn quiet_session_is_calm() {
    let store = store();
    for i in 0..5i64 {
        record_spin(&store, "calm", now() - Duration::seconds(60 - i * 10), "a", 100, 150);
    }
    let risk = compute_risk(&store, TENANT, "calm", now()).unwrap();
    assert_eq!(risk.band, RiskBand::Calm);
    assert!(risk.reasons.is_empty());
    assert!(maybe_issue_action(&store, TENANT, subject("calm"), &risk, now())
        .unwrap()
        .is_none());
}

#[test]
fn nudge_is_throttled_for_five_minutes() {
    let store = store();
    let elevated = risk(RiskBand::Elevated, &["BET_ACCEL"]);

    let first = maybe_issue_action(&store, TENANT, subject("s"), &elevated, now()).unwrap();
    let first = first.expect("first nudge issues");
    assert_eq!(first.action_type, SafetyActionType::Nudge);
    assert_eq!(first.record.severity, 2);

    let soon = now() + Duration::minutes(4);
    assert!(maybe_issue_action(&store, TENANT, subject("s"), &elevated, soon)
        .unwrap()
        .is_none());

    let later = now() + Duration::minutes(5);
    assert!(maybe_issue_action(&store, TENANT, subject("s"), &elevated, later)
        .unwrap()
        .is_some());
}

#[test]
fn cooldown_is_ninety_seconds_and_throttled_for_ten_minutes() {
    let store = store();
    let tilt = risk(RiskBand::TiltRisk, &["SPIN_RATE", "LOSS_STREAK", "GAME_HOP"]);

    let issued = maybe_issue_action(&store, TENANT, subject("s"), &tilt, now())
        .unwrap()
        .expect("cooldown issues");
    assert_eq!(issued.action_type, SafetyActionType::Cooldown);
    assert_eq!(issued.cooldown_seconds, Some(COOLDOWN_SECONDS));
    assert_eq!(
        issued.message,
        "Let's pause for 90s. Your balance and session will still be here."
    );
    assert_eq!(issued.record.severity, 4);
    assert_eq!(issued.record.details["cooldownSeconds"], 90);

    let soon = now() + Duration::minutes(9);
    assert!(maybe_issue_action(&store, TENANT, subject("s"), &tilt, soon)
        .unwrap()
        .is_none());
    let later = now() + Duration::minutes(11);
    assert!(maybe_issue_action(&store, TENANT, subject("s"), &tilt, later)
        .unwrap()
        .is_some());
}

#[test]
fn stop_always_issues_and_falls_back_to_generic_reason() {
    let store = store();
    let stop = risk(RiskBand::Stop, &[]);
    for _ in 0..3 {
        let issued = maybe_issue_action(&store, TENANT, subject("s"), &stop, now())
            .unwrap()
            .expect("stop is never throttled");
        assert_eq!(issued.record.reason_codes, vec!["RISK_SIGNAL".to_string()]);
        assert_eq!(issued.record.severity, 5);
    }
    assert_eq!(store.safety_actions_for_session(TENANT, "s").unwrap().len(), 3);
}

#[test]
fn throttles_are_per_session() {
    let store = store();
    let elevated = risk(RiskBand::Elevated, &["BET_ACCEL"]);
    assert!(maybe_issue_action(&store, TENANT, subject("one"), &elevated, now())
        .unwrap()
        .is_some());
    assert!(maybe_issue_action(&store, TENANT, subject("two"), &elevated, now())
        .unwrap()
        .is_some());
}

#[test]
fn loss_limit_trips_on_projected_loss() {
    let store = store();
    set_loss_limit(&store, TENANT, "s", Some("p1"), 10_000, now()).unwrap();
    record_spin(&store, "s", now(), "a", 9_000, 0);

    let err = enforce_loss_limit(&store, TENANT, "s", 1_500).unwrap_err();
    let breach = err.loss_limit_breach().expect("typed breach");
    assert_eq!(breach.loss_limit_cents, 10_000);
    assert_eq!(breach.current_loss_cents, 9_000);
    assert_eq!(breach.projected_loss_cents, 10_500);
    assert_eq!(err.code(), "LOSS_LIMIT_REACHED");
    assert_eq!(err.http_status(), 403);

    assert!(enforce_loss_limit(&store, TENANT, "s", 999).is_ok());
}

#[test]
fn no_limit_means_no_gate() {
    let store = store();
    record_spin(&store, "free", now(), "a", 1_000_000, 0);
    assert!(enforce_loss_limit(&store, TENANT, "free", 1_000_000).is_ok());
}

#[test]
fn loss_limit_can_only_go_down() {
    let store = store();
    set_loss_limit(&store, TENANT, "s", Some("p1"), 500, now()).unwrap();

    match set_loss_limit(&store, TENANT, "s", Some("p1"), 800, now()) {
        Err(CoreError::LossLimitLocked {
            current_cents,
            requested_cents,
        }) => {
            assert_eq!(current_cents, 500);
            assert_eq!(requested_cents, 800);
        }
        other => panic!("expected LossLimitLocked, got {other:?}"),
    }

    let lowered = set_loss_limit(&store, TENANT, "s", Some("p1"), 300, now()).unwrap();
    assert_eq!(lowered.loss_limit_cents, 300);
    assert!(enforce_loss_limit(&store, TENANT, "s", 299).is_ok());
    assert!(enforce_loss_limit(&store, TENANT, "s", 300).is_err());

    let same = set_loss_limit(&store, TENANT, "s", Some("p1"), 300, now()).unwrap();
    assert_eq!(same.loss_limit_cents, 300);
}

#[test]
fn loss_limit_must_be_positive() {
    let store = store();
    let err = set_loss_limit(&store, TENANT, "s", None, 0, now()).unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert!(store.get_safety_limit(TENANT, "s").unwrap().is_none());
}

#[test]
fn loss_limit_stop_is_audited() {
    let store = store();
    set_loss_limit(&store, TENANT, "s", Some("p1"), 1_000, now()).unwrap();
    record_spin(&store, "s", now(), "a", 900, 0);
    let err = enforce_loss_limit(&store, TENANT, "s", 200).unwrap_err();
    let breach = *err.loss_limit_breach().unwrap();

    let stop = record_loss_limit_stop(&store, TENANT, subject("s"), &breach, now()).unwrap();
    assert_eq!(stop.action_type, SafetyActionType::Stop);
    assert_eq!(stop.reason_codes, vec![REASON_LOSS_LIMIT_HIT.to_string()]);
    assert_eq!(stop.severity, 5);
    assert_eq!(stop.details["score"], 100);
    assert_eq!(stop.details["band"], "STOP");
    assert_eq!(stop.details["evidence"]["projectedLossCents"], 1_100);
}
