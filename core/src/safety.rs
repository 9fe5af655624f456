//! Player safety: session risk scoring, throttled interventions and the
//! hard loss-limit gate.
//!
//! RULE: `enforce_loss_limit` runs inside the bet transaction, before any
//! wallet write. Scoring and interventions run after commit and never
//! block a bet.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::{CoreError, CoreResult, LossLimitBreach},
    event::SpinRecord,
    store::CoreStore,
    types::{Cents, SessionId, UserId},
};

// ── Constants ────────────────────────────────────────────────────────────────

pub const MAX_SPINS: usize = 100;
pub const RECENT_SPINS: usize = 20;
const BET_ACCEL_MIN_INCREASES: u32 = 3;
const SPIN_RATE_MIN_SAMPLES: usize = 6;
const SPIN_RATE_MEDIAN_MS: f64 = 1200.0;
const GAME_HOP_WINDOW_MS: i64 = 5 * 60 * 1000;
const GAME_HOP_MIN_GAMES: usize = 3;
const LOSS_STREAK_MIN: u32 = 12;
const LOSS_CLUSTER_WINDOW_MS: i64 = 5 * 60 * 1000;
const LOSS_CLUSTER_ABSOLUTE_CENTS: f64 = 5000.0;
const LOSS_CLUSTER_BALANCE_SHARE: f64 = 0.3;

const NUDGE_THROTTLE_MS: i64 = 5 * 60 * 1000;
const COOLDOWN_THROTTLE_MS: i64 = 10 * 60 * 1000;
pub const COOLDOWN_SECONDS: u32 = 90;

pub const REASON_LOSS_LIMIT_HIT: &str = "LOSS_LIMIT_HIT";
const REASON_FALLBACK: &str = "RISK_SIGNAL";

pub const NUDGE_MESSAGE: &str =
    "Quick check-in: your pace/bets changed a lot in the last few minutes. Want to take a short break?";
pub const STOP_MESSAGE: &str = "Session limit reached. You've hit your loss cap for this session.";

pub fn cooldown_message(seconds: u32) -> String {
    format!("Let's pause for {seconds}s. Your balance and session will still be here.")
}

// ── Risk scoring ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskSignal {
    BetAccel,
    SpinRate,
    GameHop,
    LossStreak,
    LossCluster,
}

impl RiskSignal {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BetAccel => "BET_ACCEL",
            Self::SpinRate => "SPIN_RATE",
            Self::GameHop => "GAME_HOP",
            Self::LossStreak => "LOSS_STREAK",
            Self::LossCluster => "LOSS_CLUSTER",
        }
    }

    pub fn score(&self) -> u32 {
        match self {
            Self::BetAccel => 25,
            Self::SpinRate => 20,
            Self::GameHop => 15,
            Self::LossStreak => 20,
            Self::LossCluster => 20,
        }
    }
}

/// Cumulative thresholds on one additive score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskBand {
    Calm,
    Elevated,
    TiltRisk,
    Stop,
}

impl RiskBand {
    pub fn from_score(score: u32) -> Self {
        match score {
            s if s >= 75 => Self::Stop,
            s if s >= 50 => Self::TiltRisk,
            s if s >= 25 => Self::Elevated,
            _ => Self::Calm,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calm => "CALM",
            Self::Elevated => "ELEVATED",
            Self::TiltRisk => "TILT_RISK",
            Self::Stop => "STOP",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RiskEvidence {
    pub spin_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bet_increases: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub median_spin_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinct_games_5m: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss_streak: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss_5m_cents: Option<Cents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_start_balance_cents: Option<Cents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss_cluster_threshold_cents: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub score: u32,
    pub band: RiskBand,
    pub reasons: Vec<String>,
    pub evidence: RiskEvidence,
}

impl RiskAssessment {
    pub fn calm() -> Self {
        Self {
            score: 0,
            band: RiskBand::Calm,
            reasons: Vec::new(),
            evidence: RiskEvidence::default(),
        }
    }
}

/// Score a session from its spins (newest first, at most `MAX_SPINS`).
pub fn assess_spins(
    spins: &[SpinRecord],
    session_start_balance_cents: Option<Cents>,
    now: DateTime<Utc>,
) -> RiskAssessment {
    if spins.is_empty() {
        return RiskAssessment::calm();
    }
    let mut evidence = RiskEvidence {
        spin_count: spins.len(),
        ..RiskEvidence::default()
    };
    let mut tripped: Vec<RiskSignal> = Vec::new();

    // Chronological view of the most recent spins.
    let recent: Vec<&SpinRecord> = spins.iter().take(RECENT_SPINS).rev().collect();

    let bet_increases = recent
        .windows(2)
        .filter(|pair| pair[1].bet_cents > pair[0].bet_cents)
        .count() as u32;
    evidence.bet_increases = Some(bet_increases);
    if bet_increases >= BET_ACCEL_MIN_INCREASES {
        tripped.push(RiskSignal::BetAccel);
    }

    let mut times: Vec<i64> = recent
        .iter()
        .map(|s| s.client_ts.unwrap_or(s.ts).timestamp_millis())
        .collect();
    if times.len() >= SPIN_RATE_MIN_SAMPLES {
        times.sort_unstable();
        let deltas: Vec<f64> = times
            .windows(2)
            .map(|w| (w[1] - w[0]) as f64)
            .collect();
        evidence.median_spin_ms = median(&deltas);
        if evidence.median_spin_ms.is_some_and(|m| m < SPIN_RATE_MEDIAN_MS) {
            tripped.push(RiskSignal::SpinRate);
        }
    }

    let now_ms = now.timestamp_millis();
    let hop_start = now_ms - GAME_HOP_WINDOW_MS;
    let mut games: Vec<&str> = spins
        .iter()
        .filter(|s| s.ts.timestamp_millis() >= hop_start)
        .filter_map(|s| s.game_key.as_deref())
        .filter(|g| !g.is_empty())
        .collect();
    games.sort_unstable();
    games.dedup();
    evidence.distinct_games_5m = Some(games.len());
    if games.len() >= GAME_HOP_MIN_GAMES {
        tripped.push(RiskSignal::GameHop);
    }

    let loss_streak = spins.iter().take_while(|s| s.win_cents <= 0).count() as u32;
    evidence.loss_streak = Some(loss_streak);
    if loss_streak >= LOSS_STREAK_MIN {
        tripped.push(RiskSignal::LossStreak);
    }

    let cluster_start = now_ms - LOSS_CLUSTER_WINDOW_MS;
    let (bet, win) = spins
        .iter()
        .filter(|s| s.ts.timestamp_millis() >= cluster_start)
        .fold((0i64, 0i64), |(b, w), s| (b + s.bet_cents, w + s.win_cents));
    let loss_5m = (bet - win).max(0);
    evidence.loss_5m_cents = Some(loss_5m);
    evidence.session_start_balance_cents = session_start_balance_cents;
    if let Some(start) = session_start_balance_cents {
        let threshold =
            LOSS_CLUSTER_ABSOLUTE_CENTS.max(start as f64 * LOSS_CLUSTER_BALANCE_SHARE);
        evidence.loss_cluster_threshold_cents = Some(threshold);
        if loss_5m as f64 >= threshold {
            tripped.push(RiskSignal::LossCluster);
        }
    }

    let score: u32 = tripped.iter().map(RiskSignal::score).sum();
    RiskAssessment {
        score,
        band: RiskBand::from_score(score),
        reasons: tripped.iter().map(|s| s.code().to_string()).collect(),
        evidence,
    }
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Read-only: score the session from the ledger as it stands now.
pub fn compute_risk(
    store: &CoreStore,
    tenant_id: &str,
    session_id: &str,
    now: DateTime<Utc>,
) -> CoreResult<RiskAssessment> {
    let spins = store.query_recent_spins(tenant_id, session_id, MAX_SPINS)?;
    if spins.is_empty() {
        return Ok(RiskAssessment::calm());
    }
    let start_balance = store.session_start_balance_cents(tenant_id, session_id)?;
    let risk = assess_spins(&spins, start_balance, now);
    log::debug!(
        "session {session_id} risk {} ({}) reasons {:?}",
        risk.score,
        risk.band.as_str(),
        risk.reasons
    );
    Ok(risk)
}

// ── Interventions ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyActionType {
    Nudge,
    Cooldown,
    Stop,
}

impl SafetyActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nudge => "NUDGE",
            Self::Cooldown => "COOLDOWN",
            Self::Stop => "STOP",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "NUDGE" => Some(Self::Nudge),
            "COOLDOWN" => Some(Self::Cooldown),
            "STOP" => Some(Self::Stop),
            _ => None,
        }
    }

    pub fn severity(&self) -> u8 {
        match self {
            Self::Stop => 5,
            Self::Cooldown => 4,
            Self::Nudge => 2,
        }
    }
}

/// Persisted intervention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SafetyAction {
    pub id: i64,
    pub session_id: SessionId,
    pub player_id: Option<UserId>,
    pub game_key: Option<String>,
    pub action_type: SafetyActionType,
    pub reason_codes: Vec<String>,
    pub severity: u8,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// An intervention as returned to the player.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuedAction {
    pub action_type: SafetyActionType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u32>,
    pub record: SafetyAction,
}

/// Who an intervention is about.
#[derive(Debug, Clone, Copy)]
pub struct SafetySubject<'a> {
    pub session_id: &'a str,
    pub player_id: Option<&'a str>,
    pub game_key: Option<&'a str>,
}

fn throttled(
    store: &CoreStore,
    tenant_id: &str,
    session_id: &str,
    action_type: SafetyActionType,
    window_ms: i64,
    now: DateTime<Utc>,
) -> CoreResult<bool> {
    let last = store.last_safety_action_at(tenant_id, session_id, action_type)?;
    Ok(last.is_some_and(|at| now - at < Duration::milliseconds(window_ms)))
}

/// Turn a risk band into at most one persisted intervention.
///
/// The throttle lookup and the insert are not atomic; two concurrent
/// evaluations can both issue a NUDGE.
pub fn maybe_issue_action(
    store: &CoreStore,
    tenant_id: &str,
    subject: SafetySubject<'_>,
    risk: &RiskAssessment,
    now: DateTime<Utc>,
) -> CoreResult<Option<IssuedAction>> {
    let (action_type, cooldown_seconds, message) = match risk.band {
        RiskBand::Calm => return Ok(None),
        RiskBand::Elevated => {
            let session_id = subject.session_id;
            if throttled(store, tenant_id, session_id, SafetyActionType::Nudge, NUDGE_THROTTLE_MS, now)? {
                return Ok(None);
            }
            (SafetyActionType::Nudge, None, NUDGE_MESSAGE.to_string())
        }
        RiskBand::TiltRisk => {
            let session_id = subject.session_id;
            if throttled(store, tenant_id, session_id, SafetyActionType::Cooldown, COOLDOWN_THROTTLE_MS, now)? {
                return Ok(None);
            }
            (
                SafetyActionType::Cooldown,
                Some(COOLDOWN_SECONDS),
                cooldown_message(COOLDOWN_SECONDS),
            )
        }
        RiskBand::Stop => (SafetyActionType::Stop, None, STOP_MESSAGE.to_string()),
    };

    let reasons = if risk.reasons.is_empty() {
        vec![REASON_FALLBACK.to_string()]
    } else {
        risk.reasons.clone()
    };
    let mut details = json!({
        "score": risk.score,
        "band": risk.band.as_str(),
        "evidence": risk.evidence,
    });
    if let Some(seconds) = cooldown_seconds {
        details["cooldownSeconds"] = json!(seconds);
    }

    let record = store.insert_safety_action(
        tenant_id,
        subject.session_id,
        subject.player_id,
        subject.game_key,
        action_type,
        &reasons,
        action_type.severity(),
        &details,
        now,
    )?;
    log::info!(
        "session {} safety action {} ({:?})",
        subject.session_id,
        action_type.as_str(),
        reasons
    );
    Ok(Some(IssuedAction {
        action_type,
        message,
        cooldown_seconds,
        record,
    }))
}

// ── Loss limit ───────────────────────────────────────────────────────────────

/// One row per session. The limit only ever moves down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SafetyLimit {
    pub session_id: SessionId,
    pub player_id: Option<UserId>,
    pub loss_limit_cents: Cents,
    pub locked_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Hard gate: fails when the session's net loss plus the proposed loss
/// would reach the limit. No limit set means no gate.
pub fn enforce_loss_limit(
    store: &CoreStore,
    tenant_id: &str,
    session_id: &str,
    proposed_additional_loss_cents: Cents,
) -> CoreResult<()> {
    let Some(limit) = store.get_safety_limit(tenant_id, session_id)? else {
        return Ok(());
    };
    let (bets, wins) = store.sum_bets_and_wins(tenant_id, session_id)?;
    let current_loss_cents = (bets - wins).max(0);
    let projected_loss_cents = current_loss_cents + proposed_additional_loss_cents.max(0);
    if projected_loss_cents >= limit.loss_limit_cents {
        log::info!(
            "session {session_id} loss limit {} reached (projected {projected_loss_cents})",
            limit.loss_limit_cents
        );
        return Err(CoreError::LossLimitReached(LossLimitBreach {
            loss_limit_cents: limit.loss_limit_cents,
            current_loss_cents,
            projected_loss_cents,
        }));
    }
    Ok(())
}

/// Set or tighten the session's loss limit. A first call creates it;
/// later calls may lower it or repeat it, never raise it.
pub fn set_loss_limit(
    store: &CoreStore,
    tenant_id: &str,
    session_id: &str,
    player_id: Option<&str>,
    loss_limit_cents: Cents,
    now: DateTime<Utc>,
) -> CoreResult<SafetyLimit> {
    if loss_limit_cents <= 0 {
        return Err(CoreError::validation("loss_limit_cents", "must be greater than zero"));
    }
    if session_id.trim().is_empty() {
        return Err(CoreError::validation("session_id", "is required"));
    }
    store.in_transaction(|store| {
        match store.get_safety_limit(tenant_id, session_id)? {
            None => store.insert_safety_limit(tenant_id, session_id, player_id, loss_limit_cents, now)?,
            Some(existing) if loss_limit_cents > existing.loss_limit_cents => {
                return Err(CoreError::LossLimitLocked {
                    current_cents: existing.loss_limit_cents,
                    requested_cents: loss_limit_cents,
                });
            }
            Some(existing) if loss_limit_cents < existing.loss_limit_cents => {
                store.lower_safety_limit(tenant_id, session_id, loss_limit_cents, now)?;
            }
            Some(_) => {}
        }
        store
            .get_safety_limit(tenant_id, session_id)?
            .ok_or_else(|| CoreError::validation("session_id", "loss limit not stored"))
    })
}

/// Audit a tripped loss-limit gate as a STOP.
pub fn record_loss_limit_stop(
    store: &CoreStore,
    tenant_id: &str,
    subject: SafetySubject<'_>,
    breach: &LossLimitBreach,
    now: DateTime<Utc>,
) -> CoreResult<SafetyAction> {
    let details = json!({
        "score": 100,
        "band": RiskBand::Stop.as_str(),
        "evidence": breach,
    });
    store.insert_safety_action(
        tenant_id,
        subject.session_id,
        subject.player_id,
        subject.game_key,
        SafetyActionType::Stop,
        &[REASON_LOSS_LIMIT_HIT.to_string()],
        SafetyActionType::Stop.severity(),
        &details,
        now,
    )
}
