//! Per-voucher policy state between rounds.
//!
//! The cap/decay lifecycle is a one-way state machine:
//!
//!   NORMAL ──(round reaches cap)──> DECAY { cap_reached_at }
//!
//! There is no transition out of DECAY. `decay_mode` is derived from the
//! phase, so it cannot disagree with `cap_reached_at`. `decay_rounds`
//! only ever increments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::CoreResult,
    outcome_mode::OutcomeMode,
    payout::{DecayPolicy, PayoutOutcome, RoundMode},
    store::{CoreStore, WalletRow},
    types::{clamp, json_f64, round_money, Money, UserId},
    voucher::{Voucher, VoucherStatus},
    win_cap::{
        WinCapPolicy, DEFAULT_DECAY_RATE, DEFAULT_MIN_DECAY_AMOUNT,
        DEFAULT_STAKE_DECAY_MULTIPLIER, MAX_DECAY_RATE, MIN_DECAY_RATE,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapPhase {
    Normal,
    Decay { cap_reached_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoucherPolicyState {
    pub max_cashout: Money,
    /// `None` until a round (or redemption) has recorded a balance.
    pub tracked_balance: Option<Money>,
    phase: CapPhase,
    decay_rounds: u32,
    pub decay_rate: f64,
    pub min_decay_amount: Money,
    pub stake_decay_multiplier: f64,
    pub last_mode: Option<RoundMode>,
}

/// Everything a settled round contributes to the voucher's state.
#[derive(Debug, Clone, Copy)]
pub struct RoundUpdate<'a> {
    pub max_cashout: Money,
    pub outcome: &'a PayoutOutcome,
    pub balance_after_settle: Money,
    pub now: DateTime<Utc>,
}

impl Default for VoucherPolicyState {
    /// State of a voucher that has not been redeemed yet.
    fn default() -> Self {
        Self {
            max_cashout: 0.0,
            tracked_balance: None,
            phase: CapPhase::Normal,
            decay_rounds: 0,
            decay_rate: DEFAULT_DECAY_RATE,
            min_decay_amount: DEFAULT_MIN_DECAY_AMOUNT,
            stake_decay_multiplier: DEFAULT_STAKE_DECAY_MULTIPLIER,
            last_mode: None,
        }
    }
}

impl VoucherPolicyState {
    /// Initial state frozen at redemption in voucher-controlled mode.
    pub fn at_redemption(max_cashout: Money, credited: Money, policy: &WinCapPolicy) -> Self {
        Self {
            max_cashout: round_money(max_cashout),
            tracked_balance: Some(round_money(credited)),
            phase: CapPhase::Normal,
            decay_rounds: 0,
            decay_rate: policy.decay_rate,
            min_decay_amount: policy.min_decay_amount,
            stake_decay_multiplier: policy.stake_decay_multiplier,
            last_mode: None,
        }
    }

    /// State for a voucher redeemed while the tenant runs pure RNG.
    pub fn pure_rng() -> Self {
        Self {
            last_mode: Some(RoundMode::PureRng),
            ..Self::default()
        }
    }

    pub fn phase(&self) -> CapPhase {
        self.phase
    }

    pub fn decay_mode(&self) -> bool {
        matches!(self.phase, CapPhase::Decay { .. })
    }

    pub fn cap_reached_at(&self) -> Option<DateTime<Utc>> {
        match self.phase {
            CapPhase::Decay { cap_reached_at } => Some(cap_reached_at),
            CapPhase::Normal => None,
        }
    }

    pub fn decay_rounds(&self) -> u32 {
        self.decay_rounds
    }

    pub fn decay_policy(&self) -> DecayPolicy {
        DecayPolicy {
            decay_mode: self.decay_mode(),
            decay_rate: self.decay_rate,
            min_decay_amount: self.min_decay_amount,
            stake_decay_multiplier: self.stake_decay_multiplier,
        }
    }

    /// Fold one settled round into the state.
    pub fn apply_round_outcome(&self, update: RoundUpdate<'_>) -> VoucherPolicyState {
        let mut next = self.clone();
        if next.max_cashout <= 0.0 {
            next.max_cashout = round_money(update.max_cashout);
        }
        next.tracked_balance = Some(round_money(update.balance_after_settle));
        next.last_mode = Some(update.outcome.mode);

        if next.phase == CapPhase::Normal && update.outcome.reached_or_exceeded_cap {
            log::info!(
                "voucher cap {} reached at balance {}",
                next.max_cashout,
                update.balance_after_settle
            );
            next.phase = CapPhase::Decay {
                cap_reached_at: update.now,
            };
        }
        if update.outcome.mode == RoundMode::Decay {
            next.decay_rounds = next.decay_rounds.saturating_add(1);
        }
        next
    }

    /// Rebuild from persisted JSON, repairing malformed fields.
    /// `fallback_max_cashout` applies when the blob carries no usable cap.
    pub fn from_json(raw: &Value, fallback_max_cashout: Money) -> Self {
        let max_cashout = json_f64(raw.get("maxCashout"))
            .filter(|v| *v > 0.0)
            .unwrap_or(fallback_max_cashout.max(0.0));

        let tracked_balance = json_f64(raw.get("trackedBalance"))
            .or_else(|| json_f64(raw.get("lastBalance")))
            .map(|v| round_money(v.max(0.0)));

        let cap_reached_at = raw
            .get("capReachedAt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let legacy_decay_flag = raw.get("decayMode").and_then(Value::as_bool).unwrap_or(false);
        let phase = match (cap_reached_at, legacy_decay_flag) {
            (Some(at), _) => CapPhase::Decay { cap_reached_at: at },
            (None, true) => {
                log::warn!("voucher policy has decayMode without capReachedAt; keeping decay");
                CapPhase::Decay {
                    cap_reached_at: DateTime::<Utc>::UNIX_EPOCH,
                }
            }
            (None, false) => CapPhase::Normal,
        };

        let decay_rounds = json_f64(raw.get("decayRounds"))
            .map(|v| v.max(0.0).floor().min(u32::MAX as f64) as u32)
            .unwrap_or(0);

        Self {
            max_cashout: round_money(max_cashout),
            tracked_balance,
            phase,
            decay_rounds,
            decay_rate: clamp(
                json_f64(raw.get("decayRate")).unwrap_or(DEFAULT_DECAY_RATE),
                MIN_DECAY_RATE,
                MAX_DECAY_RATE,
            ),
            min_decay_amount: json_f64(raw.get("minDecayAmount"))
                .unwrap_or(DEFAULT_MIN_DECAY_AMOUNT)
                .max(0.0),
            stake_decay_multiplier: json_f64(raw.get("stakeDecayMultiplier"))
                .unwrap_or(DEFAULT_STAKE_DECAY_MULTIPLIER)
                .max(0.0),
            last_mode: raw
                .get("lastMode")
                .and_then(Value::as_str)
                .and_then(RoundMode::parse),
        }
    }

    /// Persisted form. `decayMode` is written for readers of the raw row
    /// but is always recomputed from `capReachedAt` on load.
    pub fn to_json(&self) -> Value {
        json!({
            "maxCashout": self.max_cashout,
            "trackedBalance": self.tracked_balance,
            "lastBalance": self.tracked_balance,
            "decayMode": self.decay_mode(),
            "capReachedAt": self.cap_reached_at().map(|t| t.to_rfc3339()),
            "decayRounds": self.decay_rounds,
            "decayRate": self.decay_rate,
            "minDecayAmount": self.min_decay_amount,
            "stakeDecayMultiplier": self.stake_decay_multiplier,
            "lastMode": self.last_mode.map(|m| m.as_str()),
        })
    }
}

/// Read-only projection for API consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoucherPolicyView {
    pub voucher_id: String,
    pub status: VoucherStatus,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub outcome_mode: OutcomeMode,
    pub outcomes_controlled_by_voucher: bool,
    pub max_cashout: Option<Money>,
    pub tracked_balance: Option<Money>,
    pub remaining_before_cap: Option<Money>,
    pub cap_progress: Option<f64>,
    pub decay_mode: Option<bool>,
    pub cap_reached_at: Option<DateTime<Utc>>,
    pub decay_rounds: Option<u32>,
    pub last_mode: Option<RoundMode>,
    pub jackpot_excluded_from_cap: bool,
}

/// Project a voucher's state. In pure RNG mode the cap and decay fields
/// are suppressed.
pub fn build_policy_view(
    voucher: &Voucher,
    wallet_balance: Money,
    outcome_mode: OutcomeMode,
) -> VoucherPolicyView {
    let base = VoucherPolicyView {
        voucher_id: voucher.voucher_id.clone(),
        status: voucher.status,
        redeemed_at: voucher.redeemed_at,
        expires_at: voucher.expires_at,
        outcome_mode,
        outcomes_controlled_by_voucher: outcome_mode.is_voucher_controlled(),
        max_cashout: None,
        tracked_balance: None,
        remaining_before_cap: None,
        cap_progress: None,
        decay_mode: None,
        cap_reached_at: None,
        decay_rounds: None,
        last_mode: voucher.policy_state.last_mode,
        jackpot_excluded_from_cap: true,
    };
    if !outcome_mode.is_voucher_controlled() {
        return base;
    }

    let state = &voucher.policy_state;
    let max_cashout = state.max_cashout;
    let tracked = round_money(
        state
            .tracked_balance
            .unwrap_or_else(|| max_cashout.min(wallet_balance))
            .max(0.0),
    );
    let remaining = if max_cashout > 0.0 { (max_cashout - tracked).max(0.0) } else { 0.0 };
    let progress = if max_cashout > 0.0 { (tracked / max_cashout).min(1.0) } else { 0.0 };

    VoucherPolicyView {
        max_cashout: Some(round_money(max_cashout)),
        tracked_balance: Some(tracked),
        remaining_before_cap: Some(round_money(remaining)),
        cap_progress: Some(round_money(progress)),
        decay_mode: Some(state.decay_mode()),
        cap_reached_at: state.cap_reached_at(),
        decay_rounds: Some(state.decay_rounds()),
        ..base
    }
}

/// The player's active voucher: the wallet's explicit link when it still
/// resolves in this tenant, else the most recently redeemed voucher.
pub fn resolve_active_voucher_for_wallet(
    store: &CoreStore,
    tenant_id: &str,
    wallet: &WalletRow,
    user_id: &UserId,
    persist_wallet_link: bool,
) -> CoreResult<Option<Voucher>> {
    let mut voucher = match &wallet.active_voucher_id {
        Some(id) => store.get_voucher(tenant_id, id)?,
        None => None,
    };
    if voucher.is_none() {
        voucher = store.latest_redeemed_voucher_for_user(tenant_id, user_id)?;
    }
    if persist_wallet_link {
        if let Some(v) = &voucher {
            if wallet.active_voucher_id.as_deref() != Some(v.voucher_id.as_str()) {
                store.set_active_voucher(&wallet.wallet_id, Some(&v.voucher_id))?;
            }
        }
    }
    Ok(voucher)
}

pub fn resolve_wallet_voucher_policy_state(
    store: &CoreStore,
    tenant_id: &str,
    wallet: &WalletRow,
    user_id: &UserId,
    outcome_mode: OutcomeMode,
) -> CoreResult<Option<VoucherPolicyView>> {
    let voucher = resolve_active_voucher_for_wallet(store, tenant_id, wallet, user_id, false)?;
    Ok(voucher.map(|v| build_policy_view(&v, wallet.balance, outcome_mode)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn outcome(mode: RoundMode, reached: bool) -> PayoutOutcome {
        PayoutOutcome {
            payout_amount: 0.0,
            balance_after_settle: 0.0,
            mode,
            progress: 0.0,
            reached_or_exceeded_cap: reached,
            decay_step: 0.0,
            target_balance_after_settle: 0.0,
            cap_applied: true,
        }
    }

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn cap_reached_marks_decay_once() {
        let state = VoucherPolicyState::at_redemption(200.0, 100.0, &WinCapPolicy::default());
        let hit = outcome(RoundMode::Normal, true);
        let next = state.apply_round_outcome(RoundUpdate {
            max_cashout: 200.0,
            outcome: &hit,
            balance_after_settle: 200.0,
            now: t(0),
        });
        assert_eq!(next.max_cashout, 200.0);
        assert_eq!(next.cap_reached_at(), Some(t(0)));
        assert!(next.decay_mode());
        assert_eq!(next.decay_rounds(), 0);

        let decay = outcome(RoundMode::Decay, true);
        let later = next.apply_round_outcome(RoundUpdate {
            max_cashout: 999.0,
            outcome: &decay,
            balance_after_settle: 180.0,
            now: t(5),
        });
        assert_eq!(later.cap_reached_at(), Some(t(0)));
        assert_eq!(later.decay_rounds(), 1);
        assert_eq!(later.max_cashout, 200.0);
        assert_eq!(later.tracked_balance, Some(180.0));
        assert_eq!(later.last_mode, Some(RoundMode::Decay));
    }

    #[test]
    fn normal_round_below_cap_stays_normal() {
        let state = VoucherPolicyState::at_redemption(200.0, 100.0, &WinCapPolicy::default());
        let miss = outcome(RoundMode::Normal, false);
        let next = state.apply_round_outcome(RoundUpdate {
            max_cashout: 200.0,
            outcome: &miss,
            balance_after_settle: 90.0,
            now: t(1),
        });
        assert_eq!(next.phase(), CapPhase::Normal);
        assert_eq!(next.decay_rounds(), 0);
    }

    #[test]
    fn json_round_trip_preserves_phase() {
        let state = VoucherPolicyState::at_redemption(300.0, 120.0, &WinCapPolicy::default());
        let hit = outcome(RoundMode::Decay, true);
        let state = state.apply_round_outcome(RoundUpdate {
            max_cashout: 300.0,
            outcome: &hit,
            balance_after_settle: 290.0,
            now: t(2),
        });
        let back = VoucherPolicyState::from_json(&state.to_json(), 0.0);
        assert_eq!(back, state);
    }

    #[test]
    fn malformed_json_self_heals() {
        let raw = json!({
            "maxCashout": "oops",
            "trackedBalance": -4,
            "decayMode": true,
            "decayRounds": "3",
            "decayRate": 2.0,
            "lastMode": "sideways"
        });
        let state = VoucherPolicyState::from_json(&raw, 150.0);
        assert_eq!(state.max_cashout, 150.0);
        assert_eq!(state.tracked_balance, Some(0.0));
        assert!(state.decay_mode());
        assert_eq!(state.decay_rounds(), 3);
        assert_eq!(state.decay_rate, MAX_DECAY_RATE);
        assert_eq!(state.last_mode, None);
    }
}
