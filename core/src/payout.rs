//! Voucher-driven payout engine.
//!
//! Decides one round's win under the voucher's cap:
//!   - NORMAL (pre-cap): three-tier multiplier draw whose hit chance falls
//!     as the balance approaches the cap; clamped so a round never jumps
//!     past the cap.
//!   - DECAY (post-cap): a flatter draw clamped so the attributable
//!     balance ends the round at least `decay_step` below where it began.
//!
//! Pure function of its inputs plus the injected RNG.

use serde::{Deserialize, Serialize};

use crate::{
    rng::UnitRng,
    types::{clamp, round_money, Money},
    win_cap::{
        DEFAULT_DECAY_RATE, DEFAULT_MIN_DECAY_AMOUNT, DEFAULT_STAKE_DECAY_MULTIPLIER,
        MAX_DECAY_RATE, MIN_DECAY_RATE,
    },
};

/// Absorbs float rounding when comparing a balance with the cap.
pub const CAP_EPSILON: f64 = 0.0001;

const NORMAL_BASE_HIT_CHANCE: f64 = 0.72;
const NORMAL_HIT_CHANCE_SLOPE: f64 = 0.35;
const NORMAL_MIN_HIT_CHANCE: f64 = 0.32;
const NORMAL_MAX_HIT_CHANCE: f64 = 0.78;
const SMALL_TIER_MASS: f64 = 0.78;
const MEDIUM_TIER_MASS_END: f64 = 0.96;
const SMALL_TIER: (f64, f64) = (0.35, 1.35);
const MEDIUM_TIER: (f64, f64) = (1.35, 2.75);
const BIG_TIER: (f64, f64) = (2.75, 5.5);

const DECAY_HIT_CHANCE: f64 = 0.28;
const DECAY_LOW_TIER_MASS: f64 = 0.85;
const DECAY_LOW_TIER: (f64, f64) = (0.08, 0.6);
const DECAY_HIGH_TIER: (f64, f64) = (0.6, 1.05);

const PURE_RNG_HIT_CHANCE: f64 = 0.45;
const PURE_RNG_MAX_MULTIPLIER: f64 = 5.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoundMode {
    Normal,
    Decay,
    PureRng,
}

impl RoundMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Decay => "decay",
            Self::PureRng => "pure_rng",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "normal" => Some(Self::Normal),
            "decay" => Some(Self::Decay),
            "pure_rng" => Some(Self::PureRng),
            _ => None,
        }
    }
}

/// The decay-relevant slice of a voucher's policy state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecayPolicy {
    pub decay_mode: bool,
    pub decay_rate: f64,
    pub min_decay_amount: Money,
    pub stake_decay_multiplier: f64,
}

impl Default for DecayPolicy {
    fn default() -> Self {
        Self {
            decay_mode: false,
            decay_rate: DEFAULT_DECAY_RATE,
            min_decay_amount: DEFAULT_MIN_DECAY_AMOUNT,
            stake_decay_multiplier: DEFAULT_STAKE_DECAY_MULTIPLIER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayoutRequest {
    pub stake: Money,
    pub balance_before_bet: Money,
    pub balance_after_bet: Money,
    pub cap: Money,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PayoutOutcome {
    pub payout_amount: Money,
    pub balance_after_settle: Money,
    pub mode: RoundMode,
    pub progress: f64,
    pub reached_or_exceeded_cap: bool,
    pub decay_step: Money,
    pub target_balance_after_settle: Money,
    pub cap_applied: bool,
}

/// Decide one round's payout under the voucher cap.
pub fn compute_payout(
    req: &PayoutRequest,
    policy: &DecayPolicy,
    rng: &mut dyn UnitRng,
) -> PayoutOutcome {
    let stake = non_negative(req.stake);
    let before = non_negative(req.balance_before_bet);
    let after_bet = non_negative(req.balance_after_bet);
    let cap = non_negative(req.cap);
    let progress = if cap > 0.0 { clamp(before / cap, 0.0, 1.0) } else { 0.0 };

    let at_or_over_cap = policy.decay_mode
        || (cap > 0.0 && (before >= cap - CAP_EPSILON || after_bet >= cap - CAP_EPSILON));

    if at_or_over_cap {
        let decay_rate = clamp(policy.decay_rate, MIN_DECAY_RATE, MAX_DECAY_RATE);
        let min_decay = non_negative(policy.min_decay_amount);
        let stake_decay = stake * non_negative(policy.stake_decay_multiplier);

        let decay_step = min_decay.max(before * decay_rate).max(stake_decay);
        let target = (before - decay_step).max(0.0);
        let max_win_allowed = (target - after_bet).max(0.0);

        let sampled = sample_decay_payout(stake, rng);
        let payout = clamp(sampled, 0.0, max_win_allowed);
        log::debug!(
            "decay round: before={before} step={decay_step} allowed={max_win_allowed} sampled={sampled}"
        );

        return PayoutOutcome {
            payout_amount: round_money(payout),
            balance_after_settle: round_money(after_bet + payout),
            mode: RoundMode::Decay,
            progress,
            reached_or_exceeded_cap: true,
            decay_step: round_money(decay_step),
            target_balance_after_settle: round_money(target),
            cap_applied: cap > 0.0,
        };
    }

    let sampled = sample_pre_cap_payout(stake, progress, rng);
    let max_win_by_cap = if cap > 0.0 { (cap - after_bet).max(0.0) } else { f64::INFINITY };
    let payout = clamp(sampled, 0.0, max_win_by_cap);
    let balance_after_settle = after_bet + payout;
    let reached = cap > 0.0 && balance_after_settle >= cap - CAP_EPSILON;

    PayoutOutcome {
        payout_amount: round_money(payout),
        balance_after_settle: round_money(balance_after_settle),
        mode: RoundMode::Normal,
        progress,
        reached_or_exceeded_cap: reached,
        decay_step: 0.0,
        target_balance_after_settle: round_money(balance_after_settle),
        cap_applied: cap > 0.0,
    }
}

/// Unconstrained game RNG used when the tenant runs in pure RNG mode.
/// Jackpots and caps play no part.
pub fn compute_pure_rng_payout(
    stake: Money,
    balance_after_bet: Money,
    rng: &mut dyn UnitRng,
) -> PayoutOutcome {
    let stake = non_negative(stake);
    let after_bet = non_negative(balance_after_bet);
    let payout = if rng.next_f64() < PURE_RNG_HIT_CHANCE {
        let mult = (rng.between(1.0, PURE_RNG_MAX_MULTIPLIER) * 100.0).round() / 100.0;
        stake * mult
    } else {
        0.0
    };
    PayoutOutcome {
        payout_amount: round_money(payout),
        balance_after_settle: round_money(after_bet + payout),
        mode: RoundMode::PureRng,
        progress: 0.0,
        reached_or_exceeded_cap: false,
        decay_step: 0.0,
        target_balance_after_settle: round_money(after_bet + payout),
        cap_applied: false,
    }
}

fn sample_pre_cap_payout(stake: Money, progress: f64, rng: &mut dyn UnitRng) -> Money {
    let hit_chance = clamp(
        NORMAL_BASE_HIT_CHANCE - progress * NORMAL_HIT_CHANCE_SLOPE,
        NORMAL_MIN_HIT_CHANCE,
        NORMAL_MAX_HIT_CHANCE,
    );
    if rng.next_f64() > hit_chance {
        return 0.0;
    }
    let bucket = rng.next_f64();
    let (min_mult, max_mult) = if bucket <= SMALL_TIER_MASS {
        SMALL_TIER
    } else if bucket <= MEDIUM_TIER_MASS_END {
        MEDIUM_TIER
    } else {
        BIG_TIER
    };
    stake * rng.between(min_mult, max_mult)
}

fn sample_decay_payout(stake: Money, rng: &mut dyn UnitRng) -> Money {
    if rng.next_f64() > DECAY_HIT_CHANCE {
        return 0.0;
    }
    let (min_mult, max_mult) = if rng.next_f64() > DECAY_LOW_TIER_MASS {
        DECAY_HIGH_TIER
    } else {
        DECAY_LOW_TIER
    };
    stake * rng.between(min_mult, max_mult)
}

fn non_negative(v: f64) -> f64 {
    if v.is_finite() {
        v.max(0.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::SequenceRng;

    #[test]
    fn big_tier_hit_is_clamped_to_cap() {
        let req = PayoutRequest {
            stake: 20.0,
            balance_before_bet: 95.0,
            balance_after_bet: 75.0,
            cap: 100.0,
        };
        let mut rng = SequenceRng::new(vec![0.1, 0.99, 0.99]);
        let out = compute_payout(&req, &DecayPolicy::default(), &mut rng);
        assert_eq!(out.mode, RoundMode::Normal);
        assert_eq!(out.payout_amount, 25.0);
        assert_eq!(out.balance_after_settle, 100.0);
        assert!(out.reached_or_exceeded_cap);
    }

    #[test]
    fn decay_round_cannot_rise_above_target() {
        let req = PayoutRequest {
            stake: 10.0,
            balance_before_bet: 100.0,
            balance_after_bet: 90.0,
            cap: 100.0,
        };
        let policy = DecayPolicy {
            decay_mode: true,
            decay_rate: 0.1,
            min_decay_amount: 1.0,
            stake_decay_multiplier: 0.2,
        };
        let mut rng = SequenceRng::new(vec![0.1, 0.9, 0.9]);
        let out = compute_payout(&req, &policy, &mut rng);
        assert_eq!(out.mode, RoundMode::Decay);
        assert_eq!(out.payout_amount, 0.0);
        assert!(out.balance_after_settle <= 90.0);
        assert_eq!(out.decay_step, 10.0);
        assert!(out.reached_or_exceeded_cap);
    }

    #[test]
    fn miss_draw_pays_nothing() {
        let req = PayoutRequest {
            stake: 5.0,
            balance_before_bet: 10.0,
            balance_after_bet: 5.0,
            cap: 100.0,
        };
        let mut rng = SequenceRng::new(vec![0.95]);
        let out = compute_payout(&req, &DecayPolicy::default(), &mut rng);
        assert_eq!(out.payout_amount, 0.0);
        assert_eq!(out.balance_after_settle, 5.0);
        assert!(!out.reached_or_exceeded_cap);
        assert_eq!(rng.consumed(), 1);
    }

    #[test]
    fn hit_chance_falls_with_progress() {
        // At progress 0 the hit chance is 0.72, at progress 1 it is 0.37.
        let draw = vec![0.5, 0.0, 0.0];
        let low = PayoutRequest { stake: 1.0, balance_before_bet: 0.0, balance_after_bet: 0.0, cap: 100.0 };
        let high = PayoutRequest { stake: 1.0, balance_before_bet: 99.0, balance_after_bet: 98.0, cap: 100.0 };
        let a = compute_payout(&low, &DecayPolicy::default(), &mut SequenceRng::new(draw.clone()));
        let b = compute_payout(&high, &DecayPolicy::default(), &mut SequenceRng::new(draw));
        assert!(a.payout_amount > 0.0);
        assert_eq!(b.payout_amount, 0.0);
    }

    #[test]
    fn touching_cap_after_bet_enters_decay() {
        let req = PayoutRequest {
            stake: 1.0,
            balance_before_bet: 101.0,
            balance_after_bet: 100.0,
            cap: 100.0,
        };
        let out = compute_payout(&req, &DecayPolicy::default(), &mut SequenceRng::new(vec![0.9]));
        assert_eq!(out.mode, RoundMode::Decay);
    }

    #[test]
    fn zero_cap_is_unbounded_normal_mode() {
        let req = PayoutRequest { stake: 10.0, balance_before_bet: 50.0, balance_after_bet: 40.0, cap: 0.0 };
        let mut rng = SequenceRng::new(vec![0.1, 0.99, 1.0]);
        let out = compute_payout(&req, &DecayPolicy::default(), &mut rng);
        assert_eq!(out.mode, RoundMode::Normal);
        assert!(!out.cap_applied);
        assert!(!out.reached_or_exceeded_cap);
        assert!((out.payout_amount - 55.0).abs() < 1e-9);
    }

    #[test]
    fn pure_rng_multiplier_is_rounded() {
        let mut rng = SequenceRng::new(vec![0.1, 0.5]);
        let out = compute_pure_rng_payout(10.0, 90.0, &mut rng);
        assert_eq!(out.mode, RoundMode::PureRng);
        assert_eq!(out.payout_amount, 30.0);
        assert_eq!(out.balance_after_settle, 120.0);

        let mut rng = SequenceRng::new(vec![0.6]);
        assert_eq!(compute_pure_rng_payout(10.0, 90.0, &mut rng).payout_amount, 0.0);
    }
}
