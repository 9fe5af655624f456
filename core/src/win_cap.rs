//! Win-cap policy resolution: tenant policy -> a voucher's maximum cashout.
//!
//! Policies arrive as loosely-typed JSON (tenant config rows, operator
//! edits). `WinCapPolicy::normalize` is the only way to build one, so a
//! `WinCapPolicy` value is always valid. Invalid requests fall back to the
//! policy default instead of failing issuance or redemption.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    rng::UnitRng,
    types::{clamp, json_f64, round_money, Money},
};

pub const DEFAULT_PERCENT_OPTIONS: [f64; 6] = [120.0, 150.0, 175.0, 200.0, 250.0, 300.0];
pub const DEFAULT_RANDOM_PERCENT_OPTIONS: [f64; 6] = [150.0, 175.0, 200.0, 225.0, 250.0, 300.0];
pub const DEFAULT_FIXED_PERCENT: f64 = 200.0;
pub const DEFAULT_DECAY_RATE: f64 = 0.08;
pub const DEFAULT_MIN_DECAY_AMOUNT: f64 = 0.01;
pub const DEFAULT_STAKE_DECAY_MULTIPLIER: f64 = 0.35;

pub const MIN_PERCENT: f64 = 1.0;
pub const MAX_PERCENT: f64 = 10_000.0;
pub const MIN_DECAY_RATE: f64 = 0.01;
pub const MAX_DECAY_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum WinCapMode {
    #[default]
    #[serde(rename = "fixed_percent")]
    Fixed,
    #[serde(rename = "random_percent")]
    Random,
}

impl WinCapMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed_percent",
            Self::Random => "random_percent",
        }
    }

    /// Anything other than `random_percent` is a fixed request.
    pub fn from_request(raw: &str) -> Self {
        if raw.trim() == "random_percent" {
            Self::Random
        } else {
            Self::Fixed
        }
    }
}

/// Where a selected percent came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    PolicyRandom,
    RequestFixed,
    PolicyFixed,
    RequestManual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WinCapPolicy {
    pub mode: WinCapMode,
    pub fixed_percent: f64,
    pub percent_options: Vec<f64>,
    pub random_percent_options: Vec<f64>,
    pub decay_rate: f64,
    pub min_decay_amount: Money,
    pub stake_decay_multiplier: f64,
}

impl Default for WinCapPolicy {
    fn default() -> Self {
        Self {
            mode: WinCapMode::Fixed,
            fixed_percent: DEFAULT_FIXED_PERCENT,
            percent_options: DEFAULT_PERCENT_OPTIONS.to_vec(),
            random_percent_options: DEFAULT_RANDOM_PERCENT_OPTIONS.to_vec(),
            decay_rate: DEFAULT_DECAY_RATE,
            min_decay_amount: DEFAULT_MIN_DECAY_AMOUNT,
            stake_decay_multiplier: DEFAULT_STAKE_DECAY_MULTIPLIER,
        }
    }
}

impl WinCapPolicy {
    /// Build a valid policy from raw JSON, repairing every field that is
    /// missing, out of range or of the wrong type.
    pub fn normalize(raw: &Value) -> Self {
        let mode = match raw.get("mode").and_then(Value::as_str) {
            Some("random_percent") => WinCapMode::Random,
            _ => WinCapMode::Fixed,
        };
        let percent_options = unique_percents(raw.get("percentOptions"), &DEFAULT_PERCENT_OPTIONS);
        let mut random_percent_options =
            unique_percents(raw.get("randomPercentOptions"), &DEFAULT_RANDOM_PERCENT_OPTIONS);
        if random_percent_options.is_empty() {
            random_percent_options = percent_options.clone();
        }

        let requested_fixed = json_f64(raw.get("fixedPercent")).unwrap_or(DEFAULT_FIXED_PERCENT);
        let mut fixed_percent = clamp(round2(requested_fixed), MIN_PERCENT, MAX_PERCENT);
        if !percent_options.contains(&fixed_percent) {
            let replacement = if percent_options.contains(&DEFAULT_FIXED_PERCENT) {
                DEFAULT_FIXED_PERCENT
            } else {
                percent_options[0]
            };
            log::warn!(
                "win-cap fixedPercent {fixed_percent} not in percentOptions, using {replacement}"
            );
            fixed_percent = replacement;
        }

        Self {
            mode,
            fixed_percent,
            percent_options,
            random_percent_options,
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
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Percent lists: numeric, positive, rounded to 2 decimals, deduped,
/// ascending. An unusable list yields the default.
fn unique_percents(input: Option<&Value>, fallback: &[f64]) -> Vec<f64> {
    let Some(items) = input.and_then(Value::as_array) else {
        return fallback.to_vec();
    };
    let mut values: Vec<f64> = Vec::new();
    for item in items {
        let Some(n) = json_f64(Some(item)) else { continue };
        if n <= 0.0 {
            continue;
        }
        let rounded = round2(n);
        if !values.contains(&rounded) {
            values.push(rounded);
        }
    }
    if values.is_empty() {
        return fallback.to_vec();
    }
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

fn round2(n: f64) -> f64 {
    (n * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WinCapSelection {
    pub mode: WinCapMode,
    pub selected_percent: f64,
    pub source: SelectionSource,
}

/// Pick the cap percent for one voucher.
///
/// With no requested mode the policy's own mode applies. A fixed request
/// is honored only when its percent is one of `percent_options`.
pub fn resolve_selection(
    policy: &WinCapPolicy,
    requested_mode: Option<WinCapMode>,
    requested_percent: Option<f64>,
    rng: &mut dyn UnitRng,
) -> WinCapSelection {
    let mode = requested_mode.unwrap_or(policy.mode);

    if mode == WinCapMode::Random {
        let options = &policy.random_percent_options;
        let selected_percent = if options.is_empty() {
            DEFAULT_FIXED_PERCENT
        } else {
            options[rng.index_below(options.len())]
        };
        return WinCapSelection {
            mode: WinCapMode::Random,
            selected_percent,
            source: SelectionSource::PolicyRandom,
        };
    }

    if let Some(pct) = requested_percent.filter(|p| p.is_finite() && *p > 0.0) {
        let rounded = round2(pct);
        if policy.percent_options.contains(&rounded) {
            return WinCapSelection {
                mode: WinCapMode::Fixed,
                selected_percent: rounded,
                source: SelectionSource::RequestFixed,
            };
        }
        log::debug!("requested win-cap percent {pct} not offered, using policy default");
    }

    WinCapSelection {
        mode: WinCapMode::Fixed,
        selected_percent: policy.fixed_percent,
        source: SelectionSource::PolicyFixed,
    }
}

/// `max(amount + bonus, amount * percent / 100)`. The cap never falls
/// below the credit actually granted.
pub fn compute_max_cashout(amount: Money, bonus_amount: Money, selected_percent: f64) -> Money {
    let amount = finite_non_negative(amount);
    let bonus = finite_non_negative(bonus_amount);
    let pct = if selected_percent.is_finite() {
        clamp(selected_percent, 0.0, MAX_PERCENT)
    } else {
        0.0
    };
    let total_credit = amount + bonus;
    round_money(total_credit.max(amount * pct / 100.0))
}

/// An operator-entered cap, floored at total credit.
pub fn manual_max_cashout(amount: Money, bonus_amount: Money, requested: Money) -> Money {
    let total_credit = finite_non_negative(amount) + finite_non_negative(bonus_amount);
    round_money(finite_non_negative(requested).max(total_credit))
}

fn finite_non_negative(v: f64) -> f64 {
    if v.is_finite() {
        v.max(0.0)
    } else {
        0.0
    }
}
