//! Tenant-level switch between voucher-controlled and pure RNG outcomes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeMode {
    /// Rounds follow the voucher win-cap and decay policy.
    #[default]
    VoucherControlled,
    /// Rounds resolve by unconstrained RNG; vouchers are only credit.
    PureRng,
}

impl OutcomeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VoucherControlled => "voucher_controlled",
            Self::PureRng => "pure_rng",
        }
    }

    /// Lenient parse with legacy aliases. Unknown values yield `fallback`.
    pub fn normalize(raw: &str, fallback: OutcomeMode) -> OutcomeMode {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pure_rng" | "rng" | "random" | "legacy_rng" | "original_rng" => Self::PureRng,
            "voucher_controlled" | "voucher" | "voucher_cap" | "voucher_wincap" => {
                Self::VoucherControlled
            }
            _ => fallback,
        }
    }

    pub fn from_json(value: Option<&serde_json::Value>) -> OutcomeMode {
        value
            .and_then(|v| v.as_str())
            .map(|s| Self::normalize(s, Self::default()))
            .unwrap_or_default()
    }

    pub fn is_voucher_controlled(&self) -> bool {
        matches!(self, Self::VoucherControlled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_map_to_canonical_modes() {
        for raw in ["rng", "RANDOM", " legacy_rng ", "original_rng", "pure_rng"] {
            assert_eq!(OutcomeMode::normalize(raw, OutcomeMode::VoucherControlled), OutcomeMode::PureRng);
        }
        for raw in ["voucher", "voucher_cap", "voucher_wincap", "voucher_controlled"] {
            assert_eq!(OutcomeMode::normalize(raw, OutcomeMode::PureRng), OutcomeMode::VoucherControlled);
        }
    }

    #[test]
    fn unknown_falls_back() {
        assert_eq!(OutcomeMode::normalize("jackpot", OutcomeMode::PureRng), OutcomeMode::PureRng);
        assert_eq!(OutcomeMode::from_json(Some(&serde_json::json!(42))), OutcomeMode::VoucherControlled);
        assert_eq!(OutcomeMode::from_json(None), OutcomeMode::VoucherControlled);
    }
}
