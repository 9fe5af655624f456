//! Voucher records and the pure parts of the voucher lifecycle.
//!
//! RULE: A voucher leaves NEW exactly once. REDEEMED freezes `max_cashout`;
//! CANCELLED and EXPIRED are only reachable from NEW.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    rng::UnitRng,
    types::{Money, TenantId, UserId, VoucherId},
    voucher_policy::VoucherPolicyState,
    win_cap::{
        compute_max_cashout, manual_max_cashout, resolve_selection, SelectionSource, WinCapMode,
        WinCapPolicy, WinCapSelection,
    },
};

pub const CODE_DIGITS: usize = 12;
pub const PIN_DIGITS: usize = 6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VoucherStatus {
    New,
    Redeemed,
    Cancelled,
    Expired,
}

impl VoucherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Redeemed => "redeemed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Unknown values read as cancelled so a corrupt row can never be redeemed.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "new" => Self::New,
            "redeemed" => Self::Redeemed,
            "expired" => Self::Expired,
            _ => Self::Cancelled,
        }
    }
}

impl std::fmt::Display for VoucherStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The issuing operator's cap request, resolved at redemption.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapRequest {
    pub mode: Option<WinCapMode>,
    pub percent: Option<f64>,
    /// A manual cap amount. Takes precedence over mode/percent.
    pub max_cashout: Option<Money>,
}

impl CapRequest {
    pub fn fixed(percent: f64) -> Self {
        Self {
            mode: Some(WinCapMode::Fixed),
            percent: Some(percent),
            max_cashout: None,
        }
    }

    pub fn random() -> Self {
        Self {
            mode: Some(WinCapMode::Random),
            ..Self::default()
        }
    }

    pub fn manual(max_cashout: Money) -> Self {
        Self {
            max_cashout: Some(max_cashout),
            ..Self::default()
        }
    }

    /// Resolve against the tenant policy. Returns the cap and how it was chosen.
    pub fn resolve(
        &self,
        amount: Money,
        bonus_amount: Money,
        policy: &WinCapPolicy,
        rng: &mut dyn UnitRng,
    ) -> (Money, WinCapSelection) {
        if let Some(manual) = self.max_cashout.filter(|m| m.is_finite() && *m > 0.0) {
            let cap = manual_max_cashout(amount, bonus_amount, manual);
            let selected_percent = if amount > 0.0 { cap / amount * 100.0 } else { 0.0 };
            return (
                cap,
                WinCapSelection {
                    mode: WinCapMode::Fixed,
                    selected_percent: (selected_percent * 100.0).round() / 100.0,
                    source: SelectionSource::RequestManual,
                },
            );
        }
        let selection = resolve_selection(policy, self.mode, self.percent, rng);
        let cap = compute_max_cashout(amount, bonus_amount, selection.selected_percent);
        (cap, selection)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Voucher {
    pub voucher_id: VoucherId,
    pub tenant_id: TenantId,
    pub code: String,
    pub pin_hash: String,
    pub amount: Money,
    pub bonus_amount: Money,
    pub currency: String,
    pub status: VoucherStatus,
    pub cap_request: CapRequest,
    pub redeemed_by_user_id: Option<UserId>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub policy_state: VoucherPolicyState,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Voucher {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at < now).unwrap_or(false)
    }

    pub fn max_cashout(&self) -> Money {
        self.policy_state.max_cashout
    }
}

/// SHA-256 of `voucher_id:pin`, hex encoded.
pub fn hash_pin(voucher_id: &str, pin: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(voucher_id.as_bytes());
    hasher.update(b":");
    hasher.update(pin.trim().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify_pin(voucher: &Voucher, pin: &str) -> bool {
    hash_pin(&voucher.voucher_id, pin) == voucher.pin_hash
}

pub fn generate_digits(rng: &mut dyn UnitRng, len: usize) -> String {
    (0..len)
        .map(|_| char::from(b'0' + rng.index_below(10) as u8))
        .collect()
}
