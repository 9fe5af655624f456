//! Shared primitive types used across the entire core.

use chrono::{DateTime, TimeZone, Utc};

/// Tenant identifier. Every query is scoped by one.
pub type TenantId = String;

/// A player or staff user identifier.
pub type UserId = String;

/// A client play session. All risk computation is scoped to one.
pub type SessionId = String;

pub type VoucherId = String;
pub type WalletId = String;

/// Voucher and wallet money, rounded to 4 decimals at every persisted boundary.
pub type Money = f64;

/// Ledger and safety amounts are integer cents.
pub type Cents = i64;

/// Round to the 4-decimal money grid.
pub fn round_money(value: Money) -> Money {
    if !value.is_finite() {
        return 0.0;
    }
    (value * 10_000.0).round() / 10_000.0
}

/// Convert money to integer cents.
pub fn to_cents(value: Money) -> Cents {
    if !value.is_finite() {
        return 0;
    }
    (value * 100.0).round() as Cents
}

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Out-of-range values clamp to the epoch rather than failing a read.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub(crate) fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// Read a finite number from loosely-typed JSON. Numeric strings count;
/// null, NaN and anything else read as missing.
pub(crate) fn json_f64(value: Option<&serde_json::Value>) -> Option<f64> {
    let n = match value? {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}
