//! Ledger event vocabulary.
//!
//! RULE: Ledger events are append-only facts. Nothing in the core
//! updates or deletes a row once written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Cents, SessionId, TenantId, UserId};

/// Variants are added over time, never removed or renamed.
/// Unknown telemetry types are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LedgerEventType {
    Bet,
    Spin,
    Win,
    Deposit,
    Withdraw,
    VoucherIssued,
    VoucherRedeemed,
    VoucherExpired,
    VoucherCancelled,
    Login,
    JackpotWin,
    Other(String),
}

impl LedgerEventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Bet => "BET",
            Self::Spin => "SPIN",
            Self::Win => "WIN",
            Self::Deposit => "DEPOSIT",
            Self::Withdraw => "WITHDRAW",
            Self::VoucherIssued => "VOUCHER_ISSUED",
            Self::VoucherRedeemed => "VOUCHER_REDEEMED",
            Self::VoucherExpired => "VOUCHER_EXPIRED",
            Self::VoucherCancelled => "VOUCHER_CANCELLED",
            Self::Login => "LOGIN",
            Self::JackpotWin => "JACKPOT_WIN",
            Self::Other(s) => s.as_str(),
        }
    }

    /// Trimmed and upper-cased; empty input means SPIN.
    pub fn parse(raw: &str) -> Self {
        let norm = raw.trim().to_ascii_uppercase();
        match norm.as_str() {
            "" | "SPIN" => Self::Spin,
            "BET" => Self::Bet,
            "WIN" => Self::Win,
            "DEPOSIT" => Self::Deposit,
            "WITHDRAW" => Self::Withdraw,
            "VOUCHER_ISSUED" => Self::VoucherIssued,
            "VOUCHER_REDEEMED" => Self::VoucherRedeemed,
            "VOUCHER_EXPIRED" => Self::VoucherExpired,
            "VOUCHER_CANCELLED" => Self::VoucherCancelled,
            "LOGIN" => Self::Login,
            "JACKPOT_WIN" => Self::JackpotWin,
            _ => Self::Other(norm),
        }
    }
}

impl From<String> for LedgerEventType {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<LedgerEventType> for String {
    fn from(t: LedgerEventType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for LedgerEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger row as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEvent {
    pub id: i64,
    pub tenant_id: TenantId,
    pub ts: DateTime<Utc>,
    pub client_ts: Option<DateTime<Utc>>,
    pub player_id: Option<UserId>,
    pub session_id: Option<SessionId>,
    pub action_id: Option<String>,
    pub game_key: Option<String>,
    pub event_type: LedgerEventType,
    pub amount_cents: Option<Cents>,
    pub bet_cents: Option<Cents>,
    pub win_cents: Option<Cents>,
    pub balance_cents: Option<Cents>,
    pub source: Option<String>,
    pub meta: Option<serde_json::Value>,
}

/// Payload for `record_event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLedgerEvent {
    pub ts: DateTime<Utc>,
    pub client_ts: Option<DateTime<Utc>>,
    pub player_id: Option<UserId>,
    pub session_id: Option<SessionId>,
    pub action_id: Option<String>,
    pub game_key: Option<String>,
    pub event_type: LedgerEventType,
    pub amount_cents: Option<Cents>,
    pub bet_cents: Option<Cents>,
    pub win_cents: Option<Cents>,
    pub balance_cents: Option<Cents>,
    pub source: Option<String>,
    pub meta: Option<serde_json::Value>,
}

impl NewLedgerEvent {
    pub fn new(event_type: LedgerEventType, ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            client_ts: None,
            player_id: None,
            session_id: None,
            action_id: None,
            game_key: None,
            event_type,
            amount_cents: None,
            bet_cents: None,
            win_cents: None,
            balance_cents: None,
            source: None,
            meta: None,
        }
    }

    pub fn player(mut self, player_id: impl Into<UserId>) -> Self {
        self.player_id = Some(player_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn action(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn game(mut self, game_key: impl Into<String>) -> Self {
        self.game_key = Some(game_key.into());
        self
    }

    pub fn amount(mut self, cents: Cents) -> Self {
        self.amount_cents = Some(cents);
        self
    }

    pub fn bet(mut self, cents: Cents) -> Self {
        self.bet_cents = Some(cents);
        self
    }

    pub fn win(mut self, cents: Cents) -> Self {
        self.win_cents = Some(cents);
        self
    }

    pub fn balance(mut self, cents: Cents) -> Self {
        self.balance_cents = Some(cents);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// One SPIN joined to its stake and win.
#[derive(Debug, Clone, PartialEq)]
pub struct SpinRecord {
    pub ts: DateTime<Utc>,
    pub client_ts: Option<DateTime<Utc>>,
    pub game_key: Option<String>,
    pub bet_cents: Cents,
    pub win_cents: Cents,
}
