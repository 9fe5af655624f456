//! Voucher-backed wagering core.
//!
//! Vouchers are redeemed into wallets with a frozen cashout cap. Each
//! round's payout is bounded by that cap and, once the cap is reached,
//! by a one-way decay regime. A session risk engine scores the ledger
//! after every round and a hard loss limit can veto a round before it
//! touches the wallet.

pub mod clock;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod outcome_mode;
pub mod payout;
pub mod rng;
pub mod safety;
pub mod store;
pub mod types;
pub mod voucher;
pub mod voucher_policy;
pub mod win_cap;
