//! Store methods for wallets and their transaction trail.

use crate::{
    error::{CoreError, CoreResult},
    types::{round_money, Money, WalletId},
};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use super::CoreStore;

#[derive(Debug, Clone, PartialEq)]
pub struct WalletRow {
    pub wallet_id: WalletId,
    pub tenant_id: String,
    pub user_id: String,
    pub currency: String,
    pub balance: Money,
    pub bonus_pending: Money,
    pub active_voucher_id: Option<String>,
}

const WALLET_COLUMNS: &str =
    "wallet_id, tenant_id, user_id, currency, balance, bonus_pending, active_voucher_id";

fn wallet_from_row(row: &Row<'_>) -> rusqlite::Result<WalletRow> {
    Ok(WalletRow {
        wallet_id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        currency: row.get(3)?,
        balance: row.get(4)?,
        bonus_pending: row.get(5)?,
        active_voucher_id: row.get(6)?,
    })
}

impl CoreStore {
    pub fn find_wallet(
        &self,
        tenant_id: &str,
        user_id: &str,
        currency: &str,
    ) -> CoreResult<Option<WalletRow>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {WALLET_COLUMNS} FROM wallet
                     WHERE tenant_id = ?1 AND user_id = ?2 AND currency = ?3"
                ),
                params![tenant_id, user_id, currency],
                wallet_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_or_create_wallet(
        &self,
        tenant_id: &str,
        user_id: &str,
        currency: &str,
        now_ms: i64,
    ) -> CoreResult<WalletRow> {
        self.conn.execute(
            "INSERT OR IGNORE INTO wallet
                (wallet_id, tenant_id, user_id, currency, balance, bonus_pending,
                 active_voucher_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, 0, NULL, ?5, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                tenant_id,
                user_id,
                currency,
                now_ms
            ],
        )?;
        self.find_wallet(tenant_id, user_id, currency)?
            .ok_or_else(|| CoreError::validation("wallet", "could not be created"))
    }

    /// Apply a signed amount and log it. Returns the new balance.
    /// A debit that would take the balance below zero is rejected.
    pub fn credit_debit(
        &self,
        wallet_id: &str,
        amount: Money,
        kind: &str,
        reference: Option<&str>,
        metadata: Option<&Value>,
        now_ms: i64,
    ) -> CoreResult<Money> {
        let (tenant_id, before): (String, Money) = self.conn.query_row(
            "SELECT tenant_id, balance FROM wallet WHERE wallet_id = ?1",
            params![wallet_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let after = round_money(before + amount);
        if after < 0.0 {
            return Err(CoreError::InsufficientFunds);
        }
        self.conn.execute(
            "UPDATE wallet SET balance = ?1, updated_at = ?2 WHERE wallet_id = ?3",
            params![after, now_ms, wallet_id],
        )?;
        let metadata = match metadata {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        self.conn.execute(
            "INSERT INTO wallet_transaction
                (txn_id, tenant_id, wallet_id, kind, amount, balance_before, balance_after,
                 reference, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                uuid::Uuid::new_v4().to_string(),
                tenant_id,
                wallet_id,
                kind,
                round_money(amount),
                before,
                after,
                reference,
                metadata,
                now_ms
            ],
        )?;
        Ok(after)
    }

    pub fn set_active_voucher(&self, wallet_id: &str, voucher_id: Option<&str>) -> CoreResult<()> {
        self.conn.execute(
            "UPDATE wallet SET active_voucher_id = ?1 WHERE wallet_id = ?2",
            params![voucher_id, wallet_id],
        )?;
        Ok(())
    }

    pub fn add_bonus_pending(&self, wallet_id: &str, amount: Money) -> CoreResult<Money> {
        self.conn.execute(
            "UPDATE wallet SET bonus_pending = ROUND(bonus_pending + ?1, 4) WHERE wallet_id = ?2",
            params![amount, wallet_id],
        )?;
        let pending: Money = self.conn.query_row(
            "SELECT bonus_pending FROM wallet WHERE wallet_id = ?1",
            params![wallet_id],
            |row| row.get(0),
        )?;
        Ok(pending)
    }

    /// Number of wallet transactions of one kind (`bet`, `win`, `voucher_redeem`).
    pub fn wallet_transaction_count(&self, wallet_id: &str, kind: &str) -> CoreResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM wallet_transaction WHERE wallet_id = ?1 AND kind = ?2",
            params![wallet_id, kind],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
