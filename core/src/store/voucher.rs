//! Store methods for vouchers.
//!
//! `policy_state` is normalized on every read, so a malformed blob never
//! reaches the payout path.

use chrono::{DateTime, Utc};
use crate::{
    error::CoreResult,
    types::{from_millis, to_millis},
    voucher::{CapRequest, Voucher, VoucherStatus},
    voucher_policy::VoucherPolicyState,
};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use super::{parse_json_column, CoreStore};

const VOUCHER_COLUMNS: &str = "voucher_id, tenant_id, code, pin_hash, amount, bonus_amount,
     currency, status, cap_request, max_cashout, redeemed_by_user_id, redeemed_at, expires_at,
     policy_state, created_by, created_at";

fn voucher_from_row(row: &Row<'_>) -> rusqlite::Result<Voucher> {
    let status: String = row.get(7)?;
    let cap_request = parse_json_column(row.get(8)?)
        .and_then(|v| serde_json::from_value::<CapRequest>(v).ok())
        .unwrap_or_default();
    let max_cashout: Option<f64> = row.get(9)?;
    let policy_state = VoucherPolicyState::from_json(
        &parse_json_column(row.get(13)?).unwrap_or(Value::Null),
        max_cashout.unwrap_or(0.0),
    );
    Ok(Voucher {
        voucher_id: row.get(0)?,
        tenant_id: row.get(1)?,
        code: row.get(2)?,
        pin_hash: row.get(3)?,
        amount: row.get(4)?,
        bonus_amount: row.get(5)?,
        currency: row.get(6)?,
        status: VoucherStatus::parse(&status),
        cap_request,
        redeemed_by_user_id: row.get(10)?,
        redeemed_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
        expires_at: row.get::<_, Option<i64>>(12)?.map(from_millis),
        policy_state,
        created_by: row.get(14)?,
        created_at: from_millis(row.get(15)?),
    })
}

impl CoreStore {
    pub fn insert_voucher(&self, voucher: &Voucher) -> CoreResult<()> {
        self.conn.execute(
            "INSERT INTO voucher
                (voucher_id, tenant_id, code, pin_hash, amount, bonus_amount, currency, status,
                 cap_request, max_cashout, redeemed_by_user_id, redeemed_at, expires_at,
                 policy_state, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL, NULL, ?10, NULL, ?11, ?12, ?12)",
            params![
                voucher.voucher_id,
                voucher.tenant_id,
                voucher.code,
                voucher.pin_hash,
                voucher.amount,
                voucher.bonus_amount,
                voucher.currency,
                voucher.status.as_str(),
                serde_json::to_string(&voucher.cap_request)?,
                voucher.expires_at.map(to_millis),
                voucher.created_by,
                to_millis(voucher.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_voucher(&self, tenant_id: &str, voucher_id: &str) -> CoreResult<Option<Voucher>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {VOUCHER_COLUMNS} FROM voucher WHERE tenant_id = ?1 AND voucher_id = ?2"
                ),
                params![tenant_id, voucher_id],
                voucher_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_voucher_by_code(&self, tenant_id: &str, code: &str) -> CoreResult<Option<Voucher>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {VOUCHER_COLUMNS} FROM voucher WHERE tenant_id = ?1 AND code = ?2"),
                params![tenant_id, code.trim()],
                voucher_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn code_in_use(&self, tenant_id: &str, code: &str) -> CoreResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM voucher WHERE tenant_id = ?1 AND code = ?2",
                params![tenant_id, code],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The user's most recently redeemed voucher.
    pub fn latest_redeemed_voucher_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> CoreResult<Option<Voucher>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {VOUCHER_COLUMNS} FROM voucher
                     WHERE tenant_id = ?1 AND redeemed_by_user_id = ?2 AND status = 'redeemed'
                     ORDER BY redeemed_at DESC, updated_at DESC LIMIT 1"
                ),
                params![tenant_id, user_id],
                voucher_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// NEW vouchers whose expiry is strictly before `now`.
    pub fn vouchers_due_to_expire(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<Voucher>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VOUCHER_COLUMNS} FROM voucher
             WHERE tenant_id = ?1 AND status = 'new'
               AND expires_at IS NOT NULL AND expires_at < ?2
             ORDER BY expires_at ASC"
        ))?;
        let rows = stmt.query_map(params![tenant_id, to_millis(now)], voucher_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Move a NEW voucher to a terminal status. Returns false when the
    /// voucher was no longer NEW.
    pub fn close_new_voucher(
        &self,
        tenant_id: &str,
        voucher_id: &str,
        status: VoucherStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let changed = self.conn.execute(
            "UPDATE voucher SET status = ?1, updated_at = ?2
             WHERE tenant_id = ?3 AND voucher_id = ?4 AND status = 'new'",
            params![status.as_str(), to_millis(now), tenant_id, voucher_id],
        )?;
        Ok(changed == 1)
    }

    /// NEW -> REDEEMED, freezing the cap and initial policy state.
    /// Returns false when the voucher was no longer NEW.
    pub fn mark_voucher_redeemed(
        &self,
        tenant_id: &str,
        voucher_id: &str,
        user_id: &str,
        state: &VoucherPolicyState,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let changed = self.conn.execute(
            "UPDATE voucher
             SET status = 'redeemed', redeemed_by_user_id = ?1, redeemed_at = ?2,
                 max_cashout = ?3, policy_state = ?4, updated_at = ?2
             WHERE tenant_id = ?5 AND voucher_id = ?6 AND status = 'new'",
            params![
                user_id,
                to_millis(now),
                state.max_cashout,
                serde_json::to_string(&state.to_json())?,
                tenant_id,
                voucher_id
            ],
        )?;
        Ok(changed == 1)
    }

    /// Write the per-round policy state. `max_cashout` is never touched here.
    pub fn update_voucher_policy_state(
        &self,
        tenant_id: &str,
        voucher_id: &str,
        state: &VoucherPolicyState,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.conn.execute(
            "UPDATE voucher SET policy_state = ?1, updated_at = ?2
             WHERE tenant_id = ?3 AND voucher_id = ?4",
            params![
                serde_json::to_string(&state.to_json())?,
                to_millis(now),
                tenant_id,
                voucher_id
            ],
        )?;
        Ok(())
    }
}
