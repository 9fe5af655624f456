//! Store methods for player safety: per-session loss limits and the
//! intervention audit trail.

use crate::{
    error::CoreResult,
    safety::{SafetyAction, SafetyActionType, SafetyLimit},
    types::{from_millis, to_millis, Cents},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use super::{parse_json_column, CoreStore};

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<SafetyAction> {
    let action_type: String = row.get(5)?;
    let reasons: String = row.get(6)?;
    let severity: i64 = row.get(7)?;
    Ok(SafetyAction {
        id: row.get(0)?,
        session_id: row.get(2)?,
        player_id: row.get(3)?,
        game_key: row.get(4)?,
        action_type: SafetyActionType::parse(&action_type).unwrap_or(SafetyActionType::Nudge),
        reason_codes: serde_json::from_str(&reasons).unwrap_or_default(),
        severity: severity.clamp(1, 5) as u8,
        details: parse_json_column(row.get(8)?).unwrap_or(Value::Null),
        created_at: from_millis(row.get(9)?),
    })
}

impl CoreStore {
    pub fn get_safety_limit(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> CoreResult<Option<SafetyLimit>> {
        let row = self
            .conn
            .query_row(
                "SELECT session_id, player_id, loss_limit_cents, locked_at, updated_at
                 FROM safety_limit WHERE tenant_id = ?1 AND session_id = ?2",
                params![tenant_id, session_id],
                |row| {
                    Ok(SafetyLimit {
                        session_id: row.get(0)?,
                        player_id: row.get(1)?,
                        loss_limit_cents: row.get(2)?,
                        locked_at: from_millis(row.get(3)?),
                        updated_at: from_millis(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn insert_safety_limit(
        &self,
        tenant_id: &str,
        session_id: &str,
        player_id: Option<&str>,
        loss_limit_cents: Cents,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.conn.execute(
            "INSERT INTO safety_limit
                (session_id, tenant_id, player_id, loss_limit_cents, locked_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![session_id, tenant_id, player_id, loss_limit_cents, to_millis(now)],
        )?;
        Ok(())
    }

    /// Lower an existing limit. The WHERE clause refuses an increase even
    /// if a caller skipped the check. Returns whether a row changed.
    pub fn lower_safety_limit(
        &self,
        tenant_id: &str,
        session_id: &str,
        loss_limit_cents: Cents,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let changed = self.conn.execute(
            "UPDATE safety_limit SET loss_limit_cents = ?1, updated_at = ?2
             WHERE tenant_id = ?3 AND session_id = ?4 AND loss_limit_cents > ?1",
            params![loss_limit_cents, to_millis(now), tenant_id, session_id],
        )?;
        Ok(changed == 1)
    }

    /// Timestamp of the most recent action of one type for a session.
    pub fn last_safety_action_at(
        &self,
        tenant_id: &str,
        session_id: &str,
        action_type: SafetyActionType,
    ) -> CoreResult<Option<DateTime<Utc>>> {
        let ts: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(created_at) FROM safety_action
                 WHERE tenant_id = ?1 AND session_id = ?2 AND action_type = ?3",
                params![tenant_id, session_id, action_type.as_str()],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(ts.map(from_millis))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_safety_action(
        &self,
        tenant_id: &str,
        session_id: &str,
        player_id: Option<&str>,
        game_key: Option<&str>,
        action_type: SafetyActionType,
        reason_codes: &[String],
        severity: u8,
        details: &Value,
        now: DateTime<Utc>,
    ) -> CoreResult<SafetyAction> {
        self.conn.execute(
            "INSERT INTO safety_action
                (tenant_id, session_id, player_id, game_key, action_type, reason_codes,
                 severity, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                tenant_id,
                session_id,
                player_id,
                game_key,
                action_type.as_str(),
                serde_json::to_string(reason_codes)?,
                severity as i64,
                serde_json::to_string(details)?,
                to_millis(now)
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        let row = self.conn.query_row(
            "SELECT id, tenant_id, session_id, player_id, game_key, action_type, reason_codes,
                    severity, details, created_at
             FROM safety_action WHERE id = ?1",
            params![id],
            action_from_row,
        )?;
        Ok(row)
    }

    pub fn safety_actions_for_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> CoreResult<Vec<SafetyAction>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tenant_id, session_id, player_id, game_key, action_type, reason_codes,
                    severity, details, created_at
             FROM safety_action WHERE tenant_id = ?1 AND session_id = ?2
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![tenant_id, session_id], action_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
