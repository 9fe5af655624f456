//! Store methods for the append-only ledger.

use crate::{
    error::{CoreError, CoreResult},
    event::{LedgerEvent, LedgerEventType, NewLedgerEvent, SpinRecord},
    types::{from_millis, to_millis, Cents},
};
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_json_column, CoreStore};

const LEDGER_COLUMNS: &str = "id, tenant_id, ts, client_ts, player_id, session_id, action_id,
     game_key, event_type, amount_cents, bet_cents, win_cents, balance_cents, source, meta";

fn ledger_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEvent> {
    let event_type: String = row.get(8)?;
    Ok(LedgerEvent {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        ts: from_millis(row.get(2)?),
        client_ts: row.get::<_, Option<i64>>(3)?.map(from_millis),
        player_id: row.get(4)?,
        session_id: row.get(5)?,
        action_id: row.get(6)?,
        game_key: row.get(7)?,
        event_type: LedgerEventType::parse(&event_type),
        amount_cents: row.get(9)?,
        bet_cents: row.get(10)?,
        win_cents: row.get(11)?,
        balance_cents: row.get(12)?,
        source: row.get(13)?,
        meta: parse_json_column(row.get(14)?),
    })
}

impl CoreStore {
    /// Append an event. With an action id this is find-or-create on
    /// `(tenant_id, action_id, event_type)`: a repeat returns the stored
    /// row untouched.
    pub fn record_event(&self, tenant_id: &str, event: &NewLedgerEvent) -> CoreResult<LedgerEvent> {
        let meta = match &event.meta {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO ledger_event
                (tenant_id, ts, client_ts, player_id, session_id, action_id, game_key,
                 event_type, amount_cents, bet_cents, win_cents, balance_cents, source, meta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                tenant_id,
                to_millis(event.ts),
                event.client_ts.map(to_millis),
                event.player_id,
                event.session_id,
                event.action_id,
                event.game_key,
                event.event_type.as_str(),
                event.amount_cents,
                event.bet_cents,
                event.win_cents,
                event.balance_cents,
                event.source,
                meta,
            ],
        )?;

        if inserted == 1 {
            let id = self.conn.last_insert_rowid();
            let row = self.conn.query_row(
                &format!("SELECT {LEDGER_COLUMNS} FROM ledger_event WHERE id = ?1"),
                params![id],
                ledger_from_row,
            )?;
            return Ok(row);
        }

        let Some(action_id) = event.action_id.as_deref() else {
            return Err(CoreError::validation("ledger_event", "insert was ignored"));
        };
        log::debug!("ledger {} for action {action_id} already recorded", event.event_type);
        self.find_event_by_action(tenant_id, action_id, &event.event_type)?
            .ok_or_else(|| CoreError::validation("ledger_event", "insert was ignored"))
    }

    /// `record_event` for audit paths: failures are logged and swallowed.
    pub fn record_event_best_effort(
        &self,
        tenant_id: &str,
        event: &NewLedgerEvent,
    ) -> Option<LedgerEvent> {
        match self.record_event(tenant_id, event) {
            Ok(row) => Some(row),
            Err(e) => {
                log::warn!("ledger {} insert skipped: {e}", event.event_type);
                None
            }
        }
    }

    pub fn find_event_by_action(
        &self,
        tenant_id: &str,
        action_id: &str,
        event_type: &LedgerEventType,
    ) -> CoreResult<Option<LedgerEvent>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {LEDGER_COLUMNS} FROM ledger_event
                     WHERE tenant_id = ?1 AND action_id = ?2 AND event_type = ?3"
                ),
                params![tenant_id, action_id, event_type.as_str()],
                ledger_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// The session's SPIN rows, newest first. Bet and win come from the
    /// SPIN row itself or else from the BET/WIN rows sharing its action id.
    pub fn query_recent_spins(
        &self,
        tenant_id: &str,
        session_id: &str,
        limit: usize,
    ) -> CoreResult<Vec<SpinRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.ts, s.client_ts, s.game_key,
                    COALESCE(s.bet_cents,
                        (SELECT COALESCE(b.bet_cents, b.amount_cents) FROM ledger_event b
                         WHERE b.tenant_id = s.tenant_id AND b.action_id = s.action_id
                           AND b.event_type = 'BET'), 0),
                    COALESCE(s.win_cents,
                        (SELECT COALESCE(w.win_cents, w.amount_cents) FROM ledger_event w
                         WHERE w.tenant_id = s.tenant_id AND w.action_id = s.action_id
                           AND w.event_type = 'WIN'), 0)
             FROM ledger_event s
             WHERE s.tenant_id = ?1 AND s.session_id = ?2 AND s.event_type = 'SPIN'
             ORDER BY s.ts DESC, s.id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![tenant_id, session_id, limit as i64], |row| {
            Ok(SpinRecord {
                ts: from_millis(row.get(0)?),
                client_ts: row.get::<_, Option<i64>>(1)?.map(from_millis),
                game_key: row.get(2)?,
                bet_cents: row.get(3)?,
                win_cents: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Session-to-date `(bet_cents, win_cents)` over every SPIN.
    pub fn sum_bets_and_wins(&self, tenant_id: &str, session_id: &str) -> CoreResult<(Cents, Cents)> {
        let sums = self.conn.query_row(
            "SELECT COALESCE(SUM(bet), 0), COALESCE(SUM(win), 0) FROM (
                SELECT COALESCE(s.bet_cents,
                           (SELECT COALESCE(b.bet_cents, b.amount_cents) FROM ledger_event b
                            WHERE b.tenant_id = s.tenant_id AND b.action_id = s.action_id
                              AND b.event_type = 'BET'), 0) AS bet,
                       COALESCE(s.win_cents,
                           (SELECT COALESCE(w.win_cents, w.amount_cents) FROM ledger_event w
                            WHERE w.tenant_id = s.tenant_id AND w.action_id = s.action_id
                              AND w.event_type = 'WIN'), 0) AS win
                FROM ledger_event s
                WHERE s.tenant_id = ?1 AND s.session_id = ?2 AND s.event_type = 'SPIN'
             )",
            params![tenant_id, session_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(sums)
    }

    /// Balance on the session's earliest event that carries one.
    pub fn session_start_balance_cents(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> CoreResult<Option<Cents>> {
        let balance = self
            .conn
            .query_row(
                "SELECT balance_cents FROM ledger_event
                 WHERE tenant_id = ?1 AND session_id = ?2 AND balance_cents IS NOT NULL
                 ORDER BY ts ASC, id ASC LIMIT 1",
                params![tenant_id, session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance)
    }

    /// Every event of a session in insertion order.
    pub fn ledger_events_for_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> CoreResult<Vec<LedgerEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_event
             WHERE tenant_id = ?1 AND session_id = ?2
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![tenant_id, session_id], ledger_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Test / summary helpers ────────────────────────────────────────

    /// Number of ledger rows of one type for a tenant.
    pub fn ledger_event_count(
        &self,
        tenant_id: &str,
        event_type: &LedgerEventType,
    ) -> CoreResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM ledger_event WHERE tenant_id = ?1 AND event_type = ?2",
            params![tenant_id, event_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
