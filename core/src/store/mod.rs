//! SQLite persistence layer.
//!
//! RULE: Only store/ talks to the database.
//! Engines call store methods; they never execute SQL directly.
//! Every query is scoped by an explicit tenant id.

use crate::error::CoreResult;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;

mod ledger;
mod safety;
mod voucher;
mod wallet;

pub use wallet::WalletRow;

pub struct CoreStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl CoreStore {
    pub fn open(path: &str) -> CoreResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (:memory: ignores it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> CoreResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Open a second connection to the same file.
    /// For in-memory databases this returns a new, isolated database.
    pub fn reopen(&self) -> CoreResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> CoreResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_wallets.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_vouchers.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_ledger.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/005_player_safety.sql"))?;
        Ok(())
    }

    /// Run `f` inside one IMMEDIATE transaction.
    ///
    /// IMMEDIATE takes the write lock before `f` reads anything, so a
    /// wallet balance read inside `f` cannot be raced by another writer.
    /// Any `Err` drops the transaction, which rolls it back.
    pub fn in_transaction<T, E>(&self, f: impl FnOnce(&CoreStore) -> Result<T, E>) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let tx = rusqlite::Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    // ── Tenant ─────────────────────────────────────────────────

    pub fn insert_tenant(&self, tenant_id: &str, name: &str, now_ms: i64) -> CoreResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO tenant (tenant_id, name, status, created_at)
             VALUES (?1, ?2, 'active', ?3)",
            params![tenant_id, name, now_ms],
        )?;
        Ok(())
    }

    pub fn tenant_exists(&self, tenant_id: &str) -> CoreResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM tenant WHERE tenant_id = ?1 AND status = 'active'",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The tenant's raw override object. An unparseable row reads as absent.
    pub fn tenant_config_json(&self, tenant_id: &str) -> CoreResult<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT config_json FROM tenant_config WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|s| match serde_json::from_str::<Value>(&s) {
            Ok(v) => Some(v),
            Err(e) => {
                log::warn!("tenant {tenant_id} config is not valid JSON, ignoring: {e}");
                None
            }
        }))
    }

    pub fn upsert_tenant_config(
        &self,
        tenant_id: &str,
        config: &Value,
        now_ms: i64,
    ) -> CoreResult<()> {
        self.conn.execute(
            "INSERT INTO tenant_config (tenant_id, config_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (tenant_id) DO UPDATE SET
                config_json = excluded.config_json,
                updated_at  = excluded.updated_at",
            params![tenant_id, serde_json::to_string(config)?, now_ms],
        )?;
        Ok(())
    }
}

/// Parse an optional JSON text column; bad JSON reads as `None`.
pub(crate) fn parse_json_column(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}
