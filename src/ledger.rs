//! SQLite message ledger.
//!
//! Single source of truth for voice messages and push subscriptions.  Every
//! lifecycle transition is a single conditional statement so concurrent
//! readers, `mark_read` calls and sweeps never observe a half-applied state.
//!
//! A row moves through these shapes, tracked by the `sweeping` column:
//!
//! - live: `sweeping = 0`, returned by every reader query;
//! - swept: `sweeping = 1`, claimed by the sweeper, hidden from readers and
//!   retried by every pass until its artifact is gone;
//! - deleting: `sweeping = 2`, claimed by a participant delete in flight,
//!   hidden from readers and left alone by the sweeper;
//! - gone.
//!
//! A participant delete that cannot finish hands its row over to the
//! sweeper with [`Ledger::release_to_sweeper`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::model::{Lifespan, VoiceMessage};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger lock poisoned")]
    Poisoned,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Push subscription row.  `keys` is the opaque key material the browser
/// handed us, stored as JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscriptionRow {
    pub id: i64,
    pub user_id: String,
    pub endpoint: String,
    pub keys: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionUpsert {
    Created,
    Updated,
    Unchanged,
}

const MESSAGE_COLUMNS: &str =
    "id, sender_id, receiver_id, artifact_ref, lifespan, created_at, is_read, expires_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<VoiceMessage> {
    let lifespan: String = row.get(4)?;
    Ok(VoiceMessage {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        artifact_ref: row.get(3)?,
        lifespan: Lifespan::parse_or_default(Some(&lifespan)),
        created_at: row.get::<_, i64>(5)? as u64,
        is_read: row.get::<_, i32>(6)? != 0,
        expires_at: row.get::<_, i64>(7)? as u64,
    })
}

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<PushSubscriptionRow> {
    Ok(PushSubscriptionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        endpoint: row.get(2)?,
        keys: row.get(3)?,
        created_at: row.get::<_, i64>(4)? as u64,
    })
}

// ---------------------------------------------------------------------------
// Ledger handle
// ---------------------------------------------------------------------------

pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open or create a ledger at `path`.  Creates the schema if needed.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.create_schema()?;
        ledger.recover_interrupted_deletes()?;
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.create_schema()?;
        Ok(ledger)
    }

    /// Deletes cut short by a restart are finished by the sweeper.
    fn recover_interrupted_deletes(&self) -> Result<(), LedgerError> {
        let recovered = self.conn()?.execute(
            "UPDATE voice_messages SET sweeping = 1 WHERE sweeping = 2",
            [],
        )?;
        if recovered > 0 {
            tracing::info!(recovered, "handing interrupted deletes to the sweeper");
        }
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned)
    }

    fn create_schema(&self) -> Result<(), LedgerError> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS voice_messages (
                id              TEXT PRIMARY KEY,
                sender_id       TEXT NOT NULL,
                receiver_id     TEXT NOT NULL,
                artifact_ref    TEXT NOT NULL,
                lifespan        TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                is_read         INTEGER NOT NULL DEFAULT 0,
                expires_at      INTEGER NOT NULL,
                sweeping        INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_voice_messages_pair
                ON voice_messages(sender_id, receiver_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_voice_messages_expiry
                ON voice_messages(expires_at);
            CREATE INDEX IF NOT EXISTS idx_voice_messages_unread
                ON voice_messages(receiver_id, is_read, expires_at);

            CREATE TABLE IF NOT EXISTS push_subscriptions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     TEXT NOT NULL,
                endpoint    TEXT NOT NULL,
                keys        TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                UNIQUE(user_id, endpoint)
            );
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub fn insert_message(&self, message: &VoiceMessage) -> Result<(), LedgerError> {
        self.conn()?.execute(
            "INSERT INTO voice_messages
             (id, sender_id, receiver_id, artifact_ref, lifespan, created_at, is_read, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id,
                message.sender_id,
                message.receiver_id,
                message.artifact_ref,
                message.lifespan.as_str(),
                message.created_at as i64,
                message.is_read as i32,
                message.expires_at as i64,
            ],
        )?;
        Ok(())
    }

    /// Fetch a message unless a sweep or delete has already claimed it.
    /// Expired-but-unswept rows are still returned; callers decide.
    pub fn get_message(&self, id: &str) -> Result<Option<VoiceMessage>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM voice_messages WHERE id = ?1 AND sweeping = 0"
        ))?;
        Ok(stmt.query_row(params![id], message_from_row).optional()?)
    }

    /// Live messages exchanged between `a` and `b`, oldest first.
    pub fn list_conversation(
        &self,
        a: &str,
        b: &str,
        now_ms: u64,
    ) -> Result<Vec<VoiceMessage>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM voice_messages
             WHERE ((sender_id = ?1 AND receiver_id = ?2)
                 OR (sender_id = ?2 AND receiver_id = ?1))
               AND sweeping = 0
               AND expires_at > ?3
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![a, b, now_ms as i64], message_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Apply the read transition.  Only succeeds for a live, unread,
    /// unexpired row, so the first of several concurrent callers wins and the
    /// rest see `false`.
    pub fn mark_read(&self, id: &str, expires_at: u64, now_ms: u64) -> Result<bool, LedgerError> {
        let affected = self.conn()?.execute(
            "UPDATE voice_messages SET is_read = 1, expires_at = ?2
             WHERE id = ?1 AND is_read = 0 AND sweeping = 0 AND expires_at > ?3",
            params![id, expires_at as i64, now_ms as i64],
        )?;
        Ok(affected > 0)
    }

    /// Unread, unexpired messages addressed to `receiver_id`, counted per
    /// sender.
    pub fn unread_counts(
        &self,
        receiver_id: &str,
        now_ms: u64,
    ) -> Result<BTreeMap<String, u32>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sender_id, COUNT(*) FROM voice_messages
             WHERE receiver_id = ?1 AND is_read = 0 AND sweeping = 0 AND expires_at > ?2
             GROUP BY sender_id",
        )?;
        let rows = stmt.query_map(params![receiver_id, now_ms as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u32))
        })?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (sender, count) = row?;
            counts.insert(sender, count);
        }
        Ok(counts)
    }

    /// Messages a sweep should process: past their deadline, or claimed by
    /// an earlier pass that did not finish.
    pub fn list_expired(&self, now_ms: u64) -> Result<Vec<VoiceMessage>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM voice_messages
             WHERE sweeping = 1 OR (sweeping = 0 AND expires_at <= ?1)
             ORDER BY expires_at ASC"
        ))?;
        let rows = stmt.query_map(params![now_ms as i64], message_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Claim a row for sweeping, re-checking the deadline at claim time.
    /// Returns `false` when the row is gone, is being deleted by a
    /// participant, or its deadline was pushed into the future after the
    /// candidate scan.
    pub fn claim_expired(&self, id: &str, now_ms: u64) -> Result<bool, LedgerError> {
        let affected = self.conn()?.execute(
            "UPDATE voice_messages SET sweeping = 1
             WHERE id = ?1 AND (sweeping = 1 OR (sweeping = 0 AND expires_at <= ?2))",
            params![id, now_ms as i64],
        )?;
        Ok(affected > 0)
    }

    /// Claim a live row for a participant delete, regardless of deadline.
    /// Returns `false` when the row is gone or already claimed.
    pub fn claim_for_delete(&self, id: &str) -> Result<bool, LedgerError> {
        let affected = self.conn()?.execute(
            "UPDATE voice_messages SET sweeping = 2 WHERE id = ?1 AND sweeping = 0",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// Turn a participant-delete claim into a sweep claim so the next pass
    /// finishes the job.
    pub fn release_to_sweeper(&self, id: &str) -> Result<bool, LedgerError> {
        let affected = self.conn()?.execute(
            "UPDATE voice_messages SET sweeping = 1 WHERE id = ?1 AND sweeping = 2",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// Remove a row previously claimed by [`Self::claim_expired`].
    pub fn delete_claimed(&self, id: &str) -> Result<bool, LedgerError> {
        let affected = self.conn()?.execute(
            "DELETE FROM voice_messages WHERE id = ?1 AND sweeping = 1",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// Remove a row previously claimed by [`Self::claim_for_delete`].
    pub fn delete_claimed_for_delete(&self, id: &str) -> Result<bool, LedgerError> {
        let affected = self.conn()?.execute(
            "DELETE FROM voice_messages WHERE id = ?1 AND sweeping = 2",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// Number of visible messages, for the health report.
    pub fn count_messages(&self) -> Result<u64, LedgerError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM voice_messages WHERE sweeping = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // -----------------------------------------------------------------------
    // Push subscriptions
    // -----------------------------------------------------------------------

    /// Insert a subscription or refresh its keys.  Unique per
    /// `(user_id, endpoint)`.
    pub fn upsert_subscription(
        &self,
        user_id: &str,
        endpoint: &str,
        keys: &str,
        now_ms: u64,
    ) -> Result<SubscriptionUpsert, LedgerError> {
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT keys FROM push_subscriptions WHERE user_id = ?1 AND endpoint = ?2",
                params![user_id, endpoint],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(current) if current == keys => Ok(SubscriptionUpsert::Unchanged),
            Some(_) => {
                conn.execute(
                    "UPDATE push_subscriptions SET keys = ?3 WHERE user_id = ?1 AND endpoint = ?2",
                    params![user_id, endpoint, keys],
                )?;
                Ok(SubscriptionUpsert::Updated)
            }
            None => {
                conn.execute(
                    "INSERT INTO push_subscriptions (user_id, endpoint, keys, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![user_id, endpoint, keys, now_ms as i64],
                )?;
                Ok(SubscriptionUpsert::Created)
            }
        }
    }

    pub fn list_subscriptions(&self, user_id: &str) -> Result<Vec<PushSubscriptionRow>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, endpoint, keys, created_at
             FROM push_subscriptions WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], subscription_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn delete_subscription(&self, user_id: &str, endpoint: &str) -> Result<bool, LedgerError> {
        let affected = self.conn()?.execute(
            "DELETE FROM push_subscriptions WHERE user_id = ?1 AND endpoint = ?2",
            params![user_id, endpoint],
        )?;
        Ok(affected > 0)
    }

    pub fn delete_subscription_by_id(&self, id: i64) -> Result<bool, LedgerError> {
        let affected = self
            .conn()?
            .execute("DELETE FROM push_subscriptions WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
