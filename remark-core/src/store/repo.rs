//! Outbox repository
//!
//! CRUD over the comment outbox and the single-slot actor identity cache.
//! All mutating operations are transactional at single-record granularity;
//! capture and delivery access the same handle concurrently through the
//! connection mutex.

use crate::error::{Error, Result};
use crate::types::{ActorIdentity, CommentEvent, Fragment, StoredComment};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

/// Durable outbox handle (single connection, WAL mode)
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create an outbox database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL so capture and delivery processes can share the file
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory outbox (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    // ============================================
    // Outbox operations
    // ============================================

    /// Admit a candidate event: dedup check and insert in one transaction.
    ///
    /// Returns the assigned local id, or `None` when the candidate is a
    /// duplicate (same external id, or same actor_key + text). The commit
    /// completes before this returns, so a subsequent [`Store::list_unsynced`]
    /// can never miss an admitted record.
    pub fn admit(&self, event: &CommentEvent) -> Result<Option<i64>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let duplicate = match event.external_id.as_deref() {
            Some(ext) if !ext.is_empty() => tx
                .query_row(
                    "SELECT local_id FROM comments WHERE external_id = ?1",
                    [ext],
                    |r| r.get::<_, i64>(0),
                )
                .optional()?
                .is_some(),
            _ => tx
                .query_row(
                    "SELECT local_id FROM comments WHERE actor_key = ?1 AND text = ?2",
                    params![event.actor_key, event.text],
                    |r| r.get::<_, i64>(0),
                )
                .optional()?
                .is_some(),
        };

        if duplicate {
            return Ok(None);
        }

        tx.execute(
            r#"
            INSERT INTO comments (external_id, text, actor_name, actor_key, occurred_at,
                                  source_locator, context_id, context_author, context_body,
                                  retry_count, synced)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0)
            "#,
            params![
                event.external_id,
                event.text,
                event.actor_name,
                event.actor_key,
                event.occurred_at.to_rfc3339(),
                event.source_locator,
                event.context_id,
                event.context_author,
                serde_json::to_string(&event.context_body)?,
            ],
        )?;

        let local_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Some(local_id))
    }

    /// Snapshot of not-yet-delivered records, in insertion order.
    pub fn list_unsynced(&self) -> Result<Vec<StoredComment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM comments WHERE synced = 0 ORDER BY local_id ASC",
        )?;
        let rows = stmt.query_map([], Self::row_to_comment)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// The oldest not-yet-delivered record, if any.
    pub fn head_unsynced(&self) -> Result<Option<StoredComment>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM comments WHERE synced = 0 ORDER BY local_id ASC LIMIT 1",
            [],
            Self::row_to_comment,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Number of records still awaiting delivery.
    pub fn pending_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM comments WHERE synced = 0",
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Flip records to synced. Idempotent: re-marking an already-synced id
    /// is a no-op. Returns how many records actually flipped.
    pub fn mark_synced(&self, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt =
                tx.prepare("UPDATE comments SET synced = 1 WHERE local_id = ?1 AND synced = 0")?;
            for id in ids {
                changed += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Delete all synced records. Records inserted after the sweep began
    /// are untouched (they are still `synced = 0`).
    pub fn sweep_synced(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM comments WHERE synced = 1", [])?;
        Ok(deleted)
    }

    /// Persist one more failed delivery attempt; returns the new count.
    pub fn bump_retry(&self, id: i64) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE comments SET retry_count = retry_count + 1 WHERE local_id = ?1",
            [id],
        )?;
        let count = tx.query_row(
            "SELECT retry_count FROM comments WHERE local_id = ?1",
            [id],
            |r| r.get(0),
        )?;
        tx.commit()?;
        Ok(count)
    }

    // ============================================
    // Actor identity cache
    // ============================================

    /// Read the cached actor identity, if one has been resolved.
    pub fn get_identity(&self) -> Result<Option<ActorIdentity>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT name, key FROM actor WHERE slot = 0", [], |row| {
            Ok(ActorIdentity {
                name: row.get(0)?,
                key: row.get(1)?,
            })
        })
        .optional()
        .map_err(Error::from)
    }

    /// Overwrite the cached actor identity (last write wins).
    pub fn set_identity(&self, identity: &ActorIdentity) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO actor (slot, name, key, updated_at)
            VALUES (0, ?1, ?2, ?3)
            ON CONFLICT(slot) DO UPDATE SET
                name = excluded.name,
                key = excluded.key,
                updated_at = excluded.updated_at
            "#,
            params![identity.name, identity.key, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn row_to_comment(row: &Row) -> rusqlite::Result<StoredComment> {
        let occurred_str: String = row.get("occurred_at")?;
        let body_str: String = row.get("context_body")?;
        let synced: i64 = row.get("synced")?;

        Ok(StoredComment {
            local_id: row.get("local_id")?,
            synced: synced != 0,
            retry_count: row.get("retry_count")?,
            event: CommentEvent {
                external_id: row.get("external_id")?,
                text: row.get("text")?,
                actor_name: row.get("actor_name")?,
                actor_key: row.get("actor_key")?,
                occurred_at: DateTime::parse_from_rfc3339(&occurred_str)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                source_locator: row.get("source_locator")?,
                context_id: row.get("context_id")?,
                context_author: row.get("context_author")?,
                context_body: serde_json::from_str::<Vec<Fragment>>(&body_str)
                    .unwrap_or_default(),
            },
        })
    }
}
