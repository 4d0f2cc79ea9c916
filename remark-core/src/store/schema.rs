//! Outbox schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! Every statement is written `IF NOT EXISTS` so replaying migrations over
//! a partially initialized store recreates whatever is missing without
//! touching populated collections.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: the comment outbox
    r#"
    CREATE TABLE IF NOT EXISTS comments (
        local_id         INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id      TEXT,
        text             TEXT NOT NULL,
        actor_name       TEXT NOT NULL,
        actor_key        TEXT NOT NULL,
        occurred_at      DATETIME NOT NULL,
        source_locator   TEXT NOT NULL,
        context_id       TEXT NOT NULL,
        context_author   TEXT NOT NULL,
        context_body     JSON NOT NULL,
        retry_count      INTEGER NOT NULL DEFAULT 0,
        synced           INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_comments_unsynced ON comments(synced, local_id);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_comments_external
        ON comments(external_id) WHERE external_id IS NOT NULL;
    CREATE INDEX IF NOT EXISTS idx_comments_dedup ON comments(actor_key, text);
    "#,
    // Version 2: single-slot actor identity cache
    r#"
    CREATE TABLE IF NOT EXISTS actor (
        slot         INTEGER PRIMARY KEY CHECK (slot = 0),
        name         TEXT NOT NULL,
        key          TEXT NOT NULL,
        updated_at   DATETIME NOT NULL
    );
    "#,
];

/// Collections the store must expose once migrated.
const REQUIRED_TABLES: &[&str] = &["comments", "actor"];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking outbox migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    heal_missing_collections(conn)?;

    Ok(())
}

/// Self-heal a store whose version claims completeness but whose shape
/// does not match (e.g. a crash mid-initialization, or a collection added
/// out-of-band). Replaying the migrations recreates missing collections
/// and leaves existing data untouched.
fn heal_missing_collections(conn: &Connection) -> crate::error::Result<()> {
    let missing: Vec<&str> = REQUIRED_TABLES
        .iter()
        .copied()
        .filter(|t| !table_exists(conn, t).unwrap_or(false))
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    tracing::warn!(?missing, "Store shape incomplete, replaying migrations");
    for migration in MIGRATIONS {
        conn.execute_batch(migration)?;
    }
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> crate::error::Result<bool> {
    let count: i32 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [name],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
