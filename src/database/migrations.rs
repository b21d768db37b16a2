// Database migrations for Where's My Dog
// Creates and upgrades the schema, including stores written by older deployments

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all necessary migrations to bring the database up to date
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    ).context("Failed to check for schema_version table")?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> = conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get(0),
    ).context("Failed to read schema version")?;

    Ok(version.unwrap_or(0))
}

/// Whether `table` already has a column called `column`
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))
        .context("Failed to prepare table_info query")?;

    let names = stmt.query_map([], |row| row.get::<_, String>(1))
        .context("Failed to query table_info")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to read table_info")?;

    Ok(names.iter().any(|name| name == column))
}

/// Initial schema (version 1): identity, name and keypoints only.
/// Tables created by earlier deployments are left as they are.
fn migrate_v1(conn: &Connection) -> Result<()> {
    log::info!("Running database migration v1");

    conn.execute_batch(r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Dogs table: one row per identity key
        CREATE TABLE IF NOT EXISTS dogs (
            id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            keypoints TEXT NOT NULL
        );

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
    "#).context("Failed to run migration v1")?;

    log::info!("Migration v1 completed successfully");
    Ok(())
}

/// Sighting metadata (version 2): note and last_seen.
/// Columns already present in older stores are kept with their data.
fn migrate_v2(conn: &Connection) -> Result<()> {
    log::info!("Running database migration v2 - sighting note and last seen");

    if !column_exists(conn, "dogs", "note")? {
        conn.execute("ALTER TABLE dogs ADD COLUMN note TEXT", [])
            .context("Failed to add note column")?;
    }

    if !column_exists(conn, "dogs", "last_seen")? {
        conn.execute("ALTER TABLE dogs ADD COLUMN last_seen TIMESTAMP", [])
            .context("Failed to add last_seen column")?;
    }

    conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])
        .context("Failed to record migration v2")?;

    log::info!("Migration v2 completed successfully");
    Ok(())
}
