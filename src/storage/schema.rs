use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS plans (
            id INTEGER PRIMARY KEY,
            owner_id TEXT NOT NULL,
            quarter INTEGER NOT NULL CHECK (quarter BETWEEN 1 AND 4),
            year INTEGER NOT NULL,
            data TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            deleted_at INTEGER
        );

        -- one live plan per owner and period; trashed rows do not count
        CREATE UNIQUE INDEX IF NOT EXISTS plans_active_period
            ON plans (owner_id, quarter, year)
            WHERE deleted_at IS NULL;

        CREATE INDEX IF NOT EXISTS plans_trash
            ON plans (owner_id, deleted_at)
            WHERE deleted_at IS NOT NULL;

        CREATE TABLE IF NOT EXISTS plan_versions (
            id INTEGER PRIMARY KEY,
            plan_id INTEGER NOT NULL,
            version INTEGER NOT NULL CHECK (version >= 1),
            data TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (plan_id, version),
            FOREIGN KEY (plan_id) REFERENCES plans(id) ON DELETE CASCADE
        );
        "#,
    )
    .context("applying schema migrations")?;
    Ok(())
}
