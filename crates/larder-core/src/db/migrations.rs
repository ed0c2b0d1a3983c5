//! Schema migrations for the local record store

use crate::error::Result;
use libsql::Connection;

/// Ordered schema steps; `MIGRATIONS[i]` upgrades the schema to version `i + 1`.
const MIGRATIONS: &[&[&str]] = &[&[
    "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS records (
        resource_type TEXT NOT NULL,
        resource_id TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (resource_type, resource_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_records_updated ON records(resource_type, updated_at DESC)",
]];

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
const LATEST: i64 = MIGRATIONS.len() as i64;

/// Bring the schema up to the latest version
pub async fn run(conn: &Connection) -> Result<()> {
    let applied = schema_version(conn).await?;

    let pending = MIGRATIONS
        .iter()
        .enumerate()
        .skip(usize::try_from(applied).unwrap_or(0));
    for (index, steps) in pending {
        let target = i64::try_from(index + 1).unwrap_or(LATEST);
        let tx = conn.transaction().await?;
        for step in *steps {
            tx.execute(step, ()).await?;
        }
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [target])
            .await?;
        tx.commit().await?;
        tracing::info!(version = target, "Applied record store migration");
    }

    Ok(())
}

/// Highest applied version, 0 for a fresh database
async fn schema_version(conn: &Connection) -> Result<i64> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            (),
        )
        .await?;
    let has_table = match rows.next().await? {
        Some(row) => row.get::<i64>(0)? > 0,
        None => false,
    };
    if !has_table {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT IFNULL(MAX(version), 0) FROM schema_version", ())
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<i64>(0)?),
        None => Ok(0),
    }
}
