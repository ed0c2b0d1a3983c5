//! libSQL handle for the local record store

use crate::error::{Error, Result};
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use std::path::Path;

use super::migrations;

/// Owns the libSQL database and the single connection the store uses.
pub struct Database {
    // dropping the database closes the connection
    _handle: LibSqlDatabase,
    conn: Connection,
}

impl Database {
    /// Open or create a file-backed store, creating missing parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent).map_err(|error| {
                    Error::Database(format!("cannot create {}: {error}", parent.display()))
                })?;
            }
            _ => {}
        }
        let handle = Builder::new_local(path).build().await?;
        Self::initialize(handle).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::initialize(Builder::new_local(":memory:").build().await?).await
    }

    async fn initialize(handle: LibSqlDatabase) -> Result<Self> {
        let conn = handle.connect()?;
        for pragma in ["PRAGMA journal_mode = WAL", "PRAGMA synchronous = NORMAL"] {
            // not supported for :memory:
            if let Err(error) = conn.execute(pragma, ()).await {
                tracing::debug!(%error, pragma, "Skipped pragma");
            }
        }
        migrations::run(&conn).await?;
        Ok(Self {
            _handle: handle,
            conn,
        })
    }

    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn in_memory_store_has_records_table() {
        let db = Database::open_in_memory().await.unwrap();
        let mut rows = db
            .connection()
            .query("SELECT COUNT(*) FROM records", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_store_creates_missing_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("larder.db");
        Database::open(&path).await.unwrap();
        assert!(path.exists());
    }
}
