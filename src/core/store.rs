use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;

/// Record families kept in the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    ResumePackages,
    QueueSnapshot,
    DownloadedFileInfo,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::ResumePackages => "download_resume",
            Namespace::QueueSnapshot => "download_q_resume",
            Namespace::DownloadedFileInfo => "download_info",
        }
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, ns: Namespace, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn set(&self, ns: Namespace, key: &str, blob: &[u8]) -> anyhow::Result<()>;
    async fn remove(&self, ns: Namespace, key: &str) -> anyhow::Result<()>;
    async fn keys(&self, ns: Namespace) -> anyhow::Result<Vec<String>>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the store file and its `kv` table.
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create store dir {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("open store {}", db_path.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
              namespace TEXT NOT NULL,
              key TEXT NOT NULL,
              blob BLOB NOT NULL,
              updated_at INTEGER NOT NULL,
              PRIMARY KEY (namespace, key)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("create kv table")?;

        Ok(())
    }

    fn now_epoch() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, ns: Namespace, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let row = sqlx::query(r#"SELECT blob FROM kv WHERE namespace = ? AND key = ?;"#)
            .bind(ns.as_str())
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("read {}/{}", ns.as_str(), key))?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("blob")))
    }

    async fn set(&self, ns: Namespace, key: &str, blob: &[u8]) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (namespace, key, blob, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(namespace, key) DO UPDATE
            SET blob = excluded.blob,
                updated_at = excluded.updated_at;
            "#,
        )
        .bind(ns.as_str())
        .bind(key)
        .bind(blob)
        .bind(Self::now_epoch())
        .execute(&self.pool)
        .await
        .with_context(|| format!("write {}/{}", ns.as_str(), key))?;
        Ok(())
    }

    async fn remove(&self, ns: Namespace, key: &str) -> anyhow::Result<()> {
        sqlx::query(r#"DELETE FROM kv WHERE namespace = ? AND key = ?;"#)
            .bind(ns.as_str())
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete {}/{}", ns.as_str(), key))?;
        Ok(())
    }

    async fn keys(&self, ns: Namespace) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(r#"SELECT key FROM kv WHERE namespace = ? ORDER BY key ASC;"#)
            .bind(ns.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("key")).collect())
    }
}
