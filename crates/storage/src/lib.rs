use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// Durable string key-value storage backed by SQLite.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite database url '{database_url}'"))?
            .create_if_missing(true);
        // An in-memory database lives only as long as its connection, so it
        // must be pinned to a single connection that is never recycled.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(2)
        };
        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run storage migrations")?;
        debug!(%database_url, "storage: opened key-value store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT value FROM kv_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read key '{key}'"))
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.put_many(&[(key, value)]).await
    }

    /// Writes every entry in one transaction: either all land or none do.
    pub async fn put_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin write transaction")?;
        for (key, value) in entries {
            sqlx::query(
                r#"
                INSERT INTO kv_entries (key, value, updated_at)
                VALUES (?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to write key '{key}'"))?;
        }
        tx.commit().await.context("failed to commit write")?;
        Ok(())
    }

    /// Removes the given keys, returning how many existed.
    pub async fn remove_many(&self, keys: &[&str]) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin delete transaction")?;
        let mut removed = 0;
        for key in keys {
            removed += sqlx::query("DELETE FROM kv_entries WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to remove key '{key}'"))?
                .rows_affected();
        }
        tx.commit().await.context("failed to commit delete")?;
        Ok(removed)
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.remove_many(&[key]).await? > 0)
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
