use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::Mutex;

use shared::domain::UserId;

/// Derived per-peer chat activity, persisted so a restart restores prior
/// unread badges and "last chatted" labels.
///
/// `last_activity` keeps a deliberate tri-state: an absent key means the
/// conversation was never fetched, a present `None` means a fetch confirmed
/// there are no messages yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityState {
    pub unread: HashMap<UserId, u64>,
    pub last_activity: HashMap<UserId, Option<DateTime<Utc>>>,
}

/// Persistence seam for [`ActivityState`]; the tracker is its only caller.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn load(&self) -> Result<ActivityState>;
    async fn save(&self, state: &ActivityState) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteActivityStore {
    pool: Pool<Sqlite>,
}

impl SqliteActivityStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;
        let store = Self { pool };
        store.ensure_tables().await?;
        Ok(store)
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

    async fn ensure_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS unread_counts (
                peer_id TEXT PRIMARY KEY,
                count   INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure unread_counts table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS last_activity (
                peer_id         TEXT PRIMARY KEY,
                last_message_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure last_activity table exists")?;

        Ok(())
    }
}

#[async_trait]
impl ActivityStore for SqliteActivityStore {
    async fn load(&self) -> Result<ActivityState> {
        let mut state = ActivityState::default();

        let rows = sqlx::query("SELECT peer_id, count FROM unread_counts")
            .fetch_all(&self.pool)
            .await
            .context("failed to load unread counts")?;
        for row in rows {
            let peer_id: String = row.try_get("peer_id")?;
            let count: i64 = row.try_get("count")?;
            state.unread.insert(UserId(peer_id), count.max(0) as u64);
        }

        let rows = sqlx::query("SELECT peer_id, last_message_at FROM last_activity")
            .fetch_all(&self.pool)
            .await
            .context("failed to load last-activity times")?;
        for row in rows {
            let peer_id: String = row.try_get("peer_id")?;
            let last_message_at: Option<DateTime<Utc>> = row.try_get("last_message_at")?;
            state.last_activity.insert(UserId(peer_id), last_message_at);
        }

        Ok(state)
    }

    async fn save(&self, state: &ActivityState) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open save transaction")?;

        sqlx::query("DELETE FROM unread_counts")
            .execute(&mut *tx)
            .await?;
        for (peer_id, count) in &state.unread {
            sqlx::query("INSERT INTO unread_counts (peer_id, count) VALUES (?, ?)")
                .bind(peer_id.as_str())
                .bind(*count as i64)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM last_activity")
            .execute(&mut *tx)
            .await?;
        for (peer_id, last_message_at) in &state.last_activity {
            sqlx::query("INSERT INTO last_activity (peer_id, last_message_at) VALUES (?, ?)")
                .bind(peer_id.as_str())
                .bind(last_message_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit()
            .await
            .context("failed to commit activity state")?;
        Ok(())
    }
}

/// Volatile store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryActivityStore {
    state: Mutex<ActivityState>,
}

impl MemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActivityStore for MemoryActivityStore {
    async fn load(&self) -> Result<ActivityState> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &ActivityState) -> Result<()> {
        *self.state.lock().await = state.clone();
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
