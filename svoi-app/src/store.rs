//! Persistent per-user, per-chat counters (SQLite).

use crate::triggers::TriggerKind;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use svoi_channels::{ChatId, InboundMessage, UserId};
use thiserror::Error;

/// Telegram's own service account; it forwards channel posts and must not
/// show up in stats.
pub const RESERVED_SENDER_ID: UserId = UserId::new(777_000);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stats task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("database connection lock poisoned")]
    Poisoned,

    #[error("prepare database directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Counter deltas for one message, or a stored row when read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedStats {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub display_name: String,
    pub svo_count: u64,
    pub zov_count: u64,
    pub likvidirovan_count: u64,
}

impl NamedStats {
    pub fn new(user_id: UserId, chat_id: ChatId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            chat_id,
            display_name: display_name.into(),
            svo_count: 0,
            zov_count: 0,
            likvidirovan_count: 0,
        }
    }

    pub fn for_message(msg: &InboundMessage) -> Self {
        Self::new(msg.sender.id, msg.chat_id, msg.sender.display_name())
    }

    pub fn add_trigger(&mut self, kind: TriggerKind) {
        match kind {
            TriggerKind::Svo => self.svo_count += 1,
            TriggerKind::Zov => self.zov_count += 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.svo_count == 0 && self.zov_count == 0 && self.likvidirovan_count == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub users: u64,
    pub chats: u64,
}

#[derive(Clone)]
pub struct StatsStore {
    conn: Arc<Mutex<Connection>>,
}

impl StatsStore {
    /// Open (or create) the database at `path` and apply the schema.
    /// `":memory:"` gives a private in-memory database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let in_memory = path == Path::new(":memory:");
        if !in_memory {
            if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        if !in_memory {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                "#,
            )?;
        }
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                displayed_name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS stats (
                user_id INTEGER NOT NULL REFERENCES users(id),
                chat_id INTEGER NOT NULL,
                svo_count INTEGER NOT NULL DEFAULT 0,
                zov_count INTEGER NOT NULL DEFAULT 0,
                likvidirovan_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, chat_id)
            );

            CREATE INDEX IF NOT EXISTS idx_stats_chat ON stats (chat_id);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut *guard)
        })
        .await?
    }

    /// Merge one message's counters into storage, all-or-nothing.
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %stats.user_id, chat_id = %stats.chat_id))]
    pub async fn increase_stats(&self, stats: NamedStats) -> Result<()> {
        if stats.user_id == RESERVED_SENDER_ID {
            tracing::debug!("skipping stats for reserved sender");
            return Ok(());
        }
        self.with_conn(move |conn| increase_stats_tx(conn, &stats))
            .await
    }

    /// All rows for `chat_id`, most active users first.
    pub async fn retrieve_stats(&self, chat_id: ChatId) -> Result<Vec<NamedStats>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let rows = {
                let mut stmt = tx.prepare(
                    r#"
                    SELECT s.user_id, u.displayed_name, s.svo_count, s.zov_count, s.likvidirovan_count
                    FROM stats s
                    JOIN users u ON u.id = s.user_id
                    WHERE s.chat_id = ?1
                    ORDER BY s.svo_count + s.zov_count DESC, s.user_id ASC
                    "#,
                )?;
                let rows = stmt.query_map(params![chat_id.get()], |row| {
                    Ok(NamedStats {
                        user_id: UserId::new(row.get(0)?),
                        chat_id,
                        display_name: row.get(1)?,
                        svo_count: row.get(2)?,
                        zov_count: row.get(3)?,
                        likvidirovan_count: row.get(4)?,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            tx.commit()?;
            Ok(rows)
        })
        .await
    }

    /// Every chat that has at least one stats row.
    pub async fn all_chats(&self) -> Result<Vec<ChatId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT chat_id FROM stats ORDER BY chat_id")?;
            let chats = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .map(|r| r.map(ChatId::new))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(chats)
        })
        .await
    }

    /// Stored users and distinct chats, read from one snapshot.
    pub async fn totals(&self) -> Result<Totals> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let users: u64 = tx.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            let chats: u64 =
                tx.query_row("SELECT COUNT(DISTINCT chat_id) FROM stats", [], |row| row.get(0))?;
            tx.commit()?;
            Ok(Totals { users, chats })
        })
        .await
    }

    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &'static str) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
        .await
    }
}

fn increase_stats_tx(conn: &mut Connection, stats: &NamedStats) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let user_id = stats.user_id.get();
    let chat_id = stats.chat_id.get();

    let stored_name: Option<String> = tx
        .query_row(
            "SELECT displayed_name FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    match stored_name {
        None => {
            tx.execute(
                "INSERT INTO users (id, displayed_name) VALUES (?1, ?2)",
                params![user_id, stats.display_name],
            )?;
        }
        Some(name) if name != stats.display_name => {
            tx.execute(
                "UPDATE users SET displayed_name = ?2 WHERE id = ?1",
                params![user_id, stats.display_name],
            )?;
        }
        Some(_) => {}
    }

    tx.execute(
        "INSERT OR IGNORE INTO stats (user_id, chat_id) VALUES (?1, ?2)",
        params![user_id, chat_id],
    )?;
    tx.execute(
        r#"
        UPDATE stats
        SET svo_count = svo_count + ?3,
            zov_count = zov_count + ?4,
            likvidirovan_count = likvidirovan_count + ?5
        WHERE user_id = ?1 AND chat_id = ?2
        "#,
        params![
            user_id,
            chat_id,
            stats.svo_count,
            stats.zov_count,
            stats.likvidirovan_count
        ],
    )?;

    tx.commit()?;
    Ok(())
}
