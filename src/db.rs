use std::{collections::VecDeque, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

pub const DB_NAME: &str = "aronachat";
pub const MESSAGES: &str = "messages";

/// One chat message, as sent by clients, persisted, and broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRecord {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub message: String,
    /// Public URL of a materialized image, or empty. Inbound this may hold an inline payload.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub room: String,
}

#[derive(Debug)]
struct ChangeNotification {
    resume_token: i64,
    document: Value,
}

/// Message collection backed by SQLite, with an insert notification feed.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    feed: broadcast::Sender<Arc<ChangeNotification>>,
    // held across commit + publish so feed order is commit order
    writer: Arc<Mutex<()>>,
}

impl Store {
    pub async fn connect(database_url: &str, feed_capacity: usize) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;
        Self::from_pool(pool, feed_capacity).await
    }

    /// Single-connection in-memory database, used by tests.
    pub async fn in_memory(feed_capacity: usize) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool, feed_capacity).await
    }

    async fn from_pool(pool: SqlitePool, feed_capacity: usize) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                username TEXT NOT NULL,
                message TEXT NOT NULL,
                image TEXT NOT NULL,
                room TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_room ON messages (room, seq)")
            .execute(&pool)
            .await?;

        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Ok(Self {
            pool,
            feed,
            writer: Arc::new(Mutex::new(())),
        })
    }

    /// Inserts one record and publishes its change document. Returns the document id.
    pub async fn insert(&self, record: &MessageRecord) -> Result<Uuid, sqlx::Error> {
        let _writer = self.writer.lock().await;

        let id = Uuid::now_v7();
        let seq = sqlx::query("INSERT INTO messages (id,username,message,image,room) VALUES (?,?,?,?,?)")
            .bind(id.to_string())
            .bind(&record.username)
            .bind(&record.message)
            .bind(&record.image)
            .bind(&record.room)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        // no subscribers is fine, the table is the source of truth
        let _ = self.feed.send(Arc::new(ChangeNotification {
            resume_token: seq,
            document: change_document(id, record),
        }));

        Ok(id)
    }

    pub async fn find_by_room(&self, room: &str) -> Result<Vec<MessageRecord>, sqlx::Error> {
        sqlx::query_as("SELECT username,message,image,room FROM messages WHERE room=? ORDER BY seq")
            .bind(room)
            .fetch_all(&self.pool)
            .await
    }

    /// Subscribes to inserts committed from now on.
    pub async fn watch(&self) -> Result<ChangeStream, sqlx::Error> {
        let _writer = self.writer.lock().await;

        let rx = self.feed.subscribe();
        let (last_seen,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM messages")
            .fetch_one(&self.pool)
            .await?;

        Ok(ChangeStream {
            pool: self.pool.clone(),
            rx,
            last_seen,
            backlog: VecDeque::new(),
            needs_replay: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Publishes an arbitrary document on the feed without writing anything.
    #[cfg(test)]
    pub(crate) fn publish(&self, resume_token: i64, document: Value) {
        let _ = self.feed.send(Arc::new(ChangeNotification { resume_token, document }));
    }
}

fn change_document(id: impl Serialize, record: &MessageRecord) -> Value {
    json!({
        "operationType": "insert",
        "fullDocument": record,
        "documentKey": { "_id": id },
        "ns": { "db": DB_NAME, "coll": MESSAGES },
    })
}

/// Ordered stream of raw change documents. Falls back to reading the table when the
/// in-process feed overflows, so lagging never drops or duplicates an insert.
pub struct ChangeStream {
    pool: SqlitePool,
    rx: broadcast::Receiver<Arc<ChangeNotification>>,
    last_seen: i64,
    backlog: VecDeque<Arc<ChangeNotification>>,
    // set on lag, cleared once the table has been read back
    needs_replay: bool,
}

impl ChangeStream {
    /// Next change document, or `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Result<Value, sqlx::Error>> {
        loop {
            if let Some(notification) = self.backlog.pop_front() {
                self.last_seen = notification.resume_token;
                return Some(Ok(notification.document.clone()));
            }

            if self.needs_replay {
                if let Err(err) = self.replay().await {
                    return Some(Err(err));
                }
                self.needs_replay = false;
                continue;
            }

            match self.rx.recv().await {
                Ok(notification) => {
                    if notification.resume_token <= self.last_seen {
                        continue;
                    }
                    self.last_seen = notification.resume_token;
                    return Some(Ok(notification.document.clone()));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, resume_after = self.last_seen, "change feed lagged, replaying from store");
                    self.needs_replay = true;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn resume_token(&self) -> i64 {
        self.last_seen
    }

    async fn replay(&mut self) -> Result<(), sqlx::Error> {
        let rows: Vec<(i64, String, String, String, String, String)> = sqlx::query_as(
            "SELECT seq,id,username,message,image,room FROM messages WHERE seq > ? ORDER BY seq",
        )
        .bind(self.last_seen)
        .fetch_all(&self.pool)
        .await?;

        for (seq, id, username, message, image, room) in rows {
            let record = MessageRecord { username, message, image, room };
            let document = change_document(&id, &record);
            self.backlog.push_back(Arc::new(ChangeNotification { resume_token: seq, document }));
        }
        Ok(())
    }
}
