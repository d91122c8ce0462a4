//! Local timeline cache on SQLite.
//!
//! Every cached post belongs to one partition, addressed by a [`TimelineKey`]
//! (owning account + timeline kind). Writes go through [`TimelineCache::transaction`],
//! which runs the whole closure on a blocking thread and commits only if it
//! returns `Ok`. A task cancelled while awaiting a transaction therefore never
//! observes a partial write: the blocking side either commits or rolls back.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::CacheError;
use crate::sources::Post;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS timeline_posts (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    account_key TEXT NOT NULL,
    paging_key TEXT NOT NULL,
    status_id TEXT NOT NULL,
    post_json TEXT NOT NULL,
    UNIQUE (account_key, paging_key, status_id)
);
CREATE INDEX IF NOT EXISTS idx_timeline_posts_order
    ON timeline_posts(account_key, paging_key, seq);
"#;

/// Owning account of a cached timeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccountKey(pub String);

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Timeline classification.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimelineKind {
    Home,
    Mentions,
    Conversation,
    /// Posts of one user, by user id
    User(String),
    Search(String),
    Custom(String),
}

impl TimelineKind {
    /// Stable string stored next to each cached post.
    pub fn paging_key(&self) -> String {
        match self {
            Self::Home => "home".into(),
            Self::Mentions => "mentions".into(),
            Self::Conversation => "conversation".into(),
            Self::User(id) => format!("user:{id}"),
            Self::Search(q) => format!("search:{q}"),
            Self::Custom(name) => format!("custom:{name}"),
        }
    }
}

impl fmt::Display for TimelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.paging_key())
    }
}

impl FromStr for TimelineKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.split_once(':') {
            None => match s {
                "home" => Self::Home,
                "mentions" => Self::Mentions,
                "conversation" => Self::Conversation,
                _ => return Err(CacheError::UnknownTimeline(s.into())),
            },
            Some((_, "")) => return Err(CacheError::UnknownTimeline(s.into())),
            Some(("user", id)) => Self::User(id.into()),
            Some(("search", q)) => Self::Search(q.into()),
            Some(("custom", name)) => Self::Custom(name.into()),
            Some(_) => return Err(CacheError::UnknownTimeline(s.into())),
        };
        Ok(kind)
    }
}

/// Cache partition key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimelineKey {
    pub account: AccountKey,
    pub kind: TimelineKind,
}

impl TimelineKey {
    pub fn new(account: AccountKey, kind: TimelineKind) -> Self {
        Self { account, kind }
    }
}

impl fmt::Display for TimelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.kind)
    }
}

/// A post projected into one timeline partition.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedPost {
    pub key: TimelineKey,
    pub status_id: String,
    pub post: Post,
}

impl CachedPost {
    pub fn new(key: TimelineKey, post: Post) -> Self {
        Self { key, status_id: post.id.clone(), post }
    }
}

/// Write handle passed to [`TimelineCache::transaction`] closures.
pub struct CacheTransaction<'conn> {
    tx: Transaction<'conn>,
}

impl CacheTransaction<'_> {
    /// Delete every cached post of `key`. Returns the number of removed rows.
    pub fn clear(&self, key: &TimelineKey) -> Result<usize, CacheError> {
        let removed = self.tx.execute(
            "DELETE FROM timeline_posts WHERE account_key = ?1 AND paging_key = ?2",
            params![key.account.0, key.kind.paging_key()],
        )?;
        Ok(removed)
    }

    /// Insert new posts at the tail of their partition; posts already cached
    /// keep their position and get their body replaced.
    pub fn upsert(&self, records: &[CachedPost]) -> Result<(), CacheError> {
        let mut stmt = self.tx.prepare_cached(
            "INSERT INTO timeline_posts (account_key, paging_key, status_id, post_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(account_key, paging_key, status_id)
             DO UPDATE SET post_json = excluded.post_json",
        )?;
        for record in records {
            let json = serde_json::to_string(&record.post)?;
            stmt.execute(params![
                record.key.account.0,
                record.key.kind.paging_key(),
                record.status_id,
                json,
            ])?;
        }
        Ok(())
    }
}

type KeyLocks = HashMap<TimelineKey, Arc<AsyncMutex<()>>>;

/// Load slot of one timeline, see [`TimelineCache::lock`].
/// The key is forgotten on drop once no other load holds or awaits it.
pub struct TimelineLock {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<KeyLocks>>,
    key: TimelineKey,
}

impl Drop for TimelineLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&self.key).map_or(false, |slot| Arc::strong_count(slot) == 1) {
            locks.remove(&self.key);
        }
    }
}

/// Shared handle to the cache database. Cheap to clone.
#[derive(Clone)]
pub struct TimelineCache {
    conn: Arc<Mutex<Connection>>,
    locks: Arc<Mutex<KeyLocks>>,
}

impl TimelineCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Exclusive load slot for one timeline. Loads for other keys never wait on it.
    pub async fn lock(&self, key: &TimelineKey) -> TimelineLock {
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        TimelineLock {
            guard: Some(slot.lock_owned().await),
            locks: self.locks.clone(),
            key: key.clone(),
        }
    }

    /// Run `f` inside one SQLite transaction. Commits on `Ok`, rolls back otherwise.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&CacheTransaction<'_>) -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        self.blocking(move |conn| {
            let tx = CacheTransaction { tx: conn.transaction()? };
            let out = f(&tx)?;
            tx.tx.commit()?;
            Ok(out)
        })
        .await
    }

    /// Cached posts of `key`, in timeline order.
    pub async fn list(&self, key: &TimelineKey) -> Result<Vec<CachedPost>, CacheError> {
        let key = key.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT status_id, post_json FROM timeline_posts
                 WHERE account_key = ?1 AND paging_key = ?2 ORDER BY seq",
            )?;
            let rows = stmt
                .query_map(params![key.account.0, key.kind.paging_key()], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(status_id, json)| {
                    Ok(CachedPost { key: key.clone(), status_id, post: serde_json::from_str(&json)? })
                })
                .collect()
        })
        .await
    }

    /// Tail of the partition, i.e. the oldest loaded post.
    pub async fn last(&self, key: &TimelineKey) -> Result<Option<CachedPost>, CacheError> {
        let key = key.clone();
        self.blocking(move |conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT status_id, post_json FROM timeline_posts
                     WHERE account_key = ?1 AND paging_key = ?2 ORDER BY seq DESC LIMIT 1",
                    params![key.account.0, key.kind.paging_key()],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            match row {
                Some((status_id, json)) => Ok(Some(CachedPost {
                    key,
                    status_id,
                    post: serde_json::from_str(&json)?,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn count(&self, key: &TimelineKey) -> Result<usize, CacheError> {
        let key = key.clone();
        self.blocking(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM timeline_posts WHERE account_key = ?1 AND paging_key = ?2",
                params![key.account.0, key.kind.paging_key()],
                |r| r.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }

    /// Look a post up by id in any timeline of `account`.
    pub async fn find(&self, account: &AccountKey, status_id: &str) -> Result<Option<Post>, CacheError> {
        let (account, status_id) = (account.clone(), status_id.to_string());
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT post_json FROM timeline_posts
                     WHERE account_key = ?1 AND status_id = ?2 LIMIT 1",
                    params![account.0, status_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
        })
        .await
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&mut Connection) -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| CacheError::Task(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))?
    }
}
