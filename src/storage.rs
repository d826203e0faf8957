use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{
    Connection, OpenFlags, OptionalExtension as _, Transaction, TransactionBehavior, params,
};

use crate::session::{
    NewResource, NewSession, Resource, ResourceId, ResourceMeta, ResourcePayload,
    ResourceSummary, SessionDetail, SessionId, SessionRecord, SessionStatus, SessionSummary,
};

const SCHEMA_VERSION: i32 = 1;
pub const SESSIONS_DB_FILENAME: &str = "sessions.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(String),
    Backend(String),
}

impl StoreError {
    fn backend(action: &str, err: impl std::fmt::Display) -> Self {
        Self::Backend(format!("{action}: {err}"))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "{what} was not found"),
            Self::Backend(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for StoreError {}

/// Document storage for session records and their resource collections.
///
/// Implementations must make `append_resource` atomic per call: a resource is either
/// fully attached to its session or not at all.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Creates the session together with its initial resources, returning their ids in
    /// input order.
    async fn create_session(&self, session: NewSession) -> Result<Vec<ResourceId>, StoreError>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionDetail>, StoreError>;

    /// Newest sessions first.
    async fn list_sessions(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, StoreError>;

    async fn count_sessions(&self) -> Result<u64, StoreError>;

    async fn get_resource(
        &self,
        session: &SessionId,
        resource: ResourceId,
    ) -> Result<Option<Resource>, StoreError>;

    /// Appends a resource and refreshes the session's activity timestamp. A session that
    /// is already completed keeps its status.
    async fn append_resource(
        &self,
        session: &SessionId,
        resource: NewResource,
    ) -> Result<ResourceId, StoreError>;

    /// Returns `false` when the session does not exist.
    async fn mark_completed(
        &self,
        session: &SessionId,
        completed_at_unix_ms: i64,
    ) -> Result<bool, StoreError>;

    async fn resource_count(&self, session: &SessionId) -> Result<u64, StoreError>;

    async fn blob_keys(&self, session: &SessionId) -> Result<Vec<String>, StoreError>;

    /// Removes the session record and its resources. Returns `false` when it did not exist.
    async fn delete_session(&self, session: &SessionId) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    db_path: PathBuf,
}

impl SqliteSessionStore {
    pub fn open(db_path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let store = Self { db_path };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_dir(storage_dir: &Path) -> anyhow::Result<Self> {
        Self::open(storage_dir.join(SESSIONS_DB_FILENAME))
    }

    fn init(&self) -> anyhow::Result<()> {
        let mut conn = open_connection(&self.db_path)?;
        migrate(&mut conn)?;
        Ok(())
    }

    async fn run_blocking<T, F>(&self, action: &'static str, task: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)
                .map_err(|err| StoreError::backend(action, format!("{err:#}")))?;
            task(&mut conn)
        })
        .await
        .map_err(|err| StoreError::backend(action, format!("join task failed: {err}")))?
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, session: NewSession) -> Result<Vec<ResourceId>, StoreError> {
        self.run_blocking("create session", move |conn| {
            create_session_blocking(conn, session)
        })
        .await
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionDetail>, StoreError> {
        let id = id.clone();
        self.run_blocking("get session", move |conn| get_session_blocking(conn, &id))
            .await
    }

    async fn list_sessions(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let (offset, limit) = validate_pagination(offset, limit)?;
        self.run_blocking("list sessions", move |conn| {
            list_sessions_blocking(conn, offset, limit)
        })
        .await
    }

    async fn count_sessions(&self) -> Result<u64, StoreError> {
        self.run_blocking("count sessions", |conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM sessions;", [], |row| row.get(0))
                .map_err(|err| StoreError::backend("count sessions", err))?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn get_resource(
        &self,
        session: &SessionId,
        resource: ResourceId,
    ) -> Result<Option<Resource>, StoreError> {
        let session = session.clone();
        self.run_blocking("get resource", move |conn| {
            get_resource_blocking(conn, &session, resource)
        })
        .await
    }

    async fn append_resource(
        &self,
        session: &SessionId,
        resource: NewResource,
    ) -> Result<ResourceId, StoreError> {
        let session = session.clone();
        self.run_blocking("append resource", move |conn| {
            append_resource_blocking(conn, &session, resource)
        })
        .await
    }

    async fn mark_completed(
        &self,
        session: &SessionId,
        completed_at_unix_ms: i64,
    ) -> Result<bool, StoreError> {
        let session = session.clone();
        self.run_blocking("mark session completed", move |conn| {
            let updated = conn
                .execute(
                    r#"
                    UPDATE sessions
                    SET status = ?1, completed_at_unix_ms = ?2, last_activity_unix_ms = ?2
                    WHERE id = ?3
                    "#,
                    params![
                        SessionStatus::Completed.as_str(),
                        completed_at_unix_ms,
                        session.as_str()
                    ],
                )
                .map_err(|err| StoreError::backend("mark session completed", err))?;
            Ok(updated > 0)
        })
        .await
    }

    async fn resource_count(&self, session: &SessionId) -> Result<u64, StoreError> {
        let session = session.clone();
        self.run_blocking("count resources", move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM resources WHERE session_id = ?1;",
                    params![session.as_str()],
                    |row| row.get(0),
                )
                .map_err(|err| StoreError::backend("count resources", err))?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn blob_keys(&self, session: &SessionId) -> Result<Vec<String>, StoreError> {
        let session = session.clone();
        self.run_blocking("list blob keys", move |conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT blob_key FROM resources
                    WHERE session_id = ?1 AND blob_key IS NOT NULL
                    ORDER BY id ASC
                    "#,
                )
                .map_err(|err| StoreError::backend("prepare list blob keys", err))?;
            let keys = stmt
                .query_map(params![session.as_str()], |row| row.get::<_, String>(0))
                .map_err(|err| StoreError::backend("list blob keys", err))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| StoreError::backend("read blob key row", err))?;
            Ok(keys)
        })
        .await
    }

    async fn delete_session(&self, session: &SessionId) -> Result<bool, StoreError> {
        let session = session.clone();
        self.run_blocking("delete session", move |conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM sessions WHERE id = ?1;",
                    params![session.as_str()],
                )
                .map_err(|err| StoreError::backend("delete session", err))?;
            Ok(deleted > 0)
        })
        .await
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("set PRAGMA foreign_keys=ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                  id TEXT PRIMARY KEY,
                  url TEXT NOT NULL,
                  status TEXT NOT NULL CHECK (status IN ('recording', 'completed')),
                  created_at_unix_ms INTEGER NOT NULL,
                  started_at_unix_ms INTEGER NOT NULL,
                  last_activity_unix_ms INTEGER NOT NULL,
                  completed_at_unix_ms INTEGER
                );

                CREATE TABLE IF NOT EXISTS resources (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                  url TEXT NOT NULL,
                  status INTEGER NOT NULL,
                  content_type TEXT NOT NULL,
                  captured_at_unix_ms INTEGER NOT NULL,
                  content BLOB,
                  blob_key TEXT,
                  size_bytes INTEGER NOT NULL,
                  CHECK ((content IS NULL) <> (blob_key IS NULL))
                );

                CREATE INDEX IF NOT EXISTS resources_session_idx ON resources(session_id, id);
                CREATE INDEX IF NOT EXISTS sessions_created_idx ON sessions(created_at_unix_ms DESC);
                "#,
            )
            .context("create sqlite schema v1")?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported {SESSIONS_DB_FILENAME} schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn validate_pagination(offset: usize, limit: usize) -> Result<(i64, i64), StoreError> {
    let offset = i64::try_from(offset)
        .map_err(|_| StoreError::Backend("pagination offset exceeds sqlite range".to_owned()))?;
    let limit = i64::try_from(limit)
        .map_err(|_| StoreError::Backend("pagination limit exceeds sqlite range".to_owned()))?;
    Ok((offset, limit))
}

/// Write transactions take the lock at `BEGIN`, where a concurrent writer waits on
/// `busy_timeout`.
fn begin_write(conn: &mut Connection) -> rusqlite::Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

fn create_session_blocking(
    conn: &mut Connection,
    session: NewSession,
) -> Result<Vec<ResourceId>, StoreError> {
    let tx = begin_write(conn).map_err(|err| StoreError::backend("begin create session", err))?;
    tx.execute(
        r#"
        INSERT INTO sessions (
          id, url, status, created_at_unix_ms, started_at_unix_ms, last_activity_unix_ms
        ) VALUES (?1, ?2, ?3, ?4, ?4, ?4)
        "#,
        params![
            session.id.as_str(),
            session.url,
            SessionStatus::Recording.as_str(),
            session.started_at_unix_ms
        ],
    )
    .map_err(|err| StoreError::backend(&format!("insert session {}", session.id), err))?;

    let mut ids = Vec::with_capacity(session.resources.len());
    for resource in session.resources {
        ids.push(insert_resource(&tx, &session.id, resource)?);
    }
    tx.commit()
        .map_err(|err| StoreError::backend("commit create session", err))?;
    Ok(ids)
}

fn insert_resource(
    tx: &Transaction<'_>,
    session: &SessionId,
    resource: NewResource,
) -> Result<ResourceId, StoreError> {
    let size_bytes = i64::try_from(resource.payload.size_bytes()).unwrap_or(i64::MAX);
    let (content, blob_key) = match resource.payload {
        ResourcePayload::Inline(bytes) => (Some(bytes.to_vec()), None),
        ResourcePayload::Blob { key, .. } => (None, Some(key)),
    };
    tx.execute(
        r#"
        INSERT INTO resources (
          session_id, url, status, content_type, captured_at_unix_ms, content, blob_key, size_bytes
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            session.as_str(),
            resource.meta.url,
            i64::from(resource.meta.status),
            resource.meta.content_type,
            resource.meta.captured_at_unix_ms,
            content,
            blob_key,
            size_bytes
        ],
    )
    .map_err(|err| {
        StoreError::backend(
            &format!("insert resource {} into session {session}", resource.meta.url),
            err,
        )
    })?;
    Ok(ResourceId(tx.last_insert_rowid()))
}

fn append_resource_blocking(
    conn: &mut Connection,
    session: &SessionId,
    resource: NewResource,
) -> Result<ResourceId, StoreError> {
    let captured_at = resource.meta.captured_at_unix_ms;
    let tx = begin_write(conn).map_err(|err| StoreError::backend("begin append resource", err))?;

    let exists = tx
        .query_row(
            "SELECT 1 FROM sessions WHERE id = ?1;",
            params![session.as_str()],
            |_| Ok(()),
        )
        .optional()
        .map_err(|err| StoreError::backend("look up session for append", err))?
        .is_some();
    if !exists {
        return Err(StoreError::NotFound(format!("session `{session}`")));
    }

    let id = insert_resource(&tx, session, resource)?;
    tx.execute(
        r#"
        UPDATE sessions
        SET status = ?1, last_activity_unix_ms = MAX(last_activity_unix_ms, ?2)
        WHERE id = ?3 AND completed_at_unix_ms IS NULL
        "#,
        params![SessionStatus::Recording.as_str(), captured_at, session.as_str()],
    )
    .map_err(|err| StoreError::backend("refresh session activity", err))?;
    tx.commit()
        .map_err(|err| StoreError::backend("commit append resource", err))?;
    Ok(id)
}

fn session_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    let status = SessionStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown session status `{status}`").into(),
        )
    })?;
    let id = SessionId::parse(&id).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, err.into())
    })?;
    Ok(SessionRecord {
        id,
        url: row.get(1)?,
        status,
        created_at_unix_ms: row.get(3)?,
        started_at_unix_ms: row.get(4)?,
        last_activity_unix_ms: row.get(5)?,
        completed_at_unix_ms: row.get(6)?,
    })
}

fn status_from_row(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u16> {
    let status: i64 = row.get(index)?;
    u16::try_from(status).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Integer,
            err.into(),
        )
    })
}

fn get_session_blocking(
    conn: &mut Connection,
    id: &SessionId,
) -> Result<Option<SessionDetail>, StoreError> {
    let session = conn
        .query_row(
            r#"
            SELECT id, url, status, created_at_unix_ms, started_at_unix_ms,
                   last_activity_unix_ms, completed_at_unix_ms
            FROM sessions
            WHERE id = ?1
            "#,
            params![id.as_str()],
            session_record_from_row,
        )
        .optional()
        .map_err(|err| StoreError::backend(&format!("read session {id}"), err))?;
    let Some(session) = session else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, url, status, content_type, captured_at_unix_ms, size_bytes, blob_key
            FROM resources
            WHERE session_id = ?1
            ORDER BY id ASC
            "#,
        )
        .map_err(|err| StoreError::backend("prepare list resources", err))?;
    let resources = stmt
        .query_map(params![id.as_str()], |row| {
            let size_bytes: i64 = row.get(5)?;
            Ok(ResourceSummary {
                id: ResourceId(row.get(0)?),
                url: row.get(1)?,
                status: status_from_row(row, 2)?,
                content_type: row.get(3)?,
                captured_at_unix_ms: row.get(4)?,
                size_bytes: u64::try_from(size_bytes).unwrap_or(0),
                blob_key: row.get(6)?,
            })
        })
        .map_err(|err| StoreError::backend(&format!("list resources of session {id}"), err))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| StoreError::backend("read resource row", err))?;

    Ok(Some(SessionDetail { session, resources }))
}

fn list_sessions_blocking(
    conn: &mut Connection,
    offset: i64,
    limit: i64,
) -> Result<Vec<SessionSummary>, StoreError> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT s.id, s.url, s.status, s.created_at_unix_ms, s.started_at_unix_ms,
                   s.last_activity_unix_ms, s.completed_at_unix_ms,
                   (SELECT COUNT(*) FROM resources r WHERE r.session_id = s.id)
            FROM sessions s
            ORDER BY s.created_at_unix_ms DESC, s.id ASC
            LIMIT ?1 OFFSET ?2
            "#,
        )
        .map_err(|err| StoreError::backend("prepare list sessions", err))?;
    let sessions = stmt
        .query_map(params![limit, offset], |row| {
            let resource_count: i64 = row.get(7)?;
            Ok(SessionSummary {
                session: session_record_from_row(row)?,
                resource_count: u64::try_from(resource_count).unwrap_or(0),
            })
        })
        .map_err(|err| StoreError::backend("list sessions", err))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| StoreError::backend("read session row", err))?;
    Ok(sessions)
}

fn get_resource_blocking(
    conn: &mut Connection,
    session: &SessionId,
    resource: ResourceId,
) -> Result<Option<Resource>, StoreError> {
    conn.query_row(
        r#"
        SELECT id, url, status, content_type, captured_at_unix_ms, content, blob_key, size_bytes
        FROM resources
        WHERE session_id = ?1 AND id = ?2
        "#,
        params![session.as_str(), resource.0],
        |row| {
            let content: Option<Vec<u8>> = row.get(5)?;
            let blob_key: Option<String> = row.get(6)?;
            let size_bytes: i64 = row.get(7)?;
            let payload = match (content, blob_key) {
                (Some(content), _) => ResourcePayload::Inline(Bytes::from(content)),
                (None, Some(key)) => ResourcePayload::Blob {
                    key,
                    size_bytes: u64::try_from(size_bytes).unwrap_or(0),
                },
                (None, None) => {
                    return Err(rusqlite::Error::FromSqlConversionFailure(
                        5,
                        rusqlite::types::Type::Null,
                        "resource has neither inline content nor blob key".into(),
                    ));
                }
            };
            Ok(Resource {
                id: ResourceId(row.get(0)?),
                meta: ResourceMeta {
                    url: row.get(1)?,
                    status: status_from_row(row, 2)?,
                    content_type: row.get(3)?,
                    captured_at_unix_ms: row.get(4)?,
                },
                payload,
            })
        },
    )
    .optional()
    .map_err(|err| {
        StoreError::backend(
            &format!("read resource {resource} of session {session}"),
            err,
        )
    })
}
