use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rusqlite::{
    Connection, ErrorCode, OpenFlags, OptionalExtension as _, TransactionBehavior, ffi, params,
};

use crate::error::StoreError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS session (
      id TEXT NOT NULL UNIQUE,
      creation_date INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS session_creation_date_idx ON session(creation_date);
"#;

const REQUEST_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS request (
      id_session TEXT NOT NULL,
      data TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS request_id_session_idx ON request(id_session);
"#;

/// Handle on the session/request database.
///
/// The handle only remembers where the database lives. Every operation opens
/// its own connection on a blocking worker and closes it before returning, so
/// clones can be shared freely between request handlers and the purge task;
/// SQLite serializes the writers.
#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
}

/// Rows removed by one purge run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub sessions: usize,
    pub requests: usize,
}

impl Store {
    /// Opens the store at `db_path`, creating the file and the schema if needed.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        if !db_path.exists() {
            create_store_file(&db_path)?;
        }

        let conn = open_connection(&db_path)
            .and_then(|conn| {
                conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
                    row.get::<_, i64>(0)
                })?;
                Ok(conn)
            })
            .map_err(|err| StoreError::OpenFailed(format!("{}: {err}", db_path.display())))?;
        ensure_schema(&conn)?;
        drop(conn);

        tracing::debug!(path = %db_path.display(), "store opened");
        Ok(Self { db_path })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Creates session `id` stamped with the current time.
    ///
    /// Fails with [`StoreError::SessionAlreadyExists`] when the id is taken; the
    /// existing session is left untouched.
    pub async fn insert_session(&self, id: &str) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let id = id.to_owned();
        tokio::task::spawn_blocking(move || insert_session_blocking(&db_path, &id, unix_now_secs()))
            .await
            .map_err(|err| {
                StoreError::SessionInsertFailed(format!("join insert_session task: {err}"))
            })?
    }

    /// Attaches `payload` to session `session_id`.
    ///
    /// Fails with [`StoreError::SessionNotFound`] when no such session exists.
    pub async fn insert_request(&self, session_id: &str, payload: &str) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_owned();
        let payload = payload.to_owned();
        tokio::task::spawn_blocking(move || {
            insert_request_blocking(&db_path, &session_id, &payload)
        })
        .await
        .map_err(|err| StoreError::RequestInsertFailed(format!("join insert_request task: {err}")))?
    }

    /// Deletes every session created more than `max_age` ago, together with its
    /// requests.
    pub async fn purge_sessions(&self, max_age: Duration) -> Result<PurgeSummary, StoreError> {
        self.purge_sessions_at(max_age, unix_now_secs()).await
    }

    /// Same as [`Store::purge_sessions`] with an explicit clock reading
    /// (seconds since the Unix epoch).
    ///
    /// Sessions are purged one at a time, each in its own transaction. If one of
    /// them fails, its transaction is rolled back, sessions purged before it stay
    /// purged and the remaining ones are left for the next run.
    pub async fn purge_sessions_at(
        &self,
        max_age: Duration,
        now: i64,
    ) -> Result<PurgeSummary, StoreError> {
        let db_path = self.db_path.clone();
        let max_age_secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(move || purge_sessions_blocking(&db_path, max_age_secs, now))
            .await
            .map_err(|err| StoreError::PurgeFailed(format!("join purge_sessions task: {err}")))?
    }
}

pub fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn create_store_file(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            StoreError::FileCreateFailed(format!("create store dir {}: {err}", parent.display()))
        })?;
    }

    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| StoreError::FileCreateFailed(format!("{}: {err}", path.display())))?;
    Ok(())
}

fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;

    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    Ok(conn)
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SESSION_SCHEMA)
        .map_err(|err| StoreError::SchemaCreateFailed(format!("session table: {err}")))?;
    conn.execute_batch(REQUEST_SCHEMA)
        .map_err(|err| StoreError::SchemaCreateFailed(format!("request table: {err}")))?;
    Ok(())
}

fn session_exists(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM session WHERE id = ?1 LIMIT 1",
        params![id],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}

fn insert_session_blocking(path: &Path, id: &str, created_at: i64) -> Result<(), StoreError> {
    let conn = open_connection(path).map_err(|err| {
        StoreError::SessionInsertFailed(format!("open {}: {err}", path.display()))
    })?;

    match conn.execute(
        "INSERT INTO session (id, creation_date) VALUES (?1, ?2)",
        params![id, created_at],
    ) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Err(StoreError::SessionAlreadyExists(format!(
                "session `{id}` already exists"
            )))
        }
        Err(err) => Err(StoreError::SessionInsertFailed(format!(
            "insert session `{id}`: {err}"
        ))),
    }
}

fn insert_request_blocking(path: &Path, session_id: &str, payload: &str) -> Result<(), StoreError> {
    let failed = |err: rusqlite::Error| {
        StoreError::RequestInsertFailed(format!("insert request for `{session_id}`: {err}"))
    };

    let mut conn = open_connection(path).map_err(failed)?;
    // IMMEDIATE takes the write lock up front, so a purge cannot remove the
    // session between the existence check and the insert.
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(failed)?;

    if !session_exists(&tx, session_id).map_err(failed)? {
        return Err(StoreError::SessionNotFound(format!(
            "session `{session_id}` does not exist"
        )));
    }

    tx.execute(
        "INSERT INTO request (id_session, data) VALUES (?1, ?2)",
        params![session_id, payload],
    )
    .map_err(failed)?;
    tx.commit().map_err(failed)?;
    Ok(())
}

fn expired_session_ids(conn: &Connection, limit: i64) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id
        FROM session
        WHERE creation_date < ?1
        ORDER BY creation_date ASC, id ASC
        "#,
    )?;
    let mut rows = stmt.query(params![limit])?;

    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        ids.push(row.get::<_, String>(0)?);
    }
    Ok(ids)
}

/// Removes one session and its requests atomically. Returns the number of
/// request rows deleted, or `None` when the session is gone or no longer
/// expired by the time the transaction starts.
fn purge_session(conn: &mut Connection, id: &str, limit: i64) -> rusqlite::Result<Option<usize>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let still_expired = tx
        .query_row(
            "SELECT 1 FROM session WHERE id = ?1 AND creation_date < ?2",
            params![id, limit],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !still_expired {
        return Ok(None);
    }

    let requests = tx.execute("DELETE FROM request WHERE id_session = ?1", params![id])?;
    tx.execute("DELETE FROM session WHERE id = ?1", params![id])?;
    tx.commit()?;
    Ok(Some(requests))
}

fn purge_sessions_blocking(
    path: &Path,
    max_age_secs: i64,
    now: i64,
) -> Result<PurgeSummary, StoreError> {
    let limit = now.saturating_sub(max_age_secs);
    let mut conn = open_connection(path)
        .map_err(|err| StoreError::PurgeFailed(format!("open {}: {err}", path.display())))?;

    let expired = expired_session_ids(&conn, limit)
        .map_err(|err| StoreError::PurgeFailed(format!("select expired sessions: {err}")))?;

    let mut summary = PurgeSummary::default();
    for id in &expired {
        match purge_session(&mut conn, id, limit) {
            Ok(Some(requests)) => {
                summary.sessions += 1;
                summary.requests += requests;
            }
            Ok(None) => {}
            Err(err) => {
                return Err(StoreError::PurgeFailed(format!(
                    "purge session `{id}` after purging {} of {} expired sessions: {err}",
                    summary.sessions,
                    expired.len()
                )));
            }
        }
    }

    Ok(summary)
}
