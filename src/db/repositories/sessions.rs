use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{from_millis, parse_datetime, parse_optional_datetime, parse_status, to_i64, to_u64},
    models::{Session, SessionStatus},
};

const SESSION_COLUMNS: &str =
    "id, client_id, started_at, ended_at, duration_ms, status, created_at, updated_at";

fn row_to_session(row: &Row) -> Result<Session> {
    let started_at: String = row.get("started_at")?;
    let ended_at: Option<String> = row.get("ended_at")?;
    let duration_ms: Option<i64> = row.get("duration_ms")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Session {
        id: row.get("id")?,
        client_id: row.get("client_id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        ended_at: parse_optional_datetime(ended_at, "ended_at")?,
        duration_ms: duration_ms
            .map(|ms| to_u64(ms, "duration_ms"))
            .transpose()?,
        status: parse_status(&status)?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

fn query_session(conn: &rusqlite::Connection, session_id: &str) -> Result<Option<Session>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
    ))?;
    let mut rows = stmt.query(params![session_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_session(row)?)),
        None => Ok(None),
    }
}

impl Database {
    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, client_id, started_at, ended_at, duration_ms, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id,
                    record.client_id,
                    record.started_at.to_rfc3339(),
                    record.ended_at.as_ref().map(|dt| dt.to_rfc3339()),
                    record.duration_ms.map(to_i64).transpose()?,
                    record.status.as_str(),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Sets `ended_at`, `duration_ms` and the final status. Fails if the
    /// session does not exist or is already closed.
    pub async fn close_session(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
        status: SessionStatus,
    ) -> Result<Session> {
        if status == SessionStatus::Active {
            bail!("cannot close a session as Active");
        }
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let session = query_session(conn, &session_id)?
                .ok_or_else(|| anyhow!("session {session_id} not found"))?;
            if !session.is_open() {
                bail!("session {session_id} is already closed");
            }

            // A wall clock stepped backwards must not yield a negative duration.
            let ended_at = ended_at.max(session.started_at);
            let duration_ms = (ended_at - session.started_at).num_milliseconds().max(0) as u64;

            let rows_affected = conn.execute(
                "UPDATE sessions
                 SET ended_at = ?1,
                     duration_ms = ?2,
                     status = ?3,
                     updated_at = ?4
                 WHERE id = ?5 AND ended_at IS NULL",
                params![
                    ended_at.to_rfc3339(),
                    to_i64(duration_ms)?,
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    session_id,
                ],
            )?;
            if rows_affected == 0 {
                bail!("session {session_id} is already closed");
            }

            query_session(conn, &session_id)?
                .ok_or_else(|| anyhow!("session {session_id} vanished after close"))
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| query_session(conn, &session_id))
            .await
    }

    pub async fn get_open_session(&self, client_id: &str) -> Result<Option<Session>> {
        let client_id = client_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE client_id = ?1 AND ended_at IS NULL
                 LIMIT 1"
            ))?;
            let mut rows = stmt.query(params![client_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Latest first.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY started_at DESC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    /// Closes every session left open by an unclean shutdown. `ended_at` is
    /// the last metric written for it, or its start when it has none.
    pub async fn recover_interrupted_sessions(&self) -> Result<Vec<Session>> {
        self.execute(|conn| {
            let tx = conn.transaction()?;
            let open: Vec<Session> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE ended_at IS NULL"
                ))?;
                let mut rows = stmt.query([])?;
                let mut open = Vec::new();
                while let Some(row) = rows.next()? {
                    open.push(row_to_session(row)?);
                }
                open
            };

            let now = Utc::now().to_rfc3339();
            let mut recovered = Vec::with_capacity(open.len());
            for mut session in open {
                let last_ms: Option<i64> = tx
                    .query_row(
                        "SELECT MAX(timestamp_ms) FROM metrics WHERE session_id = ?1",
                        params![session.id],
                        |row| row.get(0),
                    )
                    .optional()?
                    .flatten();
                let ended_at = match last_ms {
                    Some(ms) => from_millis(ms, "timestamp_ms")?.max(session.started_at),
                    None => session.started_at,
                };
                let duration_ms = (ended_at - session.started_at).num_milliseconds().max(0) as u64;

                tx.execute(
                    "UPDATE sessions
                     SET ended_at = ?1,
                         duration_ms = ?2,
                         status = ?3,
                         updated_at = ?4
                     WHERE id = ?5",
                    params![
                        ended_at.to_rfc3339(),
                        to_i64(duration_ms)?,
                        SessionStatus::Interrupted.as_str(),
                        now,
                        session.id,
                    ],
                )?;

                session.ended_at = Some(ended_at);
                session.duration_ms = Some(duration_ms);
                session.status = SessionStatus::Interrupted;
                recovered.push(session);
            }

            tx.commit()?;
            Ok(recovered)
        })
        .await
    }

    /// Bulk delete of every session and metric. Returns sessions removed.
    pub async fn delete_all_sessions_and_metrics(&self) -> Result<usize> {
        self.execute(|conn| {
            let tx = conn.transaction()?;
            // Metrics would cascade, but deleting them first keeps this
            // independent of the foreign_keys pragma.
            tx.execute("DELETE FROM metrics", [])?;
            let sessions = tx.execute("DELETE FROM sessions", [])?;
            tx.commit()?;
            Ok(sessions)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn open_db(dir: &tempfile::TempDir) -> Database {
        Database::new(dir.path().join("sessions.sqlite3")).unwrap()
    }

    #[tokio::test]
    async fn insert_close_and_read_back() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let started = Utc::now();
        let session = Session::start("client-a", started);
        db.insert_session(&session).await.unwrap();

        let open = db.get_open_session("client-a").await.unwrap().unwrap();
        assert_eq!(open.id, session.id);
        assert!(open.is_open());

        let closed = db
            .close_session(&session.id, started + Duration::milliseconds(1_500), SessionStatus::Completed)
            .await
            .unwrap();
        assert_eq!(closed.duration_ms, Some(1_500));
        assert_eq!(closed.status, SessionStatus::Completed);
        assert!(db.get_open_session("client-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closing_twice_fails() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let session = Session::start("client-a", Utc::now());
        db.insert_session(&session).await.unwrap();
        db.close_session(&session.id, Utc::now(), SessionStatus::Completed)
            .await
            .unwrap();
        assert!(db
            .close_session(&session.id, Utc::now(), SessionStatus::Completed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn only_one_open_session_per_client() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        db.insert_session(&Session::start("client-a", Utc::now()))
            .await
            .unwrap();
        assert!(db
            .insert_session(&Session::start("client-a", Utc::now()))
            .await
            .is_err());
        db.insert_session(&Session::start("client-b", Utc::now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn recovers_open_session_without_metrics_at_start_time() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let started = Utc::now() - Duration::minutes(5);
        let session = Session::start("client-a", started);
        db.insert_session(&session).await.unwrap();

        let recovered = db.recover_interrupted_sessions().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, SessionStatus::Interrupted);
        assert_eq!(recovered[0].duration_ms, Some(0));

        let stored = db.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Interrupted);
        assert!(!stored.is_open());
        assert!(db.recover_interrupted_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lists_latest_first_and_bulk_deletes() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let base = Utc::now() - Duration::hours(1);
        for (i, client) in ["a", "b", "c"].iter().enumerate() {
            let session = Session::start(*client, base + Duration::minutes(i as i64));
            db.insert_session(&session).await.unwrap();
        }

        let listed = db.list_sessions().await.unwrap();
        let clients: Vec<&str> = listed.iter().map(|s| s.client_id.as_str()).collect();
        assert_eq!(clients, vec!["c", "b", "a"]);

        assert_eq!(db.delete_all_sessions_and_metrics().await.unwrap(), 3);
        assert!(db.list_sessions().await.unwrap().is_empty());
    }
}
