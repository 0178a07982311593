use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::types::{
    ApprovalRequest, ApprovalStatus, ApprovalTransition, AuditEvent, IngestOutcome,
    InboundMessage, NewInboundMessage, Run, RunState, Session, StoreMetrics,
};

/// Single-writer facade over one SQLite connection.
///
/// Every method takes the connection lock for the duration of one short
/// read-modify-write sequence and releases it before returning. Long-blocking
/// work (connector calls) must never run while holding this lock.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        tracing::debug!(path = %path.as_ref().display(), "opening relay store");
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn).await
    }

    /// In-memory store, used by tests and `relayd doctor`.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn).await
    }

    async fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(1000))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS daemon_meta (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id           TEXT PRIMARY KEY,
    sender       TEXT NOT NULL,
    workspace    TEXT NOT NULL,
    last_channel TEXT,
    last_target  TEXT,
    mode         TEXT NOT NULL DEFAULT 'standard',
    created_at   TEXT NOT NULL,
    last_active  TEXT NOT NULL,
    UNIQUE (sender, workspace)
);

CREATE TABLE IF NOT EXISTS inbound_messages (
    id          TEXT PRIMARY KEY,
    channel     TEXT NOT NULL,
    external_id TEXT NOT NULL,
    sender      TEXT NOT NULL,
    title       TEXT,
    body        TEXT NOT NULL,
    context     TEXT NOT NULL,
    received_at TEXT NOT NULL,
    UNIQUE (channel, external_id)
);

CREATE TABLE IF NOT EXISTS runs (
    id         TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    kind       TEXT NOT NULL,
    state      TEXT NOT NULL,
    payload    TEXT NOT NULL,
    result     TEXT,
    error      TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS approval_requests (
    id         TEXT PRIMARY KEY,
    run_id     TEXT NOT NULL REFERENCES runs(id),
    requester  TEXT NOT NULL,
    summary    TEXT NOT NULL,
    status     TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_approvals_pending_run
    ON approval_requests(run_id) WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS audit_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id     TEXT,
    step       TEXT NOT NULL,
    event      TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS channel_cursors (
    channel    TEXT PRIMARY KEY,
    cursor     TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#,
        )?;
        Ok(())
    }

    // ---- daemon meta ----

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
INSERT INTO daemon_meta (key, value, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE
SET value = excluded.value,
    updated_at = excluded.updated_at
"#,
            params![key, value, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM daemon_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    // ---- sessions ----

    /// Resolve or create the session keyed by (sender, workspace), updating
    /// its last-seen channel/target and activity timestamp.
    pub async fn upsert_session(
        &self,
        sender: &str,
        workspace: &str,
        channel: Option<&str>,
        target: Option<&str>,
    ) -> Result<Session> {
        let now = Utc::now();
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM sessions WHERE sender = ?1 AND workspace = ?2",
                params![sender, workspace],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(raw) => {
                conn.execute(
                    r#"
UPDATE sessions
   SET last_channel = COALESCE(?2, last_channel),
       last_target = COALESCE(?3, last_target),
       last_active = ?4
 WHERE id = ?1
"#,
                    params![raw, channel, target, ts(now)],
                )?;
                parse_uuid(&raw)?
            }
            None => {
                let id = Uuid::new_v4();
                conn.execute(
                    r#"
INSERT INTO sessions (id, sender, workspace, last_channel, last_target, mode, created_at, last_active)
VALUES (?1, ?2, ?3, ?4, ?5, 'standard', ?6, ?6)
"#,
                    params![id.to_string(), sender, workspace, channel, target, ts(now)],
                )?;
                id
            }
        };

        let session = conn.query_row(
            "SELECT id, sender, workspace, last_channel, last_target, mode, created_at, last_active
               FROM sessions WHERE id = ?1",
            params![id.to_string()],
            map_session,
        )?;
        Ok(session)
    }

    pub async fn set_session_mode(&self, session_id: Uuid, mode: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE sessions SET mode = ?2, last_active = ?3 WHERE id = ?1",
            params![session_id.to_string(), mode, ts(Utc::now())],
        )?;
        Ok(changed == 1)
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        let conn = self.conn.lock().await;
        let session = conn
            .query_row(
                "SELECT id, sender, workspace, last_channel, last_target, mode, created_at, last_active
                   FROM sessions WHERE id = ?1",
                params![session_id.to_string()],
                map_session,
            )
            .optional()?;
        Ok(session)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, sender, workspace, last_channel, last_target, mode, created_at, last_active
               FROM sessions ORDER BY last_active DESC",
        )?;
        let rows = stmt.query_map([], map_session)?;
        collect(rows)
    }

    // ---- inbound messages ----

    /// Idempotent ingestion: a second item with the same (channel,
    /// external_id) is a recorded no-op, not an error.
    pub async fn record_inbound(&self, msg: &NewInboundMessage) -> Result<IngestOutcome> {
        let id = Uuid::new_v4();
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            r#"
INSERT OR IGNORE INTO inbound_messages
    (id, channel, external_id, sender, title, body, context, received_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
"#,
            params![
                id.to_string(),
                msg.channel,
                msg.external_id,
                msg.sender,
                msg.title,
                msg.body,
                serde_json::to_string(&msg.context)?,
                ts(Utc::now()),
            ],
        )?;
        if inserted == 0 {
            return Ok(IngestOutcome::Duplicate);
        }
        Ok(IngestOutcome::Inserted(id))
    }

    pub async fn list_inbound(&self, limit: usize) -> Result<Vec<InboundMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, channel, external_id, sender, title, body, context, received_at
               FROM inbound_messages ORDER BY received_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], map_inbound)?;
        collect(rows)
    }

    // ---- runs ----

    pub async fn create_run(&self, session_id: Uuid, kind: &str, payload: &str) -> Result<Run> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
INSERT INTO runs (id, session_id, kind, state, payload, created_at, updated_at)
VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?5)
"#,
            params![id.to_string(), session_id.to_string(), kind, payload, ts(now)],
        )?;
        Ok(Run {
            id,
            session_id,
            kind: kind.to_string(),
            state: RunState::Queued,
            payload: payload.to_string(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn set_run_state(
        &self,
        run_id: Uuid,
        state: RunState,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"
UPDATE runs
   SET state = ?2,
       result = COALESCE(?3, result),
       error = COALESCE(?4, error),
       updated_at = ?5
 WHERE id = ?1
"#,
            params![run_id.to_string(), state.as_str(), result, error, ts(Utc::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::InvalidValue(format!("unknown run: {run_id}")));
        }
        Ok(())
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let conn = self.conn.lock().await;
        let run = conn
            .query_row(
                "SELECT id, session_id, kind, state, payload, result, error, created_at, updated_at
                   FROM runs WHERE id = ?1",
                params![run_id.to_string()],
                map_run,
            )
            .optional()?;
        Ok(run)
    }

    pub async fn list_runs_for_session(&self, session_id: Uuid, limit: usize) -> Result<Vec<Run>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, kind, state, payload, result, error, created_at, updated_at
               FROM runs WHERE session_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id.to_string(), limit as i64], map_run)?;
        collect(rows)
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, kind, state, payload, result, error, created_at, updated_at
               FROM runs ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], map_run)?;
        collect(rows)
    }

    // ---- approval requests ----

    pub async fn create_approval(
        &self,
        run_id: Uuid,
        requester: &str,
        summary: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<ApprovalRequest> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
INSERT INTO approval_requests (id, run_id, requester, summary, status, created_at, expires_at)
VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)
"#,
            params![
                id.to_string(),
                run_id.to_string(),
                requester,
                summary,
                ts(now),
                ts(expires_at),
            ],
        )?;
        Ok(ApprovalRequest {
            id,
            run_id,
            requester: requester.to_string(),
            summary: summary.to_string(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at,
        })
    }

    pub async fn get_approval(&self, id: Uuid) -> Result<Option<ApprovalRequest>> {
        let conn = self.conn.lock().await;
        let approval = conn
            .query_row(
                "SELECT id, run_id, requester, summary, status, created_at, expires_at
                   FROM approval_requests WHERE id = ?1",
                params![id.to_string()],
                map_approval,
            )
            .optional()?;
        Ok(approval)
    }

    pub async fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
        limit: usize,
    ) -> Result<Vec<ApprovalRequest>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            r#"
SELECT id, run_id, requester, summary, status, created_at, expires_at
  FROM approval_requests
 WHERE (?1 IS NULL OR status = ?1)
 ORDER BY created_at DESC
 LIMIT ?2
"#,
        )?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit as i64],
            map_approval,
        )?;
        collect(rows)
    }

    /// Guarded compare-and-swap transition out of `pending`.
    ///
    /// Guards, in order: the row exists; it is currently pending; the actor
    /// (when given) matches the original requester; `now` is before
    /// `expires_at`. The final write is conditioned on `status = 'pending'`
    /// so a concurrent sweep and approve cannot both win. A deadline that has
    /// already passed marks the row expired here rather than leaving it
    /// approvable.
    pub async fn resolve_approval(
        &self,
        id: Uuid,
        actor: Option<&str>,
        approve: bool,
        now: DateTime<Utc>,
    ) -> Result<ApprovalTransition> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let row: Option<(String, String, String)> = tx
            .query_row(
                "SELECT requester, status, expires_at FROM approval_requests WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((requester, status_raw, expires_raw)) = row else {
            return Ok(ApprovalTransition::NotFound);
        };

        let status = ApprovalStatus::parse(&status_raw)?;
        if status != ApprovalStatus::Pending {
            return Ok(ApprovalTransition::NotPending(status));
        }
        if let Some(actor) = actor {
            if actor != requester {
                return Ok(ApprovalTransition::WrongSender);
            }
        }
        let expires_at = parse_ts(&expires_raw)?;
        if now >= expires_at {
            tx.execute(
                "UPDATE approval_requests SET status = 'expired' WHERE id = ?1 AND status = 'pending'",
                params![id.to_string()],
            )?;
            tx.commit()?;
            return Ok(ApprovalTransition::AlreadyExpired);
        }

        let new_status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        let changed = tx.execute(
            "UPDATE approval_requests SET status = ?2 WHERE id = ?1 AND status = 'pending'",
            params![id.to_string(), new_status.as_str()],
        )?;
        tx.commit()?;

        if changed == 1 {
            Ok(ApprovalTransition::Applied)
        } else {
            // Lost the conditioned write; report whatever state won.
            let status = peek_status(&conn, id)?.unwrap_or(ApprovalStatus::Pending);
            Ok(ApprovalTransition::NotPending(status))
        }
    }

    /// Mark every pending request past its deadline as expired, returning
    /// (approval id, run id) for each row actually transitioned.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<(Uuid, Uuid)>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let due: Vec<(String, String)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id, run_id FROM approval_requests
                  WHERE status = 'pending' AND expires_at <= ?1",
            )?;
            let rows = stmt.query_map(params![ts(now)], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut expired = Vec::with_capacity(due.len());
        for (approval_raw, run_raw) in due {
            let changed = tx.execute(
                "UPDATE approval_requests SET status = 'expired' WHERE id = ?1 AND status = 'pending'",
                params![approval_raw],
            )?;
            if changed == 1 {
                expired.push((parse_uuid(&approval_raw)?, parse_uuid(&run_raw)?));
            }
        }
        tx.commit()?;
        Ok(expired)
    }

    // ---- audit events ----

    pub async fn append_audit(
        &self,
        run_id: Option<Uuid>,
        step: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
INSERT INTO audit_events (run_id, step, event, payload, created_at)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
            params![
                run_id.map(|id| id.to_string()),
                step,
                event,
                serde_json::to_string(&payload)?,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub async fn audit_tail(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, run_id, step, event, payload, created_at
               FROM audit_events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], map_audit)?;
        collect(rows)
    }

    pub async fn audit_for_run(&self, run_id: Uuid) -> Result<Vec<AuditEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, run_id, step, event, payload, created_at
               FROM audit_events WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], map_audit)?;
        collect(rows)
    }

    // ---- channel cursors ----

    pub async fn get_cursor(&self, channel: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let cursor = conn
            .query_row(
                "SELECT cursor FROM channel_cursors WHERE channel = ?1",
                params![channel],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor)
    }

    pub async fn set_cursor(&self, channel: &str, cursor: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
INSERT INTO channel_cursors (channel, cursor, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(channel) DO UPDATE
SET cursor = excluded.cursor,
    updated_at = excluded.updated_at
"#,
            params![channel, cursor, ts(Utc::now())],
        )?;
        Ok(())
    }

    // ---- metrics ----

    pub async fn metrics(&self) -> Result<StoreMetrics> {
        let conn = self.conn.lock().await;
        let sessions: i64 =
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        let audit_events: i64 =
            conn.query_row("SELECT COUNT(*) FROM audit_events", [], |row| row.get(0))?;
        let inbound_by_channel = grouped_counts(
            &conn,
            "SELECT channel, COUNT(*) FROM inbound_messages GROUP BY channel ORDER BY channel",
        )?;
        let runs_by_state = grouped_counts(
            &conn,
            "SELECT state, COUNT(*) FROM runs GROUP BY state ORDER BY state",
        )?;
        let approvals_by_status = grouped_counts(
            &conn,
            "SELECT status, COUNT(*) FROM approval_requests GROUP BY status ORDER BY status",
        )?;
        Ok(StoreMetrics {
            sessions,
            inbound_by_channel,
            runs_by_state,
            approvals_by_status,
            audit_events,
        })
    }
}

fn peek_status(conn: &Connection, id: Uuid) -> Result<Option<ApprovalStatus>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM approval_requests WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| ApprovalStatus::parse(&s)).transpose()
}

fn grouped_counts(conn: &Connection, sql: &str) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    collect(rows)
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidValue(format!("timestamp {raw:?}: {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::InvalidValue(format!("uuid {raw:?}: {e}")))
}

fn column_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn column_uuid(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn column_json(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn map_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: column_uuid(row, 0)?,
        sender: row.get(1)?,
        workspace: row.get(2)?,
        last_channel: row.get(3)?,
        last_target: row.get(4)?,
        mode: row.get(5)?,
        created_at: column_ts(row, 6)?,
        last_active: column_ts(row, 7)?,
    })
}

fn map_inbound(row: &rusqlite::Row<'_>) -> rusqlite::Result<InboundMessage> {
    Ok(InboundMessage {
        id: column_uuid(row, 0)?,
        channel: row.get(1)?,
        external_id: row.get(2)?,
        sender: row.get(3)?,
        title: row.get(4)?,
        body: row.get(5)?,
        context: column_json(row, 6)?,
        received_at: column_ts(row, 7)?,
    })
}

fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let state_raw: String = row.get(3)?;
    let state = RunState::parse(&state_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(Run {
        id: column_uuid(row, 0)?,
        session_id: column_uuid(row, 1)?,
        kind: row.get(2)?,
        state,
        payload: row.get(4)?,
        result: row.get(5)?,
        error: row.get(6)?,
        created_at: column_ts(row, 7)?,
        updated_at: column_ts(row, 8)?,
    })
}

fn map_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRequest> {
    let status_raw: String = row.get(4)?;
    let status = ApprovalStatus::parse(&status_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(ApprovalRequest {
        id: column_uuid(row, 0)?,
        run_id: column_uuid(row, 1)?,
        requester: row.get(2)?,
        summary: row.get(3)?,
        status,
        created_at: column_ts(row, 5)?,
        expires_at: column_ts(row, 6)?,
    })
}

fn map_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
    let run_raw: Option<String> = row.get(1)?;
    let run_id = match run_raw {
        Some(raw) => Some(
            Uuid::parse_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
            })?,
        ),
        None => None,
    };
    Ok(AuditEvent {
        id: row.get(0)?,
        run_id,
        step: row.get(2)?,
        event: row.get(3)?,
        payload: column_json(row, 4)?,
        created_at: column_ts(row, 5)?,
    })
}
