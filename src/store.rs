//! SessionStore - SQLite persistence for learning sessions, failure events,
//! and telemetry samples.
//!
//! The store is append-only for failures and telemetry; sessions mutate only
//! through `close_session` and the one-way `is_synced` flip in `mark_synced`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::info;

/// One bounded learning interaction period. The unit of sync.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub score: i64,
    pub is_synced: bool,
}

/// A recorded mistake scoped to a session. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub id: i64,
    pub session_id: i64,
    pub concept: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

/// A periodic physical-state sample (e.g. temperature/pressure snapshot)
/// scoped to a session. The sampled readings are a free-form JSON object.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub id: i64,
    pub session_id: i64,
    pub created_at: DateTime<Utc>,
    pub fields: serde_json::Value,
}

/// Severity classification for a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Minor => "minor",
            Severity::Major => "major",
            Severity::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "minor" => Some(Severity::Minor),
            "major" => Some(Severity::Major),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Persistent storage for sessions, failures, and telemetry.
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Create a new SessionStore with the given database pool.
    /// Runs migrations to create the tables and indexes.
    pub async fn new(pool: SqlitePool) -> anyhow::Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run database migrations. Safe to call multiple times.
    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                score INTEGER NOT NULL DEFAULT 0,
                is_synced INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                concept TEXT NOT NULL,
                severity TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS telemetry (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                fields TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Pending-batch scans. Partial index keeps it small: synced rows
        // dominate the table over time and never match.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_pending
             ON sessions(started_at, id) WHERE is_synced = 0",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_failures_session
             ON failures(session_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_telemetry_session
             ON telemetry(session_id)",
        )
        .execute(&self.pool)
        .await?;

        info!("Session store migration complete");
        Ok(())
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Open a new session. Returns the assigned session ID.
    /// New sessions always start unsynced.
    pub async fn record_session(&self, started_at: DateTime<Utc>) -> anyhow::Result<i64> {
        let result = sqlx::query(
            "INSERT INTO sessions (started_at, score, is_synced) VALUES (?, 0, 0)",
        )
        .bind(started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Close a session: set its end timestamp and final score.
    pub async fn close_session(
        &self,
        session_id: i64,
        ended_at: DateTime<Utc>,
        score: i64,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET ended_at = ?, score = ? WHERE id = ?")
            .bind(ended_at.to_rfc3339())
            .bind(score)
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Append a failure event. The caller is responsible for passing a valid
    /// session ID; the store does not enforce referential integrity.
    pub async fn record_failure(
        &self,
        session_id: i64,
        concept: &str,
        severity: Severity,
        created_at: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let result = sqlx::query(
            "INSERT INTO failures (session_id, concept, severity, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(concept)
        .bind(severity.as_str())
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Append a telemetry sample with free-form reading fields.
    pub async fn record_telemetry(
        &self,
        session_id: i64,
        created_at: DateTime<Utc>,
        fields: serde_json::Value,
    ) -> anyhow::Result<i64> {
        let fields_json = serde_json::to_string(&fields)?;

        let result = sqlx::query(
            "INSERT INTO telemetry (session_id, created_at, fields) VALUES (?, ?, ?)",
        )
        .bind(session_id)
        .bind(created_at.to_rfc3339())
        .bind(&fields_json)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Flip `is_synced` to 1 for exactly the given set of sessions, in one
    /// statement. Idempotent; unknown IDs and the empty set are no-ops.
    pub async fn mark_synced(&self, session_ids: &[i64]) -> anyhow::Result<()> {
        if session_ids.is_empty() {
            return Ok(());
        }

        let placeholders: Vec<String> = session_ids.iter().map(|_| "?".to_string()).collect();
        let query = format!(
            "UPDATE sessions SET is_synced = 1 WHERE id IN ({})",
            placeholders.join(",")
        );

        let mut q = sqlx::query(&query);
        for id in session_ids {
            q = q.bind(id);
        }
        q.execute(&self.pool).await?;

        Ok(())
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Sessions not yet confirmed on the remote endpoint, oldest first.
    /// Ties on start time break by ID so the order is stable.
    pub async fn query_pending_sessions(&self, limit: usize) -> anyhow::Result<Vec<Session>> {
        let rows = sqlx::query(
            r#"
            SELECT id, started_at, ended_at, score, is_synced
            FROM sessions
            WHERE is_synced = 0
            ORDER BY started_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row_to_session(&row)?);
        }
        Ok(sessions)
    }

    /// All failures belonging to any of the given sessions, in insertion order.
    /// Used to bundle failures with their sessions for sync.
    pub async fn query_failures_for_sessions(
        &self,
        session_ids: &[i64],
    ) -> anyhow::Result<Vec<Failure>> {
        if session_ids.is_empty() {
            return Ok(vec![]);
        }

        let placeholders: Vec<String> = session_ids.iter().map(|_| "?".to_string()).collect();
        let query = format!(
            "SELECT id, session_id, concept, severity, created_at
             FROM failures
             WHERE session_id IN ({})
             ORDER BY id ASC",
            placeholders.join(",")
        );

        let mut q = sqlx::query(&query);
        for id in session_ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut failures = Vec::new();
        for row in rows {
            failures.push(row_to_failure(&row)?);
        }
        Ok(failures)
    }

    /// Telemetry samples for a session, in insertion order.
    pub async fn query_telemetry(&self, session_id: i64) -> anyhow::Result<Vec<Telemetry>> {
        let rows = sqlx::query(
            "SELECT id, session_id, created_at, fields
             FROM telemetry
             WHERE session_id = ?
             ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut samples = Vec::new();
        for row in rows {
            let created_at_str: String = row.get("created_at");
            let fields_json: String = row.get("fields");
            samples.push(Telemetry {
                id: row.get("id"),
                session_id: row.get("session_id"),
                created_at: DateTime::parse_from_rfc3339(&created_at_str)?.with_timezone(&Utc),
                fields: serde_json::from_str(&fields_json)?,
            });
        }
        Ok(samples)
    }

    /// Render a session's failure history as a prompt-ready summary string,
    /// one line per failure in insertion order. Empty string when the session
    /// has no failures.
    pub async fn get_context(&self, session_id: i64) -> anyhow::Result<String> {
        let rows = sqlx::query(
            "SELECT concept, created_at
             FROM failures
             WHERE session_id = ?
             ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let lines: Vec<String> = rows
            .iter()
            .map(|row| {
                let created_at: String = row.get("created_at");
                let concept: String = row.get("concept");
                format!("{}: Failed at {}", created_at, concept)
            })
            .collect();

        Ok(lines.join("\n"))
    }
}

// =========================================================================
// Helpers
// =========================================================================

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Session> {
    let started_at_str: String = row.get("started_at");
    let ended_at_str: Option<String> = row.get("ended_at");

    let ended_at = match ended_at_str {
        Some(s) => Some(DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc)),
        None => None,
    };

    Ok(Session {
        id: row.get("id"),
        started_at: DateTime::parse_from_rfc3339(&started_at_str)?.with_timezone(&Utc),
        ended_at,
        score: row.get("score"),
        is_synced: row.get::<i64, _>("is_synced") != 0,
    })
}

fn row_to_failure(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Failure> {
    let severity_str: String = row.get("severity");
    let created_at_str: String = row.get("created_at");

    Ok(Failure {
        id: row.get("id"),
        session_id: row.get("session_id"),
        concept: row.get("concept"),
        severity: Severity::from_str(&severity_str).unwrap_or(Severity::Minor),
        created_at: DateTime::parse_from_rfc3339(&created_at_str)?.with_timezone(&Utc),
    })
}
