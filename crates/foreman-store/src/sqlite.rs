//! SQLite-backed state store. Every mutation is a single-row upsert or delete.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use foreman_core::{
    ActiveAgentSession, AgentRole, AutomationRecord, AutomationStatus, IssueId, TurnActor,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::{StateStoreError, StoreResult};

const RECORD_COLUMNS: &str = "issue_id, title, status, has_plan, plan_summary, last_turn_actor, \
     pending_request, last_seen_comment_id, active_session_ref, spend_usd, note, \
     pull_request_url, undelivered_comment, created_at, updated_at";

const SESSION_COLUMNS: &str = "issue_id, session_ref, role, pid, started_at, log_path, \
     output_offset, workspace_path, ship_requested, estimated_cost_usd";

/// Number of records currently in one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCount {
    pub status: AutomationStatus,
    pub count: u64,
}

/// Persistent store for the daemon. Opens one connection per operation.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    db_path: PathBuf,
}

impl SqliteStateStore {
    /// Opens (creating if needed) the store at `path`.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS automation_records (
                issue_id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                status TEXT NOT NULL,
                has_plan INTEGER NOT NULL,
                plan_summary TEXT NULL,
                last_turn_actor TEXT NOT NULL,
                pending_request TEXT NULL,
                last_seen_comment_id INTEGER NULL,
                active_session_ref TEXT NULL,
                spend_usd REAL NOT NULL,
                note TEXT NULL,
                pull_request_url TEXT NULL,
                undelivered_comment TEXT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_automation_records_status
                ON automation_records (status, created_at);

            CREATE TABLE IF NOT EXISTS active_sessions (
                issue_id INTEGER PRIMARY KEY,
                session_ref TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL,
                pid INTEGER NULL,
                started_at TEXT NOT NULL,
                log_path TEXT NOT NULL,
                output_offset INTEGER NOT NULL,
                workspace_path TEXT NOT NULL,
                ship_requested INTEGER NOT NULL,
                estimated_cost_usd REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daily_spend (
                day TEXT PRIMARY KEY,
                spend_usd REAL NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn get_record(&self, issue_id: IssueId) -> StoreResult<Option<AutomationRecord>> {
        let connection = self.open_connection()?;
        let raw = connection
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM automation_records WHERE issue_id = ?1"),
                params![id_to_db(issue_id)],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    pub fn upsert_record(&self, record: &AutomationRecord) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            &format!(
                r#"
                INSERT INTO automation_records ({RECORD_COLUMNS})
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                ON CONFLICT(issue_id) DO UPDATE SET
                    title = excluded.title,
                    status = excluded.status,
                    has_plan = excluded.has_plan,
                    plan_summary = excluded.plan_summary,
                    last_turn_actor = excluded.last_turn_actor,
                    pending_request = excluded.pending_request,
                    last_seen_comment_id = excluded.last_seen_comment_id,
                    active_session_ref = excluded.active_session_ref,
                    spend_usd = excluded.spend_usd,
                    note = excluded.note,
                    pull_request_url = excluded.pull_request_url,
                    undelivered_comment = excluded.undelivered_comment,
                    updated_at = excluded.updated_at
                "#
            ),
            params![
                id_to_db(record.issue_id),
                record.title,
                record.status.as_str(),
                record.has_plan,
                record.plan_summary,
                record.last_turn_actor.as_str(),
                record.pending_request,
                record.last_seen_comment_id.map(u64_to_db),
                record.active_session_ref,
                record.spend_usd,
                record.note,
                record.pull_request_url,
                record.undelivered_comment,
                timestamp_to_db(record.created_at),
                timestamp_to_db(record.updated_at),
            ],
        )?;
        Ok(())
    }

    /// All records, oldest first.
    pub fn list_records(&self) -> StoreResult<Vec<AutomationRecord>> {
        self.query_records(&format!(
            "SELECT {RECORD_COLUMNS} FROM automation_records ORDER BY created_at ASC, issue_id ASC"
        ))
    }

    /// Records that can still transition, oldest first.
    pub fn list_open_records(&self) -> StoreResult<Vec<AutomationRecord>> {
        self.query_records(&format!(
            "SELECT {RECORD_COLUMNS} FROM automation_records \
             WHERE status NOT IN ('completed', 'failed') \
             ORDER BY created_at ASC, issue_id ASC"
        ))
    }

    fn query_records(&self, sql: &str) -> StoreResult<Vec<AutomationRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(sql)?;
        let rows = statement
            .query_map([], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRecord::into_record).collect()
    }

    pub fn count_records_by_status(&self) -> StoreResult<Vec<StatusCount>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT status, COUNT(*) FROM automation_records GROUP BY status ORDER BY status",
        )?;
        let rows = statement
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(status, count)| {
                Ok(StatusCount {
                    status: status_from_db(&status)?,
                    count: u64::try_from(count).unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Registers a live session. Fails when the issue already has one.
    pub fn register_session(&self, session: &ActiveAgentSession) -> StoreResult<()> {
        let connection = self.open_connection()?;
        let inserted = connection.execute(
            &format!(
                "INSERT INTO active_sessions ({SESSION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                id_to_db(session.issue_id),
                session.session_ref,
                session.role.as_str(),
                session.pid.map(i64::from),
                timestamp_to_db(session.started_at),
                session.log_path.display().to_string(),
                u64_to_db(session.output_offset),
                session.workspace_path.display().to_string(),
                session.ship_requested,
                session.estimated_cost_usd,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(error, _))
                if error.code == ErrorCode::ConstraintViolation =>
            {
                Err(StateStoreError::SessionAlreadyRegistered(session.issue_id))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Records the pid once the process is running.
    pub fn update_session_pid(&self, issue_id: IssueId, pid: Option<u32>) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            "UPDATE active_sessions SET pid = ?2 WHERE issue_id = ?1",
            params![id_to_db(issue_id), pid.map(i64::from)],
        )?;
        Ok(())
    }

    /// Removes the session registered for `issue_id`, returning whether one existed.
    pub fn remove_session(&self, issue_id: IssueId) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let removed = connection.execute(
            "DELETE FROM active_sessions WHERE issue_id = ?1",
            params![id_to_db(issue_id)],
        )?;
        Ok(removed > 0)
    }

    pub fn get_session(&self, issue_id: IssueId) -> StoreResult<Option<ActiveAgentSession>> {
        let connection = self.open_connection()?;
        let raw = connection
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM active_sessions WHERE issue_id = ?1"),
                params![id_to_db(issue_id)],
                RawSession::from_row,
            )
            .optional()?;
        raw.map(RawSession::into_session).transpose()
    }

    pub fn list_sessions(&self) -> StoreResult<Vec<ActiveAgentSession>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM active_sessions ORDER BY started_at ASC, issue_id ASC"
        ))?;
        let rows = statement
            .query_map([], RawSession::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawSession::into_session).collect()
    }

    pub fn daily_spend(&self, day: NaiveDate) -> StoreResult<f64> {
        let connection = self.open_connection()?;
        let spend = connection
            .query_row(
                "SELECT spend_usd FROM daily_spend WHERE day = ?1",
                params![day_to_db(day)],
                |row| row.get::<_, f64>(0),
            )
            .optional()?;
        Ok(spend.unwrap_or(0.0))
    }

    /// Adds `amount_usd` to the spend counter for `day` and returns the new total.
    pub fn add_daily_spend(&self, day: NaiveDate, amount_usd: f64) -> StoreResult<f64> {
        let connection = self.open_connection()?;
        let total = connection.query_row(
            r#"
            INSERT INTO daily_spend (day, spend_usd) VALUES (?1, ?2)
            ON CONFLICT(day) DO UPDATE SET spend_usd = spend_usd + excluded.spend_usd
            RETURNING spend_usd
            "#,
            params![day_to_db(day), amount_usd.max(0.0)],
            |row| row.get::<_, f64>(0),
        )?;
        Ok(total)
    }
}

struct RawRecord {
    issue_id: i64,
    title: String,
    status: String,
    has_plan: bool,
    plan_summary: Option<String>,
    last_turn_actor: String,
    pending_request: Option<String>,
    last_seen_comment_id: Option<i64>,
    active_session_ref: Option<String>,
    spend_usd: f64,
    note: Option<String>,
    pull_request_url: Option<String>,
    undelivered_comment: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            issue_id: row.get(0)?,
            title: row.get(1)?,
            status: row.get(2)?,
            has_plan: row.get(3)?,
            plan_summary: row.get(4)?,
            last_turn_actor: row.get(5)?,
            pending_request: row.get(6)?,
            last_seen_comment_id: row.get(7)?,
            active_session_ref: row.get(8)?,
            spend_usd: row.get(9)?,
            note: row.get(10)?,
            pull_request_url: row.get(11)?,
            undelivered_comment: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_record(self) -> StoreResult<AutomationRecord> {
        Ok(AutomationRecord {
            issue_id: id_from_db(self.issue_id)?,
            title: self.title,
            status: status_from_db(&self.status)?,
            has_plan: self.has_plan,
            plan_summary: self.plan_summary,
            last_turn_actor: TurnActor::parse(&self.last_turn_actor).ok_or_else(|| {
                StateStoreError::InvalidPersistedValue {
                    field: "last_turn_actor",
                    value: self.last_turn_actor.clone(),
                }
            })?,
            pending_request: self.pending_request,
            last_seen_comment_id: self
                .last_seen_comment_id
                .map(|value| u64_from_db("last_seen_comment_id", value))
                .transpose()?,
            active_session_ref: self.active_session_ref,
            spend_usd: self.spend_usd,
            note: self.note,
            pull_request_url: self.pull_request_url,
            undelivered_comment: self.undelivered_comment,
            created_at: timestamp_from_db(&self.created_at)?,
            updated_at: timestamp_from_db(&self.updated_at)?,
        })
    }
}

struct RawSession {
    issue_id: i64,
    session_ref: String,
    role: String,
    pid: Option<i64>,
    started_at: String,
    log_path: String,
    output_offset: i64,
    workspace_path: String,
    ship_requested: bool,
    estimated_cost_usd: f64,
}

impl RawSession {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            issue_id: row.get(0)?,
            session_ref: row.get(1)?,
            role: row.get(2)?,
            pid: row.get(3)?,
            started_at: row.get(4)?,
            log_path: row.get(5)?,
            output_offset: row.get(6)?,
            workspace_path: row.get(7)?,
            ship_requested: row.get(8)?,
            estimated_cost_usd: row.get(9)?,
        })
    }

    fn into_session(self) -> StoreResult<ActiveAgentSession> {
        Ok(ActiveAgentSession {
            session_ref: self.session_ref,
            issue_id: id_from_db(self.issue_id)?,
            role: AgentRole::parse(&self.role).ok_or_else(|| {
                StateStoreError::InvalidPersistedValue {
                    field: "role",
                    value: self.role.clone(),
                }
            })?,
            pid: self
                .pid
                .map(|pid| {
                    u32::try_from(pid).map_err(|_| StateStoreError::InvalidPersistedValue {
                        field: "pid",
                        value: pid.to_string(),
                    })
                })
                .transpose()?,
            started_at: timestamp_from_db(&self.started_at)?,
            log_path: PathBuf::from(self.log_path),
            output_offset: u64_from_db("output_offset", self.output_offset)?,
            workspace_path: PathBuf::from(self.workspace_path),
            ship_requested: self.ship_requested,
            estimated_cost_usd: self.estimated_cost_usd,
        })
    }
}

fn id_to_db(issue_id: IssueId) -> i64 {
    u64_to_db(issue_id.get())
}

fn id_from_db(value: i64) -> StoreResult<IssueId> {
    u64_from_db("issue_id", value).map(IssueId)
}

fn u64_to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn u64_from_db(field: &'static str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StateStoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn day_to_db(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn status_from_db(value: &str) -> StoreResult<AutomationStatus> {
    AutomationStatus::parse(value).ok_or_else(|| StateStoreError::InvalidPersistedValue {
        field: "status",
        value: value.to_string(),
    })
}
