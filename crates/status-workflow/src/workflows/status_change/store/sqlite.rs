use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};

use crate::workflows::status_change::audit::{AuditDraft, AuditEntity, AuditEntry, AuditOperation};
use crate::workflows::status_change::domain::{
    ApprovalStep, ApproverRole, Justification, Page, RequestFilter, RequestId, RequestStatus,
    RequestType, StatusChangeRequest, StepId, StepStatus, SubStateId, SubjectId,
};
use crate::workflows::status_change::repository::{
    RepositoryError, RequestDraft, StepResolution, WorkflowReader, WorkflowStore,
    WorkflowTransaction,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const REQUEST_COLUMNS: &str = "id, subject_id, request_type, justification, notes, \
     target_state_ref, status, created_by, created_at, updated_at";
const STEP_COLUMNS: &str =
    "id, request_id, position, approver_role, status, responded_by, message, responded_at";
const AUDIT_COLUMNS: &str = "id, request_id, entity_type, entity_id, operation, before_json, \
     after_json, actor, recorded_at";

#[derive(Debug, thiserror::Error)]
pub enum SqliteStoreError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite schema setup failed: {source}")]
    Schema {
        #[source]
        source: rusqlite::Error,
    },
}

/// SQLite-backed store. Every call opens its own connection; write transactions start
/// `IMMEDIATE` so concurrent writers queue on the busy timeout instead of interleaving.
pub struct SqliteWorkflowStore {
    db_path: PathBuf,
}

impl SqliteWorkflowStore {
    pub fn open(db_path: &Path) -> Result<Self, SqliteStoreError> {
        if let Some(parent) = db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| SqliteStoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> Result<Connection, rusqlite::Error> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        connection.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(connection)
    }

    fn connect(&self) -> Result<Connection, RepositoryError> {
        self.open_connection().map_err(sql_error)
    }

    fn ensure_schema(&self) -> Result<(), SqliteStoreError> {
        let connection = self
            .open_connection()
            .map_err(|source| SqliteStoreError::Open {
                path: self.db_path.display().to_string(),
                source,
            })?;
        connection
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))
            .map_err(|source| SqliteStoreError::Schema { source })?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS status_change_requests (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    subject_id TEXT NOT NULL,
                    request_type TEXT NOT NULL,
                    justification TEXT NOT NULL,
                    notes TEXT,
                    target_state_ref TEXT,
                    status TEXT NOT NULL,
                    created_by TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_status_change_one_pending
                    ON status_change_requests(subject_id, request_type)
                    WHERE status = 'pending';
                CREATE INDEX IF NOT EXISTS idx_status_change_subject
                    ON status_change_requests(subject_id, created_at DESC);

                CREATE TABLE IF NOT EXISTS approval_steps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    request_id INTEGER NOT NULL
                        REFERENCES status_change_requests(id),
                    position INTEGER NOT NULL,
                    approver_role TEXT NOT NULL,
                    status TEXT NOT NULL,
                    responded_by TEXT,
                    message TEXT,
                    responded_at TEXT,
                    UNIQUE (request_id, approver_role)
                );

                CREATE INDEX IF NOT EXISTS idx_approval_steps_pending_role
                    ON approval_steps(approver_role, status);

                CREATE TABLE IF NOT EXISTS audit_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    request_id INTEGER NOT NULL,
                    entity_type TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    operation TEXT NOT NULL,
                    before_json TEXT,
                    after_json TEXT NOT NULL,
                    actor TEXT NOT NULL,
                    recorded_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_audit_log_request
                    ON audit_log(request_id, id);

                CREATE TRIGGER IF NOT EXISTS audit_log_no_update
                    BEFORE UPDATE ON audit_log
                BEGIN
                    SELECT RAISE(ABORT, 'audit_log is append-only');
                END;

                CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
                    BEFORE DELETE ON audit_log
                BEGIN
                    SELECT RAISE(ABORT, 'audit_log is append-only');
                END;

                CREATE TRIGGER IF NOT EXISTS status_change_requests_no_delete
                    BEFORE DELETE ON status_change_requests
                BEGIN
                    SELECT RAISE(ABORT, 'status change requests are retained for audit');
                END;
                ",
            )
            .map_err(|source| SqliteStoreError::Schema { source })
    }
}

impl WorkflowStore for SqliteWorkflowStore {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn WorkflowTransaction) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_error)?;
        let mut unit = SqliteUnit { conn: &tx };
        let outcome = work(&mut unit)?;
        tx.commit().map_err(sql_error)?;
        Ok(outcome)
    }

    fn snapshot<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn WorkflowReader) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let mut connection = self.connect()?;
        let tx = connection.transaction().map_err(sql_error)?;
        let unit = SqliteUnit { conn: &tx };
        work(&unit)
    }
}

struct SqliteUnit<'a> {
    conn: &'a Connection,
}

impl WorkflowReader for SqliteUnit<'_> {
    fn fetch_request(&self, id: RequestId) -> Result<Option<StatusChangeRequest>, RepositoryError> {
        self.conn
            .query_row(
                &format!("SELECT {REQUEST_COLUMNS} FROM status_change_requests WHERE id = ?1"),
                params![id.0],
                RequestRow::read,
            )
            .optional()
            .map_err(sql_error)?
            .map(RequestRow::into_request)
            .transpose()
    }

    fn fetch_step(&self, id: StepId) -> Result<Option<ApprovalStep>, RepositoryError> {
        self.conn
            .query_row(
                &format!("SELECT {STEP_COLUMNS} FROM approval_steps WHERE id = ?1"),
                params![id.0],
                StepRow::read,
            )
            .optional()
            .map_err(sql_error)?
            .map(StepRow::into_step)
            .transpose()
    }

    fn steps_for(&self, request_id: RequestId) -> Result<Vec<ApprovalStep>, RepositoryError> {
        let mut statement = self
            .conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM approval_steps WHERE request_id = ?1 ORDER BY position, id"
            ))
            .map_err(sql_error)?;
        let rows = statement
            .query_map(params![request_id.0], StepRow::read)
            .map_err(sql_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_error)?;
        rows.into_iter().map(StepRow::into_step).collect()
    }

    fn find_pending(
        &self,
        subject: &SubjectId,
        request_type: RequestType,
    ) -> Result<Option<StatusChangeRequest>, RepositoryError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM status_change_requests
                     WHERE subject_id = ?1 AND request_type = ?2 AND status = 'pending'"
                ),
                params![subject.0, request_type.label()],
                RequestRow::read,
            )
            .optional()
            .map_err(sql_error)?
            .map(RequestRow::into_request)
            .transpose()
    }

    fn list_requests(
        &self,
        filter: &RequestFilter,
        limit: usize,
    ) -> Result<Page<StatusChangeRequest>, RepositoryError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(subject) = &filter.subject_id {
            clauses.push("subject_id = ?".to_string());
            values.push(SqlValue::Text(subject.0.clone()));
        }
        if let Some(kind) = filter.request_type {
            clauses.push("request_type = ?".to_string());
            values.push(SqlValue::Text(kind.label().to_string()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?".to_string());
            values.push(SqlValue::Text(status.label().to_string()));
        }
        if let Some(roles) = &filter.awaiting_roles {
            if roles.is_empty() {
                return Ok(Page {
                    items: Vec::new(),
                    total: 0,
                    offset: filter.offset,
                    limit,
                });
            }
            let placeholders = vec!["?"; roles.len()].join(", ");
            clauses.push(format!(
                "status = 'pending' AND EXISTS (
                    SELECT 1 FROM approval_steps s
                    WHERE s.request_id = status_change_requests.id
                      AND s.status = 'pending'
                      AND s.approver_role IN ({placeholders}))"
            ));
            values.extend(
                roles
                    .iter()
                    .map(|role| SqlValue::Text(role.label().to_string())),
            );
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM status_change_requests{where_sql}"),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )
            .map_err(sql_error)?;

        let mut paged = values.clone();
        paged.push(SqlValue::Integer(to_i64(limit)));
        paged.push(SqlValue::Integer(to_i64(filter.offset)));

        let mut statement = self
            .conn
            .prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM status_change_requests{where_sql}
                 ORDER BY id DESC LIMIT ? OFFSET ?"
            ))
            .map_err(sql_error)?;
        let rows = statement
            .query_map(params_from_iter(paged.iter()), RequestRow::read)
            .map_err(sql_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_error)?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(RequestRow::into_request)
                .collect::<Result<Vec<_>, _>>()?,
            total: usize::try_from(total).unwrap_or_default(),
            offset: filter.offset,
            limit,
        })
    }

    fn audit_for_request(&self, request_id: RequestId) -> Result<Vec<AuditEntry>, RepositoryError> {
        let mut statement = self
            .conn
            .prepare(&format!(
                "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE request_id = ?1 ORDER BY id"
            ))
            .map_err(sql_error)?;
        let rows = statement
            .query_map(params![request_id.0], AuditRow::read)
            .map_err(sql_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_error)?;
        rows.into_iter().map(AuditRow::into_entry).collect()
    }
}

impl WorkflowTransaction for SqliteUnit<'_> {
    fn insert_request(
        &mut self,
        draft: &RequestDraft,
    ) -> Result<StatusChangeRequest, RepositoryError> {
        let created_at = timestamp(&draft.created_at);
        self.conn
            .execute(
                "INSERT INTO status_change_requests (
                    subject_id, request_type, justification, notes, target_state_ref,
                    status, created_by, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?7)",
                params![
                    draft.subject_id.0,
                    draft.request_type.label(),
                    draft.justification.label(),
                    draft.notes,
                    draft.target_state_ref.as_ref().map(|id| id.0.as_str()),
                    draft.created_by,
                    created_at,
                ],
            )
            .map_err(sql_error)?;

        let id = RequestId(self.conn.last_insert_rowid());
        self.fetch_request(id)?.ok_or(RepositoryError::NotFound)
    }

    fn insert_step(
        &mut self,
        request_id: RequestId,
        position: u32,
        role: ApproverRole,
    ) -> Result<ApprovalStep, RepositoryError> {
        self.conn
            .execute(
                "INSERT INTO approval_steps (request_id, position, approver_role, status)
                 VALUES (?1, ?2, ?3, 'pending')",
                params![request_id.0, position, role.label()],
            )
            .map_err(sql_error)?;

        let id = StepId(self.conn.last_insert_rowid());
        self.fetch_step(id)?.ok_or(RepositoryError::NotFound)
    }

    fn transition_step(
        &mut self,
        id: StepId,
        resolution: &StepResolution,
    ) -> Result<bool, RepositoryError> {
        let changed = self
            .conn
            .execute(
                "UPDATE approval_steps
                 SET status = ?1, responded_by = ?2, message = ?3, responded_at = ?4
                 WHERE id = ?5 AND status = 'pending'",
                params![
                    resolution.status.label(),
                    resolution.responded_by,
                    resolution.message,
                    timestamp(&resolution.responded_at),
                    id.0,
                ],
            )
            .map_err(sql_error)?;

        if changed == 1 {
            return Ok(true);
        }
        match self.fetch_step(id)? {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    fn transition_request(
        &mut self,
        id: RequestId,
        status: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let changed = self
            .conn
            .execute(
                "UPDATE status_change_requests SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![status.label(), timestamp(&at), id.0],
            )
            .map_err(sql_error)?;

        if changed == 1 {
            return Ok(true);
        }
        match self.fetch_request(id)? {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    fn append_audit(&mut self, draft: &AuditDraft) -> Result<AuditEntry, RepositoryError> {
        let before = draft
            .before
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(json_error)?;
        let after = serde_json::to_string(&draft.after).map_err(json_error)?;

        self.conn
            .execute(
                "INSERT INTO audit_log (
                    request_id, entity_type, entity_id, operation, before_json,
                    after_json, actor, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    draft.request_id.0,
                    draft.entity.label(),
                    draft.entity_id,
                    draft.operation.label(),
                    before,
                    after,
                    draft.actor,
                    timestamp(&draft.recorded_at),
                ],
            )
            .map_err(sql_error)?;

        Ok(AuditEntry::from_draft(self.conn.last_insert_rowid(), draft))
    }
}

struct RequestRow {
    id: i64,
    subject_id: String,
    request_type: String,
    justification: String,
    notes: Option<String>,
    target_state_ref: Option<String>,
    status: String,
    created_by: String,
    created_at: String,
    updated_at: String,
}

impl RequestRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject_id: row.get(1)?,
            request_type: row.get(2)?,
            justification: row.get(3)?,
            notes: row.get(4)?,
            target_state_ref: row.get(5)?,
            status: row.get(6)?,
            created_by: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_request(self) -> Result<StatusChangeRequest, RepositoryError> {
        Ok(StatusChangeRequest {
            id: RequestId(self.id),
            subject_id: SubjectId(self.subject_id),
            request_type: decode(
                RequestType::parse(&self.request_type),
                "request_type",
                &self.request_type,
            )?,
            justification: decode(
                Justification::parse(&self.justification),
                "justification",
                &self.justification,
            )?,
            notes: self.notes,
            target_state_ref: self.target_state_ref.map(SubStateId),
            status: decode(RequestStatus::parse(&self.status), "status", &self.status)?,
            created_by: self.created_by,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct StepRow {
    id: i64,
    request_id: i64,
    position: u32,
    approver_role: String,
    status: String,
    responded_by: Option<String>,
    message: Option<String>,
    responded_at: Option<String>,
}

impl StepRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            request_id: row.get(1)?,
            position: row.get(2)?,
            approver_role: row.get(3)?,
            status: row.get(4)?,
            responded_by: row.get(5)?,
            message: row.get(6)?,
            responded_at: row.get(7)?,
        })
    }

    fn into_step(self) -> Result<ApprovalStep, RepositoryError> {
        Ok(ApprovalStep {
            id: StepId(self.id),
            request_id: RequestId(self.request_id),
            position: self.position,
            approver_role: decode(
                ApproverRole::parse(&self.approver_role),
                "approver_role",
                &self.approver_role,
            )?,
            status: decode(StepStatus::parse(&self.status), "status", &self.status)?,
            responded_by: self.responded_by,
            message: self.message,
            responded_at: self
                .responded_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

struct AuditRow {
    id: i64,
    request_id: i64,
    entity_type: String,
    entity_id: String,
    operation: String,
    before_json: Option<String>,
    after_json: String,
    actor: String,
    recorded_at: String,
}

impl AuditRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            request_id: row.get(1)?,
            entity_type: row.get(2)?,
            entity_id: row.get(3)?,
            operation: row.get(4)?,
            before_json: row.get(5)?,
            after_json: row.get(6)?,
            actor: row.get(7)?,
            recorded_at: row.get(8)?,
        })
    }

    fn into_entry(self) -> Result<AuditEntry, RepositoryError> {
        Ok(AuditEntry {
            sequence: self.id,
            request_id: RequestId(self.request_id),
            entity: decode(
                AuditEntity::parse(&self.entity_type),
                "entity_type",
                &self.entity_type,
            )?,
            entity_id: self.entity_id,
            operation: decode(
                AuditOperation::parse(&self.operation),
                "operation",
                &self.operation,
            )?,
            before: self
                .before_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(json_error)?,
            after: serde_json::from_str(&self.after_json).map_err(json_error)?,
            actor: self.actor,
            recorded_at: parse_timestamp(&self.recorded_at)?,
        })
    }
}

fn decode<T>(value: Option<T>, column: &str, raw: &str) -> Result<T, RepositoryError> {
    value.ok_or_else(|| {
        RepositoryError::Unavailable(format!("unrecognised {column} value `{raw}` in database"))
    })
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| RepositoryError::Unavailable(format!("invalid timestamp `{raw}`: {err}")))
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn sql_error(err: rusqlite::Error) -> RepositoryError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            RepositoryError::Conflict
        }
        _ => RepositoryError::Unavailable(format!("sqlite statement failed: {err}")),
    }
}

fn json_error(err: serde_json::Error) -> RepositoryError {
    RepositoryError::Unavailable(format!("audit payload encoding failed: {err}"))
}
