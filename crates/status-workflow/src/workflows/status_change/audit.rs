use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::domain::{ApprovalStep, RequestId, StatusChangeRequest};
use super::repository::{RepositoryError, WorkflowTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntity {
    Request,
    Step,
}

impl AuditEntity {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Step => "step",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [Self::Request, Self::Step]
            .into_iter()
            .find(|entity| entity.label() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Created,
    Approved,
    Rejected,
    Cancelled,
}

impl AuditOperation {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [Self::Created, Self::Approved, Self::Rejected, Self::Cancelled]
            .into_iter()
            .find(|operation| operation.label() == value)
    }
}

/// Audit row before the store assigns its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditDraft {
    pub request_id: RequestId,
    pub entity: AuditEntity,
    pub entity_id: String,
    pub operation: AuditOperation,
    pub before: Option<Value>,
    pub after: Value,
    pub actor: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only record of one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: i64,
    pub request_id: RequestId,
    pub entity: AuditEntity,
    pub entity_id: String,
    pub operation: AuditOperation,
    pub before: Option<Value>,
    pub after: Value,
    pub actor: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn from_draft(sequence: i64, draft: &AuditDraft) -> Self {
        Self {
            sequence,
            request_id: draft.request_id,
            entity: draft.entity,
            entity_id: draft.entity_id.clone(),
            operation: draft.operation,
            before: draft.before.clone(),
            after: draft.after.clone(),
            actor: draft.actor.clone(),
            recorded_at: draft.recorded_at,
        }
    }
}

/// Writes audit rows through the caller's open transaction so a mutation and its audit
/// commit together.
#[derive(Debug, Clone, Copy)]
pub struct AuditRecorder<'a> {
    actor: &'a str,
    at: DateTime<Utc>,
}

impl<'a> AuditRecorder<'a> {
    pub fn new(actor: &'a str, at: DateTime<Utc>) -> Self {
        Self { actor, at }
    }

    pub fn request(
        &self,
        tx: &mut dyn WorkflowTransaction,
        operation: AuditOperation,
        before: Option<&StatusChangeRequest>,
        after: &StatusChangeRequest,
    ) -> Result<AuditEntry, RepositoryError> {
        let draft = AuditDraft {
            request_id: after.id,
            entity: AuditEntity::Request,
            entity_id: after.id.to_string(),
            operation,
            before: before.map(snapshot).transpose()?,
            after: snapshot(after)?,
            actor: self.actor.to_string(),
            recorded_at: self.at,
        };
        tx.append_audit(&draft)
    }

    pub fn step(
        &self,
        tx: &mut dyn WorkflowTransaction,
        operation: AuditOperation,
        before: Option<&ApprovalStep>,
        after: &ApprovalStep,
    ) -> Result<AuditEntry, RepositoryError> {
        let draft = AuditDraft {
            request_id: after.request_id,
            entity: AuditEntity::Step,
            entity_id: after.id.to_string(),
            operation,
            before: before.map(snapshot).transpose()?,
            after: snapshot(after)?,
            actor: self.actor.to_string(),
            recorded_at: self.at,
        };
        tx.append_audit(&draft)
    }
}

fn snapshot<T: Serialize>(value: &T) -> Result<Value, RepositoryError> {
    serde_json::to_value(value)
        .map_err(|err| RepositoryError::Unavailable(format!("audit snapshot failed: {err}")))
}
