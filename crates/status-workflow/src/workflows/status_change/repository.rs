use chrono::{DateTime, Utc};
use serde::Serialize;

use super::audit::{AuditDraft, AuditEntry};
use super::domain::{
    ApprovalStep, ApproverRole, Justification, Page, RequestFilter, RequestId, RequestRecord,
    RequestStatus, RequestType, StatusChangeRequest, StepId, StepStatus, SubStateId, SubjectId,
};

/// Fields of a new request; the store assigns the id and starts it `pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestDraft {
    pub subject_id: SubjectId,
    pub request_type: RequestType,
    pub justification: Justification,
    pub notes: Option<String>,
    pub target_state_ref: Option<SubStateId>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Terminal outcome written onto a pending step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResolution {
    pub status: StepStatus,
    pub responded_by: String,
    pub message: Option<String>,
    pub responded_at: DateTime<Utc>,
}

/// Read access shared by transactions and lock-free snapshots.
pub trait WorkflowReader {
    fn fetch_request(&self, id: RequestId) -> Result<Option<StatusChangeRequest>, RepositoryError>;
    fn fetch_step(&self, id: StepId) -> Result<Option<ApprovalStep>, RepositoryError>;
    /// Steps of a request ordered by position.
    fn steps_for(&self, request_id: RequestId) -> Result<Vec<ApprovalStep>, RepositoryError>;
    fn find_pending(
        &self,
        subject: &SubjectId,
        request_type: RequestType,
    ) -> Result<Option<StatusChangeRequest>, RepositoryError>;
    /// Newest first. `limit` must already be resolved by the caller.
    fn list_requests(
        &self,
        filter: &RequestFilter,
        limit: usize,
    ) -> Result<Page<StatusChangeRequest>, RepositoryError>;
    /// Audit rows for a request and its steps, in append order.
    fn audit_for_request(&self, request_id: RequestId) -> Result<Vec<AuditEntry>, RepositoryError>;

    fn fetch_record(&self, id: RequestId) -> Result<Option<RequestRecord>, RepositoryError> {
        match self.fetch_request(id)? {
            Some(request) => {
                let steps = self.steps_for(id)?;
                Ok(Some(RequestRecord { request, steps }))
            }
            None => Ok(None),
        }
    }
}

/// Mutations available inside a unit of work.
///
/// The `transition_*` methods only move rows out of `pending` and report whether a row
/// matched, so a lost race shows up as `false` rather than an overwrite.
pub trait WorkflowTransaction: WorkflowReader {
    /// Fails with `Conflict` when a pending request already exists for the subject and type.
    fn insert_request(&mut self, draft: &RequestDraft)
        -> Result<StatusChangeRequest, RepositoryError>;
    fn insert_step(
        &mut self,
        request_id: RequestId,
        position: u32,
        role: ApproverRole,
    ) -> Result<ApprovalStep, RepositoryError>;
    fn transition_step(
        &mut self,
        id: StepId,
        resolution: &StepResolution,
    ) -> Result<bool, RepositoryError>;
    fn transition_request(
        &mut self,
        id: RequestId,
        status: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    fn append_audit(&mut self, draft: &AuditDraft) -> Result<AuditEntry, RepositoryError>;
}

/// Shared store for requests, steps and audit rows.
pub trait WorkflowStore: Send + Sync {
    /// Run `work` as one atomic unit: committed when it returns `Ok`, rolled back otherwise.
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn WorkflowTransaction) -> Result<T, E>,
        E: From<RepositoryError>;

    /// Run read-only `work` against committed state.
    fn snapshot<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn WorkflowReader) -> Result<T, E>,
        E: From<RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}
