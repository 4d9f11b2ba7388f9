use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::workflows::status_change::audit::{AuditDraft, AuditEntry};
use crate::workflows::status_change::domain::{
    ApprovalStep, ApproverRole, Page, RequestFilter, RequestId, RequestStatus, RequestType,
    StatusChangeRequest, StepId, StepStatus, SubjectId,
};
use crate::workflows::status_change::repository::{
    RepositoryError, RequestDraft, StepResolution, WorkflowReader, WorkflowStore,
    WorkflowTransaction,
};

/// Process-local store. Each transaction works on a copy of the state that replaces the
/// committed state only when the unit of work succeeds.
#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    requests: BTreeMap<RequestId, StatusChangeRequest>,
    steps: BTreeMap<StepId, ApprovalStep>,
    audit: Vec<AuditEntry>,
    last_request_id: i64,
    last_step_id: i64,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl WorkflowStore for MemoryWorkflowStore {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn WorkflowTransaction) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let mut committed = self.lock()?;
        let mut working = committed.clone();
        let outcome = work(&mut working)?;
        *committed = working;
        Ok(outcome)
    }

    fn snapshot<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn WorkflowReader) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let committed = self.lock()?;
        work(&*committed)
    }
}

impl WorkflowReader for MemoryState {
    fn fetch_request(&self, id: RequestId) -> Result<Option<StatusChangeRequest>, RepositoryError> {
        Ok(self.requests.get(&id).cloned())
    }

    fn fetch_step(&self, id: StepId) -> Result<Option<ApprovalStep>, RepositoryError> {
        Ok(self.steps.get(&id).cloned())
    }

    fn steps_for(&self, request_id: RequestId) -> Result<Vec<ApprovalStep>, RepositoryError> {
        let mut steps: Vec<ApprovalStep> = self
            .steps
            .values()
            .filter(|step| step.request_id == request_id)
            .cloned()
            .collect();
        steps.sort_by_key(|step| (step.position, step.id));
        Ok(steps)
    }

    fn find_pending(
        &self,
        subject: &SubjectId,
        request_type: RequestType,
    ) -> Result<Option<StatusChangeRequest>, RepositoryError> {
        Ok(self
            .requests
            .values()
            .find(|request| {
                &request.subject_id == subject
                    && request.request_type == request_type
                    && request.status == RequestStatus::Pending
            })
            .cloned())
    }

    fn list_requests(
        &self,
        filter: &RequestFilter,
        limit: usize,
    ) -> Result<Page<StatusChangeRequest>, RepositoryError> {
        let matching: Vec<&StatusChangeRequest> = self
            .requests
            .values()
            .rev()
            .filter(|request| filter.matches(request))
            .filter(|request| match &filter.awaiting_roles {
                Some(roles) => {
                    request.status == RequestStatus::Pending
                        && self.steps.values().any(|step| {
                            step.request_id == request.id
                                && step.status == StepStatus::Pending
                                && roles.contains(&step.approver_role)
                        })
                }
                None => true,
            })
            .collect();

        Ok(Page {
            total: matching.len(),
            items: matching
                .into_iter()
                .skip(filter.offset)
                .take(limit)
                .cloned()
                .collect(),
            offset: filter.offset,
            limit,
        })
    }

    fn audit_for_request(&self, request_id: RequestId) -> Result<Vec<AuditEntry>, RepositoryError> {
        Ok(self
            .audit
            .iter()
            .filter(|entry| entry.request_id == request_id)
            .cloned()
            .collect())
    }
}

impl WorkflowTransaction for MemoryState {
    fn insert_request(
        &mut self,
        draft: &RequestDraft,
    ) -> Result<StatusChangeRequest, RepositoryError> {
        if self
            .find_pending(&draft.subject_id, draft.request_type)?
            .is_some()
        {
            return Err(RepositoryError::Conflict);
        }

        self.last_request_id += 1;
        let request = StatusChangeRequest {
            id: RequestId(self.last_request_id),
            subject_id: draft.subject_id.clone(),
            request_type: draft.request_type,
            justification: draft.justification,
            notes: draft.notes.clone(),
            target_state_ref: draft.target_state_ref.clone(),
            status: RequestStatus::Pending,
            created_by: draft.created_by.clone(),
            created_at: draft.created_at,
            updated_at: draft.created_at,
        };
        self.requests.insert(request.id, request.clone());
        Ok(request)
    }

    fn insert_step(
        &mut self,
        request_id: RequestId,
        position: u32,
        role: ApproverRole,
    ) -> Result<ApprovalStep, RepositoryError> {
        if !self.requests.contains_key(&request_id) {
            return Err(RepositoryError::NotFound);
        }
        if self
            .steps
            .values()
            .any(|step| step.request_id == request_id && step.approver_role == role)
        {
            return Err(RepositoryError::Conflict);
        }

        self.last_step_id += 1;
        let step = ApprovalStep {
            id: StepId(self.last_step_id),
            request_id,
            position,
            approver_role: role,
            status: StepStatus::Pending,
            responded_by: None,
            message: None,
            responded_at: None,
        };
        self.steps.insert(step.id, step.clone());
        Ok(step)
    }

    fn transition_step(
        &mut self,
        id: StepId,
        resolution: &StepResolution,
    ) -> Result<bool, RepositoryError> {
        match self.steps.get_mut(&id) {
            Some(step) if step.status == StepStatus::Pending => {
                step.status = resolution.status;
                step.responded_by = Some(resolution.responded_by.clone());
                step.message = resolution.message.clone();
                step.responded_at = Some(resolution.responded_at);
                Ok(true)
            }
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
        match self.requests.get_mut(&id) {
            Some(request) if request.status == RequestStatus::Pending => {
                request.status = status;
                request.updated_at = at;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    fn append_audit(&mut self, draft: &AuditDraft) -> Result<AuditEntry, RepositoryError> {
        let sequence = self.audit.len() as i64 + 1;
        let entry = AuditEntry::from_draft(sequence, draft);
        self.audit.push(entry.clone());
        Ok(entry)
    }
}
