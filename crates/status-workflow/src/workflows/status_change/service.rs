use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::access::{AccessGuard, GuardConfigError, ADMIN_ROLE};
use super::audit::{AuditEntry, AuditOperation, AuditRecorder};
use super::definition::{ApprovalRouting, WorkflowDefinition};
use super::dispatcher::{DispatchError, DispatchReceipt, RegistryDispatcher, SideEffectDispatcher};
use super::domain::{
    Caller, Decision, NewStatusChangeRequest, Page, RequestFilter, RequestId, RequestRecord,
    RequestStatus, StatusChangeRequest, StepId, StepStatus,
};
use super::eligibility::{EligibilityValidator, EligibilityViolation};
use super::registry::{RegistryError, SubjectRegistry};
use super::repository::{
    RepositoryError, RequestDraft, StepResolution, WorkflowStore, WorkflowTransaction,
};

pub const DEFAULT_PAGE_LIMIT_MAX: usize = 100;
const DEFAULT_PAGE_SIZE: usize = 25;

/// Approval engine: owns every write to requests and steps.
pub struct StatusChangeService<S, G> {
    store: Arc<S>,
    definition: Arc<WorkflowDefinition>,
    guard: AccessGuard,
    validator: EligibilityValidator<G>,
    dispatcher: Arc<dyn SideEffectDispatcher>,
    page_limit_max: usize,
}

/// Effects applied inside a unit of work that has not committed yet.
type Dispatched = Option<(StatusChangeRequest, DispatchReceipt)>;

/// Result of re-evaluating a pending request after a step approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Approved,
    Open,
    Unchanged,
}

impl<S, G> StatusChangeService<S, G>
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
{
    /// Engine over the built-in definition table and access guard.
    pub fn new(store: Arc<S>, registry: Arc<G>) -> Result<Self, GuardConfigError> {
        Self::with_definition(
            store,
            registry,
            WorkflowDefinition::standard(),
            AccessGuard::standard(),
        )
    }

    /// Fails when the guard has no predicate for a role the definition routes to.
    pub fn with_definition(
        store: Arc<S>,
        registry: Arc<G>,
        definition: WorkflowDefinition,
        guard: AccessGuard,
    ) -> Result<Self, GuardConfigError> {
        guard.ensure_covers(&definition)?;
        let dispatcher: Arc<dyn SideEffectDispatcher> =
            Arc::new(RegistryDispatcher::new(registry.clone()));

        Ok(Self {
            store,
            definition: Arc::new(definition),
            guard,
            validator: EligibilityValidator::new(registry),
            dispatcher,
            page_limit_max: DEFAULT_PAGE_LIMIT_MAX,
        })
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn SideEffectDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_page_limit_max(mut self, page_limit_max: usize) -> Self {
        self.page_limit_max = page_limit_max.max(1);
        self
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn guard(&self) -> &AccessGuard {
        &self.guard
    }

    /// Validate and persist a new request together with one pending step per routed role.
    pub fn create_request(
        &self,
        caller: &Caller,
        input: NewStatusChangeRequest,
    ) -> Result<RequestRecord, StatusChangeError> {
        self.validator.check(&input)?;

        let route = self.definition.route(input.request_type).ok_or_else(|| {
            StatusChangeError::Configuration(format!(
                "no approval route for `{}` requests",
                input.request_type.label()
            ))
        })?;

        let now = Utc::now();
        let draft = RequestDraft {
            subject_id: input.subject_id,
            request_type: input.request_type,
            justification: input.justification,
            notes: non_blank(input.notes),
            target_state_ref: input.target_state_ref,
            created_by: caller.user_id.clone(),
            created_at: now,
        };
        let duplicate = || {
            StatusChangeError::Conflict(format!(
                "subject {} already has a pending {} request",
                draft.subject_id,
                draft.request_type.label()
            ))
        };

        let record = self
            .store
            .transaction(|tx| {
                if tx
                    .find_pending(&draft.subject_id, draft.request_type)?
                    .is_some()
                {
                    return Err(duplicate());
                }
                let request = tx.insert_request(&draft).map_err(|err| match err {
                    RepositoryError::Conflict => duplicate(),
                    other => other.into(),
                })?;

                let audit = AuditRecorder::new(&caller.user_id, now);
                audit.request(tx, AuditOperation::Created, None, &request)?;

                let mut steps = Vec::with_capacity(route.roles.len());
                for (position, role) in (0u32..).zip(route.roles.iter()) {
                    let step = tx.insert_step(request.id, position, *role)?;
                    audit.step(tx, AuditOperation::Created, None, &step)?;
                    steps.push(step);
                }
                Ok(RequestRecord { request, steps })
            })
            .inspect_err(log_conflict)?;

        info!(
            request_id = %record.request.id,
            subject_id = %record.request.subject_id,
            request_type = record.request.request_type.label(),
            steps = record.steps.len(),
            "status change request created"
        );
        Ok(record)
    }

    /// Record one approver's decision. A rejection closes the request at once; an approval
    /// closes it only when every step is approved, dispatching side effects in the same unit
    /// of work.
    pub fn respond(
        &self,
        step_id: StepId,
        caller: &Caller,
        decision: Decision,
        message: Option<String>,
    ) -> Result<RequestRecord, StatusChangeError> {
        let now = Utc::now();
        let message = non_blank(message);
        let mut dispatched: Dispatched = None;

        let outcome = self.store.transaction(|tx| {
            let step = tx.fetch_step(step_id)?.ok_or_else(|| {
                StatusChangeError::NotFound(format!("approval step {step_id} not found"))
            })?;
            let request = tx.fetch_request(step.request_id)?.ok_or_else(|| {
                StatusChangeError::NotFound(format!("request {} not found", step.request_id))
            })?;

            if !self.guard.can_act(caller, step.approver_role)? {
                return Err(StatusChangeError::Unauthorized {
                    caller: caller.user_id.clone(),
                    action: format!("respond as {}", step.approver_role),
                });
            }
            if request.status.is_terminal() {
                return Err(StatusChangeError::Conflict(format!(
                    "request {} is already {}",
                    request.id,
                    request.status.label()
                )));
            }
            if step.status != StepStatus::Pending {
                return Err(StatusChangeError::Conflict(format!(
                    "approval step {} is already {}",
                    step.id,
                    step.status.label()
                )));
            }
            if decision == Decision::Rejected && message.is_none() {
                return Err(StatusChangeError::Validation(
                    "a rejection must include a message".to_string(),
                ));
            }
            self.ensure_turn(tx, &request, step.position, step.id)?;

            let resolution = StepResolution {
                status: decision.step_status(),
                responded_by: caller.user_id.clone(),
                message: message.clone(),
                responded_at: now,
            };
            if !tx.transition_step(step.id, &resolution)? {
                return Err(StatusChangeError::Conflict(format!(
                    "approval step {} was resolved concurrently",
                    step.id
                )));
            }
            let resolved = tx.fetch_step(step.id)?.ok_or(RepositoryError::NotFound)?;

            let audit = AuditRecorder::new(&caller.user_id, now);
            let operation = match decision {
                Decision::Approved => AuditOperation::Approved,
                Decision::Rejected => AuditOperation::Rejected,
            };
            audit.step(tx, operation, Some(&step), &resolved)?;

            let settlement = match decision {
                Decision::Rejected => {
                    close(tx, &audit, &request, RequestStatus::Rejected, now)?;
                    None
                }
                Decision::Approved => {
                    Some(self.settle(tx, &audit, request.id, now, &mut dispatched)?)
                }
            };

            let record = tx
                .fetch_record(request.id)?
                .ok_or(RepositoryError::NotFound)?;
            Ok((record, settlement))
        });
        let (record, settlement) = self
            .revert_if_failed(outcome, dispatched)
            .inspect_err(log_conflict)?;

        debug!(
            step_id = %step_id,
            request_id = %record.request.id,
            responder = %caller.user_id,
            decision = ?decision,
            "approval step resolved"
        );
        match settlement {
            None => info!(request_id = %record.request.id, "status change request rejected"),
            Some(Settlement::Approved) => {
                info!(request_id = %record.request.id, "status change request approved")
            }
            Some(Settlement::Open | Settlement::Unchanged) => {}
        }
        Ok(record)
    }

    /// Withdraw a pending request. Allowed for its creator and for admins; no side effects run.
    pub fn cancel(
        &self,
        request_id: RequestId,
        caller: &Caller,
    ) -> Result<RequestRecord, StatusChangeError> {
        let now = Utc::now();
        let record = self
            .store
            .transaction(|tx| {
                let request = tx
                    .fetch_request(request_id)?
                    .ok_or_else(|| request_not_found(request_id))?;
                if !self.guard.can_cancel(caller, &request) {
                    return Err(StatusChangeError::Unauthorized {
                        caller: caller.user_id.clone(),
                        action: format!("cancel {request_id}"),
                    });
                }
                if request.status.is_terminal() {
                    return Err(StatusChangeError::Conflict(format!(
                        "request {} is already {}",
                        request.id,
                        request.status.label()
                    )));
                }

                let audit = AuditRecorder::new(&caller.user_id, now);
                close(tx, &audit, &request, RequestStatus::Cancelled, now)?;
                Ok(tx
                    .fetch_record(request_id)?
                    .ok_or(RepositoryError::NotFound)?)
            })
            .inspect_err(log_conflict)?;

        info!(request_id = %request_id, actor = %caller.user_id, "status change request cancelled");
        Ok(record)
    }

    /// Re-run the all-approved check for a request. No-op unless it is pending with every
    /// step approved.
    pub fn reconcile(
        &self,
        request_id: RequestId,
        caller: &Caller,
    ) -> Result<RequestRecord, StatusChangeError> {
        let now = Utc::now();
        let mut dispatched: Dispatched = None;
        let outcome = self.store.transaction(|tx| {
            let record = tx
                .fetch_record(request_id)?
                .ok_or_else(|| request_not_found(request_id))?;
            if !self.may_reconcile(caller, &record)? {
                return Err(StatusChangeError::Unauthorized {
                    caller: caller.user_id.clone(),
                    action: format!("reconcile {request_id}"),
                });
            }

            let audit = AuditRecorder::new(&caller.user_id, now);
            let settlement = self.settle(tx, &audit, request_id, now, &mut dispatched)?;
            let record = tx
                .fetch_record(request_id)?
                .ok_or(RepositoryError::NotFound)?;
            Ok((record, settlement))
        });
        let (record, settlement) = self
            .revert_if_failed(outcome, dispatched)
            .inspect_err(log_conflict)?;

        if settlement == Settlement::Approved {
            info!(request_id = %request_id, "status change request approved on reconcile");
        }
        Ok(record)
    }

    pub fn get(&self, request_id: RequestId) -> Result<RequestRecord, StatusChangeError> {
        self.store.snapshot(|reader| {
            reader
                .fetch_record(request_id)?
                .ok_or_else(|| request_not_found(request_id))
        })
    }

    /// Newest first. The page size defaults to 25 and is capped at the configured maximum.
    pub fn list(
        &self,
        filter: &RequestFilter,
    ) -> Result<Page<StatusChangeRequest>, StatusChangeError> {
        let limit = self.resolve_limit(filter.limit);
        self.store
            .snapshot(|reader| Ok(reader.list_requests(filter, limit)?))
    }

    /// Pending requests with an open step for any approver role the caller satisfies.
    pub fn list_pending_for_caller(
        &self,
        caller: &Caller,
        filter: &RequestFilter,
    ) -> Result<Page<StatusChangeRequest>, StatusChangeError> {
        let roles: BTreeSet<_> = self.guard.roles_for(caller).into_iter().collect();
        let filter = RequestFilter {
            status: Some(RequestStatus::Pending),
            awaiting_roles: Some(roles),
            ..filter.clone()
        };
        self.list(&filter)
    }

    pub fn audit_trail(&self, request_id: RequestId) -> Result<Vec<AuditEntry>, StatusChangeError> {
        self.store.snapshot(|reader| {
            if reader.fetch_request(request_id)?.is_none() {
                return Err(request_not_found(request_id));
            }
            Ok(reader.audit_for_request(request_id)?)
        })
    }

    /// A unit of work that failed after dispatch rolled back its approval, so the registry
    /// must not keep the effects.
    fn revert_if_failed<T>(
        &self,
        outcome: Result<T, StatusChangeError>,
        dispatched: Dispatched,
    ) -> Result<T, StatusChangeError> {
        if outcome.is_err() {
            if let Some((request, receipt)) = dispatched {
                self.dispatcher.revert(&request, receipt);
            }
        }
        outcome
    }

    fn resolve_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, self.page_limit_max)
    }

    /// Sequential routes only open a step once every earlier step is approved.
    fn ensure_turn(
        &self,
        tx: &dyn WorkflowTransaction,
        request: &StatusChangeRequest,
        position: u32,
        step_id: StepId,
    ) -> Result<(), StatusChangeError> {
        let sequential = self
            .definition
            .route(request.request_type)
            .is_some_and(|route| route.routing == ApprovalRouting::Sequential);
        if !sequential {
            return Ok(());
        }

        let blocked = tx
            .steps_for(request.id)?
            .into_iter()
            .filter(|step| step.position < position)
            .find(|step| step.status != StepStatus::Approved);
        match blocked {
            Some(earlier) => Err(StatusChangeError::Conflict(format!(
                "approval step {step_id} is waiting on {} ({})",
                earlier.approver_role,
                earlier.id
            ))),
            None => Ok(()),
        }
    }

    /// Recompute completion from persisted steps. Safe to repeat: only a pending request
    /// with every step approved is transitioned, and only once.
    fn settle(
        &self,
        tx: &mut dyn WorkflowTransaction,
        audit: &AuditRecorder<'_>,
        request_id: RequestId,
        now: DateTime<Utc>,
        dispatched: &mut Dispatched,
    ) -> Result<Settlement, StatusChangeError> {
        let record = tx
            .fetch_record(request_id)?
            .ok_or_else(|| request_not_found(request_id))?;
        if record.request.status.is_terminal() {
            return Ok(Settlement::Unchanged);
        }
        if !record.all_steps_approved() {
            return Ok(Settlement::Open);
        }
        if !tx.transition_request(request_id, RequestStatus::Approved, now)? {
            return Ok(Settlement::Unchanged);
        }

        let approved = tx
            .fetch_request(request_id)?
            .ok_or(RepositoryError::NotFound)?;
        audit.request(tx, AuditOperation::Approved, Some(&record.request), &approved)?;
        let receipt = self.dispatcher.apply(&approved)?;
        *dispatched = Some((approved, receipt));
        Ok(Settlement::Approved)
    }

    fn may_reconcile(
        &self,
        caller: &Caller,
        record: &RequestRecord,
    ) -> Result<bool, GuardConfigError> {
        if caller.has_role(ADMIN_ROLE) {
            return Ok(true);
        }
        for step in &record.steps {
            if self.guard.can_act(caller, step.approver_role)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn close(
    tx: &mut dyn WorkflowTransaction,
    audit: &AuditRecorder<'_>,
    request: &StatusChangeRequest,
    status: RequestStatus,
    now: DateTime<Utc>,
) -> Result<(), StatusChangeError> {
    if !tx.transition_request(request.id, status, now)? {
        return Err(StatusChangeError::Conflict(format!(
            "request {} was resolved concurrently",
            request.id
        )));
    }
    let closed = tx
        .fetch_request(request.id)?
        .ok_or(RepositoryError::NotFound)?;
    let operation = match status {
        RequestStatus::Cancelled => AuditOperation::Cancelled,
        _ => AuditOperation::Rejected,
    };
    audit.request(tx, operation, Some(request), &closed)?;
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn request_not_found(id: RequestId) -> StatusChangeError {
    StatusChangeError::NotFound(format!("request {id} not found"))
}

fn log_conflict(err: &StatusChangeError) {
    if let StatusChangeError::Conflict(message) = err {
        warn!(reason = %message, "status change rejected by state guard");
    }
}

/// Engine error surfaced to callers; each variant maps to one client-facing outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusChangeError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("caller {caller} is not permitted to {action}")]
    Unauthorized { caller: String, action: String },
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    DependencyFailure(String),
    #[error("{0}")]
    Storage(String),
    #[error("{0}")]
    Configuration(String),
}

impl StatusChangeError {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Validation(_) => "validation",
            Self::InvalidState(_) => "invalid_state",
            Self::DependencyFailure(_) => "dependency_failure",
            Self::Storage(_) => "storage",
            Self::Configuration(_) => "configuration",
        }
    }

    /// Failures of a collaborator rather than of the request itself.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DependencyFailure(_) | Self::Storage(_))
    }
}

impl From<RepositoryError> for StatusChangeError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Conflict => {
                Self::Conflict("record was changed by a concurrent update".to_string())
            }
            RepositoryError::NotFound => Self::NotFound(value.to_string()),
            RepositoryError::Unavailable(reason) => Self::Storage(reason),
        }
    }
}

impl From<EligibilityViolation> for StatusChangeError {
    fn from(value: EligibilityViolation) -> Self {
        let message = value.to_string();
        match value {
            EligibilityViolation::BlankSubject
            | EligibilityViolation::NotesTooLong
            | EligibilityViolation::MissingTargetReference(_)
            | EligibilityViolation::ForeignSubState { .. } => Self::Validation(message),
            EligibilityViolation::SubjectNotFound(_) | EligibilityViolation::SubStateNotFound(_) => {
                Self::NotFound(message)
            }
            EligibilityViolation::SubjectNotActive { .. }
            | EligibilityViolation::SubStateNotEnrolled { .. }
            | EligibilityViolation::NotReinstatable { .. } => Self::InvalidState(message),
            EligibilityViolation::Registry(_) => Self::DependencyFailure(message),
        }
    }
}

impl From<DispatchError> for StatusChangeError {
    fn from(value: DispatchError) -> Self {
        Self::DependencyFailure(value.to_string())
    }
}

impl From<RegistryError> for StatusChangeError {
    fn from(value: RegistryError) -> Self {
        Self::DependencyFailure(value.to_string())
    }
}

impl From<GuardConfigError> for StatusChangeError {
    fn from(value: GuardConfigError) -> Self {
        Self::Configuration(value.to_string())
    }
}
