use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::response::Response;
use axum::Router;
use serde_json::Value;

use crate::workflows::status_change::dispatcher::{
    DispatchError, DispatchReceipt, SideEffectDispatcher,
};
use crate::workflows::status_change::domain::{
    ApproverRole, Caller, Justification, NewStatusChangeRequest, RequestType, StatusChangeRequest,
    SubStateId, SubStateRecord, SubStateStatus, SubjectId, SubjectState,
};
use crate::workflows::status_change::registry::{RegistryError, SubjectRegistry};
use crate::workflows::status_change::repository::{
    RepositoryError, WorkflowReader, WorkflowStore, WorkflowTransaction,
};
use crate::workflows::status_change::{
    status_change_router, MemoryWorkflowStore, StatusChangeService,
};

pub(super) const ACTIVE_SUBJECT: &str = "9010001";
pub(super) const ACTIVE_SEMESTER: &str = "9010001-S1";
pub(super) const WITHDRAWN_SUBJECT: &str = "9010002";
pub(super) const WITHDRAWN_SEMESTER: &str = "9010002-S1";
pub(super) const DEFERRED_SUBJECT: &str = "9010003";
pub(super) const DEFERRED_SEMESTER: &str = "9010003-S1";

#[derive(Default)]
struct RegistryState {
    subjects: HashMap<SubjectId, SubjectState>,
    records: HashMap<SubStateId, SubStateRecord>,
}

/// Subject registry double recording every mutation it accepts.
#[derive(Default)]
pub(super) struct MemoryRegistry {
    state: Mutex<RegistryState>,
    mutations: AtomicUsize,
    fail_sub_state_writes: AtomicBool,
    unavailable: AtomicBool,
}

impl MemoryRegistry {
    pub(super) fn with_subject(self, subject: &str, state: SubjectState) -> Self {
        self.state
            .lock()
            .expect("registry mutex poisoned")
            .subjects
            .insert(SubjectId(subject.to_string()), state);
        self
    }

    pub(super) fn with_record(self, id: &str, subject: &str, status: SubStateStatus) -> Self {
        self.state
            .lock()
            .expect("registry mutex poisoned")
            .records
            .insert(
                SubStateId(id.to_string()),
                SubStateRecord {
                    id: SubStateId(id.to_string()),
                    subject_id: SubjectId(subject.to_string()),
                    status,
                },
            );
        self
    }

    pub(super) fn subject(&self, subject: &str) -> SubjectState {
        self.state.lock().expect("registry mutex poisoned").subjects[&SubjectId(subject.to_string())]
    }

    pub(super) fn record_status(&self, id: &str) -> SubStateStatus {
        self.state.lock().expect("registry mutex poisoned").records[&SubStateId(id.to_string())]
            .status
    }

    pub(super) fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub(super) fn fail_sub_state_writes(&self) {
        self.fail_sub_state_writes.store(true, Ordering::SeqCst);
    }

    pub(super) fn set_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RegistryError::Unavailable("registry offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl SubjectRegistry for MemoryRegistry {
    fn subject_state(&self, subject: &SubjectId) -> Result<SubjectState, RegistryError> {
        self.check_available()?;
        self.state
            .lock()
            .expect("registry mutex poisoned")
            .subjects
            .get(subject)
            .copied()
            .ok_or_else(|| RegistryError::SubjectNotFound(subject.clone()))
    }

    fn sub_state_record(&self, id: &SubStateId) -> Result<SubStateRecord, RegistryError> {
        self.check_available()?;
        self.state
            .lock()
            .expect("registry mutex poisoned")
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::SubStateNotFound(id.clone()))
    }

    fn set_subject_state(
        &self,
        subject: &SubjectId,
        state: SubjectState,
        _reason: &str,
    ) -> Result<(), RegistryError> {
        self.check_available()?;
        let mut guard = self.state.lock().expect("registry mutex poisoned");
        let current = guard
            .subjects
            .get_mut(subject)
            .ok_or_else(|| RegistryError::SubjectNotFound(subject.clone()))?;
        *current = state;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_sub_state_status(
        &self,
        id: &SubStateId,
        status: SubStateStatus,
        _reason: &str,
    ) -> Result<(), RegistryError> {
        self.check_available()?;
        if self.fail_sub_state_writes.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("semester ledger locked".to_string()));
        }
        let mut guard = self.state.lock().expect("registry mutex poisoned");
        let record = guard
            .records
            .get_mut(id)
            .ok_or_else(|| RegistryError::SubStateNotFound(id.clone()))?;
        record.status = status;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Dispatcher double counting how often it is invoked.
#[derive(Default)]
pub(super) struct CountingDispatcher {
    calls: AtomicUsize,
    reverts: AtomicUsize,
    fail: bool,
}

impl CountingDispatcher {
    pub(super) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(super) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(super) fn reverts(&self) -> usize {
        self.reverts.load(Ordering::SeqCst)
    }
}

impl SideEffectDispatcher for CountingDispatcher {
    fn apply(&self, request: &StatusChangeRequest) -> Result<DispatchReceipt, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DispatchError::Mutation {
                effect: format!("{} effects", request.request_type.label()),
                source: RegistryError::Unavailable("registry offline".to_string()),
            });
        }
        Ok(DispatchReceipt::default())
    }

    fn revert(&self, _request: &StatusChangeRequest, _receipt: DispatchReceipt) {
        self.reverts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Memory store whose commits can be switched to fail after the unit of work succeeded.
#[derive(Default)]
pub(super) struct FlakyCommitStore {
    inner: MemoryWorkflowStore,
    fail_commits: AtomicBool,
}

impl FlakyCommitStore {
    pub(super) fn fail_commits(&self) {
        self.fail_commits.store(true, Ordering::SeqCst);
    }
}

impl WorkflowStore for FlakyCommitStore {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn WorkflowTransaction) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        self.inner.transaction(|tx| {
            let outcome = work(tx)?;
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(RepositoryError::Unavailable("commit failed".to_string()).into());
            }
            Ok(outcome)
        })
    }

    fn snapshot<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn WorkflowReader) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        self.inner.snapshot(work)
    }
}

pub(super) fn seeded_registry() -> MemoryRegistry {
    MemoryRegistry::default()
        .with_subject(ACTIVE_SUBJECT, SubjectState::Active)
        .with_record(ACTIVE_SEMESTER, ACTIVE_SUBJECT, SubStateStatus::Enrolled)
        .with_subject(WITHDRAWN_SUBJECT, SubjectState::Withdrawn)
        .with_record(WITHDRAWN_SEMESTER, WITHDRAWN_SUBJECT, SubStateStatus::Withdrawn)
        .with_subject(DEFERRED_SUBJECT, SubjectState::Active)
        .with_record(DEFERRED_SEMESTER, DEFERRED_SUBJECT, SubStateStatus::Deferred)
}

pub(super) type MemoryService = StatusChangeService<MemoryWorkflowStore, MemoryRegistry>;

pub(super) fn build_service() -> (Arc<MemoryService>, Arc<MemoryWorkflowStore>, Arc<MemoryRegistry>) {
    let store = Arc::new(MemoryWorkflowStore::new());
    let registry = Arc::new(seeded_registry());
    let service = StatusChangeService::new(store.clone(), registry.clone())
        .expect("standard guard covers the standard definition");
    (Arc::new(service), store, registry)
}

pub(super) fn build_service_with_dispatcher(
    dispatcher: Arc<CountingDispatcher>,
) -> (Arc<MemoryService>, Arc<MemoryRegistry>) {
    let registry = Arc::new(seeded_registry());
    let service = StatusChangeService::new(Arc::new(MemoryWorkflowStore::new()), registry.clone())
        .expect("standard guard covers the standard definition")
        .with_dispatcher(dispatcher);
    (Arc::new(service), registry)
}

pub(super) fn build_flaky_service() -> (
    Arc<StatusChangeService<FlakyCommitStore, MemoryRegistry>>,
    Arc<FlakyCommitStore>,
    Arc<MemoryRegistry>,
) {
    let store = Arc::new(FlakyCommitStore::default());
    let registry = Arc::new(seeded_registry());
    let service = StatusChangeService::new(store.clone(), registry.clone())
        .expect("standard guard covers the standard definition");
    (Arc::new(service), store, registry)
}

pub(super) fn student(id: &str) -> Caller {
    Caller::new(id).with_role("student")
}

pub(super) fn admin() -> Caller {
    Caller::new("admin-1").with_role("admin")
}

/// A caller holding exactly the attribute the standard guard maps to `role`.
pub(super) fn approver(role: ApproverRole) -> Caller {
    let caller = Caller::new(format!("{}-1", role.label()));
    match role {
        ApproverRole::Finance | ApproverRole::Library | ApproverRole::Registrar => {
            caller.with_role(role.label())
        }
        ApproverRole::AcademicAdvisor
        | ApproverRole::ProgramLeader
        | ApproverRole::StudentAffairs => caller.with_position(role.label()),
    }
}

pub(super) fn withdrawal(subject: &str, semester: &str) -> NewStatusChangeRequest {
    NewStatusChangeRequest {
        subject_id: SubjectId(subject.to_string()),
        request_type: RequestType::Withdrawal,
        justification: Justification::Financial,
        target_state_ref: Some(SubStateId(semester.to_string())),
        notes: Some("unable to cover tuition this term".to_string()),
    }
}

pub(super) fn deferment(subject: &str, semester: &str) -> NewStatusChangeRequest {
    NewStatusChangeRequest {
        request_type: RequestType::Deferment,
        justification: Justification::Medical,
        ..withdrawal(subject, semester)
    }
}

pub(super) fn reinstatement(subject: &str, semester: Option<&str>) -> NewStatusChangeRequest {
    NewStatusChangeRequest {
        subject_id: SubjectId(subject.to_string()),
        request_type: RequestType::Reinstatement,
        justification: Justification::Academic,
        target_state_ref: semester.map(|id| SubStateId(id.to_string())),
        notes: None,
    }
}

pub(super) fn router_with_service(service: Arc<MemoryService>) -> Router {
    status_change_router(service)
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    serde_json::from_slice(&bytes).expect("json body")
}
