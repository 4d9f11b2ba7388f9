use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use status_workflow::workflows::status_change::{
    ApproverRole, Caller, Decision, Justification, MemoryWorkflowStore, NewStatusChangeRequest,
    RegistryError, RequestRecord, RequestStatus, RequestType, SqliteWorkflowStore,
    StatusChangeError, StatusChangeService, StepStatus, SubStateId, SubStateRecord,
    SubStateStatus, SubjectId, SubjectRegistry, SubjectState, WorkflowStore,
};

#[derive(Default)]
struct Registry {
    subjects: Mutex<HashMap<SubjectId, SubjectState>>,
    semesters: Mutex<HashMap<SubStateId, SubStateRecord>>,
    writes: AtomicUsize,
}

impl Registry {
    fn seeded() -> Self {
        let registry = Self::default();
        registry.enrol("9010001", SubjectState::Active, "S1", SubStateStatus::Enrolled);
        registry.enrol("9010009", SubjectState::Active, "S1", SubStateStatus::Enrolled);
        registry
    }

    fn enrol(&self, subject: &str, state: SubjectState, semester: &str, status: SubStateStatus) {
        let subject_id = SubjectId(subject.to_string());
        let semester_id = SubStateId(format!("{subject}-{semester}"));
        self.subjects
            .lock()
            .expect("subjects mutex")
            .insert(subject_id.clone(), state);
        self.semesters.lock().expect("semesters mutex").insert(
            semester_id.clone(),
            SubStateRecord {
                id: semester_id,
                subject_id,
                status,
            },
        );
    }

    fn state_of(&self, subject: &str) -> SubjectState {
        self.subjects.lock().expect("subjects mutex")[&SubjectId(subject.to_string())]
    }
}

impl SubjectRegistry for Registry {
    fn subject_state(&self, subject: &SubjectId) -> Result<SubjectState, RegistryError> {
        self.subjects
            .lock()
            .expect("subjects mutex")
            .get(subject)
            .copied()
            .ok_or_else(|| RegistryError::SubjectNotFound(subject.clone()))
    }

    fn sub_state_record(&self, id: &SubStateId) -> Result<SubStateRecord, RegistryError> {
        self.semesters
            .lock()
            .expect("semesters mutex")
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
        self.subjects
            .lock()
            .expect("subjects mutex")
            .insert(subject.clone(), state);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_sub_state_status(
        &self,
        id: &SubStateId,
        status: SubStateStatus,
        _reason: &str,
    ) -> Result<(), RegistryError> {
        let mut semesters = self.semesters.lock().expect("semesters mutex");
        let record = semesters
            .get_mut(id)
            .ok_or_else(|| RegistryError::SubStateNotFound(id.clone()))?;
        record.status = status;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn withdrawal(subject: &str) -> NewStatusChangeRequest {
    NewStatusChangeRequest {
        subject_id: SubjectId(subject.to_string()),
        request_type: RequestType::Withdrawal,
        justification: Justification::Relocation,
        target_state_ref: Some(SubStateId(format!("{subject}-S1"))),
        notes: Some("family relocating overseas".to_string()),
    }
}

fn approver(role: ApproverRole) -> Caller {
    let caller = Caller::new(format!("staff-{}", role.label()));
    match role {
        ApproverRole::Finance | ApproverRole::Library | ApproverRole::Registrar => {
            caller.with_role(role.label())
        }
        _ => caller.with_position(role.label()),
    }
}

fn step(record: &RequestRecord, role: ApproverRole) -> status_workflow::workflows::status_change::StepId {
    record.step_for(role).expect("role routed").id
}

fn sqlite_service(
    dir: &tempfile::TempDir,
) -> (StatusChangeService<SqliteWorkflowStore, Registry>, Arc<Registry>) {
    let store = SqliteWorkflowStore::open(&dir.path().join("status.db")).expect("store opens");
    let registry = Arc::new(Registry::seeded());
    let service = StatusChangeService::new(Arc::new(store), registry.clone())
        .expect("standard configuration");
    (service, registry)
}

#[test]
fn withdrawal_request_opens_a_pending_step_per_role() {
    let registry = Arc::new(Registry::seeded());
    let service = StatusChangeService::new(Arc::new(MemoryWorkflowStore::new()), registry)
        .expect("standard configuration");

    let record = service
        .create_request(&Caller::new("9010001"), withdrawal("9010001"))
        .expect("withdrawal created");

    assert_eq!(record.request.status, RequestStatus::Pending);
    assert_eq!(record.steps.len(), 4);
    assert!(record
        .steps
        .iter()
        .all(|step| step.status == StepStatus::Pending));
}

#[test]
fn simultaneous_creates_against_sqlite_conflict_once() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (service, _) = sqlite_service(&dir);
    let barrier = Barrier::new(2);

    let outcomes: Vec<Result<RequestRecord, StatusChangeError>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    service.create_request(&Caller::new("9010001"), withdrawal("9010001"))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("creator thread"))
            .collect()
    });

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Err(StatusChangeError::Conflict(_))))
            .count(),
        1
    );
}

#[test]
fn late_rejection_keeps_prior_approvals() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (service, registry) = sqlite_service(&dir);
    let record = service
        .create_request(&Caller::new("9010001"), withdrawal("9010001"))
        .expect("withdrawal created");

    for role in [
        ApproverRole::ProgramLeader,
        ApproverRole::Finance,
        ApproverRole::Library,
    ] {
        let current = service
            .respond(step(&record, role), &approver(role), Decision::Approved, None)
            .expect("approval accepted");
        assert_eq!(current.request.status, RequestStatus::Pending);
    }

    let rejected = service
        .respond(
            step(&record, ApproverRole::Registrar),
            &approver(ApproverRole::Registrar),
            Decision::Rejected,
            Some("insufficient documentation".to_string()),
        )
        .expect("rejection accepted");

    assert_eq!(rejected.request.status, RequestStatus::Rejected);
    assert_eq!(
        rejected
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Approved)
            .count(),
        3
    );
    assert_eq!(registry.writes.load(Ordering::SeqCst), 0);
}

#[test]
fn concurrent_final_approvals_dispatch_exactly_once() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (service, registry) = sqlite_service(&dir);
    let record = service
        .create_request(&Caller::new("9010009"), withdrawal("9010009"))
        .expect("withdrawal created");

    for role in [ApproverRole::ProgramLeader, ApproverRole::Finance] {
        service
            .respond(step(&record, role), &approver(role), Decision::Approved, None)
            .expect("approval accepted");
    }

    let barrier = Barrier::new(2);
    thread::scope(|scope| {
        for role in [ApproverRole::Library, ApproverRole::Registrar] {
            let step_id = step(&record, role);
            let service = &service;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                service
                    .respond(step_id, &approver(role), Decision::Approved, None)
                    .expect("both final approvals succeed");
            });
        }
    });

    let approved = service.get(record.request.id).expect("request readable");
    assert_eq!(approved.request.status, RequestStatus::Approved);
    assert_eq!(registry.state_of("9010009"), SubjectState::Withdrawn);
    assert_eq!(registry.writes.load(Ordering::SeqCst), 2);

    let again = service
        .reconcile(record.request.id, &Caller::new("ops").with_role("admin"))
        .expect("reconcile is idempotent");
    assert_eq!(again, approved);
    assert_eq!(registry.writes.load(Ordering::SeqCst), 2);
}

#[test]
fn reinstatement_of_active_subject_is_invalid_state() {
    let registry = Arc::new(Registry::seeded());
    let service = StatusChangeService::new(Arc::new(MemoryWorkflowStore::new()), registry)
        .expect("standard configuration");

    let result = service.create_request(
        &Caller::new("9010001"),
        NewStatusChangeRequest {
            subject_id: SubjectId("9010001".to_string()),
            request_type: RequestType::Reinstatement,
            justification: Justification::Academic,
            target_state_ref: None,
            notes: None,
        },
    );
    assert!(matches!(result, Err(StatusChangeError::InvalidState(_))));
}

#[test]
fn finance_cannot_answer_for_program_leader() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (service, _) = sqlite_service(&dir);
    let record = service
        .create_request(&Caller::new("9010001"), withdrawal("9010001"))
        .expect("withdrawal created");

    let result = service.respond(
        step(&record, ApproverRole::ProgramLeader),
        &approver(ApproverRole::Finance),
        Decision::Approved,
        None,
    );
    assert!(matches!(result, Err(StatusChangeError::Unauthorized { .. })));

    let unchanged = service.get(record.request.id).expect("request readable");
    assert_eq!(unchanged.request.status, RequestStatus::Pending);
    assert!(unchanged
        .steps
        .iter()
        .all(|step| step.status == StepStatus::Pending));
    let trail = service.audit_trail(record.request.id).expect("trail readable");
    assert_eq!(trail.len(), 5);
}

#[test]
fn sqlite_state_survives_reopening() {
    let dir = tempfile::tempdir().expect("temp dir");
    let request_id = {
        let (service, _) = sqlite_service(&dir);
        service
            .create_request(&Caller::new("9010001"), withdrawal("9010001"))
            .expect("withdrawal created")
            .request
            .id
    };

    let store = SqliteWorkflowStore::open(&dir.path().join("status.db")).expect("store reopens");
    let record = store
        .snapshot(|reader| reader.fetch_record(request_id))
        .expect("snapshot reads")
        .expect("request persisted");
    assert_eq!(record.request.subject_id, SubjectId("9010001".to_string()));
    assert_eq!(record.steps.len(), 4);
}
