//! Status-change approval workflow: request intake, role-gated approval steps, completion
//! detection and the registry side effects that follow a full approval.
//!
//! Every mutation runs inside one `WorkflowStore` transaction together with its audit rows,
//! so a failed side effect leaves neither the approval nor its audit trail behind.

pub mod access;
pub mod audit;
pub mod definition;
pub mod dispatcher;
pub mod domain;
pub mod eligibility;
pub mod registry;
pub mod repository;
pub mod router;
pub mod service;
pub mod store;

#[cfg(test)]
mod tests;

pub use access::{AccessGuard, GuardConfigError, RolePredicate, ADMIN_ROLE};
pub use audit::{AuditEntity, AuditEntry, AuditOperation};
pub use definition::{ApprovalRoute, ApprovalRouting, DefinitionError, WorkflowDefinition};
pub use dispatcher::{
    effects_for, DispatchError, DispatchReceipt, Effect, RegistryDispatcher, SideEffectDispatcher,
};
pub use domain::{
    ApprovalStep, ApproverRole, Caller, Decision, Justification, NewStatusChangeRequest, Page,
    RequestFilter, RequestId, RequestRecord, RequestStatus, RequestType, StatusChangeRequest,
    StepId, StepStatus, SubStateId, SubStateRecord, SubStateStatus, SubjectId, SubjectState,
};
pub use eligibility::{reinstatement_eligible, EligibilityValidator, EligibilityViolation};
pub use registry::{RegistryError, SubjectRegistry};
pub use repository::{RepositoryError, WorkflowReader, WorkflowStore, WorkflowTransaction};
pub use router::{caller_from_headers, status_change_router, RespondBody};
pub use service::{StatusChangeError, StatusChangeService, DEFAULT_PAGE_LIMIT_MAX};
pub use store::{MemoryWorkflowStore, SqliteStoreError, SqliteWorkflowStore};
