use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Surrogate key assigned by the store when a request is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub i64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{:06}", self.0)
    }
}

/// Surrogate key assigned by the store when a step is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub i64);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step-{:06}", self.0)
    }
}

/// Identifier of the subject (student number) whose standing changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub String);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a sub-state record scoped under a subject, e.g. one semester enrolment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubStateId(pub String);

impl fmt::Display for SubStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Withdrawal,
    Deferment,
    Reinstatement,
}

impl RequestType {
    pub const fn ordered() -> [Self; 3] {
        [Self::Withdrawal, Self::Deferment, Self::Reinstatement]
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Withdrawal => "withdrawal",
            Self::Deferment => "deferment",
            Self::Reinstatement => "reinstatement",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ordered()
            .into_iter()
            .find(|kind| kind.label() == value.trim())
    }
}

/// Reason code captured with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Justification {
    Financial,
    Medical,
    Personal,
    Academic,
    Employment,
    Relocation,
    Other,
}

impl Justification {
    pub const fn ordered() -> [Self; 7] {
        [
            Self::Financial,
            Self::Medical,
            Self::Personal,
            Self::Academic,
            Self::Employment,
            Self::Relocation,
            Self::Other,
        ]
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Financial => "financial",
            Self::Medical => "medical",
            Self::Personal => "personal",
            Self::Academic => "academic",
            Self::Employment => "employment",
            Self::Relocation => "relocation",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ordered()
            .into_iter()
            .find(|reason| reason.label() == value.trim())
    }
}

/// Request lifecycle. Every status other than `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl RequestStatus {
    pub const fn ordered() -> [Self; 4] {
        [Self::Pending, Self::Approved, Self::Rejected, Self::Cancelled]
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ordered()
            .into_iter()
            .find(|status| status.label() == value.trim())
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Step lifecycle. `Approved` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
}

impl StepStatus {
    pub const fn ordered() -> [Self; 3] {
        [Self::Pending, Self::Approved, Self::Rejected]
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ordered()
            .into_iter()
            .find(|status| status.label() == value.trim())
    }
}

/// Authorization capability required to resolve one approval step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverRole {
    AcademicAdvisor,
    ProgramLeader,
    Finance,
    Library,
    Registrar,
    StudentAffairs,
}

impl ApproverRole {
    pub const fn ordered() -> [Self; 6] {
        [
            Self::AcademicAdvisor,
            Self::ProgramLeader,
            Self::Finance,
            Self::Library,
            Self::Registrar,
            Self::StudentAffairs,
        ]
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::AcademicAdvisor => "academic_advisor",
            Self::ProgramLeader => "program_leader",
            Self::Finance => "finance",
            Self::Library => "library",
            Self::Registrar => "registrar",
            Self::StudentAffairs => "student_affairs",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ordered()
            .into_iter()
            .find(|role| role.label() == value.trim())
    }
}

impl fmt::Display for ApproverRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An approver's answer to one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub const fn step_status(self) -> StepStatus {
        match self {
            Self::Approved => StepStatus::Approved,
            Self::Rejected => StepStatus::Rejected,
        }
    }
}

/// Subject-level standing as reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectState {
    Active,
    Withdrawn,
    Terminated,
    Graduated,
}

impl SubjectState {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Withdrawn => "withdrawn",
            Self::Terminated => "terminated",
            Self::Graduated => "graduated",
        }
    }
}

/// Status carried by a sub-state record (one semester).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStateStatus {
    Enrolled,
    Deferred,
    Withdrawn,
    Completed,
}

impl SubStateStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Enrolled => "enrolled",
            Self::Deferred => "deferred",
            Self::Withdrawn => "withdrawn",
            Self::Completed => "completed",
        }
    }

    /// Deferred and withdrawn semesters are suspended and can be reinstated.
    pub const fn is_suspended(self) -> bool {
        matches!(self, Self::Deferred | Self::Withdrawn)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubStateRecord {
    pub id: SubStateId,
    pub subject_id: SubjectId,
    pub status: SubStateStatus,
}

/// Caller input for a new request; identity comes from the `Caller`, not the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStatusChangeRequest {
    pub subject_id: SubjectId,
    pub request_type: RequestType,
    pub justification: Justification,
    #[serde(default)]
    pub target_state_ref: Option<SubStateId>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangeRequest {
    pub id: RequestId,
    pub subject_id: SubjectId,
    pub request_type: RequestType,
    pub justification: Justification,
    pub notes: Option<String>,
    pub target_state_ref: Option<SubStateId>,
    pub status: RequestStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub id: StepId,
    pub request_id: RequestId,
    /// Zero-based position in the route; only meaningful for sequential routes.
    pub position: u32,
    pub approver_role: ApproverRole,
    pub status: StepStatus,
    pub responded_by: Option<String>,
    pub message: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
}

/// A request together with its full, fixed set of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request: StatusChangeRequest,
    pub steps: Vec<ApprovalStep>,
}

impl RequestRecord {
    pub fn all_steps_approved(&self) -> bool {
        !self.steps.is_empty()
            && self
                .steps
                .iter()
                .all(|step| step.status == StepStatus::Approved)
    }

    pub fn step(&self, id: StepId) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn step_for(&self, role: ApproverRole) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| step.approver_role == role)
    }

    pub fn pending_roles(&self) -> Vec<ApproverRole> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .map(|step| step.approver_role)
            .collect()
    }
}

/// The acting principal, resolved by the API boundary and passed into every operation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    /// System roles such as `finance` or `admin`.
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Organisational positions such as `program_leader`.
    #[serde(default)]
    pub positions: BTreeSet<String>,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.positions.insert(position.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn has_position(&self, position: &str) -> bool {
        self.positions.contains(position)
    }
}

/// Listing criteria. `awaiting_roles` keeps only pending requests with a pending step for one
/// of the given roles.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestFilter {
    #[serde(default)]
    pub subject_id: Option<SubjectId>,
    #[serde(default)]
    pub request_type: Option<RequestType>,
    #[serde(default)]
    pub status: Option<RequestStatus>,
    #[serde(skip)]
    pub awaiting_roles: Option<BTreeSet<ApproverRole>>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RequestFilter {
    pub fn matches(&self, request: &StatusChangeRequest) -> bool {
        self.subject_id
            .as_ref()
            .map_or(true, |subject| &request.subject_id == subject)
            && self
                .request_type
                .map_or(true, |kind| request.request_type == kind)
            && self.status.map_or(true, |status| request.status == status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}
