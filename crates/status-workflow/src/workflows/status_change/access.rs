use std::collections::BTreeMap;

use super::definition::WorkflowDefinition;
use super::domain::{ApproverRole, Caller, StatusChangeRequest};

/// System role allowed to cancel any pending request.
pub const ADMIN_ROLE: &str = "admin";

/// Closed set of checks over a caller's resolved attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolePredicate {
    SystemRole(&'static str),
    Position(&'static str),
    AnyOf(&'static [RolePredicate]),
}

impl RolePredicate {
    pub fn holds_for(&self, caller: &Caller) -> bool {
        match self {
            RolePredicate::SystemRole(role) => caller.has_role(role),
            RolePredicate::Position(position) => caller.has_position(position),
            RolePredicate::AnyOf(options) => options.iter().any(|option| option.holds_for(caller)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardConfigError {
    #[error("approver role `{0}` has no access predicate configured")]
    Unmapped(ApproverRole),
}

/// Decides whether a caller may act on a step for a given approver role.
#[derive(Debug, Clone)]
pub struct AccessGuard {
    predicates: BTreeMap<ApproverRole, RolePredicate>,
}

impl AccessGuard {
    pub fn new(predicates: BTreeMap<ApproverRole, RolePredicate>) -> Self {
        Self { predicates }
    }

    pub fn standard() -> Self {
        Self::new(standard_predicates())
    }

    /// Fails on the first role in the definition's vocabulary without a predicate.
    pub fn ensure_covers(&self, definition: &WorkflowDefinition) -> Result<(), GuardConfigError> {
        match definition
            .role_vocabulary()
            .into_iter()
            .find(|role| !self.predicates.contains_key(role))
        {
            Some(role) => Err(GuardConfigError::Unmapped(role)),
            None => Ok(()),
        }
    }

    pub fn can_act(&self, caller: &Caller, role: ApproverRole) -> Result<bool, GuardConfigError> {
        self.predicates
            .get(&role)
            .map(|predicate| predicate.holds_for(caller))
            .ok_or(GuardConfigError::Unmapped(role))
    }

    /// Approver roles the caller currently satisfies.
    pub fn roles_for(&self, caller: &Caller) -> Vec<ApproverRole> {
        self.predicates
            .iter()
            .filter(|(_, predicate)| predicate.holds_for(caller))
            .map(|(role, _)| *role)
            .collect()
    }

    pub fn can_cancel(&self, caller: &Caller, request: &StatusChangeRequest) -> bool {
        caller.user_id == request.created_by || caller.has_role(ADMIN_ROLE)
    }
}

impl Default for AccessGuard {
    fn default() -> Self {
        Self::standard()
    }
}

const REGISTRAR_OPTIONS: &[RolePredicate] = &[
    RolePredicate::SystemRole("registrar"),
    RolePredicate::Position("registrar"),
];

fn standard_predicates() -> BTreeMap<ApproverRole, RolePredicate> {
    ApproverRole::ordered()
        .into_iter()
        .map(|role| {
            let predicate = match role {
                ApproverRole::AcademicAdvisor => RolePredicate::Position("academic_advisor"),
                ApproverRole::ProgramLeader => RolePredicate::Position("program_leader"),
                ApproverRole::Finance => RolePredicate::SystemRole("finance"),
                ApproverRole::Library => RolePredicate::SystemRole("library"),
                ApproverRole::Registrar => RolePredicate::AnyOf(REGISTRAR_OPTIONS),
                ApproverRole::StudentAffairs => RolePredicate::Position("student_affairs"),
            };
            (role, predicate)
        })
        .collect()
}
