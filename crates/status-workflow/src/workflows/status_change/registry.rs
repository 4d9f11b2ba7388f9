use super::domain::{SubStateId, SubStateRecord, SubStateStatus, SubjectId, SubjectState};

/// Gateway to the system of record holding subject and sub-state standing.
///
/// Mutations must be idempotent: writing the state a record already carries succeeds.
pub trait SubjectRegistry: Send + Sync {
    fn subject_state(&self, subject: &SubjectId) -> Result<SubjectState, RegistryError>;
    fn sub_state_record(&self, id: &SubStateId) -> Result<SubStateRecord, RegistryError>;
    fn set_subject_state(
        &self,
        subject: &SubjectId,
        state: SubjectState,
        reason: &str,
    ) -> Result<(), RegistryError>;
    fn set_sub_state_status(
        &self,
        id: &SubStateId,
        status: SubStateStatus,
        reason: &str,
    ) -> Result<(), RegistryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("subject {0} not found")]
    SubjectNotFound(SubjectId),
    #[error("sub-state record {0} not found")]
    SubStateNotFound(SubStateId),
    #[error("subject registry unavailable: {0}")]
    Unavailable(String),
}
