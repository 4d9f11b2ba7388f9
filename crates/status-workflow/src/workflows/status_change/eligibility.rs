use std::sync::Arc;

use super::domain::{
    NewStatusChangeRequest, RequestType, SubStateId, SubStateRecord, SubStateStatus, SubjectId,
    SubjectState,
};
use super::registry::{RegistryError, SubjectRegistry};

const MAX_NOTES_LEN: usize = 2000;

/// Reasons a proposed request may not be created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EligibilityViolation {
    #[error("subject id must not be blank")]
    BlankSubject,
    #[error("notes exceed 2000 characters")]
    NotesTooLong,
    #[error("subject {0} not found")]
    SubjectNotFound(SubjectId),
    #[error("sub-state record {0} not found")]
    SubStateNotFound(SubStateId),
    #[error("{} requests must reference a sub-state record", .0.label())]
    MissingTargetReference(RequestType),
    #[error("sub-state record {record} belongs to subject {owner}, not {subject}")]
    ForeignSubState {
        record: SubStateId,
        owner: SubjectId,
        subject: SubjectId,
    },
    #[error("subject {subject} is {}; {} requires an active subject", .state.label(), .request_type.label())]
    SubjectNotActive {
        subject: SubjectId,
        state: SubjectState,
        request_type: RequestType,
    },
    #[error("sub-state record {record} is {}; {} requires an enrolled record", .status.label(), .request_type.label())]
    SubStateNotEnrolled {
        record: SubStateId,
        status: SubStateStatus,
        request_type: RequestType,
    },
    #[error("subject {subject} is {} with no suspended sub-state; nothing to reinstate", .state.label())]
    NotReinstatable {
        subject: SubjectId,
        state: SubjectState,
    },
    #[error(transparent)]
    Registry(RegistryError),
}

impl From<RegistryError> for EligibilityViolation {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::SubjectNotFound(id) => Self::SubjectNotFound(id),
            RegistryError::SubStateNotFound(id) => Self::SubStateNotFound(id),
            other => Self::Registry(other),
        }
    }
}

/// Reinstatement decision table: a terminal subject, or any subject whose referenced
/// sub-state is suspended.
pub fn reinstatement_eligible(subject: SubjectState, sub_state: Option<SubStateStatus>) -> bool {
    match (subject, sub_state) {
        (SubjectState::Withdrawn | SubjectState::Terminated, _) => true,
        (_, Some(status)) => status.is_suspended(),
        _ => false,
    }
}

/// Checks structural prerequisites of a proposed request against the subject registry.
pub struct EligibilityValidator<G> {
    registry: Arc<G>,
}

impl<G> EligibilityValidator<G>
where
    G: SubjectRegistry,
{
    pub fn new(registry: Arc<G>) -> Self {
        Self { registry }
    }

    pub fn check(&self, input: &NewStatusChangeRequest) -> Result<(), EligibilityViolation> {
        if input.subject_id.0.trim().is_empty() {
            return Err(EligibilityViolation::BlankSubject);
        }
        if input
            .notes
            .as_ref()
            .is_some_and(|notes| notes.chars().count() > MAX_NOTES_LEN)
        {
            return Err(EligibilityViolation::NotesTooLong);
        }

        let subject_state = self.registry.subject_state(&input.subject_id)?;
        let target = match &input.target_state_ref {
            Some(id) => Some(self.owned_record(&input.subject_id, id)?),
            None => None,
        };

        match input.request_type {
            RequestType::Withdrawal | RequestType::Deferment => {
                let record =
                    target.ok_or(EligibilityViolation::MissingTargetReference(input.request_type))?;
                if subject_state != SubjectState::Active {
                    return Err(EligibilityViolation::SubjectNotActive {
                        subject: input.subject_id.clone(),
                        state: subject_state,
                        request_type: input.request_type,
                    });
                }
                if record.status != SubStateStatus::Enrolled {
                    return Err(EligibilityViolation::SubStateNotEnrolled {
                        record: record.id,
                        status: record.status,
                        request_type: input.request_type,
                    });
                }
                Ok(())
            }
            RequestType::Reinstatement => {
                let sub_state = target.map(|record| record.status);
                if reinstatement_eligible(subject_state, sub_state) {
                    Ok(())
                } else {
                    Err(EligibilityViolation::NotReinstatable {
                        subject: input.subject_id.clone(),
                        state: subject_state,
                    })
                }
            }
        }
    }

    fn owned_record(
        &self,
        subject: &SubjectId,
        id: &SubStateId,
    ) -> Result<SubStateRecord, EligibilityViolation> {
        let record = self.registry.sub_state_record(id)?;
        if &record.subject_id != subject {
            return Err(EligibilityViolation::ForeignSubState {
                record: record.id,
                owner: record.subject_id,
                subject: subject.clone(),
            });
        }
        Ok(record)
    }
}
