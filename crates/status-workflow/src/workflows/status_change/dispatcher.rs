use std::sync::Arc;

use tracing::{error, info, warn};

use super::domain::{
    RequestId, RequestType, StatusChangeRequest, SubStateId, SubStateStatus, SubjectId,
    SubjectState,
};
use super::registry::{RegistryError, SubjectRegistry};

/// Applies the registry mutations that follow from a fully approved request.
///
/// Called from inside the approval unit of work; an `Err` aborts and rolls back the approval.
/// When the unit of work fails after a successful `apply`, the engine hands the receipt back
/// to `revert` so no effect outlives a rolled-back approval.
pub trait SideEffectDispatcher: Send + Sync {
    fn apply(&self, request: &StatusChangeRequest) -> Result<DispatchReceipt, DispatchError>;
    fn revert(&self, request: &StatusChangeRequest, receipt: DispatchReceipt);
}

/// Prior registry values captured while a plan was applied, in application order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReceipt {
    restores: Vec<Restore>,
}

impl DispatchReceipt {
    pub fn len(&self) -> usize {
        self.restores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.restores.is_empty()
    }
}

/// One registry mutation in a dispatch plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    SubjectState(SubjectState),
    SubStateStatus(SubStateStatus),
}

impl Effect {
    pub fn describe(&self) -> String {
        match self {
            Effect::SubjectState(state) => format!("subject_state={}", state.label()),
            Effect::SubStateStatus(status) => format!("sub_state_status={}", status.label()),
        }
    }

    fn needs_target(&self) -> bool {
        matches!(self, Effect::SubStateStatus(_))
    }
}

/// Mutations applied, in order, when a request of the given type is approved.
pub const fn effects_for(request_type: RequestType) -> &'static [Effect] {
    match request_type {
        RequestType::Withdrawal => &[
            Effect::SubjectState(SubjectState::Withdrawn),
            Effect::SubStateStatus(SubStateStatus::Withdrawn),
        ],
        RequestType::Deferment => &[Effect::SubStateStatus(SubStateStatus::Deferred)],
        RequestType::Reinstatement => &[],
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("{} request {request} has no sub-state reference to update", .request_type.label())]
    MissingTarget {
        request: RequestId,
        request_type: RequestType,
    },
    #[error("side effect `{effect}` failed: {source}")]
    Mutation {
        effect: String,
        #[source]
        source: RegistryError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Restore {
    Subject(SubjectId, SubjectState),
    SubState(SubStateId, SubStateStatus),
}

/// Dispatcher writing through the subject registry gateway.
///
/// If a mutation fails partway through a plan, earlier mutations are reverted to the state
/// read before they were applied.
pub struct RegistryDispatcher<G> {
    registry: Arc<G>,
}

impl<G> RegistryDispatcher<G>
where
    G: SubjectRegistry,
{
    pub fn new(registry: Arc<G>) -> Self {
        Self { registry }
    }

    fn apply_one(
        &self,
        request: &StatusChangeRequest,
        effect: Effect,
        reason: &str,
    ) -> Result<Restore, DispatchError> {
        let failed = |source| DispatchError::Mutation {
            effect: effect.describe(),
            source,
        };

        match effect {
            Effect::SubjectState(state) => {
                let prior = self
                    .registry
                    .subject_state(&request.subject_id)
                    .map_err(failed)?;
                self.registry
                    .set_subject_state(&request.subject_id, state, reason)
                    .map_err(failed)?;
                Ok(Restore::Subject(request.subject_id.clone(), prior))
            }
            Effect::SubStateStatus(status) => {
                let target = request
                    .target_state_ref
                    .as_ref()
                    .ok_or(DispatchError::MissingTarget {
                        request: request.id,
                        request_type: request.request_type,
                    })?;
                let prior = self
                    .registry
                    .sub_state_record(target)
                    .map_err(failed)?
                    .status;
                self.registry
                    .set_sub_state_status(target, status, reason)
                    .map_err(failed)?;
                Ok(Restore::SubState(target.clone(), prior))
            }
        }
    }

    fn compensate(&self, request: &StatusChangeRequest, applied: Vec<Restore>) {
        let reason = format!("reverting dispatch of {}", request.id);
        for restore in applied.into_iter().rev() {
            let result = match &restore {
                Restore::Subject(subject, state) => {
                    self.registry.set_subject_state(subject, *state, &reason)
                }
                Restore::SubState(id, status) => {
                    self.registry.set_sub_state_status(id, *status, &reason)
                }
            };
            if let Err(err) = result {
                error!(request_id = %request.id, error = %err, "compensating side effect failed");
            }
        }
    }
}

impl<G> SideEffectDispatcher for RegistryDispatcher<G>
where
    G: SubjectRegistry,
{
    fn apply(&self, request: &StatusChangeRequest) -> Result<DispatchReceipt, DispatchError> {
        let plan = effects_for(request.request_type);
        if request.target_state_ref.is_none() && plan.iter().any(Effect::needs_target) {
            return Err(DispatchError::MissingTarget {
                request: request.id,
                request_type: request.request_type,
            });
        }

        let reason = format!("{} {} approved", request.request_type.label(), request.id);
        let mut applied = Vec::with_capacity(plan.len());
        for effect in plan {
            match self.apply_one(request, *effect, &reason) {
                Ok(restore) => applied.push(restore),
                Err(err) => {
                    if !applied.is_empty() {
                        warn!(
                            request_id = %request.id,
                            applied = applied.len(),
                            error = %err,
                            "side effect failed; reverting applied mutations"
                        );
                        self.compensate(request, applied);
                    }
                    return Err(err);
                }
            }
        }

        info!(
            request_id = %request.id,
            request_type = request.request_type.label(),
            effects = plan.len(),
            "side effects dispatched"
        );
        Ok(DispatchReceipt { restores: applied })
    }

    fn revert(&self, request: &StatusChangeRequest, receipt: DispatchReceipt) {
        if receipt.is_empty() {
            return;
        }
        warn!(
            request_id = %request.id,
            applied = receipt.len(),
            "approval rolled back after dispatch; reverting side effects"
        );
        self.compensate(request, receipt.restores);
    }
}
