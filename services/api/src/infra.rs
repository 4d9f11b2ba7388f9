use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use status_workflow::config::WorkflowConfig;
use status_workflow::error::AppError;
use status_workflow::workflows::status_change::{
    RegistryError, SubStateId, SubStateRecord, SubStateStatus, SubjectId, SubjectRegistry,
    SubjectState, WorkflowDefinition,
};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// One accepted registry write, kept so demos and operators can see what dispatch changed.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct RegistryMutation {
    pub(crate) target: String,
    pub(crate) change: String,
    pub(crate) reason: String,
    pub(crate) at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryBook {
    subjects: HashMap<SubjectId, SubjectState>,
    semesters: HashMap<SubStateId, SubStateRecord>,
    journal: Vec<RegistryMutation>,
}

/// Student registry adapter backed by process memory.
#[derive(Default, Clone)]
pub(crate) struct InMemorySubjectRegistry {
    book: Arc<Mutex<RegistryBook>>,
}

impl InMemorySubjectRegistry {
    /// Registry preloaded with the subjects used by the demo and local runs.
    pub(crate) fn seeded() -> Self {
        let registry = Self::default();
        if let Ok(mut book) = registry.book.lock() {
            for (subject, state, semester) in [
                ("9010001", SubjectState::Active, SubStateStatus::Enrolled),
                ("9010002", SubjectState::Withdrawn, SubStateStatus::Withdrawn),
                ("9010003", SubjectState::Active, SubStateStatus::Deferred),
                ("9010004", SubjectState::Terminated, SubStateStatus::Completed),
                ("9010005", SubjectState::Active, SubStateStatus::Enrolled),
            ] {
                let subject_id = SubjectId(subject.to_string());
                let semester_id = SubStateId(format!("{subject}-S1"));
                book.subjects.insert(subject_id.clone(), state);
                book.semesters.insert(
                    semester_id.clone(),
                    SubStateRecord {
                        id: semester_id,
                        subject_id,
                        status: semester,
                    },
                );
            }
        }
        registry
    }

    pub(crate) fn journal(&self) -> Vec<RegistryMutation> {
        self.book
            .lock()
            .map(|book| book.journal.clone())
            .unwrap_or_default()
    }

    fn book(&self) -> Result<MutexGuard<'_, RegistryBook>, RegistryError> {
        self.book
            .lock()
            .map_err(|_| RegistryError::Unavailable("registry mutex poisoned".to_string()))
    }
}

impl SubjectRegistry for InMemorySubjectRegistry {
    fn subject_state(&self, subject: &SubjectId) -> Result<SubjectState, RegistryError> {
        self.book()?
            .subjects
            .get(subject)
            .copied()
            .ok_or_else(|| RegistryError::SubjectNotFound(subject.clone()))
    }

    fn sub_state_record(&self, id: &SubStateId) -> Result<SubStateRecord, RegistryError> {
        self.book()?
            .semesters
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::SubStateNotFound(id.clone()))
    }

    fn set_subject_state(
        &self,
        subject: &SubjectId,
        state: SubjectState,
        reason: &str,
    ) -> Result<(), RegistryError> {
        let mut book = self.book()?;
        let current = book
            .subjects
            .get_mut(subject)
            .ok_or_else(|| RegistryError::SubjectNotFound(subject.clone()))?;
        if *current == state {
            return Ok(());
        }
        *current = state;
        book.journal.push(RegistryMutation {
            target: subject.to_string(),
            change: format!("subject -> {}", state.label()),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    fn set_sub_state_status(
        &self,
        id: &SubStateId,
        status: SubStateStatus,
        reason: &str,
    ) -> Result<(), RegistryError> {
        let mut book = self.book()?;
        let record = book
            .semesters
            .get_mut(id)
            .ok_or_else(|| RegistryError::SubStateNotFound(id.clone()))?;
        if record.status == status {
            return Ok(());
        }
        record.status = status;
        book.journal.push(RegistryMutation {
            target: id.to_string(),
            change: format!("semester -> {}", status.label()),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }
}

/// Built-in table unless a definition file is configured.
pub(crate) fn load_definition(config: &WorkflowConfig) -> Result<WorkflowDefinition, AppError> {
    match &config.definition_path {
        Some(path) => {
            let definition = WorkflowDefinition::load(path)?;
            info!(path = %path.display(), "loaded workflow definition");
            Ok(definition)
        }
        None => Ok(WorkflowDefinition::standard()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_writes_are_idempotent() {
        let registry = InMemorySubjectRegistry::seeded();
        let subject = SubjectId("9010001".to_string());

        registry
            .set_subject_state(&subject, SubjectState::Withdrawn, "withdrawal approved")
            .expect("first write");
        registry
            .set_subject_state(&subject, SubjectState::Withdrawn, "withdrawal approved")
            .expect("repeat write");

        assert_eq!(
            registry.subject_state(&subject).expect("subject present"),
            SubjectState::Withdrawn
        );
        assert_eq!(registry.journal().len(), 1);
    }

    #[test]
    fn unknown_records_are_reported() {
        let registry = InMemorySubjectRegistry::seeded();
        assert_eq!(
            registry.sub_state_record(&SubStateId("missing".to_string())),
            Err(RegistryError::SubStateNotFound(SubStateId(
                "missing".to_string()
            )))
        );
    }

    #[test]
    fn missing_definition_files_fail_startup() {
        let config = WorkflowConfig {
            definition_path: Some(std::path::PathBuf::from("/nonexistent/workflow.json")),
            ..WorkflowConfig::default()
        };
        assert!(matches!(
            load_definition(&config),
            Err(AppError::Definition(_))
        ));
    }
}
