use crate::infra::{load_definition, InMemorySubjectRegistry};
use clap::Args;
use status_workflow::config::AppConfig;
use status_workflow::error::AppError;
use status_workflow::workflows::status_change::{
    ApproverRole, Caller, Decision, Justification, MemoryWorkflowStore, NewStatusChangeRequest,
    RequestRecord, RequestType, StatusChangeError, StatusChangeService, StepId, SubStateId,
    SubjectId, WorkflowDefinition,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

type DemoService = StatusChangeService<MemoryWorkflowStore, InMemorySubjectRegistry>;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Print the audit trail of the approved withdrawal.
    #[arg(long)]
    pub(crate) show_audit: bool,
}

#[derive(Args, Debug, Default)]
pub(crate) struct DefinitionArgs {
    /// Validate and print this definition file instead of the configured table.
    #[arg(long)]
    pub(crate) file: Option<PathBuf>,
}

pub(crate) fn run_definition_dump(args: DefinitionArgs) -> Result<(), AppError> {
    let definition = match args.file {
        Some(path) => WorkflowDefinition::load(&path)?,
        None => load_definition(&AppConfig::load()?.workflow)?,
    };
    let rendered = serde_json::to_string_pretty(&definition).map_err(std::io::Error::from)?;
    println!("{rendered}");
    Ok(())
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let registry = Arc::new(InMemorySubjectRegistry::seeded());
    let service = StatusChangeService::new(Arc::new(MemoryWorkflowStore::new()), registry.clone())?;

    println!("Status change workflow demo");

    println!("\nWithdrawal intake");
    let withdrawal = match service.create_request(
        &Caller::new("9010001"),
        NewStatusChangeRequest {
            subject_id: SubjectId("9010001".to_string()),
            request_type: RequestType::Withdrawal,
            justification: Justification::Relocation,
            target_state_ref: Some(SubStateId("9010001-S1".to_string())),
            notes: Some("family relocating overseas".to_string()),
        },
    ) {
        Ok(record) => record,
        Err(err) => {
            println!("  Withdrawal rejected at intake: {}", err);
            return Ok(());
        }
    };
    render_record(&withdrawal);

    let duplicate = service.create_request(
        &Caller::new("9010001"),
        NewStatusChangeRequest {
            subject_id: SubjectId("9010001".to_string()),
            request_type: RequestType::Withdrawal,
            justification: Justification::Financial,
            target_state_ref: Some(SubStateId("9010001-S1".to_string())),
            notes: Some("second attempt".to_string()),
        },
    );
    render_outcome("Duplicate withdrawal", &duplicate);

    println!("\nRole gating");
    let Some(leader_step) = step_id(&withdrawal, ApproverRole::ProgramLeader) else {
        return Ok(());
    };
    let wrong_role = service.respond(
        leader_step,
        &approver(ApproverRole::Finance),
        Decision::Approved,
        None,
    );
    render_outcome("Finance answering for program_leader", &wrong_role);

    println!("\nApprovals (library and registrar race for the final step)");
    for role in [ApproverRole::ProgramLeader, ApproverRole::Finance] {
        let Some(step) = step_id(&withdrawal, role) else {
            continue;
        };
        let outcome = service.respond(step, &approver(role), Decision::Approved, None);
        render_outcome(role.label(), &outcome);
    }
    let racing = [ApproverRole::Library, ApproverRole::Registrar]
        .into_iter()
        .filter_map(|role| step_id(&withdrawal, role).map(|step| (role, step)))
        .collect::<Vec<_>>();
    let raced = race_approvals(&service, &racing);
    for (role, outcome) in &raced {
        render_outcome(role.label(), outcome);
    }

    match service.reconcile(withdrawal.request.id, &Caller::new("ops").with_role("admin")) {
        Ok(record) => println!(
            "- Reconciled {} -> status {} (no further effects)",
            record.request.id,
            record.request.status.label()
        ),
        Err(err) => println!("- Reconcile failed: {}", err),
    }

    println!("Registry journal:");
    for mutation in registry.journal() {
        println!(
            "  - {} {} ({}) at {}",
            mutation.target,
            mutation.change,
            mutation.reason,
            mutation.at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    if args.show_audit {
        match service.audit_trail(withdrawal.request.id) {
            Ok(entries) => {
                println!("Audit trail ({} entries):", entries.len());
                for entry in entries {
                    println!(
                        "  #{} {} {} {} by {}",
                        entry.sequence,
                        entry.entity.label(),
                        entry.entity_id,
                        entry.operation.label(),
                        entry.actor
                    );
                }
            }
            Err(err) => println!("Audit trail unavailable: {}", err),
        }
    }

    println!("\nDeferment with a late rejection");
    match service.create_request(
        &Caller::new("9010005"),
        NewStatusChangeRequest {
            subject_id: SubjectId("9010005".to_string()),
            request_type: RequestType::Deferment,
            justification: Justification::Employment,
            target_state_ref: Some(SubStateId("9010005-S1".to_string())),
            notes: None,
        },
    ) {
        Ok(deferment) => {
            for role in [ApproverRole::AcademicAdvisor, ApproverRole::ProgramLeader] {
                if let Some(step) = step_id(&deferment, role) {
                    let outcome = service.respond(step, &approver(role), Decision::Approved, None);
                    render_outcome(role.label(), &outcome);
                }
            }
            if let Some(step) = step_id(&deferment, ApproverRole::Registrar) {
                let outcome = service.respond(
                    step,
                    &approver(ApproverRole::Registrar),
                    Decision::Rejected,
                    Some("insufficient documentation".to_string()),
                );
                render_outcome("registrar", &outcome);
            }
        }
        Err(err) => println!("  Deferment rejected at intake: {}", err),
    }

    println!("\nReinstatement eligibility");
    for subject in ["9010005", "9010001"] {
        let outcome = service.create_request(
            &Caller::new(subject),
            NewStatusChangeRequest {
                subject_id: SubjectId(subject.to_string()),
                request_type: RequestType::Reinstatement,
                justification: Justification::Academic,
                target_state_ref: None,
                notes: None,
            },
        );
        render_outcome(&format!("Reinstatement for {subject}"), &outcome);
    }

    Ok(())
}

fn race_approvals(
    service: &DemoService,
    steps: &[(ApproverRole, StepId)],
) -> Vec<(ApproverRole, Result<RequestRecord, StatusChangeError>)> {
    thread::scope(|scope| {
        let handles = steps
            .iter()
            .map(|&(role, step)| {
                scope.spawn(move || {
                    (
                        role,
                        service.respond(step, &approver(role), Decision::Approved, None),
                    )
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .collect()
    })
}

fn step_id(record: &RequestRecord, role: ApproverRole) -> Option<StepId> {
    record.step_for(role).map(|step| step.id)
}

fn approver(role: ApproverRole) -> Caller {
    let caller = Caller::new(format!("demo-{}", role.label()));
    match role {
        ApproverRole::Finance | ApproverRole::Library | ApproverRole::Registrar => {
            caller.with_role(role.label())
        }
        ApproverRole::AcademicAdvisor
        | ApproverRole::ProgramLeader
        | ApproverRole::StudentAffairs => caller.with_position(role.label()),
    }
}

fn render_record(record: &RequestRecord) {
    println!(
        "- Received {} {} for {} -> status {}",
        record.request.request_type.label(),
        record.request.id,
        record.request.subject_id,
        record.request.status.label()
    );
    for step in &record.steps {
        println!(
            "  - {} {}: {}",
            step.id,
            step.approver_role.label(),
            step.status.label()
        );
    }
}

fn render_outcome(label: &str, outcome: &Result<RequestRecord, StatusChangeError>) {
    match outcome {
        Ok(record) => println!(
            "- {} -> request {} {} ({} steps still pending)",
            label,
            record.request.id,
            record.request.status.label(),
            record.pending_roles().len()
        ),
        Err(err) => println!("- {} refused [{}]: {}", label, err.kind(), err),
    }
}
