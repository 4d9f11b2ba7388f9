use crate::cli::ServeArgs;
use crate::infra::{load_definition, AppState, InMemorySubjectRegistry};
use crate::routes::with_status_change_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use status_workflow::config::AppConfig;
use status_workflow::error::AppError;
use status_workflow::telemetry;
use status_workflow::workflows::status_change::{
    AccessGuard, MemoryWorkflowStore, SqliteWorkflowStore, StatusChangeService, SubjectRegistry,
    WorkflowDefinition, WorkflowStore,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }
    if let Some(database) = args.database.take() {
        config.storage.database_path = Some(database);
    }

    telemetry::init(&config.telemetry)?;

    let definition = load_definition(&config.workflow)?;
    let registry = Arc::new(InMemorySubjectRegistry::seeded());

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let app = match &config.storage.database_path {
        Some(path) => {
            let store = Arc::new(SqliteWorkflowStore::open(path)?);
            info!(path = %path.display(), "using sqlite workflow store");
            warn!(
                path = %path.display(),
                "subject registry is the seeded in-memory one; its standing resets on restart \
                 while persisted requests and audit entries do not"
            );
            build_router(store, registry, definition, &config)?
        }
        None => {
            info!("using in-memory workflow store");
            build_router(
                Arc::new(MemoryWorkflowStore::new()),
                registry,
                definition,
                &config,
            )?
        }
    }
    .layer(Extension(app_state))
    .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "status change workflow service ready");

    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router<S, G>(
    store: Arc<S>,
    registry: Arc<G>,
    definition: WorkflowDefinition,
    config: &AppConfig,
) -> Result<axum::Router, AppError>
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
{
    let service = StatusChangeService::with_definition(
        store,
        registry,
        definition,
        AccessGuard::standard(),
    )?
    .with_page_limit_max(config.workflow.page_limit_max);

    Ok(with_status_change_routes(Arc::new(service)))
}
