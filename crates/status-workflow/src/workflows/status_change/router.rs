use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task;
use tracing::error;

use super::domain::{Caller, Decision, NewStatusChangeRequest, RequestFilter, RequestId, StepId};
use super::registry::SubjectRegistry;
use super::repository::WorkflowStore;
use super::service::{StatusChangeError, StatusChangeService};

pub const CALLER_ID_HEADER: &str = "x-caller-id";
pub const CALLER_ROLES_HEADER: &str = "x-caller-roles";
pub const CALLER_POSITIONS_HEADER: &str = "x-caller-positions";

/// Body of `POST /api/v1/approval-steps/:step_id/respond`.
#[derive(Debug, Clone, Deserialize)]
pub struct RespondBody {
    pub decision: Decision,
    #[serde(default)]
    pub message: Option<String>,
}

/// Router exposing request intake, approval responses and read models.
pub fn status_change_router<S, G>(service: Arc<StatusChangeService<S, G>>) -> Router
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
{
    Router::new()
        .route(
            "/api/v1/status-changes",
            post(create_handler::<S, G>).get(list_handler::<S, G>),
        )
        .route("/api/v1/status-changes/inbox", get(inbox_handler::<S, G>))
        .route(
            "/api/v1/status-changes/:request_id",
            get(detail_handler::<S, G>),
        )
        .route(
            "/api/v1/status-changes/:request_id/audit",
            get(audit_handler::<S, G>),
        )
        .route(
            "/api/v1/status-changes/:request_id/cancel",
            post(cancel_handler::<S, G>),
        )
        .route(
            "/api/v1/status-changes/:request_id/reconcile",
            post(reconcile_handler::<S, G>),
        )
        .route(
            "/api/v1/approval-steps/:step_id/respond",
            post(respond_handler::<S, G>),
        )
        .route(
            "/api/v1/workflow-definition",
            get(definition_handler::<S, G>),
        )
        .with_state(service)
}

impl IntoResponse for StatusChangeError {
    fn into_response(self) -> Response {
        let status = match &self {
            StatusChangeError::NotFound(_) => StatusCode::NOT_FOUND,
            StatusChangeError::Conflict(_) => StatusCode::CONFLICT,
            StatusChangeError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            StatusChangeError::Validation(_) | StatusChangeError::InvalidState(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            StatusChangeError::DependencyFailure(_) | StatusChangeError::Storage(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            StatusChangeError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let payload = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status, Json(payload)).into_response()
    }
}

/// Resolve the acting caller from identity headers set by the upstream gateway.
pub fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, Response> {
    let user_id = header_text(headers, CALLER_ID_HEADER)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            let payload = json!({
                "error": "unauthenticated",
                "message": format!("missing {CALLER_ID_HEADER} header"),
            });
            (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
        })?;

    let mut caller = Caller::new(user_id);
    for role in split_list(header_text(headers, CALLER_ROLES_HEADER)) {
        caller = caller.with_role(role);
    }
    for position in split_list(header_text(headers, CALLER_POSITIONS_HEADER)) {
        caller = caller.with_position(position);
    }
    Ok(caller)
}

fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn split_list(raw: Option<&str>) -> impl Iterator<Item = &str> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

/// Run a synchronous service call on the blocking pool and render its outcome.
async fn run_blocking<S, G, T, F>(
    service: Arc<StatusChangeService<S, G>>,
    success: StatusCode,
    call: F,
) -> Response
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
    T: Serialize + Send + 'static,
    F: FnOnce(&StatusChangeService<S, G>) -> Result<T, StatusChangeError> + Send + 'static,
{
    match task::spawn_blocking(move || call(&service)).await {
        Ok(Ok(body)) => (success, Json(body)).into_response(),
        Ok(Err(error)) => error.into_response(),
        Err(join_error) => {
            error!(error = %join_error, "status change worker did not complete");
            let payload = json!({
                "error": "internal",
                "message": "request processing failed",
            });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(payload)).into_response()
        }
    }
}

pub(crate) async fn create_handler<S, G>(
    State(service): State<Arc<StatusChangeService<S, G>>>,
    headers: HeaderMap,
    Json(input): Json<NewStatusChangeRequest>,
) -> Response
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
{
    let caller = match caller_from_headers(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    run_blocking(service, StatusCode::CREATED, move |service| {
        service.create_request(&caller, input)
    })
    .await
}

pub(crate) async fn list_handler<S, G>(
    State(service): State<Arc<StatusChangeService<S, G>>>,
    Query(filter): Query<RequestFilter>,
) -> Response
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
{
    run_blocking(service, StatusCode::OK, move |service| service.list(&filter)).await
}

pub(crate) async fn inbox_handler<S, G>(
    State(service): State<Arc<StatusChangeService<S, G>>>,
    headers: HeaderMap,
    Query(filter): Query<RequestFilter>,
) -> Response
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
{
    let caller = match caller_from_headers(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    run_blocking(service, StatusCode::OK, move |service| {
        service.list_pending_for_caller(&caller, &filter)
    })
    .await
}

pub(crate) async fn detail_handler<S, G>(
    State(service): State<Arc<StatusChangeService<S, G>>>,
    Path(request_id): Path<i64>,
) -> Response
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
{
    run_blocking(service, StatusCode::OK, move |service| {
        service.get(RequestId(request_id))
    })
    .await
}

pub(crate) async fn audit_handler<S, G>(
    State(service): State<Arc<StatusChangeService<S, G>>>,
    Path(request_id): Path<i64>,
) -> Response
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
{
    run_blocking(service, StatusCode::OK, move |service| {
        service.audit_trail(RequestId(request_id))
    })
    .await
}

pub(crate) async fn cancel_handler<S, G>(
    State(service): State<Arc<StatusChangeService<S, G>>>,
    Path(request_id): Path<i64>,
    headers: HeaderMap,
) -> Response
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
{
    let caller = match caller_from_headers(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    run_blocking(service, StatusCode::OK, move |service| {
        service.cancel(RequestId(request_id), &caller)
    })
    .await
}

pub(crate) async fn reconcile_handler<S, G>(
    State(service): State<Arc<StatusChangeService<S, G>>>,
    Path(request_id): Path<i64>,
    headers: HeaderMap,
) -> Response
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
{
    let caller = match caller_from_headers(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    run_blocking(service, StatusCode::OK, move |service| {
        service.reconcile(RequestId(request_id), &caller)
    })
    .await
}

pub(crate) async fn respond_handler<S, G>(
    State(service): State<Arc<StatusChangeService<S, G>>>,
    Path(step_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<RespondBody>,
) -> Response
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
{
    let caller = match caller_from_headers(&headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    run_blocking(service, StatusCode::OK, move |service| {
        service.respond(StepId(step_id), &caller, body.decision, body.message)
    })
    .await
}

pub(crate) async fn definition_handler<S, G>(
    State(service): State<Arc<StatusChangeService<S, G>>>,
) -> Response
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
{
    (StatusCode::OK, Json(service.definition())).into_response()
}
