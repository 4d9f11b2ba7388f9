use crate::infra::AppState;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Extension;
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use status_workflow::workflows::status_change::{
    status_change_router, StatusChangeService, SubjectRegistry, WorkflowStore,
};

pub(crate) fn with_status_change_routes<S, G>(
    service: Arc<StatusChangeService<S, G>>,
) -> axum::Router
where
    S: WorkflowStore + 'static,
    G: SubjectRegistry + 'static,
{
    status_change_router(service)
        .route("/health", axum::routing::get(healthcheck))
        .route("/ready", axum::routing::get(readiness_endpoint))
        .route("/metrics", axum::routing::get(metrics_endpoint))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::InMemorySubjectRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use status_workflow::workflows::status_change::MemoryWorkflowStore;
    use std::sync::atomic::AtomicBool;
    use tower::ServiceExt;

    fn app(ready: bool) -> axum::Router {
        let service = StatusChangeService::new(
            Arc::new(MemoryWorkflowStore::new()),
            Arc::new(InMemorySubjectRegistry::seeded()),
        )
        .expect("standard configuration");
        let state = AppState {
            readiness: Arc::new(AtomicBool::new(ready)),
            metrics: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
        };
        with_status_change_routes(Arc::new(service)).layer(Extension(state))
    }

    #[tokio::test]
    async fn readiness_reports_initializing_until_bound() {
        let response = app(false)
            .oneshot(Request::get("/ready").body(Body::empty()).expect("request"))
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app(true)
            .oneshot(Request::get("/ready").body(Body::empty()).expect("request"))
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_and_workflow_routes_share_one_router() {
        let router = app(true);
        let health = router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("router responds");
        assert_eq!(health.status(), StatusCode::OK);

        let create = router
            .oneshot(
                Request::post("/api/v1/status-changes")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header("x-caller-id", "9010005")
                    .body(Body::from(
                        json!({
                            "subject_id": "9010005",
                            "request_type": "deferment",
                            "justification": "employment",
                            "target_state_ref": "9010005-S1"
                        })
                        .to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("router responds");
        assert_eq!(create.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn metrics_render_as_prometheus_text() {
        let response = app(true)
            .oneshot(Request::get("/metrics").body(Body::empty()).expect("request"))
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("text/plain; version=0.0.4")
        );
    }
}
