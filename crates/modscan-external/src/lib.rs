// SPDX-License-Identifier: MIT OR Apache-2.0
//! The External Module Adapter (C8) — spec §4.8.
//!
//! An `axum` [`Router`] exposing the HTTP surface external workers consume
//! (`GET /health`, `GET /external-modules/{id}/files`,
//! `POST /external-modules/{id}/results`), plus [`notify`], the outbound
//! best-effort task notification a caller fires after enqueueing a task for
//! an external module.

use axum::{
    Json, Router,
    extract::{Path as AxPath, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use modscan_core::{Fingerprint, ModuleKind, ModuleResult};
use modscan_error::{ErrorKind, ModscanError};
use modscan_queue::{QueuePlane, ResultEnvelope};
use modscan_registry::ModuleRegistry;
use modscan_report::ReportStore;
use modscan_store::ArtifactStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Shared state for the external-module HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub registry: ModuleRegistry,
    pub queue: Arc<dyn QueuePlane>,
    pub reports: ReportStore,
    pub store: ArtifactStore,
}

/// Uniform JSON error body for this adapter's routes.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ModscanError> for ApiError {
    fn from(err: ModscanError) -> Self {
        let status = match err.kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::IllegalState | ErrorKind::Unavailable => StatusCode::CONFLICT,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::WorkerError => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Build the `axum` router for the external-module adapter.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/external-modules/{id}/files", get(pull_files))
        .route("/external-modules/{id}/results", post(ingest_result))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

#[derive(Debug, Deserialize)]
struct FilesQuery {
    file_hash: String,
    file_ids: Option<String>,
}

async fn pull_files(
    AxPath(_module_id): AxPath<String>,
    Query(q): Query<FilesQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let fingerprint = Fingerprint::parse(&q.file_hash)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    let paths = q
        .file_ids
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect());

    let bytes = state.store.tarball(fingerprint, paths, true).await?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/gzip")],
        bytes,
    )
        .into_response())
}

/// Body of `POST /external-modules/{id}/results`, per the wire shape in
/// spec §6 — a simpler envelope than the internal [`ModuleResult`]:
/// `module_id`/`module_version`/`contract_version` are implied by the URL
/// and registry entry rather than carried by the worker.
#[derive(Debug, Deserialize)]
struct ExternalResultBody {
    task_id: Uuid,
    file_hash: String,
    status: modscan_core::ModuleResultStatus,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    findings: Vec<modscan_core::Finding>,
    #[serde(default)]
    summary: modscan_core::Summary,
}

async fn ingest_result(
    AxPath(module_id): AxPath<String>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExternalResultBody>,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = state
        .registry
        .list()
        .await
        .into_iter()
        .find(|m| m.id == module_id && m.kind() == ModuleKind::External)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("module '{module_id}' is not a registered external module"),
            )
        })?;

    let fingerprint = Fingerprint::parse(&req.file_hash)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    // Fingerprint is known if a report already exists for it (C1 always
    // creates one at ingest time, before any task can be enqueued).
    state.reports.get_report(fingerprint).await?;

    let result = ModuleResult {
        contract_version: modscan_core::CONTRACT_VERSION.to_string(),
        module_id: module_id.clone(),
        module_version: descriptor.version,
        task_id: req.task_id,
        completed_at: chrono::Utc::now(),
        status: req.status,
        error_message: req.error,
        findings: req.findings,
        summary: req.summary,
    };

    let envelope = ResultEnvelope {
        task_id: req.task_id,
        result: result.clone(),
    };
    state
        .queue
        .publish_result(&module_id, fingerprint, envelope)
        .await?;
    state
        .reports
        .put_module_result(fingerprint, &module_id, result)
        .await?;

    Ok(Json(json!({ "status": "ok" })))
}

/// Minimal payload POSTed to `{base_url}/operations/process` to notify an
/// external worker that a task is waiting on its queue. Best-effort: the
/// queue write already happened and remains the source of truth regardless
/// of whether this call succeeds.
#[derive(Debug, Clone, Serialize)]
pub struct TaskNotification {
    pub task_id: Uuid,
    pub file_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_task_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    pub data: TaskNotificationData,
}

/// The `data` sub-object of [`TaskNotification`].
#[derive(Debug, Clone, Serialize)]
pub struct TaskNotificationData {
    pub folder_path: String,
    pub file_type: modscan_core::FileType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// POST a best-effort notification to the external module's `base_url`.
/// Errors are logged and swallowed: a failed notification never rolls back
/// the enqueue, since the worker can still discover the task by polling.
pub async fn notify(client: &reqwest::Client, base_url: &str, notification: &TaskNotification) {
    let url = format!("{}/operations/process", base_url.trim_end_matches('/'));
    match client.post(&url).json(notification).send().await {
        Ok(resp) if resp.status().is_success() => {
            tracing::debug!(task_id = %notification.task_id, %url, "notified external worker");
        }
        Ok(resp) => {
            tracing::warn!(task_id = %notification.task_id, %url, status = %resp.status(), "external notification rejected");
        }
        Err(err) => {
            tracing::warn!(task_id = %notification.task_id, %url, error = %err, "external notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use modscan_core::{ModuleResultStatus, Summary};
    use modscan_queue::MemoryQueuePlane;
    use modscan_registry::MockContainerDriver;
    use tower::ServiceExt;

    async fn test_state(tmp: &std::path::Path) -> Arc<AppState> {
        let queue = Arc::new(MemoryQueuePlane::new());
        let registry = ModuleRegistry::new(
            tmp.join("modules"),
            Arc::new(MockContainerDriver::always_succeeds()),
            1,
            queue.clone(),
        );
        registry
            .register_external(
                "yara-cloud".into(),
                "YARA Cloud".into(),
                "1.0.0".into(),
                "test".into(),
                String::new(),
                [modscan_core::FileType::Apk],
                "http://worker.example".into(),
                "http://worker.example/health".into(),
            )
            .await
            .unwrap();

        let reports = ReportStore::new(tmp.join("reports")).await.unwrap();
        let fingerprint = Fingerprint::of(b"ext-adapter-test");
        reports
            .ensure_report(&modscan_core::Artifact {
                fingerprint,
                original_name: "app.apk".into(),
                aliases: Vec::new(),
                size: 4,
                detected_type: modscan_core::FileType::Apk,
                ingested_at: chrono::Utc::now(),
                extracted_root: format!("{}/tree", fingerprint.to_hex()),
            })
            .await
            .unwrap();

        let store = ArtifactStore::new(tmp.join("store")).await.unwrap();

        Arc::new(AppState {
            registry,
            queue,
            reports,
            store,
        })
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let tmp = tempfile::tempdir().unwrap();
        let app = build_app(test_state(tmp.path()).await);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ingest_result_rejects_unknown_module() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path()).await;
        let fingerprint = Fingerprint::of(b"ext-adapter-test");
        let app = build_app(state);

        let body = serde_json::to_vec(&json!({
            "task_id": Uuid::new_v4(),
            "file_hash": fingerprint.to_hex(),
            "status": "success",
        }))
        .unwrap();

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/external-modules/not-registered/results")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ingest_result_writes_through_queue_and_report() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path()).await;
        let fingerprint = Fingerprint::of(b"ext-adapter-test");
        let task_id = Uuid::new_v4();
        let app = build_app(state.clone());

        let body = serde_json::to_vec(&json!({
            "task_id": task_id,
            "file_hash": fingerprint.to_hex(),
            "status": "success",
            "findings": [],
            "summary": Summary::default(),
        }))
        .unwrap();

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/external-modules/yara-cloud/results")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let report = state.reports.get_report(fingerprint).await.unwrap();
        let stored = report.modules.get("yara-cloud").unwrap();
        assert_eq!(stored.status, ModuleResultStatus::Success);
    }
}
