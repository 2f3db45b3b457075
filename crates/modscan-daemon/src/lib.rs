// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control-plane daemon wiring every orchestrator component into one
//! `axum::Router`.
//!
//! This surface is a narrow stand-in for the scoped-out upload/report web
//! API: module register/deregister/lifecycle, chain CRUD, auto-run settings
//! GET/PUT, run/cancel, and report GET. It does not accept artifact
//! uploads — that remains the caller's (or `modscan-cli`'s) job via
//! `modscan_store::ArtifactStore` directly. It does merge in the External
//! Module Adapter (C8) surface from `modscan_external`, so one running
//! `modscan-daemon` process is the only thing an external worker ever talks
//! to.

pub mod middleware;

use axum::{
    Json, Router,
    extract::{Path as AxPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use modscan_chains::ChainStore;
use modscan_core::{AutoRunConfig, Chain, Fingerprint, ModuleKind};
use modscan_dispatcher::{AutoRunSettings, Dispatcher, RunTarget};
use modscan_error::{ErrorKind, ModscanError};
use modscan_executor::{ChainExecutor, ChainRunHandle};
use modscan_queue::QueuePlane;
use modscan_registry::ModuleRegistry;
use modscan_report::ReportStore;
use modscan_store::ArtifactStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Shared daemon state: one handle to each orchestrator component.
#[derive(Clone)]
pub struct AppState {
    pub registry: ModuleRegistry,
    pub chains: Arc<dyn ChainStore>,
    pub executor: ChainExecutor,
    pub dispatcher: Dispatcher,
    pub settings: AutoRunSettings,
    pub reports: ReportStore,
    pub queue: Arc<dyn QueuePlane>,
    pub store: ArtifactStore,
    /// Handles for runs started through this process, keyed by
    /// `chain_run_id`, so `cancel` can reach a still-live task. A run
    /// started by a prior process (pre-restart) is cancelled through
    /// [`ChainExecutor::cancel_persisted`] instead.
    live_runs: Arc<RwLock<HashMap<Uuid, ChainRunHandle>>>,
}

impl AppState {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: ModuleRegistry,
        chains: Arc<dyn ChainStore>,
        executor: ChainExecutor,
        dispatcher: Dispatcher,
        settings: AutoRunSettings,
        reports: ReportStore,
        queue: Arc<dyn QueuePlane>,
        store: ArtifactStore,
    ) -> Self {
        Self {
            registry,
            chains,
            executor,
            dispatcher,
            settings,
            reports,
            queue,
            store,
            live_runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Build the external-module adapter (C8) state sharing this daemon's
    /// registry, queue, and report store.
    fn external_state(&self) -> Arc<modscan_external::AppState> {
        Arc::new(modscan_external::AppState {
            registry: self.registry.clone(),
            queue: self.queue.clone(),
            reports: self.reports.clone(),
            store: self.store.clone(),
        })
    }

    async fn track(&self, handle: ChainRunHandle) -> Uuid {
        let id = handle.chain_run_id();
        self.live_runs.write().await.insert(id, handle);
        id
    }
}

/// Uniform JSON error body.
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

/// Build the daemon's `axum::Router`, merged with the External Module
/// Adapter (C8) surface (`/health`, `/external-modules/{id}/files`,
/// `/external-modules/{id}/results`) that external workers poll and post
/// results to.
pub fn build_app(state: Arc<AppState>) -> Router {
    let external = modscan_external::build_app(state.external_state());

    let daemon_routes = Router::new()
        .route("/status", get(health))
        .route("/modules", get(list_modules))
        .route("/modules/external", post(register_external_module))
        .route("/modules/{id}", delete(deregister_module))
        .route("/modules/{id}/build", post(build_module))
        .route("/modules/{id}/start", post(start_module))
        .route("/modules/{id}/stop", post(stop_module))
        .route("/modules/{id}/rebuild", post(rebuild_module))
        .route("/chains", get(list_chains))
        .route("/chains/{name}", put(put_chain))
        .route("/chains/{name}", get(get_chain))
        .route("/chains/{name}", delete(delete_chain))
        .route("/auto-run", get(get_auto_run))
        .route("/auto-run", put(put_auto_run))
        .route("/runs", post(start_run))
        .route("/runs/{fingerprint}/{chain_run_id}/cancel", post(cancel_run))
        .route("/reports/{fingerprint}", get(get_report))
        .with_state(state);

    // `external` already carries `/health`, which doubles as this process's
    // liveness endpoint — the daemon's own richer status lives at `/status`.
    daemon_routes.merge(external)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "contract_version": modscan_core::CONTRACT_VERSION }))
}

async fn list_modules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

#[derive(Debug, Deserialize)]
struct RegisterExternalRequest {
    module_id: String,
    base_url: String,
    healthcheck_url: String,
    config: ExternalModuleConfig,
}

#[derive(Debug, Deserialize)]
struct ExternalModuleConfig {
    name: String,
    version: String,
    #[serde(default)]
    description: String,
    author: String,
    #[serde(default)]
    input_formats: Vec<modscan_core::FileType>,
}

async fn register_external_module(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterExternalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = state
        .registry
        .register_external(
            req.module_id,
            req.config.name,
            req.config.version,
            req.config.author,
            req.config.description,
            req.config.input_formats,
            req.base_url,
            req.healthcheck_url,
        )
        .await?;
    Ok(Json(descriptor))
}

#[derive(Debug, Deserialize)]
struct DeregisterQuery {
    kind: ModuleKind,
}

async fn deregister_module(
    AxPath(id): AxPath<String>,
    axum::extract::Query(q): axum::extract::Query<DeregisterQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.deregister(q.kind, &id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn build_module(
    AxPath(id): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.build(&id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn start_module(
    AxPath(id): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.start(&id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn stop_module(
    AxPath(id): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.stop(&id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn rebuild_module(
    AxPath(id): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.rebuild(&id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn list_chains(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.chains.list_chains().await?))
}

async fn get_chain(
    AxPath(name): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.chains.get_chain(&name).await?))
}

async fn put_chain(
    AxPath(name): AxPath<String>,
    State(state): State<Arc<AppState>>,
    Json(mut chain): Json<Chain>,
) -> Result<impl IntoResponse, ApiError> {
    chain.name = name;
    let known_ids: HashSet<String> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|m| m.id)
        .collect();
    state.chains.put_chain(chain, &known_ids).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn delete_chain(
    AxPath(name): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.chains.delete_chain(&name).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn get_auto_run(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.settings.snapshot().await)
}

async fn put_auto_run(
    State(state): State<Arc<AppState>>,
    Json(config): Json<AutoRunConfig>,
) -> impl IntoResponse {
    state.settings.replace(config).await;
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RunTargetRequest {
    Chain { name: String },
    Module { id: String },
}

#[derive(Debug, Deserialize)]
struct StartRunRequest {
    target: RunTargetRequest,
    fingerprint: String,
}

#[derive(Debug, Serialize)]
struct StartRunResponse {
    chain_run_id: Uuid,
}

async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let fingerprint = Fingerprint::parse(&req.fingerprint)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    let report = state.reports.get_report(fingerprint).await?;

    let target = match req.target {
        RunTargetRequest::Chain { name } => RunTarget::Chain(name),
        RunTargetRequest::Module { id } => RunTarget::Module(id),
    };

    let handle = state
        .dispatcher
        .run_explicit(
            target,
            fingerprint,
            report.artifact_meta.extracted_root.clone(),
            report.artifact_meta.detected_type,
        )
        .await?;
    let chain_run_id = state.track(handle).await;
    Ok(Json(StartRunResponse { chain_run_id }))
}

async fn cancel_run(
    AxPath((fingerprint, chain_run_id)): AxPath<(String, Uuid)>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let fingerprint = Fingerprint::parse(&fingerprint)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    let live = state.live_runs.read().await.get(&chain_run_id).is_some();
    if live {
        let guard = state.live_runs.read().await;
        if let Some(handle) = guard.get(&chain_run_id) {
            handle.cancel();
            return Ok(Json(json!({ "status": "cancelling" })));
        }
    }

    state.executor.cancel_persisted(fingerprint, chain_run_id).await?;
    Ok(Json(json!({ "status": "cancelled" })))
}

async fn get_report(
    AxPath(fingerprint): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let fingerprint = Fingerprint::parse(&fingerprint)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(state.reports.get_report(fingerprint).await?))
}
