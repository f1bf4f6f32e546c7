//! HTTP API for knowledge bases and conflict detection.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Status, version and backend capabilities |
//! | `POST` | `/kb/build` | Build a project KB (`mode`: `async` or `sync`) |
//! | `POST` | `/kb/incremental` | Deduplicated append to an existing KB |
//! | `POST` | `/kb/query` | Top-k retrieval |
//! | `GET`  | `/kb/status/{project_id}` | KB status (never an error) |
//! | `GET`  | `/kb/job/{job_id}` | Async build job status |
//! | `POST` | `/kb/needs-rag` | Retrieval gate plus context message |
//! | `POST` | `/api/conflicts/detect` | Start a detection run |
//! | `GET`  | `/api/conflicts/status/{job_id}` | Poll a detection run |
//! | `DELETE` | `/api/conflicts/status/{job_id}` | Forget a detection run |
//!
//! Every route except `/health` requires `X-API-Key` when `[server].api_key`
//! is set.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "Knowledge base not found for project 7. Build it first." } }
//! ```
//!
//! Codes: `bad_request` (400), `forbidden` (403), `not_found` (404),
//! `conflict` (409), `upstream_error` (502), `malformed_response` (502),
//! `dependency_unavailable` (503), `internal` (500).

use axum::{
    extract::{rejection::JsonRejection, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::conflict::{ConflictDetector, DetectionOptions};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{classify, KbError};
use crate::jobs::{
    build_job_id, conflict_job_id, InMemoryJobTracker, JobKind, JobRecord, JobStatus, JobTracker,
};
use crate::kb::{documents_to_chunks, Capabilities, KnowledgeBase};
use crate::llm::{create_llm, LlmClient};
use crate::models::{ConflictPair, Document, QueryHit, RequirementInput, RunMetadata};
use crate::progress::JobProgress;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    kb: Arc<KnowledgeBase>,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmClient>,
    jobs: Arc<dyn JobTracker>,
    capabilities: Capabilities,
}

/// Start the server with the backends named in the config.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
    let llm: Arc<dyn LlmClient> = Arc::from(create_llm(&config.llm)?);
    run_server_with_extensions(config, embedder, llm).await
}

/// Start the server with caller-supplied backends.
///
/// ```rust,no_run
/// use req_harness::embedding::HashProvider;
/// use req_harness::llm::DisabledLlm;
/// use req_harness::server::run_server_with_extensions;
/// use std::sync::Arc;
///
/// # async fn example(config: &req_harness::config::Config) -> anyhow::Result<()> {
/// run_server_with_extensions(config, Arc::new(HashProvider::new(384)), Arc::new(DisabledLlm)).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_server_with_extensions(
    config: &Config,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmClient>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(config, embedder, llm);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// The full route table, without binding a socket.
pub fn router(config: &Config, embedder: Arc<dyn EmbeddingProvider>, llm: Arc<dyn LlmClient>) -> Router {
    let capabilities = Capabilities::detect(embedder.as_ref(), llm.as_ref());
    tracing::info!(
        embeddings = capabilities.embeddings,
        llm = capabilities.llm,
        embedding_model = embedder.model_name(),
        llm_model = llm.model_name(),
        "backend capabilities"
    );
    let state = AppState {
        config: Arc::new(config.clone()),
        kb: Arc::new(KnowledgeBase::new(config, embedder.clone())),
        embedder,
        llm,
        jobs: Arc::new(InMemoryJobTracker::with_retention(Duration::from_secs(
            config.server.job_retention_secs,
        ))),
        capabilities,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/kb/build", post(handle_build))
        .route("/kb/incremental", post(handle_incremental))
        .route("/kb/query", post(handle_query))
        .route("/kb/status/{project_id}", get(handle_status))
        .route("/kb/job/{job_id}", get(handle_build_job))
        .route("/kb/needs-rag", post(handle_needs_rag))
        .route("/api/conflicts/detect", post(handle_detect))
        .route(
            "/api/conflicts/status/{job_id}",
            get(handle_conflict_status).delete(handle_conflict_delete),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(handle_health))
        .merge(protected)
        .layer(cors)
        .with_state(state)
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = &state.config.server.api_key {
        let provided = request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return Err(AppError::new(
                StatusCode::FORBIDDEN,
                "forbidden",
                "invalid or missing X-API-Key",
            ));
        }
    }
    Ok(next.run(request).await)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

/// Map a core error to its HTTP class by the first [`KbError`] in the chain.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        match classify(&err) {
            Some(KbError::NotFound(_)) => not_found(message),
            Some(KbError::BadInput(_)) => bad_request(message),
            Some(KbError::DependencyUnavailable(..)) => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "dependency_unavailable",
                message,
            ),
            Some(KbError::Upstream(_)) => {
                AppError::new(StatusCode::BAD_GATEWAY, "upstream_error", message)
            }
            Some(KbError::MalformedResponse(_)) => {
                AppError::new(StatusCode::BAD_GATEWAY, "malformed_response", message)
            }
            Some(KbError::Inconsistent(_)) => {
                AppError::new(StatusCode::CONFLICT, "conflict", message)
            }
            None => {
                tracing::error!(error = %message, "request failed");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    capabilities: Capabilities,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        capabilities: state.capabilities,
    })
}

// ============ Knowledge base ============

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum BuildMode {
    #[default]
    Async,
    Sync,
}

#[derive(Deserialize)]
struct BuildRequest {
    #[serde(deserialize_with = "crate::models::string_or_number")]
    project_id: String,
    #[serde(default)]
    documents: Vec<Document>,
    #[serde(default)]
    mode: BuildMode,
}

async fn handle_build(
    State(state): State<AppState>,
    payload: Result<Json<BuildRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(req) = payload?;
    if req.documents.is_empty() {
        return Err(bad_request("No documents provided"));
    }
    state.capabilities.require_embeddings()?;
    state.kb.paths(&req.project_id)?;
    documents_to_chunks(req.documents.clone())?;

    if req.mode == BuildMode::Sync {
        let summary = state.kb.build_project(&req.project_id, req.documents).await?;
        return Ok(Json(serde_json::json!({
            "status": "completed",
            "project_id": summary.project_id,
            "total_chunks": summary.total_chunks,
            "version": summary.version,
            "index_path": summary.index_path,
        })));
    }

    let job_id = build_job_id();
    state
        .jobs
        .create(JobRecord::build(job_id.clone(), &req.project_id));
    tracing::info!(job_id = %job_id, project_id = %req.project_id, "build job queued");

    let task_state = state.clone();
    let task_job = job_id.clone();
    tokio::spawn(async move {
        let jobs = task_state.jobs.clone();
        jobs.update(&task_job, &mut |r| r.status = JobStatus::Building);
        match task_state.kb.build_project(&req.project_id, req.documents).await {
            Ok(summary) => {
                let result = serde_json::json!({
                    "total_chunks": summary.total_chunks,
                    "version": summary.version,
                    "index_path": summary.index_path,
                });
                jobs.update(&task_job, &mut |r| {
                    r.status = JobStatus::Completed;
                    r.result = Some(result.clone());
                    r.progress = None;
                });
            }
            Err(e) => {
                let msg = format!("{:#}", e);
                tracing::warn!(job_id = %task_job, error = %msg, "build job failed");
                jobs.update(&task_job, &mut |r| r.fail(msg.clone()));
            }
        }
    });

    Ok(Json(serde_json::json!({
        "job_id": job_id,
        "status": JobStatus::Queued.as_str(),
    })))
}

#[derive(Deserialize)]
struct IncrementalRequest {
    #[serde(deserialize_with = "crate::models::string_or_number")]
    project_id: String,
    #[serde(default)]
    documents: Vec<Document>,
}

async fn handle_incremental(
    State(state): State<AppState>,
    payload: Result<Json<IncrementalRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(req) = payload?;
    let summary = state
        .kb
        .incremental_update(&req.project_id, req.documents)
        .await?;
    Ok(Json(serde_json::json!({
        "status": "completed",
        "added_chunks": summary.added_chunks,
        "skipped_chunks": summary.skipped_chunks,
        "total_chunks": summary.total_chunks,
        "version": summary.version,
    })))
}

#[derive(Deserialize)]
struct QueryRequest {
    #[serde(deserialize_with = "crate::models::string_or_number")]
    project_id: String,
    query: String,
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct QueryResponse {
    results: Vec<QueryHit>,
    total_results: usize,
}

async fn handle_query(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(req) = payload?;
    let results = state
        .kb
        .query_project(&req.project_id, &req.query, req.top_k)
        .await?;
    Ok(Json(QueryResponse {
        total_results: results.len(),
        results,
    }))
}

async fn handle_status(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Json<serde_json::Value> {
    let status = state.kb.project_status(&project_id);
    let mut body = serde_json::to_value(&status).unwrap_or_default();
    body["project_id"] = serde_json::Value::String(project_id);
    Json(body)
}

async fn handle_build_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, AppError> {
    state
        .jobs
        .get(&job_id)
        .filter(|r| r.kind == JobKind::Build)
        .map(Json)
        .ok_or_else(|| not_found(format!("Job {} not found", job_id)))
}

#[derive(Deserialize)]
struct NeedsRagRequest {
    #[serde(deserialize_with = "crate::models::string_or_number")]
    project_id: String,
    query: String,
}

async fn handle_needs_rag(
    State(state): State<AppState>,
    payload: Result<Json<NeedsRagRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(req) = payload?;
    let needs_rag = state.kb.needs_rag(&req.project_id, &req.query).await;
    let context = if needs_rag {
        state.kb.rag_context(&req.project_id, &req.query).await
    } else {
        None
    };
    Ok(Json(serde_json::json!({
        "needs_rag": needs_rag,
        "context": context,
    })))
}

// ============ Conflict detection ============

#[derive(Deserialize)]
struct DetectRequest {
    #[serde(deserialize_with = "crate::models::string_or_number")]
    project_id: String,
    requirements: Vec<RequirementInput>,
    min_cluster_size: Option<usize>,
    max_batch_size: Option<usize>,
    similarity_threshold: Option<f32>,
}

/// Wire shape of one conflict in job status responses.
#[derive(Serialize)]
struct ConflictResult {
    req_id_1: String,
    req_id_2: String,
    req_text_1: String,
    req_text_2: String,
    reason: String,
    confidence: &'static str,
    severity: &'static str,
    cluster_id: i32,
}

impl From<&ConflictPair> for ConflictResult {
    fn from(c: &ConflictPair) -> Self {
        Self {
            req_id_1: c.req_a_id.clone(),
            req_id_2: c.req_b_id.clone(),
            req_text_1: c.req_a_text.clone(),
            req_text_2: c.req_b_text.clone(),
            reason: c.reason.clone(),
            confidence: c.confidence.as_str(),
            severity: c.confidence.severity(),
            cluster_id: c.cluster_id,
        }
    }
}

#[derive(Serialize)]
struct ConflictStatusResponse {
    job_id: String,
    project_id: String,
    status: JobStatus,
    progress: Option<String>,
    conflicts: Option<Vec<ConflictResult>>,
    error: Option<String>,
    metadata: Option<RunMetadata>,
    created_at: chrono::DateTime<chrono::Utc>,
}

async fn handle_detect(
    State(state): State<AppState>,
    payload: Result<Json<DetectRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(req) = payload?;
    if req.requirements.is_empty() {
        return Err(bad_request("No requirements provided"));
    }

    let mut options = DetectionOptions::from_config(&state.config.conflicts);
    if let Some(v) = req.min_cluster_size {
        options.min_cluster_size = v;
    }
    if let Some(v) = req.max_batch_size {
        options.max_cluster_batch = v;
    }
    if let Some(v) = req.similarity_threshold {
        options.similarity_threshold = v;
    }
    options.validate()?;
    state.capabilities.require_embeddings()?;
    state.capabilities.require_llm()?;

    let job_id = conflict_job_id(&req.project_id, chrono::Utc::now());
    state
        .jobs
        .create(JobRecord::conflicts(job_id.clone(), &req.project_id));
    let count = req.requirements.len();
    tracing::info!(job_id = %job_id, project_id = %req.project_id, requirements = count, "detection job pending");

    let detector = ConflictDetector::new(state.embedder.clone(), state.llm.clone(), options);
    let jobs = state.jobs.clone();
    let task_job = job_id.clone();
    tokio::spawn(async move {
        jobs.update(&task_job, &mut |r| {
            r.status = JobStatus::Running;
            r.progress = Some("Initializing detector...".to_string());
        });
        let progress = JobProgress::new(jobs.clone(), task_job.clone());
        match detector.run(req.requirements, &progress).await {
            Ok(report) => {
                jobs.update(&task_job, &mut |r| {
                    r.status = JobStatus::Completed;
                    r.conflicts = Some(report.conflicts.clone());
                    r.metadata = Some(report.metadata.clone());
                    r.progress = None;
                });
            }
            Err(e) => {
                let msg = format!("{:#}", e);
                tracing::warn!(job_id = %task_job, error = %msg, "detection job failed");
                jobs.update(&task_job, &mut |r| r.fail(msg.clone()));
            }
        }
    });

    Ok(Json(serde_json::json!({
        "job_id": job_id,
        "status": JobStatus::Pending.as_str(),
        "message": format!("Conflict detection started for {} requirements", count),
    })))
}

fn conflict_job(state: &AppState, job_id: &str) -> Result<JobRecord, AppError> {
    state
        .jobs
        .get(job_id)
        .filter(|r| r.kind == JobKind::Conflicts)
        .ok_or_else(|| not_found(format!("Job {} not found", job_id)))
}

async fn handle_conflict_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<ConflictStatusResponse>, AppError> {
    let job = conflict_job(&state, &job_id)?;
    Ok(Json(ConflictStatusResponse {
        job_id: job.job_id,
        project_id: job.project_id,
        status: job.status,
        progress: job.progress,
        conflicts: job
            .conflicts
            .as_ref()
            .map(|cs| cs.iter().map(ConflictResult::from).collect()),
        error: job.error,
        metadata: job.metadata,
        created_at: job.created_at,
    }))
}

async fn handle_conflict_delete(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    conflict_job(&state, &job_id)?;
    state.jobs.remove(&job_id);
    Ok(Json(serde_json::json!({
        "message": format!("Job {} cleared", job_id),
    })))
}
