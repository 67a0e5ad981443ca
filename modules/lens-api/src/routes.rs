//! JSON routes. Read paths surface degradation through the
//! `x-ops-degraded` header instead of failing.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use lens_common::KeywordDiscoverer;
use lens_jobs::{run_job, JobError, JobManager};
use lens_pipeline::PipelineRunner;
use lens_store::{Store, StoreError};

use crate::views::{clean_snippet, merge_phenomenon_meta};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub runner: Arc<PipelineRunner>,
    pub discoverer: Arc<dyn KeywordDiscoverer>,
    pub store: Store,
    pub worker_count: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs/", post(create_job).get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/items", get(get_job_items))
        .route("/api/jobs/{id}/summary", get(get_job_summary))
        .route("/api/posts", get(list_posts))
        .route("/api/analysis-json/{post_id}", get(get_analysis_json))
        .route("/api/analysis/{post_id}", get(get_analysis_report))
        .route("/api/comments/by-post/{post_id}", get(comments_by_post))
        .route("/api/comments/search", get(comments_search))
        .route("/api/library/phenomena", get(list_phenomena))
        .route("/api/library/phenomena/{id}", get(get_phenomenon))
        .route("/api/library/phenomena/{id}/promote", post(promote_phenomenon))
        .route("/api/run", post(run_default))
        .route("/api/run/{pipeline}", post(run_pipeline))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    detail: String,
    dev_context: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            dev_context: None,
        }
    }

    fn not_found(detail: impl Into<String>, reason: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
            dev_context: Some(json!({"reason": reason})),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({"detail": self.detail});
        if let Some(ctx) = self.dev_context {
            body["dev_context"] = ctx;
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::Invalid(msg) => Self::new(StatusCode::BAD_REQUEST, msg),
            JobError::NotFound => Self::new(StatusCode::NOT_FOUND, "Job not found"),
            JobError::Store(inner) => inner.into(),
        }
    }
}

/// JSON response with the read-path cache headers applied.
fn ops_json(payload: Value, degraded: bool) -> Response {
    let mut res = Json(payload).into_response();
    res.headers_mut()
        .insert("Cache-Control", HeaderValue::from_static("max-age=2"));
    if degraded {
        res.headers_mut()
            .insert("x-ops-degraded", HeaderValue::from_static("1"));
    }
    res
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct JobCreate {
    pipeline_type: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    input_config: Option<Value>,
}

fn dispatch_job(state: &AppState, job_id: Uuid) {
    let manager = Arc::clone(&state.manager);
    let runner = Arc::clone(&state.runner);
    let discoverer = Arc::clone(&state.discoverer);
    let worker_count = state.worker_count;
    tokio::spawn(async move {
        run_job(&manager, runner, discoverer, job_id, worker_count).await;
    });
}

async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<JobCreate>,
) -> Result<Response, ApiError> {
    let input_config = body.input_config.unwrap_or_else(|| json!({}));
    let job = state
        .manager
        .create_job(
            &body.pipeline_type,
            body.mode.as_deref().unwrap_or("ingest"),
            &input_config,
        )
        .await?;
    state.manager.start_discovery(job.id).await?;
    dispatch_job(&state, job.id);

    let job_row = state
        .manager
        .get_job(job.id)
        .await?
        .ok_or_else(|| ApiError::not_found("Job not found", "JOB_NOT_FOUND"))?;
    let (items, _) = state.manager.get_job_items(job.id, 20).await?;

    let mut payload = json!(job_row);
    payload["items"] = items;
    Ok(Json(payload).into_response())
}

#[derive(Deserialize)]
struct ListJobsQuery {
    #[serde(default)]
    limit: Option<i64>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Response, ApiError> {
    let limit = q.limit.unwrap_or(20).clamp(1, 200);
    let (data, degraded) = state.manager.get_job_list(limit).await?;
    Ok(ops_json(data, degraded))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state
        .manager
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Job not found", "JOB_NOT_FOUND"))?;
    let (items, degraded) = state.manager.get_job_items(id, 20).await?;

    let mut payload = json!(job);
    payload["items"] = items;
    Ok(ops_json(payload, degraded))
}

#[derive(Deserialize)]
struct ItemsQuery {
    #[serde(default)]
    limit: Option<i64>,
}

async fn get_job_items(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<ItemsQuery>,
) -> Result<Response, ApiError> {
    let limit = q.limit.unwrap_or(100).clamp(1, 100);
    let (items, degraded) = state.manager.get_job_items(id, limit).await?;
    Ok(ops_json(items, degraded))
}

async fn get_job_summary(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let (summary, degraded) = state
        .manager
        .get_job_summary(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Job not found", "JOB_NOT_FOUND"))?;
    Ok(ops_json(summary, degraded))
}

// ---------------------------------------------------------------------------
// Posts & analysis
// ---------------------------------------------------------------------------

async fn list_posts(State(state): State<AppState>) -> Result<Response, ApiError> {
    let rows = state.store.list_recent_posts(20).await?;
    let degraded = rows.is_none();
    let posts: Vec<Value> = rows
        .unwrap_or_default()
        .iter()
        .map(|row| {
            let mut v = json!(row);
            v["snippet"] = json!(clean_snippet(row.post_text.as_deref().unwrap_or(""), 180));
            v["phenomenon"] = merge_phenomenon_meta(row);
            v
        })
        .collect();
    Ok(ops_json(json!(posts), degraded))
}

async fn get_analysis_json(
    State(state): State<AppState>,
    Path(post_id): Path<i64>,
) -> Result<Response, ApiError> {
    let post = state
        .store
        .get_post(post_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Post not found", "POST_NOT_FOUND"))?;

    let Some(analysis_json) = post.analysis_json else {
        return Err(ApiError::not_found(
            "analysis_json not available for this post",
            "ANALYSIS_NOT_FOUND",
        ));
    };

    Ok(Json(json!({
        "post_id": post.id,
        "analysis_json": analysis_json,
        "analysis_is_valid": post.analysis_is_valid,
        "analysis_invalid_reason": post.analysis_invalid_reason,
        "analysis_missing_keys": post.analysis_missing_keys,
        "analysis_version": post.analysis_version,
        "analysis_build_id": post.analysis_build_id,
    }))
    .into_response())
}

async fn get_analysis_report(
    State(state): State<AppState>,
    Path(post_id): Path<i64>,
) -> Result<Response, ApiError> {
    let post = state
        .store
        .get_post(post_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Post not found", "POST_NOT_FOUND"))?;

    let report = post
        .full_report
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ApiError::not_found("No report for this post", "REPORT_NOT_FOUND"))?;

    let mut res = report.into_response();
    res.headers_mut().insert(
        "Content-Type",
        HeaderValue::from_static("text/markdown; charset=utf-8"),
    );
    Ok(res)
}

// ---------------------------------------------------------------------------
// Comments
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CommentsQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    sort: Option<String>,
}

async fn comments_by_post(
    State(state): State<AppState>,
    Path(post_id): Path<i64>,
    Query(q): Query<CommentsQuery>,
) -> Result<Response, ApiError> {
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    let offset = q.offset.unwrap_or(0).max(0);
    let sort_by_likes = q.sort.as_deref().unwrap_or("likes") != "time";

    let rows = state
        .store
        .comments_by_post(post_id, limit, offset, sort_by_likes)
        .await?;
    let degraded = rows.is_none();
    Ok(ops_json(json!(rows.unwrap_or_default()), degraded))
}

#[derive(Deserialize)]
struct CommentSearchQuery {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    author_handle: Option<String>,
    #[serde(default)]
    post_id: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn comments_search(
    State(state): State<AppState>,
    Query(q): Query<CommentSearchQuery>,
) -> Result<Response, ApiError> {
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    let rows = state
        .store
        .comments_search(q.q.as_deref(), q.author_handle.as_deref(), q.post_id, limit)
        .await?;
    let degraded = rows.is_none();
    Ok(ops_json(json!(rows.unwrap_or_default()), degraded))
}

// ---------------------------------------------------------------------------
// Phenomenon library
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PhenomenaQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn list_phenomena(
    State(state): State<AppState>,
    Query(q): Query<PhenomenaQuery>,
) -> Result<Response, ApiError> {
    let limit = q.limit.unwrap_or(200).clamp(1, 500);
    let rows = state
        .store
        .list_phenomena(q.status.as_deref(), q.q.as_deref(), limit)
        .await?;
    let degraded = rows.is_none();
    let stats = state.store.phenomenon_post_stats().await.unwrap_or_default();

    let items: Vec<Value> = rows
        .unwrap_or_default()
        .iter()
        .map(|row| {
            let mut v = json!(row);
            let id = row.id.to_string();
            if let Some(s) = stats.get(&id) {
                v["total_posts"] = json!(s.total_posts);
                v["total_likes"] = json!(s.total_likes);
                v["last_seen_at"] = json!(s.last_seen_at);
            } else {
                v["total_posts"] = json!(0);
                v["total_likes"] = json!(0);
                v["last_seen_at"] = Value::Null;
            }
            v
        })
        .collect();
    Ok(ops_json(json!(items), degraded))
}

async fn get_phenomenon(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let row = state
        .store
        .get_phenomenon(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Phenomenon not found", "PHENOMENON_NOT_FOUND"))?;

    let posts = state
        .store
        .posts_for_phenomenon(&id.to_string(), 20)
        .await?
        .unwrap_or_default();
    let posts: Vec<Value> = posts
        .iter()
        .map(|p| {
            let mut v = json!(p);
            v["snippet"] = json!(clean_snippet(p.post_text.as_deref().unwrap_or(""), 180));
            v
        })
        .collect();

    let mut payload = json!(row);
    payload["recent_posts"] = json!(posts);
    Ok(Json(payload).into_response())
}

async fn promote_phenomenon(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let promoted = state.store.promote_phenomenon(id).await?;
    if !promoted {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "Phenomenon is not in a promotable state (expected provisional)",
        ));
    }
    Ok(Json(json!({"id": id, "status": "active"})).into_response())
}

// ---------------------------------------------------------------------------
// Legacy run endpoints
// ---------------------------------------------------------------------------

async fn run_default(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    start_legacy_run(state, "A", payload).await
}

async fn run_pipeline(
    State(state): State<AppState>,
    Path(pipeline): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    start_legacy_run(state, &pipeline, payload).await
}

async fn start_legacy_run(
    state: AppState,
    pipeline: &str,
    payload: Value,
) -> Result<Response, ApiError> {
    let mode = payload
        .get("mode")
        .and_then(Value::as_str)
        .unwrap_or("run")
        .to_string();
    let job = state.manager.create_job(pipeline, &mode, &payload).await?;
    state.manager.start_discovery(job.id).await?;
    dispatch_job(&state, job.id);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"job_id": job.id, "status": "accepted"})),
    )
        .into_response())
}
