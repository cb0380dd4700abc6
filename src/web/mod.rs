use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{ErrorKind, SchedulerError};
use crate::scheduler::{Application, Container, Job, Resources};
use crate::service::{JobList, JobService, SandboxDir, SandboxFile};

/// Header carrying the requester identity. Verifying it is up to whatever
/// sits in front of this server.
pub const REQUESTER_HEADER: &str = "x-batchq-key";

#[derive(Debug)]
pub enum ApiError {
    MissingRequester,
    Scheduler(SchedulerError),
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        ApiError::Scheduler(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::MissingRequester => (
                StatusCode::UNAUTHORIZED,
                format!("missing {} header", REQUESTER_HEADER),
            ),
            ApiError::Scheduler(e) => {
                let status = match e.kind() {
                    ErrorKind::Client => StatusCode::BAD_REQUEST,
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::Unavailable => {
                        tracing::error!(error = %e, "Request failed, scheduler unavailable");
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    ErrorKind::Internal => {
                        tracing::error!(error = %e, "Request failed");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn requester(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(REQUESTER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::MissingRequester)
}

#[derive(Debug, Deserialize)]
struct LoadAppRequest {
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    container: Container,
    #[serde(default)]
    default_resources: Option<Resources>,
}

#[derive(Debug, Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    appid: String,
    command: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    resources: Resources,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    retry: u32,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: i64,
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    #[serde(default)]
    path: String,
    #[serde(default)]
    offset: u64,
    #[serde(default = "whole_file")]
    length: i64,
}

fn whole_file() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
struct DirQuery {
    #[serde(default)]
    path: String,
}

#[derive(Serialize)]
struct CancelResponse {
    job_id: u64,
    cancelled: bool,
}

pub fn router(service: JobService) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/app/{appid}", put(load_app_handler).get(get_app_handler))
        .route("/app/{appid}/enabled", post(set_enabled_handler))
        .route("/apps", get(list_apps_handler))
        .route("/job", post(schedule_handler))
        .route("/job/{id}", get(get_job_handler).delete(cancel_handler))
        .route("/job/{id}/file", get(get_file_handler))
        .route("/job/{id}/dir", get(list_dir_handler))
        .route("/jobs", get(list_jobs_handler))
        .route("/status", get(status_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve the HTTP API until `token` is cancelled.
pub async fn run_web(
    addr: SocketAddr,
    service: JobService,
    token: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP API listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

async fn load_app_handler(
    State(service): State<JobService>,
    Path(appid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<LoadAppRequest>,
) -> ApiResult<Application> {
    let owner = requester(&headers)?;
    let mut app = Application::new(appid, owner.clone()).with_container(body.container);
    app.files = body.files;
    app.default_resources = body.default_resources;
    Ok(Json(service.load_app(&owner, app)?))
}

async fn get_app_handler(
    State(service): State<JobService>,
    Path(appid): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Application> {
    let owner = requester(&headers)?;
    Ok(Json(service.get_app(&owner, &appid)?))
}

async fn list_apps_handler(
    State(service): State<JobService>,
    headers: HeaderMap,
) -> ApiResult<Vec<Application>> {
    let owner = requester(&headers)?;
    Ok(Json(service.list_apps(&owner)?))
}

async fn set_enabled_handler(
    State(service): State<JobService>,
    Path(appid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<EnabledRequest>,
) -> ApiResult<Application> {
    let owner = requester(&headers)?;
    Ok(Json(service.set_app_enabled(&owner, &appid, body.enabled)?))
}

async fn schedule_handler(
    State(service): State<JobService>,
    headers: HeaderMap,
    Json(body): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let owner = requester(&headers)?;
    let mut job = Job::new(body.appid, body.command, body.resources);
    if let Some(name) = body.name {
        job = job.with_name(name);
    }
    job.priority = body.priority;
    job.retry = body.retry;
    let job = service.schedule(&owner, job).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs_handler(
    State(service): State<JobService>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> ApiResult<JobList> {
    let owner = requester(&headers)?;
    Ok(Json(service.list(&owner, query.limit).await?))
}

async fn get_job_handler(
    State(service): State<JobService>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> ApiResult<Job> {
    let owner = requester(&headers)?;
    match service.get_job(&owner, id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(SchedulerError::job_not_found(id).into()),
    }
}

async fn get_file_handler(
    State(service): State<JobService>,
    Path(id): Path<u64>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> ApiResult<SandboxFile> {
    let owner = requester(&headers)?;
    let file = service
        .get_file(&owner, id, &query.path, query.offset, query.length)
        .await?;
    Ok(Json(file))
}

async fn list_dir_handler(
    State(service): State<JobService>,
    Path(id): Path<u64>,
    Query(query): Query<DirQuery>,
    headers: HeaderMap,
) -> ApiResult<SandboxDir> {
    let owner = requester(&headers)?;
    Ok(Json(service.list_dir(&owner, id, &query.path).await?))
}

async fn cancel_handler(
    State(service): State<JobService>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> ApiResult<CancelResponse> {
    let owner = requester(&headers)?;
    let cancelled = service.cancel(&owner, id).await?;
    Ok(Json(CancelResponse {
        job_id: id,
        cancelled,
    }))
}

async fn status_handler(State(service): State<JobService>) -> impl IntoResponse {
    Json(service.status().await)
}
