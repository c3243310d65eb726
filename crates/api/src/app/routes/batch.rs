//! Batch analysis endpoints: start, observe, cancel, resume.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::info;

use recap_core::{JobId, TaskId};

use crate::app::dto::{
    CancelResponse, JobAccepted, JobListResponse, JobView, SingleAnalysisRequest,
    StartBatchRequest,
};
use crate::app::errors::{control_error_to_response, parse_id};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/single", post(analyze_single))
        .route("/defaults", get(defaults))
        .route("/jobs/:task_id", get(list_jobs))
        .route("/:job_id/status", get(status))
        .route("/:job_id/cancel", post(cancel))
        .route("/:job_id/resume", post(resume))
}

/// POST /batch-analysis/start
pub async fn start(
    Extension(services): Extension<Arc<AppServices>>,
    Json(req): Json<StartBatchRequest>,
) -> axum::response::Response {
    let task_id: TaskId = match parse_id(&req.task_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.jobs.create_job(task_id, req.to_config()).await {
        Ok(job) => {
            info!(job_id = %job.id, task_id = %task_id, kind = job.config.kind.as_str(), "batch job accepted");
            (
                StatusCode::ACCEPTED,
                Json(JobAccepted::new(&job, "batch analysis started")),
            )
                .into_response()
        }
        Err(e) => control_error_to_response(e),
    }
}

/// GET /batch-analysis/:job_id/status
pub async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match parse_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.jobs.get_job(job_id).await {
        Ok(job) => Json(JobView::from(job)).into_response(),
        Err(e) => control_error_to_response(e),
    }
}

/// POST /batch-analysis/:job_id/cancel
///
/// Cancellation is cooperative: the job reaches CANCELLED once in-flight
/// calls return.
pub async fn cancel(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match parse_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.jobs.cancel(job_id).await {
        Ok(job) => Json(CancelResponse {
            job_id,
            status: job.status,
            message: "cancellation requested",
        })
        .into_response(),
        Err(e) => control_error_to_response(e),
    }
}

/// POST /batch-analysis/:job_id/resume
pub async fn resume(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match parse_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.jobs.resume(job_id).await {
        Ok(job) => (
            StatusCode::ACCEPTED,
            Json(JobAccepted::new(&job, "batch analysis resumed")),
        )
            .into_response(),
        Err(e) => control_error_to_response(e),
    }
}

/// GET /batch-analysis/jobs/:task_id
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(task_id): Path<String>,
) -> axum::response::Response {
    let task_id: TaskId = match parse_id(&task_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.jobs.list_jobs(task_id).await {
        Ok(jobs) => Json(JobListResponse {
            task_id,
            jobs: jobs.into_iter().map(JobView::from).collect(),
        })
        .into_response(),
        Err(e) => control_error_to_response(e),
    }
}

/// POST /batch-analysis/single
pub async fn analyze_single(
    Extension(services): Extension<Arc<AppServices>>,
    Json(req): Json<SingleAnalysisRequest>,
) -> axum::response::Response {
    let task_id: TaskId = match parse_id(&req.task_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services
        .jobs
        .analyze_single(task_id, req.record_id, req.instructions, req.model)
        .await
    {
        Ok(analysis) => Json(analysis).into_response(),
        Err(e) => control_error_to_response(e),
    }
}

/// GET /batch-analysis/defaults
pub async fn defaults(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(services.jobs.defaults())
}
