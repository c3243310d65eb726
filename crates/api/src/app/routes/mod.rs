use axum::Router;

pub mod batch;
pub mod system;

/// Router for all engine endpoints.
pub fn router() -> Router {
    Router::new().nest("/batch-analysis", batch::router())
}
