pub mod backups;
pub mod system;
pub mod updates;

use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/system-info", get(system::system_info))
        .route("/api/backups", get(backups::list_backups))
        .route("/api/upload-update", post(updates::upload_update))
        .route("/api/apply-update", post(updates::apply_update))
        .route("/api/update-status/{job_id}", get(updates::update_status))
        .route("/api/update-stream/{job_id}", get(updates::update_stream))
        .route("/api/rollback/{job_id}", post(updates::rollback))
        .with_state(state)
}
