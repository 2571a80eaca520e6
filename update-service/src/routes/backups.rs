//! Read-only backup listing; records are finalized by the engine, so these
//! stay consistent while a job runs.

use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use update_engine::backup::BackupManager;

#[derive(Serialize)]
pub struct BackupInfo {
    pub name: String,
    pub created_at: String,
    pub sources: Vec<String>,
}

pub async fn list_backups(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BackupInfo>>, AppError> {
    let backups_dir = state.config.engine.backups_dir();
    let records = tokio::task::spawn_blocking(move || {
        let manager = BackupManager::new(backups_dir)?;
        manager.list().map_err(|e| anyhow::anyhow!(e.to_string()))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let infos = records
        .into_iter()
        .map(|r| BackupInfo {
            name: r.name,
            created_at: r.created_at.to_rfc3339(),
            sources: r
                .sources
                .iter()
                .map(|s| s.original_path.display().to_string())
                .collect(),
        })
        .collect();

    Ok(Json(infos))
}
