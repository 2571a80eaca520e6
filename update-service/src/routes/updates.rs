//! Update job endpoints: upload, start, stream, rollback.
//!
//! One job runs at a time; reads stay available while it does. The SSE
//! stream is fed from the engine's progress bus with the persisted snapshot
//! emitted first, so a late subscriber starts from current state.

use axum::extract::{Multipart, Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::state::AppState;
use update_engine::bootstrap::Bootstrap;
use update_engine::engine::UpdateEngine;
use update_engine::host::HostAdapters;
use update_engine::progress::JobEvent;
use update_engine::state::{Job, JobStatus, ProcessLock};
use update_engine::{EngineError, ErrorKind, Manifest};

// ── upload ──

#[derive(Serialize)]
pub struct UploadResponse {
    pub filename: String,
    pub size: u64,
}

pub async fn upload_update(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        let Some(filename) = field.file_name().map(sanitize_filename) else {
            continue;
        };
        if !filename.ends_with(".tar.gz") && !filename.ends_with(".tgz") {
            return Err(AppError::BadRequest(
                "invalid file type, expected .tar.gz".into(),
            ));
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("upload read failed: {}", e)))?;

        let path = state.config.engine.uploads_dir().join(&filename);
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| anyhow::anyhow!("failed to store upload: {}", e))?;

        info!("Uploaded package {} ({} bytes)", filename, data.len());
        return Ok(Json(UploadResponse {
            filename,
            size: data.len() as u64,
        }));
    }
    Err(AppError::BadRequest("no file field in upload".into()))
}

fn sanitize_filename(name: &str) -> String {
    std::path::Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.tar.gz".to_string())
}

// ── apply ──

#[derive(Deserialize)]
pub struct ApplyQuery {
    pub filename: String,
}

#[derive(Serialize)]
pub struct ApplyResponse {
    pub job_id: String,
}

pub async fn apply_update(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApplyQuery>,
) -> Result<Json<ApplyResponse>, AppError> {
    let package = state
        .config
        .engine
        .uploads_dir()
        .join(sanitize_filename(&query.filename));
    if !package.is_file() {
        return Err(AppError::NotFound("update package not found".into()));
    }

    // One job at a time, process-wide.
    let mut running = state.running_job.lock().await;
    if let Some(job_id) = running.as_ref() {
        return Err(AppError::Conflict(format!(
            "another update is already in progress ({})",
            job_id
        )));
    }

    // Stage and parse up front so the caller gets integrity/parse failures
    // synchronously instead of a doomed job id.
    let bootstrap = Bootstrap::new(state.config.engine.clone());
    let staged_root = {
        let bootstrap_package = package.clone();
        tokio::task::spawn_blocking(move || bootstrap.stage(&bootstrap_package))
            .await
            .map_err(|e| anyhow::anyhow!(e))?
            .map_err(engine_error_to_http)?
    };
    let manifest = Manifest::load(&staged_root).map_err(engine_error_to_http)?;

    let installed = Bootstrap::new(state.config.engine.clone()).installed_version();
    if installed < manifest.required_engine_version {
        let _ = std::fs::remove_dir_all(&staged_root);
        return Err(AppError::Unprocessable(format!(
            "package requires engine {} but {} is installed; apply via update-bootstrap",
            manifest.required_engine_version, installed
        )));
    }

    let job = Job::new(manifest.description.clone(), manifest.actions.len());
    let job_id = job.job_id.clone();
    state.store.save(&job).map_err(engine_error_to_http)?;
    *running = Some(job_id.clone());
    drop(running);

    let task_state = state.clone();
    let task_job_id = job_id.clone();
    tokio::spawn(async move {
        run_update_job(task_state.clone(), manifest, staged_root.clone(), job).await;
        let _ = std::fs::remove_dir_all(&staged_root);
        task_state.running_job.lock().await.take();
        info!("Update job {} finished", task_job_id);
    });

    Ok(Json(ApplyResponse { job_id }))
}

async fn run_update_job(
    state: Arc<AppState>,
    manifest: Manifest,
    staged_root: std::path::PathBuf,
    mut job: Job,
) {
    let lock = match ProcessLock::acquire(state.config.engine.lock_file()) {
        Ok(lock) => lock,
        Err(e) => {
            error!("Cannot acquire engine lock: {}", e);
            job.status = JobStatus::Failed;
            job.fail(ErrorKind::Busy, e.to_string(), None);
            let _ = state.store.save(&job);
            state.bus.publish(JobEvent::Complete(job));
            return;
        }
    };

    let engine = match UpdateEngine::new(
        state.config.engine.clone(),
        HostAdapters::real(),
        state.bus.clone(),
    ) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Engine init failed: {}", e);
            job.status = JobStatus::Failed;
            job.fail(e.kind(), e.to_string(), None);
            let _ = state.store.save(&job);
            state.bus.publish(JobEvent::Complete(job));
            return;
        }
    };

    if let Err(e) = engine.recover_on_startup(Some(&manifest)) {
        warn!("Startup recovery failed: {}", e);
    }

    match engine.run(&manifest, staged_root, job).await {
        Ok(job) => info!("Job {} ended with status {:?}", job.job_id, job.status),
        Err(e) => error!("Engine run failed: {}", e),
    }
    drop(lock);
}

fn engine_error_to_http(e: EngineError) -> AppError {
    match e.kind() {
        ErrorKind::Integrity | ErrorKind::ManifestParse => AppError::Unprocessable(e.to_string()),
        ErrorKind::Busy => AppError::Conflict(e.to_string()),
        _ => AppError::Internal(anyhow::anyhow!(e.to_string())),
    }
}

// ── status & stream ──

pub async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, AppError> {
    match state.store.load(&job_id).map_err(engine_error_to_http)? {
        Some(job) => Ok(Json(job)),
        None => Err(AppError::NotFound("job not found".into())),
    }
}

pub async fn update_stream(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let snapshot = state
        .store
        .load(&job_id)
        .map_err(engine_error_to_http)?
        .ok_or_else(|| AppError::NotFound("job not found".into()))?;

    // Subscribe before emitting the snapshot so no transition is lost in
    // between.
    let rx = state.bus.subscribe();

    let terminal = snapshot.status.is_terminal();
    let first = if terminal {
        sse_event("complete", &snapshot)
    } else {
        sse_event("status", &snapshot)
    };
    let head = stream::iter(vec![Ok::<_, Infallible>(first)]);

    let tail = stream::unfold(
        (rx, job_id, terminal),
        |(mut rx, job_id, done)| async move {
            if done {
                return None;
            }
            loop {
                match rx.recv().await {
                    Ok(event) if event.job_id() == job_id => {
                        let done = matches!(event, JobEvent::Complete(_));
                        let sse = match &event {
                            JobEvent::Status(job) => sse_event("status", job),
                            JobEvent::Complete(job) => sse_event("complete", job),
                            JobEvent::Log { line, .. } => {
                                Event::default().event("log").data(line.clone())
                            }
                        };
                        return Some((Ok(sse), (rx, job_id, done)));
                    }
                    Ok(_) => continue,
                    // A lagged subscriber is dropped rather than stalling
                    // the engine; the UI reconnects.
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("SSE subscriber for {} lagged by {}, dropping", job_id, skipped);
                        return None;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        },
    );

    Ok(Sse::new(head.chain(tail)).keep_alive(KeepAlive::default()))
}

fn sse_event(name: &str, job: &Job) -> Event {
    Event::default()
        .event(name)
        .data(serde_json::to_string(job).unwrap_or_else(|_| "{}".into()))
}

// ── rollback ──

#[derive(Serialize)]
pub struct RollbackResponse {
    pub message: String,
}

pub async fn rollback(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<RollbackResponse>, AppError> {
    let mut job = state
        .store
        .load(&job_id)
        .map_err(engine_error_to_http)?
        .ok_or_else(|| AppError::NotFound("job not found".into()))?;

    if job.status != JobStatus::Failed {
        return Err(AppError::Conflict(format!(
            "job is {:?}, only failed jobs can be rolled back",
            job.status
        )));
    }
    let Some(backup_id) = job.backups_created.last().cloned() else {
        return Err(AppError::Conflict("job has no backups to restore".into()));
    };

    let backups_dir = state.config.engine.backups_dir();
    let restore_result = tokio::task::spawn_blocking(move || {
        let manager = update_engine::backup::BackupManager::new(backups_dir)?;
        let record = manager
            .find(&backup_id)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?
            .ok_or_else(|| anyhow::anyhow!("backup {} is missing", backup_id))?;
        manager
            .restore(&record)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok::<_, anyhow::Error>(record.name)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))?;

    match restore_result {
        Ok(name) => {
            job.status = JobStatus::RolledBack;
            job.push_log(format!("manual rollback restored backup {}", name));
            state.store.save(&job).map_err(engine_error_to_http)?;
            state.bus.publish(JobEvent::Complete(job));
            info!("Manual rollback of job {} completed", job_id);
            Ok(Json(RollbackResponse {
                message: format!("rollback completed, restored backup {}", name),
            }))
        }
        Err(e) => {
            job.fail(ErrorKind::RollbackFailed, e.to_string(), None);
            job.push_log(format!("manual rollback failed: {}", e));
            let _ = state.store.save(&job);
            Err(AppError::Internal(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_strips_directories() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("update-1.2.tar.gz"), "update-1.2.tar.gz");
    }
}
