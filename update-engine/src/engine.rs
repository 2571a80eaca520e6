//! The update engine orchestrator.
//!
//! Drives one job through pre_check → actions → post_check → cleanup,
//! checkpointing the job record after every state-changing step and
//! emitting progress on the bus. Any failure after the first mutation can
//! enter rollback when the manifest permits it.

use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::actions::{execute_action, ActionContext};
use crate::backup::BackupManager;
use crate::checks::execute_check;
use crate::config::{Config, JOB_LOG_CAP};
use crate::error::{EngineError, ErrorKind, Result};
use crate::host::HostAdapters;
use crate::manifest::{ActionSpec, CheckSpec, Manifest};
use crate::progress::{JobEvent, LogSink, ProgressBus};
use crate::state::{Job, JobStatus, Phase, StateStore};

pub struct UpdateEngine {
    config: Config,
    state: StateStore,
    backups: BackupManager,
    host: HostAdapters,
    bus: ProgressBus,
    cancel: CancellationToken,
}

/// Which phase a failure occurred in; decides the error kind and whether
/// rollback applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailurePhase {
    Action,
    PostCheck,
}

impl UpdateEngine {
    pub fn new(config: Config, host: HostAdapters, bus: ProgressBus) -> Result<Self> {
        config.ensure_layout()?;
        let state = StateStore::new(config.jobs_dir())?;
        let backups = BackupManager::new(config.backups_dir())?;
        backups.gc_temp()?;
        Ok(Self {
            config,
            state,
            backups,
            host,
            bus,
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    pub fn backup_manager(&self) -> &BackupManager {
        &self.backups
    }

    /// Startup recovery: reclassify interrupted jobs and, when the given
    /// manifest enables auto-rollback and the job recorded backups, restore
    /// the most recent one.
    pub fn recover_on_startup(&self, manifest: Option<&Manifest>) -> Result<()> {
        for mut job in self.state.recover_interrupted()? {
            let auto = manifest
                .map(|m| m.rollback.enabled && m.rollback.auto_on_failure)
                .unwrap_or(false);
            if !auto || job.backups_created.is_empty() {
                continue;
            }
            info!("Rolling back interrupted job {}", job.job_id);
            match self.restore_job_backup(&job) {
                Ok(()) => {
                    job.status = JobStatus::RolledBack;
                    job.push_log("interrupted job rolled back on startup");
                }
                Err(e) => {
                    error!("Rollback of interrupted job {} failed: {}", job.job_id, e);
                    job.fail(ErrorKind::RollbackFailed, e.to_string(), None);
                    job.push_log(format!("rollback failed: {}", e));
                }
            }
            self.state.save(&job)?;
        }
        Ok(())
    }

    /// Run one update job to a terminal status. The returned job snapshot
    /// equals the persisted record.
    pub async fn run(&self, manifest: &Manifest, staged_root: PathBuf, mut job: Job) -> Result<Job> {
        let sink = LogSink::new(job.job_id.clone(), self.bus.clone(), JOB_LOG_CAP);

        job.status = JobStatus::Running;
        job.current_phase = Phase::PreCheck;
        self.checkpoint(&mut job, &sink)?;
        sink.log(format!("update started: {}", manifest.description));

        // ── pre-checks: nothing has mutated yet, so a failure aborts
        // without rollback.
        if let Err(diag) = self.run_checks(&manifest.pre_checks, "pre-check", &sink).await {
            job.fail(ErrorKind::PrecheckFailed, diag.clone(), None);
            return self.finish_failed(manifest, job, sink, None).await;
        }

        // ── actions, in declared order.
        job.current_phase = Phase::Action;
        self.checkpoint(&mut job, &sink)?;

        let failure = self
            .run_actions(manifest, &staged_root, &mut job, &sink)
            .await?;

        let failure = match failure {
            Some(f) => Some((f, FailurePhase::Action)),
            None => {
                // ── post-checks.
                job.current_phase = Phase::PostCheck;
                job.progress.current_action_index = None;
                job.progress.current_action_name = None;
                self.checkpoint(&mut job, &sink)?;
                match self.run_checks(&manifest.post_checks, "post-check", &sink).await {
                    Ok(()) => None,
                    Err(diag) => Some((diag, FailurePhase::PostCheck)),
                }
            }
        };

        if let Some((message, phase)) = failure {
            let (kind, action_index) = match phase {
                FailurePhase::Action => (ErrorKind::ActionFailed, job.progress.current_action_index),
                FailurePhase::PostCheck => (ErrorKind::PostcheckFailed, None),
            };
            job.fail(kind, message, action_index);
            let wants_rollback = manifest.rollback.enabled && manifest.rollback.auto_on_failure;
            return self
                .finish_failed(manifest, job, sink, wants_rollback.then_some(staged_root))
                .await;
        }

        // ── success: cleanup is best-effort and never changes the outcome.
        self.run_cleanup(manifest, &sink).await;

        job.status = JobStatus::Completed;
        job.current_phase = Phase::Done;
        job.ended_at = Some(chrono::Utc::now());
        sink.log("update completed successfully");
        self.checkpoint(&mut job, &sink)?;
        self.bus.publish(JobEvent::Complete(job.clone()));
        Ok(job)
    }

    async fn run_checks(
        &self,
        checks: &[CheckSpec],
        what: &str,
        sink: &LogSink,
    ) -> std::result::Result<(), String> {
        if checks.is_empty() {
            sink.log(format!("no {}s defined", what));
            return Ok(());
        }
        for (i, check) in checks.iter().enumerate() {
            sink.log(format!(
                "{} {}/{}: {}",
                what,
                i + 1,
                checks.len(),
                check.type_name()
            ));
            let outcome = execute_check(check, &self.host, &self.cancel).await;
            if outcome.ok {
                sink.log(format!("{} passed: {}", what, outcome.diagnostic));
            } else {
                sink.log(format!("{} failed: {}", what, outcome.diagnostic));
                return Err(format!("{} ({}): {}", what, check.type_name(), outcome.diagnostic));
            }
        }
        Ok(())
    }

    /// Execute the action list. Returns the failure message of the first
    /// non-continuable failure, or None when every action succeeded.
    async fn run_actions(
        &self,
        manifest: &Manifest,
        staged_root: &std::path::Path,
        job: &mut Job,
        sink: &LogSink,
    ) -> Result<Option<String>> {
        if manifest.actions.is_empty() {
            sink.log("no actions defined");
            return Ok(None);
        }

        for (index, action) in manifest.actions.iter().enumerate() {
            job.progress.current_action_index = Some(index);
            job.progress.current_action_name = Some(action.name().to_string());
            self.checkpoint(job, sink)?;
            sink.log(format!(
                "action {}/{}: {}",
                index + 1,
                manifest.actions.len(),
                action.name()
            ));

            let ctx = ActionContext {
                staged_root,
                backups: &self.backups,
                host: &self.host,
                cancel: &self.cancel,
                sink,
                job_id: &job.job_id,
                action_index: index,
            };

            match execute_action(action, &ctx).await {
                Ok(created) => {
                    if let Some(record) = created {
                        job.backups_created.push(record.id);
                    }
                    job.progress.completed_actions += 1;
                    job.progress.current_action_index = Some(index);
                    self.checkpoint(job, sink)?;
                    sink.log(format!("action completed: {}", action.name()));
                }
                Err(e) if action.continue_on_error => {
                    warn!("Action {} failed but continue_on_error is set: {}", action.name(), e);
                    sink.log(format!(
                        "action failed (continuing): {}: {}",
                        action.name(),
                        e
                    ));
                    job.progress.completed_actions += 1;
                    self.checkpoint(job, sink)?;
                }
                Err(e) => {
                    sink.log(format!("action failed: {}: {}", action.name(), e));
                    return Ok(Some(format!("{}: {}", action.name(), e)));
                }
            }
        }
        Ok(None)
    }

    /// Drive a failing job to its terminal status, rolling back when asked.
    async fn finish_failed(
        &self,
        manifest: &Manifest,
        mut job: Job,
        sink: LogSink,
        rollback_with_staged: Option<PathBuf>,
    ) -> Result<Job> {
        if let Some(staged_root) = rollback_with_staged {
            job.status = JobStatus::RollingBack;
            job.current_phase = Phase::Rollback;
            self.checkpoint(&mut job, &sink)?;
            sink.log("starting rollback");

            match self.rollback(manifest, &staged_root, &mut job, &sink).await {
                Ok(()) => {
                    job.status = JobStatus::RolledBack;
                    sink.log("rollback completed");
                }
                Err(e) => {
                    error!("Rollback failed for job {}: {}", job.job_id, e);
                    job.status = JobStatus::Failed;
                    job.fail(ErrorKind::RollbackFailed, e.to_string(), None);
                    sink.log(format!("rollback failed: {}", e));
                }
            }
        } else {
            job.status = JobStatus::Failed;
        }

        job.ended_at = Some(chrono::Utc::now());
        self.checkpoint(&mut job, &sink)?;
        self.bus.publish(JobEvent::Complete(job.clone()));
        Ok(job)
    }

    /// Execute explicit rollback steps, or restore this job's most recent
    /// backup when none are declared. A failure here is fatal; rollback is
    /// itself never rolled back.
    async fn rollback(
        &self,
        manifest: &Manifest,
        staged_root: &std::path::Path,
        job: &mut Job,
        sink: &LogSink,
    ) -> std::result::Result<(), EngineError> {
        match &manifest.rollback.steps {
            Some(steps) if !steps.is_empty() => {
                self.run_rollback_steps(steps, staged_root, job, sink).await
            }
            _ => {
                sink.log("no rollback steps declared, restoring most recent backup");
                self.restore_job_backup(job)
            }
        }
    }

    async fn run_rollback_steps(
        &self,
        steps: &[ActionSpec],
        staged_root: &std::path::Path,
        job: &mut Job,
        sink: &LogSink,
    ) -> std::result::Result<(), EngineError> {
        for (index, step) in steps.iter().enumerate() {
            sink.log(format!("rollback step {}/{}: {}", index + 1, steps.len(), step.name()));
            let ctx = ActionContext {
                staged_root,
                backups: &self.backups,
                host: &self.host,
                cancel: &self.cancel,
                sink,
                job_id: &job.job_id,
                action_index: index,
            };
            match execute_action(step, &ctx).await {
                Ok(_) => {}
                Err(e) if step.continue_on_error => {
                    warn!(
                        "Rollback step {} failed but continue_on_error is set: {}",
                        step.name(),
                        e
                    );
                    sink.log(format!(
                        "rollback step failed (continuing): {}: {}",
                        step.name(),
                        e
                    ));
                }
                Err(e) => {
                    return Err(EngineError::RollbackFailed(format!(
                        "step {} ({}): {}",
                        index + 1,
                        step.name(),
                        e
                    )));
                }
            }
        }
        Ok(())
    }

    /// Restore the most recent backup created by this job.
    fn restore_job_backup(&self, job: &Job) -> std::result::Result<(), EngineError> {
        let backup_id = job
            .backups_created
            .last()
            .ok_or_else(|| EngineError::RollbackFailed("job created no backups".into()))?;
        let record = self
            .backups
            .find(backup_id)?
            .ok_or_else(|| EngineError::RollbackFailed(format!("backup {} is missing", backup_id)))?;
        self.backups.restore(&record)
    }

    /// Cleanup after a successful job: retention, temp note, image prune.
    /// Not transactional; failures log but never affect the job outcome.
    async fn run_cleanup(&self, manifest: &Manifest, sink: &LogSink) {
        let cleanup = &manifest.cleanup;
        if cleanup.remove_old_backups {
            match self.backups.cleanup_old(cleanup.keep_last_n) {
                Ok(removed) => sink.log(format!(
                    "backup retention applied (keep {}): removed {}",
                    cleanup.keep_last_n, removed
                )),
                Err(e) => warn!("Backup cleanup failed: {}", e),
            }
        }
        if cleanup.remove_temp_files {
            // The staged tree is owned and removed by the caller that staged
            // it; note the request so the log explains the eventual removal.
            sink.log(format!(
                "temp files under {} will be removed after the job",
                self.config.tmp_dir().display()
            ));
        }
        if cleanup.remove_old_images {
            match self.host.containers.prune_images(false, true).await {
                Ok(_) => sink.log("pruned unused container images"),
                Err(e) => warn!("Image prune failed: {}", e),
            }
        }
    }

    /// Persist the job record with the current log ring. The on-disk state
    /// is always either just-before or just-after the step that called this.
    fn checkpoint(&self, job: &mut Job, sink: &LogSink) -> Result<()> {
        job.logs = sink.snapshot();
        self.state.save(job)?;
        self.bus.publish(JobEvent::Status(job.clone()));
        Ok(())
    }
}
