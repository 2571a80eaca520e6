//! Job records and the crash-safe state store.
//!
//! One JSON file per job under `<base>/state/jobs/`, written with the
//! temp-file + fsync + rename discipline so a job record is always parseable
//! after a host crash. A process-wide file lock under `<base>/state/.lock`
//! serializes engines across processes.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::config::JOB_LOG_CAP;
use crate::error::{EngineError, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::RolledBack
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreCheck,
    Action,
    PostCheck,
    Rollback,
    Done,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_actions: usize,
    pub completed_actions: usize,
    pub current_action_index: Option<usize>,
    pub current_action_name: Option<String>,
}

impl JobProgress {
    /// Percentage over actions; an empty action list reports 100% only once
    /// the job reached its done phase.
    pub fn percent(&self, phase: Phase) -> f64 {
        if self.total_actions == 0 {
            return if phase == Phase::Done { 100.0 } else { 0.0 };
        }
        (self.completed_actions as f64 / self.total_actions as f64) * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,
}

/// The engine's central entity: one update attempt, checkpointed to disk
/// after every state-changing step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub description: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    pub current_phase: Phase,
    pub backups_created: Vec<String>,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Time-ordered job id, unique per process lifetime.
pub fn next_job_id() -> String {
    let seq = JOB_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("job-{}-{:04}", Utc::now().format("%Y%m%dT%H%M%S"), seq)
}

impl Job {
    pub fn new(description: impl Into<String>, total_actions: usize) -> Self {
        Self {
            job_id: next_job_id(),
            status: JobStatus::Pending,
            description: description.into(),
            started_at: Utc::now(),
            ended_at: None,
            progress: JobProgress {
                total_actions,
                ..Default::default()
            },
            current_phase: Phase::PreCheck,
            backups_created: Vec::new(),
            logs: Vec::new(),
            error: None,
        }
    }

    /// Append to the bounded log ring.
    pub fn push_log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
        if self.logs.len() > JOB_LOG_CAP {
            let drop = self.logs.len() - JOB_LOG_CAP;
            self.logs.drain(..drop);
        }
    }

    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>, action_index: Option<usize>) {
        self.error = Some(JobError {
            kind,
            message: message.into(),
            action_index,
        });
    }
}

// ── Store ──

pub struct StateStore {
    jobs_dir: PathBuf,
}

impl StateStore {
    pub fn new(jobs_dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&jobs_dir)?;
        Ok(Self { jobs_dir })
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{}.json", job_id))
    }

    /// Atomically persist a job record: write `<id>.json.tmp`, fsync,
    /// rename over `<id>.json`, fsync the directory.
    pub fn save(&self, job: &Job) -> Result<()> {
        let path = self.job_path(&job.job_id);
        let tmp = path.with_extension("json.tmp");

        let data = serde_json::to_vec_pretty(job)
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        if let Ok(dir) = File::open(&self.jobs_dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    pub fn load(&self, job_id: &str) -> Result<Option<Job>> {
        let path = self.job_path(job_id);
        if !path.is_file() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        let job = serde_json::from_slice(&data)
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        Ok(Some(job))
    }

    /// All persisted jobs, newest first.
    pub fn list(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.jobs_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "json") != Some(true) {
                continue;
            }
            match fs::read(&path).ok().and_then(|d| serde_json::from_slice::<Job>(&d).ok()) {
                Some(job) => jobs.push(job),
                None => warn!("Skipping unreadable job record: {}", path.display()),
            }
        }
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(jobs)
    }

    /// Startup recovery: any job left in a non-terminal status is
    /// reclassified as failed/interrupted. The engine never resumes
    /// mid-action; the returned jobs are candidates for rollback when their
    /// recorded backups permit it.
    pub fn recover_interrupted(&self) -> Result<Vec<Job>> {
        let mut interrupted = Vec::new();
        for mut job in self.list()? {
            if job.status.is_terminal() {
                continue;
            }
            info!(
                "Found interrupted job {} (status {:?}), marking failed",
                job.job_id, job.status
            );
            job.status = JobStatus::Failed;
            job.ended_at = Some(Utc::now());
            job.fail(
                ErrorKind::Interrupted,
                "engine restarted while the job was in progress",
                job.progress.current_action_index,
            );
            job.push_log("job interrupted by engine restart".to_string());
            self.save(&job)?;
            interrupted.push(job);
        }
        Ok(interrupted)
    }
}

// ── Process lock ──

/// Exclusive advisory lock held for the lifetime of an engine process.
/// A second process attempting to start a job fails with `busy`.
pub struct ProcessLock {
    _file: File,
    path: PathBuf,
}

impl ProcessLock {
    pub fn acquire(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| EngineError::Busy)?;
        Ok(Self { _file: file, path })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        // The OS releases the lock on close; the file itself stays behind.
        tracing::debug!("Released process lock {}", self.path.display());
    }
}
