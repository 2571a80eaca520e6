//! In-process progress bus: a single writer (the engine), any number of
//! subscribers (the HTTP service's SSE streams).
//!
//! Events are delivered in emission order per subscriber. The per-subscriber
//! buffer is bounded; a subscriber that falls too far behind observes a lag
//! error and is expected to disconnect, which keeps a slow HTTP client from
//! ever stalling the engine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::state::Job;

/// Per-subscriber buffered events before overflow drops the subscriber.
const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum JobEvent {
    /// Snapshot emitted on every status or progress transition.
    Status(Job),
    /// One human-readable log line.
    Log { job_id: String, line: String },
    /// Final snapshot; the job is terminal after this.
    Complete(Job),
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Status(job) | JobEvent::Complete(job) => &job.job_id,
            JobEvent::Log { job_id, .. } => job_id,
        }
    }
}

#[derive(Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<JobEvent>,
}

impl ProgressBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. A send with no subscribers is not an error; the
    /// engine must make progress whether or not anyone is watching.
    pub fn publish(&self, event: JobEvent) {
        match self.tx.send(event) {
            Ok(n) => debug!("Published job event to {} subscriber(s)", n),
            Err(_) => debug!("Published job event with no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Log fan-out for one job: every line goes to the tracing log, the bus and
/// a bounded in-memory ring the orchestrator copies into the job record at
/// each checkpoint.
#[derive(Clone)]
pub struct LogSink {
    job_id: String,
    bus: ProgressBus,
    ring: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    cap: usize,
}

impl LogSink {
    pub fn new(job_id: impl Into<String>, bus: ProgressBus, cap: usize) -> Self {
        Self {
            job_id: job_id.into(),
            bus,
            ring: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
            cap,
        }
    }

    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(job_id = %self.job_id, "{}", line);
        {
            let mut ring = self.ring.lock().expect("log ring poisoned");
            ring.push(line.clone());
            if ring.len() > self.cap {
                let drop = ring.len() - self.cap;
                ring.drain(..drop);
            }
        }
        self.bus.publish(JobEvent::Log {
            job_id: self.job_id.clone(),
            line,
        });
    }

    /// Current ring contents, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.ring.lock().expect("log ring poisoned").clone()
    }
}
