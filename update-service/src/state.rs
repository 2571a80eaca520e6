use crate::config::AppConfig;
use std::sync::Arc;
use tokio::sync::Mutex;
use update_engine::backup::BackupManager;
use update_engine::progress::ProgressBus;
use update_engine::state::StateStore;

pub struct AppState {
    pub config: AppConfig,
    pub bus: ProgressBus,
    pub store: StateStore,
    pub backups: BackupManager,
    /// job_id of the running job; one update at a time, process-wide.
    pub running_job: Arc<Mutex<Option<String>>>,
}

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        config.engine.ensure_layout()?;
        let store = StateStore::new(config.engine.jobs_dir())?;
        let backups = BackupManager::new(config.engine.backups_dir())?;
        Ok(Self {
            config,
            bus: ProgressBus::new(),
            store,
            backups,
            running_job: Arc::new(Mutex::new(None)),
        })
    }
}
