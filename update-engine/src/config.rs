//! Engine configuration: the on-disk base directory layout.
//!
//! Everything the updater persists lives under a single base directory
//! (default `/opt/updater`), overridable with `UPDATER_BASE_DIR`.

use std::path::{Path, PathBuf};

pub const DEFAULT_BASE_DIR: &str = "/opt/updater";
pub const BASE_DIR_ENV: &str = "UPDATER_BASE_DIR";

/// Maximum log lines retained per job record.
pub const JOB_LOG_CAP: usize = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let base_dir = std::env::var(BASE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_BASE_DIR));
        Self { base_dir }
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join("state")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.state_dir().join("jobs")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir().join(".lock")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base_dir.join("backups")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.base_dir.join("uploads")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.base_dir.join("tmp")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Versioned engine installs: `update-engines/v<semver>/`.
    pub fn engines_dir(&self) -> PathBuf {
        self.base_dir.join("update-engines")
    }

    /// Symlink to the active engine install.
    pub fn current_engine_link(&self) -> PathBuf {
        self.engines_dir().join("current")
    }

    /// Create the directory tree. Idempotent.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.jobs_dir(),
            self.backups_dir(),
            self.uploads_dir(),
            self.tmp_dir(),
            self.logs_dir(),
            self.engines_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Resolve a package-relative path against the staged tree.
pub fn staged_path(staged_root: &Path, rel: &Path) -> PathBuf {
    if rel.is_absolute() {
        rel.to_path_buf()
    } else {
        staged_root.join(rel)
    }
}
