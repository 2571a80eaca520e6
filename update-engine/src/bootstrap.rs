//! Bootstrap: stage a package, pick the engine that executes it, forward
//! the outcome as a process exit code.
//!
//! The two-stage self-update handshake: when the package requires a newer
//! engine than the one installed, and the package bundles one under
//! `update_engine/` with a valid `CHECKSUM`, the bootstrap re-executes the
//! bundled binary against the same staged tree. The bundled engine's own
//! action list is expected to install itself under
//! `update-engines/v<version>/` and swap the `current` symlink.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::archive::extract_tar_gz;
use crate::checksum::{parse_md5_manifest, verify_tree};
use crate::config::Config;
use crate::engine::UpdateEngine;
use crate::error::{exit, EngineError, Result};
use crate::host::HostAdapters;
use crate::manifest::Manifest;
use crate::progress::ProgressBus;
use crate::state::{Job, JobStatus, ProcessLock};
use crate::version::Version;

/// Name of the bundled engine directory inside a package.
pub const BUNDLED_ENGINE_DIR: &str = "update_engine";
/// Name of the engine binary inside an engine install.
pub const ENGINE_BINARY: &str = "update-bootstrap";

pub struct Bootstrap {
    config: Config,
    own_version: Version,
}

impl Bootstrap {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            own_version: Version::current(),
        }
    }

    /// Override the version this bootstrap reports for itself; the normal
    /// constructor uses the build version.
    pub fn with_version(config: Config, own_version: Version) -> Self {
        Self { config, own_version }
    }

    /// Full run: stage, verify, handshake, execute. Returns the CLI exit code.
    pub async fn run(&self, package: &Path) -> i32 {
        match self.try_run(package).await {
            Ok(code) => code,
            Err(e) => {
                error!("Bootstrap failed: {}", e);
                exit_code_for(&e)
            }
        }
    }

    async fn try_run(&self, package: &Path) -> Result<i32> {
        self.config.ensure_layout()?;

        let staged_root = self.stage(package)?;
        let result = self.dispatch(&staged_root).await;

        // The staged tree belongs to this invocation; a re-exec'd engine has
        // finished with it by the time dispatch returns.
        if let Err(e) = std::fs::remove_dir_all(&staged_root) {
            warn!("Failed to remove staged tree {}: {}", staged_root.display(), e);
        }
        result
    }

    /// Run against a tree staged (and integrity-checked) by an earlier
    /// bootstrap stage; used by the `--staged-root` handoff.
    pub async fn run_staged(&self, staged_root: &Path) -> i32 {
        let result = async {
            self.config.ensure_layout()?;
            let manifest = Manifest::load(staged_root)?;
            self.run_engine(manifest, staged_root).await
        }
        .await;
        match result {
            Ok(code) => code,
            Err(e) => {
                error!("Bootstrap failed: {}", e);
                exit_code_for(&e)
            }
        }
    }

    /// Extract and integrity-check the package. Returns the staged root.
    pub fn stage(&self, package: &Path) -> Result<PathBuf> {
        let staged_root = self
            .config
            .tmp_dir()
            .join(format!("staged-{}", Utc::now().format("%Y%m%dT%H%M%S%3f")));
        extract_tar_gz(package, &staged_root)?;

        let checksums = staged_root.join("checksums.md5");
        if !checksums.is_file() {
            return Err(EngineError::Integrity("package has no checksums.md5".into()));
        }
        let entries = parse_md5_manifest(&checksums)?;
        verify_tree(&staged_root, &entries)?;
        info!("Package integrity verified ({} files)", entries.len());

        Ok(staged_root)
    }

    async fn dispatch(&self, staged_root: &Path) -> Result<i32> {
        let manifest = Manifest::load(staged_root)?;
        let required = manifest.required_engine_version;
        let installed = self.installed_version();

        info!(
            "Engine versions: installed {}, required {}, self {}",
            installed, required, self.own_version
        );

        if installed >= required {
            if installed > self.own_version {
                // A newer engine is installed; this binary is only the
                // first stage.
                let binary = self.installed_engine_binary();
                if binary.is_file() {
                    return self.reexec(&binary, staged_root);
                }
                warn!(
                    "current engine symlink claims {} but {} is missing; running in-process",
                    installed,
                    binary.display()
                );
            }
            return self.run_engine(manifest, staged_root).await;
        }

        // Engine too old: hand off to a bundled engine when the package
        // carries one.
        let bundled = staged_root.join(BUNDLED_ENGINE_DIR);
        if !bundled.is_dir() {
            return Err(EngineError::EngineTooOld {
                required: required.to_string(),
                installed: installed.to_string(),
            });
        }

        let checksum_file = bundled.join("CHECKSUM");
        if !checksum_file.is_file() {
            return Err(EngineError::Integrity(
                "bundled engine has no CHECKSUM file".into(),
            ));
        }
        let entries = parse_md5_manifest(&checksum_file)?;
        verify_tree(&bundled, &entries)?;
        info!("Bundled engine verified ({} files)", entries.len());

        let binary = bundled.join(ENGINE_BINARY);
        if !binary.is_file() {
            return Err(EngineError::Integrity(format!(
                "bundled engine binary missing: {}",
                binary.display()
            )));
        }
        self.reexec(&binary, staged_root)
    }

    /// Version of the engine addressed by the `current` symlink, falling
    /// back to this binary's version when no install exists.
    pub fn installed_version(&self) -> Version {
        let link = self.config.current_engine_link();
        let target = match std::fs::read_link(&link) {
            Ok(t) => t,
            Err(_) => return self.own_version,
        };
        target
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix('v'))
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.own_version)
    }

    fn installed_engine_binary(&self) -> PathBuf {
        self.config.current_engine_link().join(ENGINE_BINARY)
    }

    /// Run another engine binary against an already-staged tree, forwarding
    /// its exit code.
    fn reexec(&self, binary: &Path, staged_root: &Path) -> Result<i32> {
        info!("Handing off to engine {}", binary.display());
        let status = std::process::Command::new(binary)
            .arg("--staged-root")
            .arg(staged_root)
            .env(crate::config::BASE_DIR_ENV, &self.config.base_dir)
            .status()?;
        Ok(status.code().unwrap_or(exit::JOB_FAILED))
    }

    /// Run the in-process engine over a staged tree that already passed
    /// integrity checks. Public so the HTTP service and the second stage of
    /// a re-exec can drive the same path.
    pub async fn run_engine(&self, manifest: Manifest, staged_root: &Path) -> Result<i32> {
        let _lock = ProcessLock::acquire(self.config.lock_file())?;

        let bus = ProgressBus::new();
        let engine = UpdateEngine::new(self.config.clone(), HostAdapters::real(), bus)?;
        engine.recover_on_startup(Some(&manifest))?;

        let job = Job::new(manifest.description.clone(), manifest.actions.len());
        let job = engine.run(&manifest, staged_root.to_path_buf(), job).await?;
        Ok(job_exit_code(&job))
    }
}

pub fn job_exit_code(job: &Job) -> i32 {
    match job.status {
        JobStatus::Completed => exit::SUCCESS,
        JobStatus::RolledBack => exit::JOB_FAILED,
        _ => match job.error.as_ref().map(|e| e.kind) {
            Some(crate::error::ErrorKind::RollbackFailed) => exit::ROLLBACK_FAILED,
            _ => exit::JOB_FAILED,
        },
    }
}

pub fn exit_code_for(err: &EngineError) -> i32 {
    match err {
        EngineError::Integrity(_) | EngineError::ManifestParse(_) => exit::INTEGRITY,
        EngineError::EngineTooOld { .. } => exit::ENGINE_TOO_OLD,
        EngineError::Busy => exit::BUSY,
        EngineError::RollbackFailed(_) => exit::ROLLBACK_FAILED,
        _ => exit::JOB_FAILED,
    }
}

/// Atomically repoint `update-engines/current` at `v<version>`: create a
/// temporary symlink next to it and rename over the old one.
pub fn swap_current_symlink(config: &Config, version: Version) -> std::io::Result<()> {
    let link = config.current_engine_link();
    let target = PathBuf::from(format!("v{}", version));
    let tmp = config.engines_dir().join(".current.tmp");
    if tmp.exists() || tmp.symlink_metadata().is_ok() {
        std::fs::remove_file(&tmp)?;
    }
    std::os::unix::fs::symlink(&target, &tmp)?;
    std::fs::rename(&tmp, &link)?;
    info!("current engine -> {}", target.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_installed_version_falls_back_to_self() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_base_dir(dir.path());
        config.ensure_layout().unwrap();
        let bootstrap = Bootstrap::with_version(config, Version::new(1, 2, 3));
        assert_eq!(bootstrap.installed_version(), Version::new(1, 2, 3));
    }

    #[test]
    fn test_installed_version_reads_symlink() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_base_dir(dir.path());
        config.ensure_layout().unwrap();
        std::fs::create_dir_all(config.engines_dir().join("v2.5.0")).unwrap();
        swap_current_symlink(&config, Version::new(2, 5, 0)).unwrap();

        let bootstrap = Bootstrap::with_version(config, Version::new(1, 0, 0));
        assert_eq!(bootstrap.installed_version(), Version::new(2, 5, 0));
    }

    #[test]
    fn test_symlink_swap_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_base_dir(dir.path());
        config.ensure_layout().unwrap();
        swap_current_symlink(&config, Version::new(1, 0, 0)).unwrap();
        swap_current_symlink(&config, Version::new(2, 0, 0)).unwrap();

        let target = std::fs::read_link(config.current_engine_link()).unwrap();
        assert_eq!(target, PathBuf::from("v2.0.0"));
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(
            exit_code_for(&EngineError::Integrity("x".into())),
            exit::INTEGRITY
        );
        assert_eq!(
            exit_code_for(&EngineError::EngineTooOld {
                required: "2.0.0".into(),
                installed: "1.0.0".into()
            }),
            exit::ENGINE_TOO_OLD
        );
        assert_eq!(exit_code_for(&EngineError::Busy), exit::BUSY);
    }
}
