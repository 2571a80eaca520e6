//! Update manifest: the YAML document declaring checks, actions, rollback
//! and cleanup policy for one update.
//!
//! Checks and actions are closed tagged variants; an unknown `type` is a
//! parse error, so a malformed manifest is rejected before any phase runs.
//! Unknown top-level keys are ignored for forward compatibility.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};
use crate::version::Version;

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub description: String,
    pub date: String,
    pub required_engine_version: Version,
    #[serde(default)]
    pub pre_checks: Vec<CheckSpec>,
    #[serde(default)]
    pub post_checks: Vec<CheckSpec>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub rollback: RollbackPolicy,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
}

impl Manifest {
    /// Load and validate `manifest.yml` from a staged package root.
    pub fn load(staged_root: &Path) -> Result<Self> {
        let path = staged_root.join("manifest.yml");
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::ManifestParse(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| EngineError::ManifestParse(e.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RollbackPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Roll back automatically when an action or post-check fails.
    #[serde(default, alias = "auto_rollback_on_failure")]
    pub auto_on_failure: bool,
    /// Explicit rollback steps; when absent the most recent backup created
    /// by the failing job is restored instead.
    #[serde(default)]
    pub steps: Option<Vec<ActionSpec>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CleanupPolicy {
    #[serde(default)]
    pub remove_old_backups: bool,
    /// 0 = keep all.
    #[serde(default)]
    pub keep_last_n: usize,
    #[serde(default)]
    pub remove_temp_files: bool,
    #[serde(default)]
    pub remove_old_images: bool,
}

// ── Checks ──

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckSpec {
    DiskSpace {
        path: PathBuf,
        required_mb: u64,
    },
    DockerRunning,
    FileExists {
        path: PathBuf,
    },
    DockerHealth {
        container_name: String,
    },
    HttpCheck {
        url: String,
        #[serde(default = "default_http_retries")]
        retries: u32,
        #[serde(default = "default_http_delay")]
        delay: u64,
        #[serde(default = "default_http_timeout")]
        timeout: u64,
        #[serde(default = "default_http_status")]
        expected_status: u16,
    },
    ServiceRunning {
        service_name: String,
    },
    Command {
        command: String,
        #[serde(default = "default_check_timeout")]
        timeout: u64,
    },
}

impl CheckSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            CheckSpec::DiskSpace { .. } => "disk_space",
            CheckSpec::DockerRunning => "docker_running",
            CheckSpec::FileExists { .. } => "file_exists",
            CheckSpec::DockerHealth { .. } => "docker_health",
            CheckSpec::HttpCheck { .. } => "http_check",
            CheckSpec::ServiceRunning { .. } => "service_running",
            CheckSpec::Command { .. } => "command",
        }
    }
}

fn default_http_retries() -> u32 {
    1
}
fn default_http_delay() -> u64 {
    5
}
fn default_http_timeout() -> u64 {
    10
}
fn default_http_status() -> u16 {
    200
}
fn default_check_timeout() -> u64 {
    30
}

// ── Actions ──

/// One side-effecting unit of the manifest. The variant carries the
/// type-specific fields; `name` and `continue_on_error` are common.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl ActionSpec {
    /// Display name: explicit `name` or the type tag.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.kind.type_name())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Command {
        command: String,
        cwd: Option<PathBuf>,
        #[serde(default = "default_command_timeout")]
        timeout: u64,
    },
    Backup {
        sources: Vec<PathBuf>,
        /// Custom backup name; defaults to `backup_<job_id>_<seq>`.
        #[serde(default)]
        backup_name: Option<String>,
    },
    RestoreBackup {
        #[serde(default = "default_backup_name")]
        backup_name: String,
    },
    DockerComposeDown {
        compose_file: PathBuf,
        #[serde(default = "default_compose_timeout")]
        timeout: u64,
    },
    DockerComposeUp {
        compose_file: PathBuf,
        #[serde(default = "default_true")]
        detach: bool,
        #[serde(default)]
        build: bool,
    },
    DockerLoad {
        /// Relative to the staged package root.
        image_tar: PathBuf,
    },
    DockerPrune {
        #[serde(default)]
        all: bool,
        #[serde(default = "default_true")]
        force: bool,
    },
    FileCopy {
        /// Relative to the staged package root.
        source: PathBuf,
        destination: PathBuf,
        /// Expected MD5 of the staged source, verified before writing.
        checksum: Option<String>,
    },
    FileSync {
        /// Relative to the staged package root.
        source: PathBuf,
        destination: PathBuf,
        #[serde(default)]
        mode: SyncMode,
    },
    FileMerge {
        /// Relative to the staged package root.
        source: PathBuf,
        destination: PathBuf,
        #[serde(default)]
        strategy: MergeStrategy,
    },
}

impl ActionKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ActionKind::Command { .. } => "command",
            ActionKind::Backup { .. } => "backup",
            ActionKind::RestoreBackup { .. } => "restore_backup",
            ActionKind::DockerComposeDown { .. } => "docker_compose_down",
            ActionKind::DockerComposeUp { .. } => "docker_compose_up",
            ActionKind::DockerLoad { .. } => "docker_load",
            ActionKind::DockerPrune { .. } => "docker_prune",
            ActionKind::FileCopy { .. } => "file_copy",
            ActionKind::FileSync { .. } => "file_sync",
            ActionKind::FileMerge { .. } => "file_merge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Destination becomes a bit-copy of the source; extraneous files removed.
    #[default]
    Mirror,
    /// Copy files missing at the destination; never overwrite.
    AddOnly,
    /// Copy everything, overwriting; keep extraneous destination files.
    OverwriteExisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Destination keys win; new source keys are appended.
    #[default]
    KeepExisting,
    /// Source keys win; destination-only keys are kept.
    OverwriteAll,
    /// Union of both key sets; destination wins on conflict.
    MergeKeys,
}

fn default_command_timeout() -> u64 {
    300
}
fn default_compose_timeout() -> u64 {
    60
}
fn default_backup_name() -> String {
    "latest".to_string()
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
description: test update
date: "2026-08-01"
required_engine_version: "1.0.0"
"#;

    #[test]
    fn test_minimal_manifest_defaults() {
        let m = Manifest::parse(MINIMAL).unwrap();
        assert_eq!(m.description, "test update");
        assert!(m.actions.is_empty());
        assert!(m.pre_checks.is_empty());
        assert!(!m.rollback.enabled);
        assert_eq!(m.cleanup.keep_last_n, 0);
    }

    #[test]
    fn test_unknown_top_level_keys_ignored() {
        let raw = format!("{}\nfuture_field: whatever\n", MINIMAL);
        assert!(Manifest::parse(&raw).is_ok());
    }

    #[test]
    fn test_unknown_action_type_rejected() {
        let raw = format!(
            "{}\nactions:\n  - type: teleport\n    destination: /mars\n",
            MINIMAL
        );
        let err = Manifest::parse(&raw).unwrap_err();
        assert!(matches!(err, EngineError::ManifestParse(_)));
    }

    #[test]
    fn test_unknown_check_type_rejected() {
        let raw = format!("{}\npre_checks:\n  - type: crystal_ball\n", MINIMAL);
        assert!(Manifest::parse(&raw).is_err());
    }

    #[test]
    fn test_full_action_list_parses() {
        let raw = format!(
            r#"{}
pre_checks:
  - type: disk_space
    path: /opt
    required_mb: 100
  - type: docker_running
  - type: http_check
    url: http://localhost:8080/health
    retries: 3
actions:
  - type: backup
    name: snapshot config
    sources: [/etc/app.conf]
  - type: command
    command: "echo hi"
    timeout: 10
  - type: file_copy
    source: files/app.conf
    destination: /etc/app.conf
    checksum: d41d8cd98f00b204e9800998ecf8427e
  - type: file_sync
    source: files/www
    destination: /var/www
    mode: overwrite_existing
  - type: file_merge
    source: files/.env
    destination: /etc/app/.env
    strategy: merge_keys
  - type: docker_compose_up
    compose_file: docker-compose.yml
    build: true
  - type: docker_load
    image_tar: docker/app.tar
  - type: docker_prune
    all: true
rollback:
  enabled: true
  auto_on_failure: true
cleanup:
  remove_old_backups: true
  keep_last_n: 3
"#,
            MINIMAL
        );
        let m = Manifest::parse(&raw).unwrap();
        assert_eq!(m.actions.len(), 8);
        assert_eq!(m.actions[0].name(), "snapshot config");
        assert_eq!(m.actions[1].name(), "command");
        assert!(m.rollback.enabled && m.rollback.auto_on_failure);
        assert_eq!(m.cleanup.keep_last_n, 3);
        match &m.actions[1].kind {
            ActionKind::Command { timeout, .. } => assert_eq!(*timeout, 10),
            other => panic!("wrong kind: {:?}", other),
        }
        match &m.actions[3].kind {
            ActionKind::FileSync { mode, .. } => assert_eq!(*mode, SyncMode::OverwriteExisting),
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_command_timeout_default() {
        let raw = format!("{}\nactions:\n  - type: command\n    command: \"true\"\n", MINIMAL);
        let m = Manifest::parse(&raw).unwrap();
        match &m.actions[0].kind {
            ActionKind::Command { timeout, .. } => assert_eq!(*timeout, 300),
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_rollback_legacy_alias() {
        let raw = format!(
            "{}\nrollback:\n  enabled: true\n  auto_rollback_on_failure: true\n",
            MINIMAL
        );
        let m = Manifest::parse(&raw).unwrap();
        assert!(m.rollback.auto_on_failure);
    }

    #[test]
    fn test_missing_required_field_rejected() {
        assert!(Manifest::parse("description: x\ndate: y\n").is_err());
    }
}
