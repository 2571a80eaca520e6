//! Backup creation, restoration and retention.
//!
//! Backups are content-copied trees under `<base>/backups/<id>/` with a
//! per-file MD5 map in `manifest.json`. Creation is transactional: the tree
//! is assembled under `.tmp-<id>/` and a single rename publishes it, so a
//! crash can never leave a half-visible backup. Orphaned temp directories
//! are garbage-collected on startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::checksum::{md5_file, verify_file};
use crate::error::{EngineError, Result};

const RECORD_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Absolute path the content was captured from, and the restore target.
    pub original_path: PathBuf,
    /// Name of the entry inside the backup directory.
    pub backup_path: String,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub job_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub sources: Vec<SourceEntry>,
    /// Relative path inside the backup → MD5 of the captured bytes.
    pub checksums: BTreeMap<String, String>,
}

pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Remove partial temp directories left behind by a crash.
    pub fn gc_temp(&self) -> std::io::Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(".tmp-") && entry.path().is_dir() {
                warn!("Removing orphaned backup temp dir: {}", entry.path().display());
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }

    /// Capture `sources` into a new backup. Fails if any source is missing.
    pub fn create(
        &self,
        sources: &[PathBuf],
        name: Option<String>,
        job_id: &str,
        seq: usize,
    ) -> Result<BackupRecord> {
        let id = format!("backup-{}-{}", Utc::now().format("%Y%m%dT%H%M%S%3f"), seq);
        let name = name.unwrap_or_else(|| format!("backup_{}_{}", job_id, seq));
        let tmp_dir = self.root.join(format!(".tmp-{}", id));
        let final_dir = self.root.join(&id);
        fs::create_dir_all(&tmp_dir)?;

        info!("Creating backup {} ({} sources)", name, sources.len());

        let result = self.assemble(&tmp_dir, sources, &id, &name, job_id);
        match result {
            Ok(record) => {
                fs::rename(&tmp_dir, &final_dir)?;
                if let Ok(dir) = File::open(&self.root) {
                    let _ = dir.sync_all();
                }
                info!("Backup {} published at {}", name, final_dir.display());
                Ok(record)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&tmp_dir);
                Err(e)
            }
        }
    }

    fn assemble(
        &self,
        tmp_dir: &Path,
        sources: &[PathBuf],
        id: &str,
        name: &str,
        job_id: &str,
    ) -> Result<BackupRecord> {
        let mut entries = Vec::new();
        let mut checksums = BTreeMap::new();

        for source in sources {
            if !source.exists() {
                return Err(EngineError::ActionFailed {
                    index: 0,
                    name: "backup".into(),
                    message: format!("backup source not found: {}", source.display()),
                });
            }
            let dest_name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| EngineError::ActionFailed {
                    index: 0,
                    name: "backup".into(),
                    message: format!("backup source has no file name: {}", source.display()),
                })?;
            let dest = tmp_dir.join(&dest_name);

            if source.is_file() {
                fs::copy(source, &dest)?;
                checksums.insert(dest_name.clone(), md5_file(&dest)?);
                entries.push(SourceEntry {
                    original_path: source.clone(),
                    backup_path: dest_name,
                    kind: SourceKind::File,
                });
            } else {
                copy_tree(source, &dest)?;
                for file in WalkDir::new(&dest).into_iter().filter_map(|e| e.ok()) {
                    if file.file_type().is_file() {
                        let rel = file
                            .path()
                            .strip_prefix(tmp_dir)
                            .expect("walked file is under tmp_dir")
                            .to_string_lossy()
                            .to_string();
                        checksums.insert(rel, md5_file(file.path())?);
                    }
                }
                entries.push(SourceEntry {
                    original_path: source.clone(),
                    backup_path: dest_name,
                    kind: SourceKind::Directory,
                });
            }
            debug!("Captured {}", source.display());
        }

        let record = BackupRecord {
            id: id.to_string(),
            job_id: job_id.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            sources: entries,
            checksums,
        };

        let record_path = tmp_dir.join(RECORD_FILE);
        let mut file = File::create(&record_path)?;
        file.write_all(&serde_json::to_vec_pretty(&record).map_err(std::io::Error::other)?)?;
        file.sync_all()?;
        Ok(record)
    }

    /// All published backups, newest first.
    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || entry.file_name().to_string_lossy().starts_with(".tmp-") {
                continue;
            }
            let record_path = path.join(RECORD_FILE);
            match fs::read(&record_path)
                .ok()
                .and_then(|d| serde_json::from_slice::<BackupRecord>(&d).ok())
            {
                Some(record) => records.push(record),
                None => warn!("Skipping backup without readable record: {}", path.display()),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Resolve a backup by name or id; `latest` picks the most recent
    /// published backup regardless of which job created it.
    pub fn find(&self, name: &str) -> Result<Option<BackupRecord>> {
        let records = self.list()?;
        if name == "latest" {
            return Ok(records.into_iter().next());
        }
        Ok(records.into_iter().find(|r| r.name == name || r.id == name))
    }

    /// Restore a backup to its recorded source paths. Every file is verified
    /// against the backup's MD5 map before being written; a mismatch aborts
    /// the restore, which the orchestrator treats as a fatal rollback failure.
    pub fn restore(&self, record: &BackupRecord) -> Result<()> {
        let backup_dir = self.root.join(&record.id);
        if !backup_dir.is_dir() {
            return Err(EngineError::RollbackFailed(format!(
                "backup {} is missing on disk",
                record.name
            )));
        }

        info!("Restoring backup {} ({} files)", record.name, record.checksums.len());

        for (rel, expected) in &record.checksums {
            let path = backup_dir.join(rel);
            if !verify_file(&path, expected)? {
                return Err(EngineError::RollbackFailed(format!(
                    "backup file checksum mismatch: {}",
                    rel
                )));
            }
        }

        for source in &record.sources {
            let captured = backup_dir.join(&source.backup_path);
            match source.kind {
                SourceKind::File => {
                    atomic_copy(&captured, &source.original_path)?;
                    debug!("Restored file {}", source.original_path.display());
                }
                SourceKind::Directory => {
                    if source.original_path.exists() {
                        fs::remove_dir_all(&source.original_path)?;
                    }
                    copy_tree(&captured, &source.original_path)?;
                    debug!("Restored directory {}", source.original_path.display());
                }
            }
        }

        info!("Backup {} restored", record.name);
        Ok(())
    }

    /// Apply the retention policy: keep the newest `keep_last_n` backups
    /// across all jobs. 0 keeps everything.
    pub fn cleanup_old(&self, keep_last_n: usize) -> Result<usize> {
        if keep_last_n == 0 {
            info!("Backup retention disabled (keep_last_n=0)");
            return Ok(0);
        }
        let records = self.list()?;
        let mut removed = 0;
        for record in records.iter().skip(keep_last_n) {
            info!("Removing old backup {}", record.name);
            fs::remove_dir_all(self.root.join(&record.id))?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Recursive directory copy preserving the tree shape.
fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walked path is under src");
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Atomic single-file copy: write `<dest>.tmp`, fsync, rename over `dest`.
pub fn atomic_copy(src: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = dest.with_extension(match dest.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    {
        let data = fs::read(src)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dest)?;
    Ok(())
}
