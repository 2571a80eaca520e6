//! Action registry: typed dispatch of manifest actions against the host.
//!
//! Handlers receive an [`ActionContext`] exposing the staged package root,
//! the backup manager, the host adapters, the cancellation token and the
//! job's log sink. The orchestrator owns classification; handlers report
//! plain errors.

use anyhow::{anyhow, bail, Context};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::backup::{atomic_copy, BackupManager, BackupRecord};
use crate::checksum::verify_file;
use crate::config::staged_path;
use crate::host::HostAdapters;
use crate::manifest::{ActionKind, ActionSpec, MergeStrategy, SyncMode};
use crate::progress::LogSink;

/// Grace period between SIGTERM and SIGKILL for a timed-out command.
const KILL_GRACE: Duration = Duration::from_secs(5);

pub struct ActionContext<'a> {
    pub staged_root: &'a Path,
    pub backups: &'a BackupManager,
    pub host: &'a HostAdapters,
    pub cancel: &'a CancellationToken,
    pub sink: &'a LogSink,
    pub job_id: &'a str,
    pub action_index: usize,
}

/// Execute one action. Returns the backup record when the action created one
/// so the orchestrator can register it on the job.
pub async fn execute_action(
    spec: &ActionSpec,
    ctx: &ActionContext<'_>,
) -> anyhow::Result<Option<BackupRecord>> {
    ctx.sink
        .log(format!("executing action: {} ({})", spec.name(), spec.kind.type_name()));

    match &spec.kind {
        ActionKind::Command {
            command,
            cwd,
            timeout,
        } => {
            run_command(ctx, command, cwd.as_deref(), *timeout).await?;
            Ok(None)
        }
        ActionKind::Backup {
            sources,
            backup_name,
        } => {
            let name = backup_name.clone().or_else(|| spec.name.clone());
            let record = ctx
                .backups
                .create(sources, name, ctx.job_id, ctx.action_index)
                .map_err(|e| anyhow!(e.to_string()))?;
            ctx.sink
                .log(format!("backup {} created ({} files)", record.name, record.checksums.len()));
            Ok(Some(record))
        }
        ActionKind::RestoreBackup { backup_name } => {
            let record = ctx
                .backups
                .find(backup_name)
                .map_err(|e| anyhow!(e.to_string()))?
                .ok_or_else(|| anyhow!("backup not found: {}", backup_name))?;
            if record.job_id != ctx.job_id {
                warn!(
                    "Restoring backup {} created by another job ({})",
                    record.name, record.job_id
                );
                ctx.sink.log(format!(
                    "warning: backup {} belongs to job {}",
                    record.name, record.job_id
                ));
            }
            ctx.backups
                .restore(&record)
                .map_err(|e| anyhow!(e.to_string()))?;
            ctx.sink.log(format!("backup {} restored", record.name));
            Ok(None)
        }
        ActionKind::DockerComposeDown {
            compose_file,
            timeout,
        } => {
            let file = staged_path(ctx.staged_root, compose_file);
            let output = ctx
                .host
                .containers
                .compose_down(&file, *timeout)
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            log_adapter_output(ctx.sink, &output);
            ctx.sink.log("compose services stopped");
            Ok(None)
        }
        ActionKind::DockerComposeUp {
            compose_file,
            detach,
            build,
        } => {
            let file = staged_path(ctx.staged_root, compose_file);
            let output = ctx
                .host
                .containers
                .compose_up(&file, *detach, *build)
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            log_adapter_output(ctx.sink, &output);
            ctx.sink.log("compose services started");
            Ok(None)
        }
        ActionKind::DockerLoad { image_tar } => {
            let tar = staged_path(ctx.staged_root, image_tar);
            if !tar.is_file() {
                bail!("image tar not found: {}", tar.display());
            }
            let output = ctx
                .host
                .containers
                .load_image(&tar)
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            log_adapter_output(ctx.sink, &output);
            Ok(None)
        }
        ActionKind::DockerPrune { all, force } => {
            let output = ctx
                .host
                .containers
                .prune_images(*all, *force)
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            log_adapter_output(ctx.sink, &output);
            Ok(None)
        }
        ActionKind::FileCopy {
            source,
            destination,
            checksum,
        } => {
            file_copy(ctx, source, destination, checksum.as_deref())?;
            Ok(None)
        }
        ActionKind::FileSync {
            source,
            destination,
            mode,
        } => {
            let src = staged_path(ctx.staged_root, source);
            let (copied, removed) = sync_tree(&src, destination, *mode)?;
            ctx.sink.log(format!(
                "synced {} -> {} ({:?}): {} copied, {} removed",
                src.display(),
                destination.display(),
                mode,
                copied,
                removed
            ));
            Ok(None)
        }
        ActionKind::FileMerge {
            source,
            destination,
            strategy,
        } => {
            let src = staged_path(ctx.staged_root, source);
            let keys = merge_files(&src, destination, *strategy)?;
            ctx.sink.log(format!(
                "merged {} into {} ({:?}): {} keys",
                src.display(),
                destination.display(),
                strategy,
                keys
            ));
            Ok(None)
        }
    }
}

fn log_adapter_output(sink: &LogSink, output: &str) {
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        sink.log(line.to_string());
    }
}

// ── command ──

async fn run_command(
    ctx: &ActionContext<'_>,
    command: &str,
    cwd: Option<&Path>,
    timeout: u64,
) -> anyhow::Result<()> {
    let cwd = cwd.unwrap_or(ctx.staged_root);
    debug!("Running command in {}: {}", cwd.display(), command);

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn: {}", command))?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let out_task = tokio::spawn(stream_lines(stdout, ctx.sink.clone()));
    let err_task = tokio::spawn(stream_lines(stderr, ctx.sink.clone()));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = tokio::time::sleep(Duration::from_secs(timeout)) => {
            ctx.sink.log(format!("command timed out after {}s, terminating", timeout));
            terminate_then_kill(&mut child).await;
            let _ = out_task.await;
            let _ = err_task.await;
            bail!("command timed out after {}s", timeout);
        }
        _ = ctx.cancel.cancelled() => {
            ctx.sink.log("command cancelled, terminating".to_string());
            terminate_then_kill(&mut child).await;
            let _ = out_task.await;
            let _ = err_task.await;
            bail!("command cancelled");
        }
    };

    let _ = out_task.await;
    let _ = err_task.await;

    if !status.success() {
        bail!("command exited with {}", status);
    }
    Ok(())
}

async fn stream_lines<R>(reader: R, sink: LogSink)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink.log(line);
    }
}

/// SIGTERM first, SIGKILL after the grace period.
async fn terminate_then_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .stdin(Stdio::null())
            .status()
            .await;
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

// ── file_copy ──

fn file_copy(
    ctx: &ActionContext<'_>,
    source: &Path,
    destination: &Path,
    checksum: Option<&str>,
) -> anyhow::Result<()> {
    let src = staged_path(ctx.staged_root, source);
    if !src.is_file() {
        bail!("source file not found: {}", src.display());
    }
    if let Some(expected) = checksum {
        if !verify_file(&src, expected)? {
            bail!("source file checksum mismatch: {}", src.display());
        }
    }
    atomic_copy(&src, destination)?;
    ctx.sink
        .log(format!("copied {} -> {}", src.display(), destination.display()));
    Ok(())
}

// ── file_sync ──

/// Directory tree sync. Returns `(copied, removed)` file counts.
pub fn sync_tree(src: &Path, dest: &Path, mode: SyncMode) -> anyhow::Result<(usize, usize)> {
    if !src.is_dir() {
        bail!("source directory not found: {}", src.display());
    }
    fs::create_dir_all(dest)?;

    let mut src_files = BTreeSet::new();
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).expect("under src").to_path_buf();
        if entry.file_type().is_dir() {
            fs::create_dir_all(dest.join(&rel))?;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        src_files.insert(rel.clone());
        let target = dest.join(&rel);
        if mode == SyncMode::AddOnly && target.exists() {
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target)?;
        copied += 1;
    }

    let mut removed = 0;
    if mode == SyncMode::Mirror {
        // Drop extraneous destination files, then prune empty directories.
        for entry in WalkDir::new(dest).contents_first(true) {
            let entry = entry?;
            let rel = entry.path().strip_prefix(dest).expect("under dest").to_path_buf();
            if rel.as_os_str().is_empty() {
                continue;
            }
            if entry.file_type().is_file() && !src_files.contains(&rel) {
                fs::remove_file(entry.path())?;
                removed += 1;
            } else if entry.file_type().is_dir() && !src.join(&rel).is_dir() {
                let _ = fs::remove_dir(entry.path());
            }
        }
    }

    Ok((copied, removed))
}

// ── file_merge ──

/// Merge two `KEY=VALUE` files, writing the result atomically to `dest`.
/// Returns the number of keys in the merged result.
pub fn merge_files(src: &Path, dest: &Path, strategy: MergeStrategy) -> anyhow::Result<usize> {
    if !src.is_file() {
        bail!("source file not found: {}", src.display());
    }
    let source_text = fs::read_to_string(src)?;
    let dest_text = if dest.is_file() {
        fs::read_to_string(dest)?
    } else {
        String::new()
    };

    let (merged, keys) = merge_env_text(&source_text, &dest_text, strategy);

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = dest.with_extension("merge.tmp");
    {
        use std::io::Write;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(merged.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dest)?;
    Ok(keys)
}

fn parse_env_line(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (key, value) = trimmed.split_once('=')?;
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((key.trim().to_string(), value.to_string()))
}

fn format_env_value(value: &str) -> String {
    if value.contains(' ') || value.contains('#') {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}

/// Pure merge over the textual contents. The destination's comments, blank
/// lines and key order are preserved; new keys from the source are appended
/// in source order.
pub fn merge_env_text(
    source_text: &str,
    dest_text: &str,
    strategy: MergeStrategy,
) -> (String, usize) {
    let source_pairs: Vec<(String, String)> =
        source_text.lines().filter_map(parse_env_line).collect();

    let mut out = String::new();
    let mut emitted: BTreeSet<String> = BTreeSet::new();

    for line in dest_text.lines() {
        match parse_env_line(line) {
            None => {
                out.push_str(line);
                out.push('\n');
            }
            Some((key, dest_value)) => {
                if emitted.contains(&key) {
                    continue; // duplicate destination key, first wins
                }
                let value = match strategy {
                    // Destination wins on conflict.
                    MergeStrategy::KeepExisting | MergeStrategy::MergeKeys => dest_value,
                    // Source wins on conflict; destination-only keys are kept.
                    MergeStrategy::OverwriteAll => source_pairs
                        .iter()
                        .find(|(k, _)| *k == key)
                        .map(|(_, v)| v.clone())
                        .unwrap_or(dest_value),
                };
                out.push_str(&format!("{}={}\n", key, format_env_value(&value)));
                emitted.insert(key);
            }
        }
    }

    for (key, value) in &source_pairs {
        if !emitted.contains(key) {
            out.push_str(&format!("{}={}\n", key, format_env_value(value)));
            emitted.insert(key.clone());
        }
    }

    (out, emitted.len())
}
