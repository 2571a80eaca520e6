//! End-to-end phase machine scenarios driven through fake host adapters.

mod common;

use common::fake_host;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use update_engine::config::Config;
use update_engine::engine::UpdateEngine;
use update_engine::error::ErrorKind;
use update_engine::manifest::Manifest;
use update_engine::progress::{JobEvent, ProgressBus};
use update_engine::state::{Job, JobStatus, Phase};

fn engine_in(dir: &TempDir) -> (UpdateEngine, ProgressBus, Config) {
    let config = Config::with_base_dir(dir.path().join("base"));
    let bus = ProgressBus::new();
    let engine = UpdateEngine::new(config.clone(), fake_host(), bus.clone()).unwrap();
    (engine, bus, config)
}

/// Stage a fake extracted package tree.
fn stage(dir: &TempDir, files: &[(&str, &[u8])]) -> std::path::PathBuf {
    let root = dir.path().join("staged");
    for (name, contents) in files {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
    fs::create_dir_all(&root).unwrap();
    root
}

fn manifest_for(yaml: &str) -> Manifest {
    Manifest::parse(yaml).unwrap()
}

fn base_manifest(dest: &Path, extra: &str) -> String {
    format!(
        r#"
description: test update
date: "2026-08-01"
required_engine_version: "1.0.0"
actions:
  - type: backup
    sources: ["{dest}"]
  - type: file_copy
    source: files/app.conf
    destination: "{dest}"
{extra}
"#,
        dest = dest.display(),
        extra = extra
    )
}

#[tokio::test]
async fn test_happy_path_file_copy() {
    let dir = TempDir::new().unwrap();
    let (engine, bus, _config) = engine_in(&dir);
    let mut rx = bus.subscribe();

    let dest = dir.path().join("etc/app.conf");
    fs::create_dir_all(dest.parent().unwrap()).unwrap();
    fs::write(&dest, b"v1\n").unwrap();

    let staged = stage(&dir, &[("files/app.conf", b"v2\n")]);
    let yaml = base_manifest(
        &dest,
        &format!(
            "post_checks:\n  - type: command\n    command: \"test \\\"$(cat {})\\\" = v2\"\n",
            dest.display()
        ),
    );
    let manifest = manifest_for(&yaml);

    let job = Job::new(manifest.description.clone(), manifest.actions.len());
    let job_id = job.job_id.clone();
    let job = engine.run(&manifest, staged, job).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.current_phase, Phase::Done);
    assert!(job.error.is_none());
    assert_eq!(job.progress.completed_actions, 2);
    assert_eq!(fs::read(&dest).unwrap(), b"v2\n");

    // Backup retained and job record persisted.
    assert_eq!(job.backups_created.len(), 1);
    assert_eq!(engine.backup_manager().list().unwrap().len(), 1);
    let persisted = engine.state_store().load(&job_id).unwrap().unwrap();
    assert_eq!(persisted.status, JobStatus::Completed);

    // The bus saw status updates and a final complete event.
    let mut saw_complete = false;
    while let Ok(event) = rx.try_recv() {
        if let JobEvent::Complete(snapshot) = event {
            assert_eq!(snapshot.status, JobStatus::Completed);
            saw_complete = true;
        }
    }
    assert!(saw_complete);
}

#[tokio::test]
async fn test_failing_post_check_triggers_rollback() {
    let dir = TempDir::new().unwrap();
    let (engine, _bus, _config) = engine_in(&dir);

    let dest = dir.path().join("etc/app.conf");
    fs::create_dir_all(dest.parent().unwrap()).unwrap();
    fs::write(&dest, b"v1\n").unwrap();

    let staged = stage(&dir, &[("files/app.conf", b"v2\n")]);
    let yaml = base_manifest(
        &dest,
        "post_checks:\n  - type: command\n    command: \"false\"\nrollback:\n  enabled: true\n  auto_on_failure: true\n",
    );
    let manifest = manifest_for(&yaml);

    let job = Job::new(manifest.description.clone(), manifest.actions.len());
    let job = engine.run(&manifest, staged, job).await.unwrap();

    assert_eq!(job.status, JobStatus::RolledBack);
    assert_eq!(job.error.as_ref().unwrap().kind, ErrorKind::PostcheckFailed);
    // The overwritten file came back.
    assert_eq!(fs::read(&dest).unwrap(), b"v1\n");
    assert!(job.logs.iter().any(|l| l.contains("post-check failed")));
}

#[tokio::test]
async fn test_action_failure_without_auto_rollback() {
    let dir = TempDir::new().unwrap();
    let (engine, _bus, _config) = engine_in(&dir);

    let dest = dir.path().join("etc/app.conf");
    fs::create_dir_all(dest.parent().unwrap()).unwrap();
    fs::write(&dest, b"v1\n").unwrap();

    let staged = stage(&dir, &[("files/app.conf", b"v2\n")]);
    let yaml = format!(
        r#"
description: failing update
date: "2026-08-01"
required_engine_version: "1.0.0"
actions:
  - type: backup
    sources: ["{dest}"]
  - type: file_copy
    source: files/app.conf
    destination: "{dest}"
  - type: command
    command: "exit 9"
rollback:
  enabled: true
  auto_on_failure: false
"#,
        dest = dest.display()
    );
    let manifest = manifest_for(&yaml);

    let job = Job::new(manifest.description.clone(), manifest.actions.len());
    let job = engine.run(&manifest, staged, job).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::ActionFailed);
    assert_eq!(error.action_index, Some(2));
    // No restore happened; backups are retained for a manual rollback.
    assert_eq!(fs::read(&dest).unwrap(), b"v2\n");
    assert_eq!(engine.backup_manager().list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_precheck_failure_skips_rollback() {
    let dir = TempDir::new().unwrap();
    let (engine, _bus, _config) = engine_in(&dir);
    let staged = stage(&dir, &[]);

    let yaml = r#"
description: blocked update
date: "2026-08-01"
required_engine_version: "1.0.0"
pre_checks:
  - type: file_exists
    path: /definitely/not/here
actions:
  - type: command
    command: "echo never runs"
rollback:
  enabled: true
  auto_on_failure: true
"#;
    let manifest = manifest_for(yaml);

    let job = Job::new(manifest.description.clone(), manifest.actions.len());
    let job = engine.run(&manifest, staged, job).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_ref().unwrap().kind, ErrorKind::PrecheckFailed);
    assert_eq!(job.progress.completed_actions, 0);
    // Nothing mutated, so no rollback was attempted.
    assert!(engine.backup_manager().list().unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_actions_completes() {
    let dir = TempDir::new().unwrap();
    let (engine, _bus, _config) = engine_in(&dir);
    let staged = stage(&dir, &[]);

    let yaml = r#"
description: no-op update
date: "2026-08-01"
required_engine_version: "1.0.0"
"#;
    let manifest = manifest_for(yaml);

    let job = Job::new(manifest.description.clone(), manifest.actions.len());
    let job = engine.run(&manifest, staged, job).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.total_actions, 0);
    assert_eq!(job.progress.percent(job.current_phase), 100.0);
}

#[tokio::test]
async fn test_continue_on_error_keeps_going() {
    let dir = TempDir::new().unwrap();
    let (engine, _bus, _config) = engine_in(&dir);
    let staged = stage(&dir, &[]);
    let marker = dir.path().join("marker");

    let yaml = format!(
        r#"
description: tolerant update
date: "2026-08-01"
required_engine_version: "1.0.0"
actions:
  - type: command
    command: "exit 1"
    continue_on_error: true
  - type: command
    command: "touch {}"
"#,
        marker.display()
    );
    let manifest = manifest_for(&yaml);

    let job = Job::new(manifest.description.clone(), manifest.actions.len());
    let job = engine.run(&manifest, staged, job).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.completed_actions, 2);
    assert!(marker.exists());
    assert!(job.logs.iter().any(|l| l.contains("continuing")));
}

#[tokio::test]
async fn test_explicit_rollback_steps_run_in_order() {
    let dir = TempDir::new().unwrap();
    let (engine, _bus, _config) = engine_in(&dir);
    let staged = stage(&dir, &[]);
    let trail = dir.path().join("trail");

    let yaml = format!(
        r#"
description: scripted rollback
date: "2026-08-01"
required_engine_version: "1.0.0"
actions:
  - type: command
    command: "exit 1"
rollback:
  enabled: true
  auto_on_failure: true
  steps:
    - type: command
      command: "echo first >> {trail}"
    - type: command
      command: "echo second >> {trail}"
"#,
        trail = trail.display()
    );
    let manifest = manifest_for(&yaml);

    let job = Job::new(manifest.description.clone(), manifest.actions.len());
    let job = engine.run(&manifest, staged, job).await.unwrap();

    assert_eq!(job.status, JobStatus::RolledBack);
    assert_eq!(fs::read_to_string(&trail).unwrap(), "first\nsecond\n");
}

#[tokio::test]
async fn test_rollback_step_continue_on_error_still_rolls_back() {
    let dir = TempDir::new().unwrap();
    let (engine, _bus, _config) = engine_in(&dir);
    let staged = stage(&dir, &[]);
    let trail = dir.path().join("trail");

    let yaml = format!(
        r#"
description: tolerant rollback
date: "2026-08-01"
required_engine_version: "1.0.0"
actions:
  - type: command
    command: "exit 1"
rollback:
  enabled: true
  auto_on_failure: true
  steps:
    - type: command
      command: "exit 3"
      continue_on_error: true
    - type: command
      command: "echo recovered >> {trail}"
"#,
        trail = trail.display()
    );
    let manifest = manifest_for(&yaml);

    let job = Job::new(manifest.description.clone(), manifest.actions.len());
    let job = engine.run(&manifest, staged, job).await.unwrap();

    // The failing step was tolerated; the rollback ran to completion.
    assert_eq!(job.status, JobStatus::RolledBack);
    assert_eq!(fs::read_to_string(&trail).unwrap(), "recovered\n");
    assert!(job
        .logs
        .iter()
        .any(|l| l.contains("rollback step failed (continuing)")));
}

#[tokio::test]
async fn test_failed_rollback_is_terminal_failed() {
    let dir = TempDir::new().unwrap();
    let (engine, _bus, _config) = engine_in(&dir);
    let staged = stage(&dir, &[]);

    // The failing job never created a backup, so the default rollback
    // (restore latest own backup) cannot proceed.
    let yaml = r#"
description: unrecoverable update
date: "2026-08-01"
required_engine_version: "1.0.0"
actions:
  - type: command
    command: "exit 1"
rollback:
  enabled: true
  auto_on_failure: true
"#;
    let manifest = manifest_for(yaml);

    let job = Job::new(manifest.description.clone(), manifest.actions.len());
    let job = engine.run(&manifest, staged, job).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_ref().unwrap().kind, ErrorKind::RollbackFailed);
}

#[tokio::test]
async fn test_cleanup_applies_retention() {
    let dir = TempDir::new().unwrap();
    let (engine, _bus, _config) = engine_in(&dir);

    let target = dir.path().join("etc/app.conf");
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::write(&target, b"x").unwrap();

    // Seed older backups.
    for i in 0..3 {
        engine
            .backup_manager()
            .create(&[target.clone()], Some(format!("seed{}", i)), "job-prev", i)
            .unwrap();
    }

    let staged = stage(&dir, &[]);
    let yaml = format!(
        r#"
description: retention update
date: "2026-08-01"
required_engine_version: "1.0.0"
actions:
  - type: backup
    sources: ["{}"]
cleanup:
  remove_old_backups: true
  keep_last_n: 2
"#,
        target.display()
    );
    let manifest = manifest_for(&yaml);

    let job = Job::new(manifest.description.clone(), manifest.actions.len());
    let job = engine.run(&manifest, staged, job).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    let names: Vec<_> = engine
        .backup_manager()
        .list()
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names.len(), 2);
    assert_eq!(names[1], "seed2");
}

#[tokio::test]
async fn test_interrupted_job_rolls_back_on_startup() {
    let dir = TempDir::new().unwrap();
    let (engine, _bus, config) = engine_in(&dir);

    let target = dir.path().join("etc/app.conf");
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::write(&target, b"v1\n").unwrap();

    // A job backs up the file, overwrites it, then "crashes" before the
    // post-checks: simulate by persisting a running job with the backup
    // registered.
    let record = engine
        .backup_manager()
        .create(&[target.clone()], None, "job-crashed", 0)
        .unwrap();
    fs::write(&target, b"v2\n").unwrap();

    let mut job = Job::new("crashed update", 2);
    job.status = JobStatus::Running;
    job.current_phase = Phase::Action;
    job.progress.completed_actions = 2;
    job.progress.current_action_index = Some(1);
    job.backups_created.push(record.id);
    engine.state_store().save(&job).unwrap();

    // Restart: a fresh engine over the same base dir.
    let bus = ProgressBus::new();
    let engine2 = UpdateEngine::new(config, fake_host(), bus).unwrap();
    let yaml = r#"
description: crashed update
date: "2026-08-01"
required_engine_version: "1.0.0"
rollback:
  enabled: true
  auto_on_failure: true
"#;
    engine2.recover_on_startup(Some(&manifest_for(yaml))).unwrap();

    let recovered = engine2.state_store().load(&job.job_id).unwrap().unwrap();
    assert_eq!(recovered.status, JobStatus::RolledBack);
    assert_eq!(fs::read(&target).unwrap(), b"v1\n");
}

#[tokio::test]
async fn test_restore_latest_spans_jobs() {
    let dir = TempDir::new().unwrap();
    let (engine, _bus, _config) = engine_in(&dir);

    let target = dir.path().join("etc/app.conf");
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::write(&target, b"old contents\n").unwrap();
    engine
        .backup_manager()
        .create(&[target.clone()], None, "job-other", 0)
        .unwrap();
    fs::write(&target, b"changed\n").unwrap();

    let staged = stage(&dir, &[]);
    let yaml = r#"
description: restore update
date: "2026-08-01"
required_engine_version: "1.0.0"
actions:
  - type: restore_backup
    backup_name: latest
"#;
    let manifest = manifest_for(yaml);

    let job = Job::new(manifest.description.clone(), manifest.actions.len());
    let job = engine.run(&manifest, staged, job).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(fs::read(&target).unwrap(), b"old contents\n");
    // Restoring another job's backup is allowed but flagged.
    assert!(job.logs.iter().any(|l| l.contains("belongs to job")));
}

#[tokio::test]
async fn test_identical_manifests_produce_identical_outcomes() {
    let dir = TempDir::new().unwrap();
    let (engine, _bus, _config) = engine_in(&dir);

    let dest = dir.path().join("etc/app.conf");
    fs::create_dir_all(dest.parent().unwrap()).unwrap();
    fs::write(&dest, b"v1\n").unwrap();

    let yaml = base_manifest(&dest, "");
    let manifest = manifest_for(&yaml);

    for _ in 0..2 {
        let staged = stage(&dir, &[("files/app.conf", b"v2\n")]);
        let job = Job::new(manifest.description.clone(), manifest.actions.len());
        let job = engine.run(&manifest, staged, job).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(fs::read(&dest).unwrap(), b"v2\n");
    }
}
