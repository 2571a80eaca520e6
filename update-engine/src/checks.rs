//! Check registry: typed dispatch of pre/post check specs.
//!
//! Checks are probes, not mutations; they return pass/fail plus a
//! diagnostic instead of erroring, so the orchestrator can report every
//! failure with context.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::host::{ContainerHealth, HostAdapters};
use crate::manifest::CheckSpec;

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub ok: bool,
    pub diagnostic: String,
}

impl CheckOutcome {
    fn pass(diagnostic: impl Into<String>) -> Self {
        Self {
            ok: true,
            diagnostic: diagnostic.into(),
        }
    }

    fn fail(diagnostic: impl Into<String>) -> Self {
        Self {
            ok: false,
            diagnostic: diagnostic.into(),
        }
    }
}

pub async fn execute_check(
    spec: &CheckSpec,
    host: &HostAdapters,
    cancel: &CancellationToken,
) -> CheckOutcome {
    match spec {
        CheckSpec::DiskSpace { path, required_mb } => check_disk_space(path, *required_mb),
        CheckSpec::DockerRunning => match host.containers.daemon_running().await {
            Ok(true) => CheckOutcome::pass("docker daemon is running"),
            Ok(false) => CheckOutcome::fail("docker daemon is not running"),
            Err(e) => CheckOutcome::fail(format!("docker probe failed: {}", e)),
        },
        CheckSpec::FileExists { path } => {
            if path.exists() {
                CheckOutcome::pass(format!("path exists: {}", path.display()))
            } else {
                CheckOutcome::fail(format!("path does not exist: {}", path.display()))
            }
        }
        CheckSpec::DockerHealth { container_name } => {
            match host.containers.container_health(container_name).await {
                Ok(ContainerHealth::Healthy) => {
                    CheckOutcome::pass(format!("container {} is healthy", container_name))
                }
                Ok(ContainerHealth::RunningNoHealthCheck) => CheckOutcome::pass(format!(
                    "container {} is running (no health check defined)",
                    container_name
                )),
                Ok(status) => CheckOutcome::fail(format!(
                    "container {} is not healthy: {:?}",
                    container_name, status
                )),
                Err(e) => CheckOutcome::fail(format!("health probe failed: {}", e)),
            }
        }
        CheckSpec::HttpCheck {
            url,
            retries,
            delay,
            timeout,
            expected_status,
        } => check_http(host, cancel, url, *retries, *delay, *timeout, *expected_status).await,
        CheckSpec::ServiceRunning { service_name } => {
            match host.services.is_active(service_name).await {
                Ok(true) => CheckOutcome::pass(format!("service {} is running", service_name)),
                Ok(false) => CheckOutcome::fail(format!("service {} is not running", service_name)),
                Err(e) => CheckOutcome::fail(format!("service probe failed: {}", e)),
            }
        }
        CheckSpec::Command { command, timeout } => check_command(command, *timeout).await,
    }
}

fn check_disk_space(path: &std::path::Path, required_mb: u64) -> CheckOutcome {
    if !path.exists() {
        if let Err(e) = std::fs::create_dir_all(path) {
            return CheckOutcome::fail(format!("cannot create {}: {}", path.display(), e));
        }
    }
    match fs2::available_space(path) {
        Ok(free) => {
            let free_mb = free / (1024 * 1024);
            if free_mb >= required_mb {
                CheckOutcome::pass(format!(
                    "{} MB available at {} (required {} MB)",
                    free_mb,
                    path.display(),
                    required_mb
                ))
            } else {
                CheckOutcome::fail(format!(
                    "insufficient disk space at {}: {} MB available, {} MB required",
                    path.display(),
                    free_mb,
                    required_mb
                ))
            }
        }
        Err(e) => CheckOutcome::fail(format!("disk usage probe failed: {}", e)),
    }
}

/// Retry the probe `retries` times with `delay` seconds in between, failing
/// only after the last attempt.
async fn check_http(
    host: &HostAdapters,
    cancel: &CancellationToken,
    url: &str,
    retries: u32,
    delay: u64,
    timeout: u64,
    expected_status: u16,
) -> CheckOutcome {
    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        info!("HTTP check attempt {}/{}: {}", attempt, attempts, url);
        match host.http.get_status(url, Duration::from_secs(timeout)).await {
            Ok(status) if status == expected_status => {
                return CheckOutcome::pass(format!("{} returned {}", url, status));
            }
            Ok(status) => info!(
                "HTTP check got {} from {}, expected {}",
                status, url, expected_status
            ),
            Err(e) => info!("HTTP check request failed: {}", e),
        }
        if attempt < attempts {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                _ = cancel.cancelled() => {
                    return CheckOutcome::fail(format!("HTTP check cancelled: {}", url));
                }
            }
        }
    }
    CheckOutcome::fail(format!(
        "endpoint not reachable after {} attempt(s): {}",
        attempts, url
    ))
}

async fn check_command(command: &str, timeout: u64) -> CheckOutcome {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .output();
    match tokio::time::timeout(Duration::from_secs(timeout), child).await {
        Ok(Ok(output)) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            CheckOutcome::pass(if stdout.is_empty() {
                "command succeeded".to_string()
            } else {
                stdout
            })
        }
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            CheckOutcome::fail(format!(
                "command exited with {}{}",
                output.status,
                if stderr.is_empty() {
                    String::new()
                } else {
                    format!(": {}", stderr)
                }
            ))
        }
        Ok(Err(e)) => CheckOutcome::fail(format!("failed to spawn command: {}", e)),
        Err(_) => CheckOutcome::fail(format!("command timed out after {}s", timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn host_with_fakes() -> HostAdapters {
        HostAdapters::real() // real adapters; only fs/command checks used below
    }

    #[tokio::test]
    async fn test_file_exists_check() {
        let dir = TempDir::new().unwrap();
        let host = host_with_fakes();
        let cancel = CancellationToken::new();

        let ok = execute_check(
            &CheckSpec::FileExists {
                path: dir.path().to_path_buf(),
            },
            &host,
            &cancel,
        )
        .await;
        assert!(ok.ok);

        let missing = execute_check(
            &CheckSpec::FileExists {
                path: dir.path().join("nope"),
            },
            &host,
            &cancel,
        )
        .await;
        assert!(!missing.ok);
    }

    #[tokio::test]
    async fn test_command_check_pass_and_fail() {
        let host = host_with_fakes();
        let cancel = CancellationToken::new();

        let pass = execute_check(
            &CheckSpec::Command {
                command: "exit 0".into(),
                timeout: 5,
            },
            &host,
            &cancel,
        )
        .await;
        assert!(pass.ok);

        let fail = execute_check(
            &CheckSpec::Command {
                command: "exit 3".into(),
                timeout: 5,
            },
            &host,
            &cancel,
        )
        .await;
        assert!(!fail.ok);
        assert!(fail.diagnostic.contains("exited"));
    }

    #[tokio::test]
    async fn test_disk_space_check_trivially_satisfiable() {
        let dir = TempDir::new().unwrap();
        let host = host_with_fakes();
        let cancel = CancellationToken::new();
        let outcome = execute_check(
            &CheckSpec::DiskSpace {
                path: dir.path().to_path_buf(),
                required_mb: 0,
            },
            &host,
            &cancel,
        )
        .await;
        assert!(outcome.ok, "{}", outcome.diagnostic);
    }
}
