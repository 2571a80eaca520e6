//! Narrow capability interfaces over host side-effects.
//!
//! The container runtime, service supervisor and HTTP probe are behind
//! traits so tests can drive the full phase machine with in-process fakes
//! while production dispatches to the real host.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerHealth {
    Healthy,
    /// Running but the container defines no health check.
    RunningNoHealthCheck,
    Unhealthy,
    NotRunning,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HostError(pub String);

type HostResult<T> = std::result::Result<T, HostError>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn compose_down(&self, compose_file: &Path, timeout_secs: u64) -> HostResult<String>;
    async fn compose_up(&self, compose_file: &Path, detach: bool, build: bool) -> HostResult<String>;
    async fn load_image(&self, image_tar: &Path) -> HostResult<String>;
    async fn prune_images(&self, all: bool, force: bool) -> HostResult<String>;
    async fn daemon_running(&self) -> HostResult<bool>;
    async fn container_health(&self, container_name: &str) -> HostResult<ContainerHealth>;
}

#[async_trait]
pub trait ServiceSupervisor: Send + Sync {
    async fn is_active(&self, service_name: &str) -> HostResult<bool>;
}

#[async_trait]
pub trait HttpProbe: Send + Sync {
    /// GET the URL, returning the response status code.
    async fn get_status(&self, url: &str, timeout: Duration) -> HostResult<u16>;
}

/// Bundle of host adapters handed to action and check handlers.
#[derive(Clone)]
pub struct HostAdapters {
    pub containers: Arc<dyn ContainerRuntime>,
    pub services: Arc<dyn ServiceSupervisor>,
    pub http: Arc<dyn HttpProbe>,
}

impl HostAdapters {
    /// Production adapters backed by the docker CLI, systemd and reqwest.
    pub fn real() -> Self {
        Self {
            containers: Arc::new(DockerCli),
            services: Arc::new(SystemdCli),
            http: Arc::new(ReqwestProbe::new()),
        }
    }
}

// ── Production implementations ──

async fn run_cli(program: &str, args: &[&str]) -> HostResult<std::process::Output> {
    debug!("Running host command: {} {}", program, args.join(" "));
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| HostError(format!("failed to run {}: {}", program, e)))
}

fn expect_success(output: std::process::Output, what: &str) -> HostResult<String> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(HostError(format!(
            "{} failed: {}",
            what,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Docker CLI adapter (`docker compose`, `docker load`, `docker image prune`).
pub struct DockerCli;

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn compose_down(&self, compose_file: &Path, timeout_secs: u64) -> HostResult<String> {
        let file = compose_file.to_string_lossy();
        let timeout = timeout_secs.to_string();
        let output = run_cli(
            "docker",
            &["compose", "-f", &file, "down", "--timeout", &timeout],
        )
        .await?;
        expect_success(output, "docker compose down")
    }

    async fn compose_up(&self, compose_file: &Path, detach: bool, build: bool) -> HostResult<String> {
        let file = compose_file.to_string_lossy();
        let mut args = vec!["compose", "-f", file.as_ref(), "up"];
        if detach {
            args.push("-d");
        }
        if build {
            args.push("--build");
        }
        let output = run_cli("docker", &args).await?;
        expect_success(output, "docker compose up")
    }

    async fn load_image(&self, image_tar: &Path) -> HostResult<String> {
        let tar = image_tar.to_string_lossy();
        let output = run_cli("docker", &["load", "-i", &tar]).await?;
        expect_success(output, "docker load")
    }

    async fn prune_images(&self, all: bool, force: bool) -> HostResult<String> {
        let mut args = vec!["image", "prune"];
        if all {
            args.push("--all");
        }
        if force {
            args.push("--force");
        }
        let output = run_cli("docker", &args).await?;
        expect_success(output, "docker image prune")
    }

    async fn daemon_running(&self) -> HostResult<bool> {
        Ok(run_cli("docker", &["info"]).await?.status.success())
    }

    async fn container_health(&self, container_name: &str) -> HostResult<ContainerHealth> {
        let output = run_cli(
            "docker",
            &[
                "inspect",
                "--format={{.State.Health.Status}}",
                container_name,
            ],
        )
        .await?;
        if !output.status.success() {
            return Err(HostError(format!("container not found: {}", container_name)));
        }
        let health = String::from_utf8_lossy(&output.stdout).trim().to_string();
        match health.as_str() {
            "healthy" => Ok(ContainerHealth::Healthy),
            "<no value>" => {
                // No health check defined; fall back to the running flag.
                let output = run_cli(
                    "docker",
                    &["inspect", "--format={{.State.Running}}", container_name],
                )
                .await?;
                let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
                Ok(if running {
                    ContainerHealth::RunningNoHealthCheck
                } else {
                    ContainerHealth::NotRunning
                })
            }
            "unhealthy" | "starting" => Ok(ContainerHealth::Unhealthy),
            _ => Ok(ContainerHealth::NotRunning),
        }
    }
}

/// systemd adapter (`systemctl is-active`).
pub struct SystemdCli;

#[async_trait]
impl ServiceSupervisor for SystemdCli {
    async fn is_active(&self, service_name: &str) -> HostResult<bool> {
        let output = run_cli("systemctl", &["is-active", service_name]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "active")
    }
}

/// reqwest-backed HTTP probe.
pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl ReqwestProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn get_status(&self, url: &str, timeout: Duration) -> HostResult<u16> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| HostError(format!("request failed: {}", e)))?;
        Ok(response.status().as_u16())
    }
}
