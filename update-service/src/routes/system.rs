//! Host overview for the UI dashboard.

use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

#[derive(Serialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub disk_usage: DiskUsage,
    pub memory: MemoryUsage,
}

#[derive(Serialize)]
pub struct DiskUsage {
    pub total: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Serialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub available: u64,
    pub percent: f64,
}

pub async fn system_info(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SystemInfo>, AppError> {
    let base_dir = state.config.engine.base_dir.clone();
    let info = tokio::task::spawn_blocking(move || -> anyhow::Result<SystemInfo> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(SystemInfo {
            hostname,
            disk_usage: disk_usage(&base_dir)?,
            memory: memory_usage()?,
        })
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    Ok(Json(info))
}

fn disk_usage(path: &Path) -> anyhow::Result<DiskUsage> {
    let total = fs2::total_space(path)?;
    let free = fs2::available_space(path)?;
    let percent = if total > 0 {
        ((total - free) as f64 / total as f64) * 100.0
    } else {
        0.0
    };
    Ok(DiskUsage { total, free, percent })
}

/// Parse MemTotal/MemAvailable out of /proc/meminfo (values are in kB).
fn memory_usage() -> anyhow::Result<MemoryUsage> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")?;
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()
            .map(|kb| kb * 1024)
    };
    let total = field("MemTotal:").unwrap_or(0);
    let available = field("MemAvailable:").unwrap_or(0);
    let percent = if total > 0 {
        ((total - available) as f64 / total as f64) * 100.0
    } else {
        0.0
    };
    Ok(MemoryUsage {
        total,
        available,
        percent,
    })
}
