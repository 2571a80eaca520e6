//! Shared fixtures: in-process host adapter fakes and package builders.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use update_engine::host::{
    ContainerHealth, ContainerRuntime, HostAdapters, HostError, HttpProbe, ServiceSupervisor,
};

type HostResult<T> = Result<T, HostError>;

/// Container runtime fake: records every invocation, succeeds unless told
/// otherwise.
#[derive(Default)]
pub struct FakeContainers {
    pub calls: Mutex<Vec<String>>,
    pub fail_compose_up: bool,
}

#[async_trait]
impl ContainerRuntime for FakeContainers {
    async fn compose_down(&self, compose_file: &Path, timeout_secs: u64) -> HostResult<String> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("compose_down {} {}", compose_file.display(), timeout_secs));
        Ok(String::new())
    }

    async fn compose_up(&self, compose_file: &Path, detach: bool, build: bool) -> HostResult<String> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("compose_up {} {} {}", compose_file.display(), detach, build));
        if self.fail_compose_up {
            Err(HostError("compose up exploded".into()))
        } else {
            Ok(String::new())
        }
    }

    async fn load_image(&self, image_tar: &Path) -> HostResult<String> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("load_image {}", image_tar.display()));
        Ok("Loaded image: app:latest".into())
    }

    async fn prune_images(&self, all: bool, force: bool) -> HostResult<String> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("prune {} {}", all, force));
        Ok(String::new())
    }

    async fn daemon_running(&self) -> HostResult<bool> {
        Ok(true)
    }

    async fn container_health(&self, _container_name: &str) -> HostResult<ContainerHealth> {
        Ok(ContainerHealth::Healthy)
    }
}

pub struct FakeServices {
    pub active: bool,
}

#[async_trait]
impl ServiceSupervisor for FakeServices {
    async fn is_active(&self, _service_name: &str) -> HostResult<bool> {
        Ok(self.active)
    }
}

/// HTTP probe fake: pops scripted status codes, then repeats the last one.
pub struct FakeHttp {
    pub statuses: Mutex<VecDeque<u16>>,
}

impl FakeHttp {
    pub fn always(status: u16) -> Self {
        Self {
            statuses: Mutex::new(VecDeque::from(vec![status])),
        }
    }

    pub fn sequence(statuses: &[u16]) -> Self {
        Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
        }
    }
}

#[async_trait]
impl HttpProbe for FakeHttp {
    async fn get_status(&self, _url: &str, _timeout: Duration) -> HostResult<u16> {
        let mut statuses = self.statuses.lock().unwrap();
        if statuses.len() > 1 {
            Ok(statuses.pop_front().unwrap())
        } else {
            statuses
                .front()
                .copied()
                .ok_or_else(|| HostError("no scripted status".into()))
        }
    }
}

pub fn fake_host() -> HostAdapters {
    HostAdapters {
        containers: std::sync::Arc::new(FakeContainers::default()),
        services: std::sync::Arc::new(FakeServices { active: true }),
        http: std::sync::Arc::new(FakeHttp::always(200)),
    }
}

// ── package builder ──

/// Build a `.tar.gz` package with a generated `checksums.md5` covering
/// every file. Returns the archive path.
pub fn build_package(dir: &Path, manifest_yaml: &str, files: &[(&str, &[u8])]) -> std::path::PathBuf {
    build_package_with(dir, manifest_yaml, files, &[], |_| {})
}

/// Full-control package builder: `extra_exec` entries are added with mode
/// 0755, and `tweak` can mutate the checksum lines before they are written
/// (to fabricate integrity failures).
pub fn build_package_with(
    dir: &Path,
    manifest_yaml: &str,
    files: &[(&str, &[u8])],
    extra_exec: &[(&str, &[u8])],
    tweak: impl FnOnce(&mut Vec<String>),
) -> std::path::PathBuf {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use md5::{Digest, Md5};

    let md5_hex = |data: &[u8]| -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    };

    let mut checksum_lines: Vec<String> =
        vec![format!("{}  manifest.yml", md5_hex(manifest_yaml.as_bytes()))];
    for (name, contents) in files.iter().chain(extra_exec.iter()) {
        checksum_lines.push(format!("{}  {}", md5_hex(contents), name));
    }
    checksum_lines.sort();
    tweak(&mut checksum_lines);
    let checksums = format!("{}\n", checksum_lines.join("\n"));

    let archive = dir.join("package.tar.gz");
    let file = std::fs::File::create(&archive).unwrap();
    let enc = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(enc);

    let mut append = |name: &str, contents: &[u8], mode: u32| {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(mode);
        header.set_cksum();
        builder.append_data(&mut header, name, contents).unwrap();
    };

    append("manifest.yml", manifest_yaml.as_bytes(), 0o644);
    append("checksums.md5", checksums.as_bytes(), 0o644);
    for (name, contents) in files {
        append(name, contents, 0o644);
    }
    for (name, contents) in extra_exec {
        append(name, contents, 0o755);
    }

    builder.into_inner().unwrap().finish().unwrap();
    archive
}
