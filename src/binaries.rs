//! Locating, and when missing downloading, the service executables.
use std::{
    env::consts,
    fs::{self, File},
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    error::{DownloadError, ProcessManagerError},
    service::ServiceName,
};

/// Release naming for the host, e.g. `linux`/`amd64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
}

impl Platform {
    /// Maps the compile-time target to release naming.
    pub fn detect() -> Result<Self, ProcessManagerError> {
        Self::from_target(consts::OS, consts::ARCH)
    }

    pub fn from_target(os: &str, arch: &str) -> Result<Self, ProcessManagerError> {
        let unsupported = || ProcessManagerError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        };
        let os = match os {
            "linux" => "linux",
            "macos" | "darwin" => "darwin",
            "windows" => "windows",
            _ => return Err(unsupported()),
        };
        let arch = match arch {
            "x86_64" | "amd64" => "amd64",
            "aarch64" | "arm64" => "arm64",
            _ => return Err(unsupported()),
        };
        Ok(Self { os, arch })
    }

    fn exe_suffix(&self) -> &'static str {
        if self.os == "windows" { ".exe" } else { "" }
    }

    fn grafana_archive_ext(&self) -> &'static str {
        if self.os == "windows" { "zip" } else { "tar.gz" }
    }

    /// Artifact stem for loki and promtail, e.g. `loki-linux-amd64`.
    pub fn artifact_name(&self, service: ServiceName) -> String {
        format!("{service}-{}-{}", self.os, self.arch)
    }
}

/// Resolved executables for all three services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binaries {
    pub loki: PathBuf,
    pub promtail: PathBuf,
    pub grafana: PathBuf,
}

/// Where the extracted loki or promtail binary lives.
pub fn agent_binary_path(base_dir: &Path, platform: Platform, service: ServiceName) -> PathBuf {
    base_dir.join(format!(
        "{}{}",
        platform.artifact_name(service),
        platform.exe_suffix()
    ))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Scans `<base_dir>/grafana*/bin/` for the server executable, preferring the highest version.
pub fn find_grafana_binary(base_dir: &Path, platform: Platform) -> Option<PathBuf> {
    let binary_name = format!("grafana-server{}", platform.exe_suffix());
    let entries = fs::read_dir(base_dir).ok()?;

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("grafana"))
        .map(|entry| entry.path().join("bin").join(&binary_name))
        .filter(|path| {
            !path
                .components()
                .any(|component| component.as_os_str() == "packaging")
        })
        .filter(|path| is_executable(path))
        .collect();
    candidates.sort_by_cached_key(|path| (grafana_version_key(path), path.clone()));
    candidates.pop()
}

/// Numeric version parts of the `grafana*` directory holding `binary`, e.g.
/// `grafana-v11.2.0` -> `[11, 2, 0]`.
fn grafana_version_key(binary: &Path) -> Vec<u64> {
    let dir_name = binary
        .ancestors()
        .nth(2)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    dir_name
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Finds every executable, or lists the services whose binaries are missing.
pub fn locate_binaries(
    base_dir: &Path,
    platform: Platform,
) -> Result<Binaries, Vec<ServiceName>> {
    let loki = agent_binary_path(base_dir, platform, ServiceName::Loki);
    let promtail = agent_binary_path(base_dir, platform, ServiceName::Promtail);
    let grafana = find_grafana_binary(base_dir, platform);

    let mut missing = Vec::new();
    if !loki.is_file() {
        missing.push(ServiceName::Loki);
    }
    if !promtail.is_file() {
        missing.push(ServiceName::Promtail);
    }
    if grafana.is_none() {
        missing.push(ServiceName::Grafana);
    }

    match grafana {
        Some(grafana) if missing.is_empty() => Ok(Binaries {
            loki,
            promtail,
            grafana,
        }),
        _ => Err(missing),
    }
}

pub fn loki_download_url(version: &str, platform: Platform, service: ServiceName) -> String {
    format!(
        "https://github.com/grafana/loki/releases/download/v{version}/{}.zip",
        platform.artifact_name(service)
    )
}

pub fn grafana_download_url(version: &str, platform: Platform) -> String {
    format!(
        "https://dl.grafana.com/oss/release/grafana-{version}.{}-{}.{}",
        platform.os,
        platform.arch,
        platform.grafana_archive_ext()
    )
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: Option<String>,
}

/// Thin GitHub and artifact client.
#[derive(Debug, Clone)]
pub struct ReleaseClient {
    client: Client,
}

impl ReleaseClient {
    pub fn new() -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(concat!("lokikit/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self { client })
    }

    /// Latest release tag of `grafana/<repo>`, without the leading `v`.
    pub fn latest_version(&self, repo: &str) -> Result<String, DownloadError> {
        let url = format!("https://api.github.com/repos/grafana/{repo}/releases/latest");
        debug!("Querying {url}");
        let body = self.client.get(&url).send()?.error_for_status()?.text()?;
        let release: Release = serde_json::from_str(&body)
            .map_err(|_| DownloadError::MissingTag(repo.to_string()))?;
        release
            .tag_name
            .map(|tag| tag.trim_start_matches('v').to_string())
            .ok_or_else(|| DownloadError::MissingTag(repo.to_string()))
    }

    /// Downloads `url` into `dest` and unpacks it there.
    pub fn download_and_extract(&self, url: &str, dest: &Path) -> Result<PathBuf, DownloadError> {
        let file_name = url.rsplit('/').next().unwrap_or("artifact");
        let archive = dest.join(file_name);

        info!("Downloading {url} ...");
        let mut response = self.client.get(url).send()?.error_for_status()?;
        fs::create_dir_all(dest)?;
        let mut file = File::create(&archive)?;
        io::copy(&mut response, &mut file)?;
        debug!("Downloaded to {}", archive.display());

        extract(&archive, dest)?;
        Ok(archive)
    }
}

fn extract(archive: &Path, dest: &Path) -> Result<(), DownloadError> {
    let name = archive.to_string_lossy();
    let mut cmd = if name.ends_with(".zip") {
        let mut cmd = Command::new("unzip");
        cmd.arg("-o").arg(archive).arg("-d").arg(dest);
        cmd
    } else {
        let mut cmd = Command::new("tar");
        cmd.arg("-xzf").arg(archive).arg("-C").arg(dest);
        cmd
    };

    let output = cmd.output()?;
    if !output.status.success() {
        return Err(DownloadError::Extract {
            archive: archive.to_path_buf(),
            status: output.status.code(),
        });
    }
    Ok(())
}

/// Sets mode 0755 on an extracted binary.
pub fn make_executable(path: &Path) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}
