//! `lokikit setup`: fetch binaries and write configuration files.
use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{
    binaries::{
        Platform, ReleaseClient, agent_binary_path, find_grafana_binary, grafana_download_url,
        loki_download_url, make_executable,
    },
    config::Config,
    error::ProcessManagerError,
    runtime::RuntimeLayout,
    service::{ServiceName, grafana_home},
    templates::{PromtailParams, render_datasource, render_loki_config, render_promtail_config},
};

/// Writes the loki and promtail configs under the base directory.
pub fn write_service_configs(config: &Config) -> Result<(), ProcessManagerError> {
    let layout = RuntimeLayout::new(&config.base_dir);
    fs::create_dir_all(layout.base_dir())?;

    let loki = render_loki_config(
        &config.host,
        config.loki_port,
        &layout.base_dir().join("loki-data"),
    );
    debug!("Writing Loki configuration to {}", layout.loki_config().display());
    fs::write(layout.loki_config(), loki)?;

    let promtail = render_promtail_config(&PromtailParams {
        base_dir: layout.base_dir(),
        host: &config.host,
        loki_port: config.loki_port,
        promtail_port: config.promtail_port,
        log_paths: &config.log_paths,
    })?;
    debug!(
        "Writing Promtail configuration to {}",
        layout.promtail_config().display()
    );
    fs::write(layout.promtail_config(), promtail)?;
    Ok(())
}

/// Provisions the loki datasource next to the grafana binary unless one already exists.
pub fn ensure_datasource(
    grafana_binary: &Path,
    host: &str,
    loki_port: u16,
) -> Result<PathBuf, ProcessManagerError> {
    let dir = grafana_home(grafana_binary)
        .join("conf")
        .join("provisioning")
        .join("datasources");
    fs::create_dir_all(&dir)?;

    let path = dir.join("lokikit.yaml");
    if path.exists() {
        debug!("Loki datasource configuration already exists at {}", path.display());
    } else {
        fs::write(&path, render_datasource(host, loki_port)?)?;
        info!("Created Loki datasource configuration for Grafana at {}", path.display());
    }
    Ok(path)
}

/// Resolves a pinned version or asks GitHub for the latest release, at most once.
struct VersionResolver<'a> {
    client: &'a ReleaseClient,
    pinned: Option<String>,
    repo: &'static str,
}

impl VersionResolver<'_> {
    fn get(&mut self) -> Result<String, ProcessManagerError> {
        if let Some(version) = &self.pinned {
            return Ok(version.clone());
        }
        let version = self.client.latest_version(self.repo)?;
        info!("Using latest {} release {version}", self.repo);
        self.pinned = Some(version.clone());
        Ok(version)
    }
}

/// Downloads whatever binaries are missing, then writes configs and the datasource.
pub fn run_setup(config: &Config) -> Result<(), ProcessManagerError> {
    let base_dir = config.base_dir.as_path();
    fs::create_dir_all(base_dir)?;
    let platform = Platform::detect()?;
    let client = ReleaseClient::new()?;

    let mut loki_version = VersionResolver {
        client: &client,
        pinned: config.loki_version.clone(),
        repo: "loki",
    };
    for service in [ServiceName::Loki, ServiceName::Promtail] {
        let binary = agent_binary_path(base_dir, platform, service);
        if binary.exists() {
            info!(
                "{} binary already exists at {}, skipping download.",
                service.title(),
                binary.display()
            );
            continue;
        }
        let url = loki_download_url(&loki_version.get()?, platform, service);
        client.download_and_extract(&url, base_dir)?;
        make_executable(&binary)?;
        info!("{} binary downloaded and extracted.", service.title());
    }

    let grafana = match find_grafana_binary(base_dir, platform) {
        Some(binary) => {
            info!(
                "Grafana binary already exists at {}, skipping download.",
                binary.display()
            );
            Some(binary)
        }
        None => {
            let mut grafana_version = VersionResolver {
                client: &client,
                pinned: config.grafana_version.clone(),
                repo: "grafana",
            };
            let url = grafana_download_url(&grafana_version.get()?, platform);
            client.download_and_extract(&url, base_dir)?;
            let binary = find_grafana_binary(base_dir, platform);
            match &binary {
                Some(path) => {
                    make_executable(path)?;
                    info!("Grafana downloaded and extracted.");
                }
                None => warn!("Could not find grafana-server binary after extraction."),
            }
            binary
        }
    };

    write_service_configs(config)?;

    if let Some(binary) = grafana {
        ensure_datasource(&binary, &config.host, config.loki_port)?;
    }

    info!("Setup complete.");
    Ok(())
}
