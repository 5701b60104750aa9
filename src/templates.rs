//! Rendering of the loki, promtail and grafana datasource configuration files.
use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{config::LogPathEntry, probe::probe_host};

/// Render loki's single-binary config with filesystem storage under `data_dir`.
pub fn render_loki_config(host: &str, loki_port: u16, data_dir: &Path) -> String {
    let data = data_dir.display();
    format!(
        r#"auth_enabled: false
server:
  http_listen_port: {loki_port}
  http_listen_address: {host}
common:
  path_prefix: {data}
  storage:
    filesystem:
      chunks_directory: {data}/chunks
      rules_directory: {data}/rules
  replication_factor: 1
  ring:
    kvstore:
      store: inmemory
query_range:
  results_cache:
    cache:
      embedded_cache:
        enabled: true
        max_size_mb: 100
schema_config:
  configs:
    - from: 2020-10-24
      store: boltdb-shipper
      object_store: filesystem
      schema: v11
      index:
        prefix: index_
        period: 24h
limits_config:
  max_query_length: 8760h
  allow_structured_metadata: false
  reject_old_samples: true
  reject_old_samples_max_age: 168h
ruler:
  alertmanager_url: http://localhost:9093
"#
    )
}

/// One promtail scrape job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeConfig {
    pub job_name: String,
    pub static_configs: Vec<StaticConfig>,
}

/// Files picked up by a scrape job, identified by the `__path__` label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticConfig {
    pub targets: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl StaticConfig {
    pub fn new(job: &str, path: &str, extra: &BTreeMap<String, String>) -> Self {
        let mut labels = extra.clone();
        labels.insert("job".to_string(), job.to_string());
        labels.insert("__path__".to_string(), path.to_string());
        Self {
            targets: vec!["localhost".to_string()],
            labels,
        }
    }
}

impl ScrapeConfig {
    pub fn new(job: &str, path: &str, labels: &BTreeMap<String, String>) -> Self {
        Self {
            job_name: job.to_string(),
            static_configs: vec![StaticConfig::new(job, path, labels)],
        }
    }
}

#[derive(Serialize)]
struct PromtailConfig {
    server: PromtailServer,
    positions: Positions,
    clients: Vec<Client>,
    scrape_configs: Vec<ScrapeConfig>,
}

#[derive(Serialize)]
struct PromtailServer {
    http_listen_port: u16,
    http_listen_address: String,
    grpc_listen_port: u16,
}

#[derive(Serialize)]
struct Positions {
    filename: String,
}

#[derive(Serialize)]
struct Client {
    url: String,
}

/// Settings consumed by [`render_promtail_config`].
#[derive(Debug, Clone)]
pub struct PromtailParams<'a> {
    pub base_dir: &'a Path,
    pub host: &'a str,
    pub loki_port: u16,
    pub promtail_port: u16,
    pub log_paths: &'a [LogPathEntry],
}

/// Scrape jobs for lokikit's own logs followed by the configured extra paths.
pub fn scrape_configs(base_dir: &Path, log_paths: &[LogPathEntry]) -> Vec<ScrapeConfig> {
    let logs_dir = base_dir.join("logs");
    let source_labels = |kind: &str| -> BTreeMap<String, String> {
        [("source", "lokikit"), ("type", kind)]
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    };

    let mut jobs = vec![
        ScrapeConfig::new(
            "service_logs",
            &logs_dir.join("*.log").display().to_string(),
            &source_labels("service_log"),
        ),
        ScrapeConfig::new(
            "lokikit_app",
            &logs_dir.join("lokikit_*.log").display().to_string(),
            &source_labels("application_log"),
        ),
    ];

    // Numbering continues after the built-in jobs.
    let built_in = jobs.len();
    for (index, entry) in log_paths.iter().enumerate() {
        let index = index + built_in;
        let job = match entry {
            LogPathEntry::Detailed {
                path,
                job: Some(job),
                labels,
            } if !path.is_empty() => ScrapeConfig::new(job, path, labels),
            entry if !entry.path().is_empty() => ScrapeConfig::new(
                &format!("logfile_{index}"),
                entry.path(),
                &BTreeMap::new(),
            ),
            _ => continue,
        };
        jobs.push(job);
    }
    jobs
}

/// Renders promtail's YAML config.
pub fn render_promtail_config(params: &PromtailParams<'_>) -> Result<String, serde_yaml::Error> {
    let config = PromtailConfig {
        server: PromtailServer {
            http_listen_port: params.promtail_port,
            http_listen_address: params.host.to_string(),
            grpc_listen_port: 0,
        },
        positions: Positions {
            filename: params.base_dir.join("positions.yaml").display().to_string(),
        },
        clients: vec![Client {
            url: format!(
                "http://{}:{}/loki/api/v1/push",
                probe_host(params.host),
                params.loki_port
            ),
        }],
        scrape_configs: scrape_configs(params.base_dir, params.log_paths),
    };
    serde_yaml::to_string(&config)
}

/// Grafana provisioning file registering loki as the default datasource.
pub fn render_datasource(host: &str, loki_port: u16) -> Result<String, serde_yaml::Error> {
    let datasource = json!({
        "apiVersion": 1,
        "datasources": [{
            "name": "lokikit",
            "type": "loki",
            "access": "proxy",
            "url": format!("http://{}:{loki_port}", probe_host(host)),
            "isDefault": true,
            "jsonData": { "maxLines": 1000, "timeout": 60 },
        }],
    });
    serde_yaml::to_string(&datasource)
}
