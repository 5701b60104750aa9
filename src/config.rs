//! Configuration management for lokikit.
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::runtime::expand_home;

/// Default base directory, before `~` expansion.
pub const DEFAULT_BASE_DIR: &str = "~/.lokikit";
/// Default bind host.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default grafana port.
pub const DEFAULT_GRAFANA_PORT: u16 = 3000;
/// Default loki port.
pub const DEFAULT_LOKI_PORT: u16 = 3100;
/// Default promtail port.
pub const DEFAULT_PROMTAIL_PORT: u16 = 9080;

/// Raw contents of a `--config` YAML file. Every key is optional.
#[derive(Debug, Default, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    /// Base directory for downloads, configs, logs and the PID file.
    pub base_dir: Option<String>,
    /// Bind host for all services.
    pub host: Option<String>,
    /// Grafana port.
    pub grafana_port: Option<u16>,
    /// Loki port.
    pub loki_port: Option<u16>,
    /// Promtail port.
    pub promtail_port: Option<u16>,
    /// Pinned loki/promtail release, without the leading `v`.
    pub loki_version: Option<String>,
    /// Pinned grafana release.
    pub grafana_version: Option<String>,
    /// Promtail-specific settings.
    pub promtail: PromtailSection,
}

/// `promtail:` block of the config file.
#[derive(Debug, Default, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromtailSection {
    /// Extra files or globs to ship.
    pub log_paths: Vec<LogPathEntry>,
}

/// One extra log source: either a bare path or a path with a job name and labels.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum LogPathEntry {
    Plain(String),
    Detailed {
        path: String,
        #[serde(default)]
        job: Option<String>,
        #[serde(default)]
        labels: BTreeMap<String, String>,
    },
}

impl LogPathEntry {
    /// File or glob being watched.
    pub fn path(&self) -> &str {
        match self {
            LogPathEntry::Plain(path) => path,
            LogPathEntry::Detailed { path, .. } => path,
        }
    }
}

/// Values supplied on the command line; `None` means "not given".
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub base_dir: Option<String>,
    pub host: Option<String>,
    pub grafana_port: Option<u16>,
    pub loki_port: Option<u16>,
    pub promtail_port: Option<u16>,
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub base_dir: PathBuf,
    pub host: String,
    pub grafana_port: u16,
    pub loki_port: u16,
    pub promtail_port: u16,
    pub loki_version: Option<String>,
    pub grafana_version: Option<String>,
    pub log_paths: Vec<LogPathEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(CliOverrides::default(), FileConfig::default())
    }
}

impl Config {
    /// Merges sources with command-line values taking precedence over the file.
    pub fn resolve(cli: CliOverrides, file: FileConfig) -> Self {
        let base_dir = cli
            .base_dir
            .or(file.base_dir)
            .unwrap_or_else(|| DEFAULT_BASE_DIR.to_string());

        Self {
            base_dir: expand_home(&base_dir),
            host: cli
                .host
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            grafana_port: cli
                .grafana_port
                .or(file.grafana_port)
                .unwrap_or(DEFAULT_GRAFANA_PORT),
            loki_port: cli.loki_port.or(file.loki_port).unwrap_or(DEFAULT_LOKI_PORT),
            promtail_port: cli
                .promtail_port
                .or(file.promtail_port)
                .unwrap_or(DEFAULT_PROMTAIL_PORT),
            loki_version: file.loki_version,
            grafana_version: file.grafana_version,
            log_paths: file.promtail.log_paths,
        }
    }
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex is valid")
    })
}

/// Expands `${VAR}` references from the environment. Unknown variables are left as written.
pub fn expand_env_vars(input: &str) -> String {
    env_pattern()
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    warn!("Environment variable {var_name} is not set; leaving it unexpanded");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

/// Parses config file text after environment expansion.
pub fn parse_config(content: &str) -> Result<FileConfig, serde_yaml::Error> {
    let expanded = expand_env_vars(content);
    let parsed: Option<FileConfig> = serde_yaml::from_str(&expanded)?;
    Ok(parsed.unwrap_or_default())
}

/// Loads the YAML config file, if any.
///
/// A missing or invalid file is reported as a warning and yields an empty config so the
/// built-in defaults apply.
pub fn load_config(config_path: Option<&Path>) -> FileConfig {
    let Some(path) = config_path else {
        return FileConfig::default();
    };

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!(
                "Config file {} could not be read ({err}), using defaults.",
                path.display()
            );
            return FileConfig::default();
        }
    };

    match parse_config(&content) {
        Ok(config) => {
            debug!("Loaded configuration from {}", path.display());
            config
        }
        Err(err) => {
            warn!(
                "Error loading config file {}: {err}. Using defaults.",
                path.display()
            );
            FileConfig::default()
        }
    }
}
