//! Identity and launch descriptors for the three managed services.
use std::path::{Path, PathBuf};

use strum_macros::{AsRefStr, Display, EnumString};

/// One of the three services lokikit manages.
///
/// The declaration order is the launch order and the order entries are written to the
/// PID file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumString, AsRefStr, Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum ServiceName {
    /// Log aggregator.
    Loki,
    /// Log shipping agent.
    Promtail,
    /// Dashboard server.
    Grafana,
}

impl ServiceName {
    /// Every managed service, in launch order.
    pub const ALL: [ServiceName; 3] =
        [ServiceName::Loki, ServiceName::Promtail, ServiceName::Grafana];

    /// Substring expected in the command line of a running instance of this service.
    pub fn process_pattern(&self) -> &'static str {
        match self {
            ServiceName::Loki => "loki-",
            ServiceName::Promtail => "promtail-",
            ServiceName::Grafana => "grafana-server",
        }
    }

    /// Name with the first letter capitalised, for user-facing summaries.
    pub fn title(&self) -> &'static str {
        match self {
            ServiceName::Loki => "Loki",
            ServiceName::Promtail => "Promtail",
            ServiceName::Grafana => "Grafana",
        }
    }
}

/// Resolved launch specification for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Which service this describes.
    pub name: ServiceName,
    /// Executable to run.
    pub executable_path: PathBuf,
    /// Arguments passed to the executable, in order.
    pub launch_args: Vec<String>,
    /// File receiving combined stdout and stderr.
    pub log_file_path: PathBuf,
    /// Host the service binds to.
    pub host: String,
    /// Port used for readiness checks.
    pub port: u16,
}

impl ServiceDescriptor {
    /// Loki reads everything from its YAML config.
    pub fn loki(
        binary: &Path,
        config_file: &Path,
        log_file: PathBuf,
        host: &str,
        port: u16,
    ) -> Self {
        Self {
            name: ServiceName::Loki,
            executable_path: binary.to_path_buf(),
            launch_args: vec![
                "-config.file".to_string(),
                config_file.display().to_string(),
            ],
            log_file_path: log_file,
            host: host.to_string(),
            port,
        }
    }

    /// Promtail reads everything from its YAML config.
    pub fn promtail(
        binary: &Path,
        config_file: &Path,
        log_file: PathBuf,
        host: &str,
        port: u16,
    ) -> Self {
        Self {
            name: ServiceName::Promtail,
            executable_path: binary.to_path_buf(),
            launch_args: vec![
                "-config.file".to_string(),
                config_file.display().to_string(),
            ],
            log_file_path: log_file,
            host: host.to_string(),
            port,
        }
    }

    /// Grafana runs from its unpacked home with the bind address passed as overrides.
    pub fn grafana(binary: &Path, log_file: PathBuf, host: &str, port: u16) -> Self {
        let home = grafana_home(binary);
        Self {
            name: ServiceName::Grafana,
            executable_path: binary.to_path_buf(),
            launch_args: vec![
                "--homepath".to_string(),
                home.display().to_string(),
                "--config".to_string(),
                home.join("conf").join("defaults.ini").display().to_string(),
                "--configOverrides".to_string(),
                format!("server.http_addr={host};server.http_port={port}"),
            ],
            log_file_path: log_file,
            host: host.to_string(),
            port,
        }
    }

    /// Full command line, for logging.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.executable_path.display().to_string()];
        parts.extend(self.launch_args.iter().cloned());
        parts.join(" ")
    }
}

/// Grafana's home directory is the grandparent of `bin/grafana-server`.
pub fn grafana_home(binary: &Path) -> PathBuf {
    binary
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
