//! Error handling for lokikit.
use std::path::PathBuf;

use thiserror::Error;

use crate::service::ServiceName;

/// Defines all possible errors that can occur while managing the stack.
#[derive(Debug, Error)]
pub enum ProcessManagerError {
    /// Generic filesystem failure (creating directories, writing configs).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// One or more service executables could not be located.
    #[error(
        "Missing binaries {}. Please run 'lokikit setup' first.",
        join_names(.services)
    )]
    MissingBinaries {
        /// Services whose executable is missing.
        services: Vec<ServiceName>,
    },

    /// Error spawning a service process.
    #[error("Failed to start service '{service}': {source}")]
    ServiceStartError {
        /// The service name that failed to start.
        service: ServiceName,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// `clean` refused to run because tracked services are alive.
    #[error("Services are still running. Please stop them first using 'lokikit stop'.")]
    ServicesStillRunning,

    /// Removing the base directory failed.
    #[error("Failed to remove directory {}: {source}", .path.display())]
    CleanError {
        /// Directory that could not be removed.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error for PID file.
    #[error("PID file error: {0}")]
    PidFileError(#[from] PidFileError),

    /// Error while fetching or unpacking a release artifact.
    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    /// The host OS or CPU architecture has no published release.
    #[error("Unsupported platform: {os}/{arch}")]
    UnsupportedPlatform {
        /// Value of `std::env::consts::OS`.
        os: String,
        /// Value of `std::env::consts::ARCH`.
        arch: String,
    },

    /// The promtail configuration could not be updated.
    #[error("Promtail configuration error: {0}")]
    PromtailConfig(String),
}

fn join_names(services: &[ServiceName]) -> String {
    services
        .iter()
        .map(|service| service.as_ref())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading a PID file.
    #[error("Failed to read PID file {}: {source}", .path.display())]
    ReadError {
        /// Location of the PID file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error writing or removing a PID file.
    #[error("Failed to write PID file {}: {source}", .path.display())]
    WriteError {
        /// Location of the PID file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Error type for artifact downloads.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// HTTP request failed or returned a non-success status.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Writing the archive to disk failed.
    #[error("Failed to write archive: {0}")]
    Io(#[from] std::io::Error),

    /// The extraction tool exited unsuccessfully.
    #[error("Failed to extract {}: extractor exited with status {status:?}", .archive.display())]
    Extract {
        /// Archive that could not be extracted.
        archive: PathBuf,
        /// Exit code of the extractor, if any.
        status: Option<i32>,
    },

    /// The release API response carried no `tag_name`.
    #[error("Release metadata for {0} has no tag_name")]
    MissingTag(String),
}
