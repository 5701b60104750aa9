//! lokikit runs a local Loki, Promtail and Grafana stack as supervised child processes.
//! It downloads the binaries, writes their configuration, starts them in the right order,
//! waits until their ports answer and tracks their PIDs so later invocations can report
//! status or shut everything down cleanly.

/// Release discovery and binary downloads.
pub mod binaries;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Error handling.
pub mod error;

/// Child process launching.
pub mod launcher;

/// Logs management.
pub mod logs;

/// Process liveness and port probes.
pub mod probe;

/// Promtail config edits for `lokikit watch`.
pub mod promtail;

/// Readiness waiting after launch.
pub mod readiness;

/// PID registry.
pub mod registry;

/// Paths and shutdown plumbing shared by every command.
pub mod runtime;

/// Service identities and command lines.
pub mod service;

/// First-run setup.
pub mod setup;

/// Start, stop and status orchestration.
pub mod supervisor;

/// Generated configuration files.
pub mod templates;

/// Graceful termination.
pub mod terminate;

#[cfg(test)]
mod test_utils;
