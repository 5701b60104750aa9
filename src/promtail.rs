//! `lokikit watch`: adding log paths to an existing promtail config.
use std::{
    collections::BTreeMap,
    fs,
    hash::{DefaultHasher, Hash, Hasher},
    path::Path,
};

use serde_yaml::Value;
use tracing::{info, warn};

use crate::{
    error::ProcessManagerError,
    probe::{ProcessTable, check_services_running},
    registry::PidFile,
    runtime::{RuntimeLayout, expand_home},
    templates::{ScrapeConfig, StaticConfig},
};

/// Parses `key=value` labels; malformed entries are reported and skipped.
pub fn parse_labels(raw: &[String]) -> BTreeMap<String, String> {
    raw.iter()
        .filter_map(|label| match label.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Some((key.trim().to_string(), value.trim().to_string()))
            }
            _ => {
                warn!("Ignoring invalid label format: {label}. Use key=value format.");
                None
            }
        })
        .collect()
}

/// Stable job name derived from the watched path.
pub fn default_job_name(path: &str) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    format!("job_{}", hasher.finish() % 10_000)
}

fn config_error(message: impl Into<String>) -> ProcessManagerError {
    ProcessManagerError::PromtailConfig(message.into())
}

fn watches_path(job: &Value, path: &str) -> bool {
    job.get("static_configs")
        .and_then(Value::as_sequence)
        .into_iter()
        .flatten()
        .any(|static_config| {
            static_config
                .get("labels")
                .and_then(|labels| labels.get("__path__"))
                .and_then(Value::as_str)
                == Some(path)
        })
}

/// Adds `path` to the promtail config in `base_dir`.
///
/// Returns `Ok(false)` when the job already watches the path.
pub fn update_promtail_config(
    base_dir: &Path,
    path: &str,
    job: Option<&str>,
    labels: &BTreeMap<String, String>,
) -> Result<bool, ProcessManagerError> {
    let config_path = RuntimeLayout::new(base_dir).promtail_config();
    if !config_path.exists() {
        return Err(config_error(format!(
            "Promtail config not found at {}. Run 'lokikit setup' first.",
            config_path.display()
        )));
    }

    let contents = fs::read_to_string(&config_path)?;
    let mut config: Value = serde_yaml::from_str(&contents)?;
    let root = config
        .as_mapping_mut()
        .ok_or_else(|| config_error("Invalid Promtail config: expected a mapping"))?;

    let path = expand_home(path).display().to_string();
    let job_name = job
        .map(str::to_string)
        .unwrap_or_else(|| default_job_name(&path));

    let jobs = root
        .entry(Value::from("scrape_configs"))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    if jobs.is_null() {
        *jobs = Value::Sequence(Vec::new());
    }
    let jobs = jobs
        .as_sequence_mut()
        .ok_or_else(|| config_error("Invalid Promtail config: scrape_configs is not a list"))?;

    let existing = jobs
        .iter_mut()
        .find(|entry| entry.get("job_name").and_then(Value::as_str) == Some(job_name.as_str()));

    match existing {
        Some(entry) if watches_path(&*entry, &path) => {
            info!("Path {path} is already being watched by job '{job_name}'.");
            return Ok(false);
        }
        Some(entry) => {
            let static_config = serde_yaml::to_value(StaticConfig::new(&job_name, &path, labels))?;
            let mapping = entry
                .as_mapping_mut()
                .ok_or_else(|| config_error(format!("Job '{job_name}' is not a mapping")))?;
            let static_configs = mapping
                .entry(Value::from("static_configs"))
                .or_insert_with(|| Value::Sequence(Vec::new()));
            if !static_configs.is_sequence() {
                *static_configs = Value::Sequence(Vec::new());
            }
            if let Some(list) = static_configs.as_sequence_mut() {
                list.push(static_config);
            }
            info!("Added {path} to existing job '{job_name}' in Promtail configuration.");
        }
        None => {
            jobs.push(serde_yaml::to_value(ScrapeConfig::new(&job_name, &path, labels))?);
            info!("Added {path} to Promtail configuration with job name '{job_name}'.");
        }
    }

    fs::write(&config_path, serde_yaml::to_string(&config)?)?;
    Ok(true)
}

/// `lokikit watch`: parses labels, updates the config and hints at a restart when the
/// tracked services are live.
pub fn watch<T: ProcessTable>(
    base_dir: &Path,
    path: &str,
    job: Option<&str>,
    raw_labels: &[String],
    table: &T,
) -> Result<bool, ProcessManagerError> {
    let labels = parse_labels(raw_labels);
    let changed = update_promtail_config(base_dir, path, job, &labels)?;
    if !changed {
        info!("No changes made to Promtail configuration.");
        return Ok(false);
    }

    if let Some(mut pid_file) = PidFile::load(base_dir)?
        && check_services_running(&mut pid_file, table)
    {
        info!("Services are currently running.");
        info!("To apply changes, restart services with: lokikit stop && lokikit start");
    }
    Ok(true)
}
