//! Flat `name=pid` registry shared between invocations.
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use tracing::debug;

use crate::{error::PidFileError, runtime::PID_FILE_NAME, service::ServiceName};

/// Tracked process ids, one per service.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PidFile {
    services: BTreeMap<ServiceName, u32>,
}

impl PidFile {
    /// Location of the registry inside `dir`.
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(PID_FILE_NAME)
    }

    /// Parses registry text. Malformed lines are skipped and a later duplicate wins.
    pub fn parse(contents: &str) -> Self {
        let mut services = BTreeMap::new();
        for line in contents.lines() {
            let Some((name, pid)) = line.trim().split_once('=') else {
                continue;
            };
            let Ok(service) = ServiceName::from_str(name.trim()) else {
                continue;
            };
            let Ok(pid) = pid.trim().parse::<i32>() else {
                continue;
            };
            if pid <= 0 {
                continue;
            }
            services.insert(service, pid as u32);
        }
        Self { services }
    }

    /// Renders one `name=pid` line per service, in launch order.
    pub fn render(&self) -> String {
        self.services
            .iter()
            .map(|(service, pid)| format!("{service}={pid}\n"))
            .collect()
    }

    /// Reads the registry from `dir`; `None` when no file exists.
    pub fn load(dir: &Path) -> Result<Option<Self>, PidFileError> {
        let path = Self::path(dir);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(Self::parse(&contents))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PidFileError::ReadError { path, source }),
        }
    }

    /// Overwrites the registry in `dir`.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, PidFileError> {
        let path = Self::path(dir);
        let write = || -> io::Result<()> {
            fs::create_dir_all(dir)?;
            fs::write(&path, self.render())
        };
        write().map_err(|source| PidFileError::WriteError {
            path: path.clone(),
            source,
        })?;
        debug!("Wrote PID file {}", path.display());
        Ok(path)
    }

    /// Deletes the registry in `dir`, returning whether a file was removed.
    pub fn remove(dir: &Path) -> Result<bool, PidFileError> {
        let path = Self::path(dir);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed PID file {}", path.display());
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(PidFileError::WriteError { path, source }),
        }
    }

    /// Returns the services map.
    pub fn services(&self) -> &BTreeMap<ServiceName, u32> {
        &self.services
    }

    /// Return the PID for a specific service
    pub fn pid_for(&self, service: ServiceName) -> Option<u32> {
        self.services.get(&service).copied()
    }

    /// Records (or replaces) the pid of a service in memory.
    pub fn insert(&mut self, service: ServiceName, pid: u32) {
        self.services.insert(service, pid);
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }
}

impl FromIterator<(ServiceName, u32)> for PidFile {
    fn from_iter<I: IntoIterator<Item = (ServiceName, u32)>>(iter: I) -> Self {
        Self {
            services: iter.into_iter().collect(),
        }
    }
}
