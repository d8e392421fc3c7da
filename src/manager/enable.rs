//! Enable markers
//!
//! A service is enabled when `enabled/<name>.service` exists. The marker is a
//! symlink to the declared definition in `services/`.

use std::path::Path;

use super::{Manager, ManagerError};
use crate::config::SERVICE_SUFFIX;

impl Manager {
    /// Create the enable marker.
    ///
    /// Succeeds if the marker already exists. The definition must be declared.
    pub fn link(&self, name: &str) -> Result<(), ManagerError> {
        Self::valid(name)?;

        let target = self.paths.definition(name);
        if !target.is_file() {
            return Err(ManagerError::InvalidService);
        }

        let link = self.paths.enabled_link(name);
        if link.symlink_metadata().is_ok() {
            log::debug!("{} already enabled", name);
            return Ok(());
        }

        std::os::unix::fs::symlink(&target, &link).map_err(|e| ManagerError::io("symlink", &e))?;
        log::debug!("Created {} -> {}", link.display(), target.display());
        Ok(())
    }

    /// Remove the enable marker; fails if there is none
    pub fn unlink(&self, name: &str) -> Result<(), ManagerError> {
        Self::valid(name)?;

        let link = self.paths.enabled_link(name);
        std::fs::remove_file(&link).map_err(|e| ManagerError::io("unlink", &e))?;
        log::debug!("Removed {}", link.display());
        Ok(())
    }

    /// Whether the enable marker exists
    pub fn is_enabled(&self, name: &str) -> bool {
        self.paths.enabled_link(name).symlink_metadata().is_ok()
    }

    /// Whether a definition is declared for `name`
    pub fn is_declared(&self, name: &str) -> bool {
        self.paths.definition(name).is_file()
    }

    /// Names of declared services
    pub fn declared_services(&self) -> Vec<String> {
        service_names(&self.paths.services_dir())
    }

    /// Names of enabled services
    pub fn enabled_services(&self) -> Vec<String> {
        service_names(&self.paths.enabled_dir())
    }
}

/// Service names of the `*.service` entries in a directory, sorted
pub fn service_names(dir: &Path) -> Vec<String> {
    let pattern = dir.join(format!("*{}", SERVICE_SUFFIX));
    let Some(pattern) = pattern.to_str() else {
        log::warn!("Non UTF-8 directory {}", dir.display());
        return Vec::new();
    };

    let entries = match glob::glob(pattern) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Bad pattern {}: {}", pattern, e);
            return Vec::new();
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| match entry {
            Ok(path) => path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(SERVICE_SUFFIX))
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            Err(e) => {
                log::debug!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .collect();
    names.sort();
    names
}
