//! Service definition loading
//!
//! Reads `services/<name>.service` JSON files into typed [`ServiceConfig`]s.

mod service;

pub use service::*;

use std::path::Path;

/// Load a service definition from disk.
///
/// An unreadable file is treated like an empty definition, so the only
/// failure is a missing `ExecStart`.
pub fn load_service(name: &str, path: &Path) -> Result<ServiceConfig, LoadError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            log::debug!("{}: cannot read {}: {}", name, path.display(), e);
            String::new()
        }
    };
    ServiceConfig::from_json(name, &content)
}
