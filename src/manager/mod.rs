//! Service manager
//!
//! Owns the registry of services and drives their lifecycle: registration,
//! enable/disable, start/stop/restart/reload, and crash supervision.
//!
//! All operations run on the reactor thread and return a [`ManagerError`]
//! whose text is what clients see.

mod enable;
mod process;
mod runtime;
mod state;

pub use enable::service_names;
pub use process::{has_exited, process_present, SpawnError, Termination};
pub use state::{Retry, ServiceState};

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;

use crate::config::{Paths, SupervisorPolicy};
use crate::limits::ProcessLimits;
use crate::units::{self, LoadError, ServiceConfig};

/// A registered service
#[derive(Debug, Clone)]
pub struct Service {
    pub config: ServiceConfig,
    pub state: ServiceState,
}

/// Status reported by `list`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListStatus {
    Active,
    Enabled,
    Disabled,
}

impl ListStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ListStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service manager that tracks and controls services
pub struct Manager {
    /// Registered services by name
    services: BTreeMap<String, Service>,
    /// On-disk layout
    paths: Paths,
    /// The daemon's own limits, used to clamp service requests
    limits: ProcessLimits,
    /// Supervision timings
    policy: SupervisorPolicy,
}

impl Manager {
    /// Create a manager with an empty registry
    pub fn new(paths: Paths, limits: ProcessLimits, policy: SupervisorPolicy) -> Self {
        Self {
            services: BTreeMap::new(),
            paths,
            limits,
            policy,
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.policy
    }

    /// Check a service name
    pub fn valid(name: &str) -> Result<(), ManagerError> {
        if name.is_empty() {
            return Err(ManagerError::MissingService);
        }
        if name.contains('/') {
            return Err(ManagerError::InvalidName);
        }
        Ok(())
    }

    /// Check that a service is valid and registered
    pub fn exist(&self, name: &str) -> Result<(), ManagerError> {
        Self::valid(name)?;
        if !self.services.contains_key(name) {
            return Err(ManagerError::InvalidService);
        }
        Ok(())
    }

    /// Whether a service is registered and has a tracked pid
    pub fn is_active(&self, name: &str) -> bool {
        self.services
            .get(name)
            .is_some_and(|s| s.state.is_active())
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = (&String, &Service)> {
        self.services.iter()
    }

    /// Whether any registered service currently tracks `pid`
    pub fn tracks_pid(&self, pid: i32) -> bool {
        self.services.values().any(|s| s.state.pid == Some(pid))
    }

    /// Register a service from its declared definition.
    ///
    /// Registering an already registered service is a no-op.
    pub fn add(&mut self, name: &str) -> Result<(), ManagerError> {
        Self::valid(name)?;
        if self.services.contains_key(name) {
            return Ok(());
        }

        let config = units::load_service(name, &self.paths.definition(name))?;
        log::debug!("Registered {}: {}", name, config.exec_start);
        self.services.insert(
            name.to_string(),
            Service {
                config,
                state: ServiceState::new(),
            },
        );
        Ok(())
    }

    /// Stop a service if needed and drop it from the registry
    pub fn remove(&mut self, name: &str) -> Result<(), ManagerError> {
        self.exist(name)?;
        if self.is_active(name) {
            self.stop(name)?;
        }
        self.services.remove(name);
        log::debug!("Unregistered {}", name);
        Ok(())
    }

    /// Mark a service for start at boot and register it
    pub fn enable(&mut self, name: &str) -> Result<(), ManagerError> {
        self.link(name)?;
        self.add(name)?;
        log::info!("Enabled {}", name);
        Ok(())
    }

    /// Unregister a service (stopping it first) and remove its marker
    pub fn disable(&mut self, name: &str) -> Result<(), ManagerError> {
        self.remove(name)?;
        self.unlink(name)?;
        log::info!("Disabled {}", name);
        Ok(())
    }

    /// Start a registered service that is not running
    pub fn start(&mut self, name: &str) -> Result<(), ManagerError> {
        self.exist(name)?;
        if self.is_active(name) {
            return Err(ManagerError::AlreadyActive);
        }
        self.start_service(name)
    }

    /// Stop a running service.
    ///
    /// An operator stop also drops any pending crash retries.
    pub fn stop(&mut self, name: &str) -> Result<(), ManagerError> {
        self.exist(name)?;
        if !self.is_active(name) {
            return Err(ManagerError::NotActive);
        }
        self.stop_service(name)?;
        if let Some(service) = self.services.get_mut(name) {
            service.state.crashes = 0;
        }
        Ok(())
    }

    /// Stop then start; fails if the service was not running
    pub fn restart(&mut self, name: &str) -> Result<(), ManagerError> {
        self.stop(name)?;
        self.start(name)
    }

    /// Ask a running service to reload (SIGHUP)
    pub fn reload(&mut self, name: &str) -> Result<(), ManagerError> {
        self.exist(name)?;
        let pid = self
            .services
            .get(name)
            .and_then(|s| s.state.pid)
            .ok_or(ManagerError::NotActive)?;

        kill(Pid::from_raw(pid), Signal::SIGHUP)
            .map_err(|errno| ManagerError::Os { call: "kill", errno })?;
        log::info!("Reloading {} (PID {})", name, pid);
        Ok(())
    }

    /// Status of one service
    pub fn list(&self, name: &str) -> Result<ListStatus, ManagerError> {
        Self::valid(name)?;
        if let Some(service) = self.services.get(name) {
            return Ok(if service.state.is_active() {
                ListStatus::Active
            } else {
                ListStatus::Enabled
            });
        }
        if self.is_enabled(name) {
            return Ok(ListStatus::Enabled);
        }
        if self.is_declared(name) {
            return Ok(ListStatus::Disabled);
        }
        Err(ManagerError::NotFound)
    }

    /// Status of every declared, enabled or registered service
    pub fn list_all(&self) -> BTreeMap<String, ListStatus> {
        let mut all = BTreeMap::new();
        for name in self.declared_services() {
            all.insert(name, ListStatus::Disabled);
        }
        for name in self.enabled_services() {
            all.insert(name, ListStatus::Enabled);
        }
        for (name, service) in &self.services {
            let status = if service.state.is_active() {
                ListStatus::Active
            } else {
                ListStatus::Enabled
            };
            all.insert(name.clone(), status);
        }
        all
    }

    /// Stop and unregister everything
    pub fn shutdown(&mut self) {
        let names: Vec<String> = self.services.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.remove(&name) {
                log::warn!("Failed to stop {} during shutdown: {}", name, e);
                self.services.remove(&name);
            }
        }
    }

    /// Spawn the main process, with the surrounding hooks and pid file
    fn start_service(&mut self, name: &str) -> Result<(), ManagerError> {
        let service = self
            .services
            .get_mut(name)
            .ok_or(ManagerError::InvalidService)?;
        let config = &service.config;

        if let Some(pre) = &config.exec_start_pre {
            process::run_hook(name, "ExecStartPre", pre);
        }

        service.state.set_starting(Instant::now());
        let pid = match process::spawn_service(config, &self.limits) {
            Ok(pid) => pid,
            Err(e) => {
                log::warn!("Failed to start {}: {}", name, e);
                return Err(e.into());
            }
        };
        log::info!("Started {} (PID {})", name, pid);

        service.state.set_running(pid);
        if let Err(e) = process::write_pid_file(&self.paths.pid_file(name), pid) {
            log::warn!("{}: failed to write pid file: {}", name, e);
        }

        if let Some(post) = &service.config.exec_start_post {
            process::run_hook(name, "ExecStartPost", post);
        }
        Ok(())
    }

    /// Terminate the main process and clean up, keeping the crash count
    fn stop_service(&mut self, name: &str) -> Result<(), ManagerError> {
        let service = self
            .services
            .get_mut(name)
            .ok_or(ManagerError::InvalidService)?;
        let pid = service.state.pid.ok_or(ManagerError::NotActive)?;

        service.state.set_stopping();
        log::info!("Stopping {} (PID {})", name, pid);
        if process::terminate(pid, &self.policy)? == Termination::Killed {
            log::warn!("{} (PID {}) was killed", name, pid);
        }

        service.state.set_stopped();
        process::remove_pid_file(&self.paths.pid_file(name));

        if let Some(post) = &service.config.exec_stop_post {
            process::run_hook(name, "ExecStopPost", post);
        }
        Ok(())
    }
}

impl From<LoadError> for ManagerError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::MissingExecStart(_) => Self::MissingCommand,
        }
    }
}

impl ManagerError {
    /// OS failure from an I/O error
    pub fn io(call: &'static str, e: &io::Error) -> Self {
        Self::Os {
            call,
            errno: process::errno_of(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Please provide the Service.")]
    MissingService,

    #[error("The Service cannot contain the following characters:  /.")]
    InvalidName,

    #[error("Please provide a valid Service.")]
    InvalidService,

    #[error("Please provide the Command within the Service configuration.")]
    MissingCommand,

    #[error("The Service is already active.")]
    AlreadyActive,

    #[error("The Service is not active.")]
    NotActive,

    #[error("Failed to find service.")]
    NotFound,

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("{}", os_message(.call, .errno))]
    Os { call: &'static str, errno: Errno },
}

/// `<call>(<errno>) <description>`
pub(crate) fn os_message(call: &str, errno: &Errno) -> String {
    format!("{}({}) {}", call, *errno as i32, errno.desc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Manager {
        Manager::new(
            Paths::new("/nonexistent/svcmgr"),
            ProcessLimits::default(),
            SupervisorPolicy::default(),
        )
    }

    #[test]
    fn test_valid() {
        assert!(Manager::valid("web").is_ok());
        assert!(matches!(Manager::valid(""), Err(ManagerError::MissingService)));
        assert!(matches!(Manager::valid("a/b"), Err(ManagerError::InvalidName)));
        assert!(matches!(Manager::valid("/"), Err(ManagerError::InvalidName)));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ManagerError::MissingService.to_string(),
            "Please provide the Service."
        );
        assert_eq!(
            ManagerError::InvalidName.to_string(),
            "The Service cannot contain the following characters:  /."
        );
        assert_eq!(
            ManagerError::InvalidService.to_string(),
            "Please provide a valid Service."
        );
        assert_eq!(
            ManagerError::MissingCommand.to_string(),
            "Please provide the Command within the Service configuration."
        );
        assert_eq!(
            ManagerError::AlreadyActive.to_string(),
            "The Service is already active."
        );
        assert_eq!(
            ManagerError::NotActive.to_string(),
            "The Service is not active."
        );
        assert_eq!(ManagerError::NotFound.to_string(), "Failed to find service.");
        assert_eq!(
            ManagerError::Os {
                call: "kill",
                errno: Errno::EPERM
            }
            .to_string(),
            "kill(1) Operation not permitted"
        );
    }

    #[test]
    fn test_unregistered_operations_fail() {
        let mut mgr = manager();
        assert!(matches!(mgr.start("web"), Err(ManagerError::InvalidService)));
        assert!(matches!(mgr.stop("web"), Err(ManagerError::InvalidService)));
        assert!(matches!(mgr.reload("web"), Err(ManagerError::InvalidService)));
        assert!(matches!(mgr.remove("web"), Err(ManagerError::InvalidService)));
        assert!(matches!(mgr.list("web"), Err(ManagerError::NotFound)));
        assert!(!mgr.is_active("web"));
    }

    #[test]
    fn test_path_separator_rejected_everywhere() {
        let mut mgr = manager();
        let name = "../etc";
        assert!(matches!(mgr.add(name), Err(ManagerError::InvalidName)));
        assert!(matches!(mgr.enable(name), Err(ManagerError::InvalidName)));
        assert!(matches!(mgr.disable(name), Err(ManagerError::InvalidName)));
        assert!(matches!(mgr.start(name), Err(ManagerError::InvalidName)));
        assert!(matches!(mgr.stop(name), Err(ManagerError::InvalidName)));
        assert!(matches!(mgr.restart(name), Err(ManagerError::InvalidName)));
        assert!(matches!(mgr.reload(name), Err(ManagerError::InvalidName)));
        assert!(matches!(mgr.list(name), Err(ManagerError::InvalidName)));
        assert!(matches!(mgr.link(name), Err(ManagerError::InvalidName)));
        assert!(matches!(mgr.unlink(name), Err(ManagerError::InvalidName)));
    }

    #[test]
    fn test_add_without_definition() {
        let mut mgr = manager();
        assert!(matches!(mgr.add("web"), Err(ManagerError::MissingCommand)));
        assert!(mgr.get("web").is_none());
    }

    #[test]
    fn test_disable_keeps_marker_when_stop_fails() {
        // Needs a process we may not signal
        if kill(Pid::from_raw(1), None).is_ok() {
            return;
        }
        let dir = std::env::temp_dir()
            .join(format!("svcmgr-manager-disable-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let paths = Paths::new(dir.clone());
        paths.ensure_layout().unwrap();
        std::fs::write(paths.definition("web"), r#"{"ExecStart": "/bin/sleep 60"}"#).unwrap();

        let mut mgr = Manager::new(
            paths.clone(),
            ProcessLimits::default(),
            SupervisorPolicy::default(),
        );
        mgr.enable("web").unwrap();
        mgr.services.get_mut("web").unwrap().state.adopt(1);

        let err = mgr.disable("web").unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Os {
                call: "kill",
                errno: Errno::EPERM
            }
        ));
        assert!(paths.enabled_link("web").symlink_metadata().is_ok());
        assert!(mgr.get("web").is_some());
        assert!(mgr.is_active("web"));
        assert_eq!(mgr.list("web").unwrap(), ListStatus::Active);

        mgr.services.clear();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_list_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ListStatus::Active).unwrap(),
            "\"active\""
        );
        assert_eq!(ListStatus::Disabled.to_string(), "disabled");
    }
}
