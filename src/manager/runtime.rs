//! Runtime processing for the service manager
//!
//! Called once per reactor tick to handle:
//! - Exit detection for every tracked pid
//! - Adoption of the real pid of daemonizing services
//! - Crash restarts and the delayed retry backoff

use std::time::Instant;

use super::process;
use super::state::Retry;
use super::Manager;

impl Manager {
    /// One supervision pass over the registry
    pub fn scan(&mut self) {
        self.check_liveness();
        self.process_backoff();
    }

    /// Find tracked processes that went away and deal with each
    fn check_liveness(&mut self) {
        let exited: Vec<String> = self
            .services
            .iter()
            .filter_map(|(name, service)| {
                let pid = service.state.pid?;
                process::has_exited(pid).then(|| name.clone())
            })
            .collect();

        for name in exited {
            self.handle_exit(&name);
        }
    }

    fn handle_exit(&mut self, name: &str) {
        let Some(service) = self.services.get_mut(name) else {
            return;
        };

        if service.state.stopped {
            // A stop that errored out left the state behind
            log::debug!("{} exited while stopping", name);
            service.state.set_stopped();
            process::remove_pid_file(&self.paths.pid_file(name));
            return;
        }

        if service.config.is_detachable() && !service.state.detached && self.adopt_detached(name)
        {
            return;
        }

        self.handle_crash(name);
    }

    /// Follow a launcher that exited after daemonizing.
    ///
    /// Returns false when no pid showed up in the PID file in time, which
    /// makes the exit a crash.
    fn adopt_detached(&mut self, name: &str) -> bool {
        let Some(service) = self.services.get_mut(name) else {
            return false;
        };
        let Some(pid_file) = service.config.pid_file.clone() else {
            return false;
        };

        let Some(pid) = process::discover_pid(&pid_file, &self.policy) else {
            log::warn!(
                "{}: no pid in {} within {:?}",
                name,
                pid_file.display(),
                self.policy.detach_timeout
            );
            return false;
        };

        if let Err(e) = process::write_pid_file(&self.paths.pid_file(name), pid) {
            log::warn!("{}: failed to persist detached PID {}: {}", name, pid, e);
            return false;
        }

        service.state.adopt(pid);
        log::info!("{} detached, tracking PID {}", name, pid);
        true
    }

    fn handle_crash(&mut self, name: &str) {
        let Some(pid) = self.services.get(name).and_then(|s| s.state.pid) else {
            return;
        };
        log::warn!("{} (PID {}) exited unexpectedly", name, pid);

        if let Err(e) = self.stop_service(name) {
            log::warn!("Failed to clean up {}: {}", name, e);
            return;
        }

        let Some(service) = self.services.get_mut(name) else {
            return;
        };
        if !service.config.restart.is_always() {
            return;
        }

        if service
            .state
            .record_crash(Instant::now(), self.policy.crash_window)
        {
            log::info!("Restarting {}", name);
            self.retry_start(name);
        } else {
            log::warn!(
                "{} crashed {} times within {:?}, deferring restart",
                name,
                service.state.crashes,
                self.policy.crash_window
            );
        }
    }

    /// Retry services whose restart was deferred
    fn process_backoff(&mut self) {
        let now = Instant::now();
        let mut attempts = Vec::new();

        for (name, service) in self.services.iter_mut() {
            match service
                .state
                .retry(&service.config.restart, now, &self.policy)
            {
                Retry::Nothing => {}
                Retry::Attempt => attempts.push(name.clone()),
                Retry::GiveUp => log::error!(
                    "{}: Leaving service stopped due to too many crashes",
                    name
                ),
            }
        }

        for name in attempts {
            log::info!("Retrying {} after crash", name);
            self.retry_start(&name);
        }
    }

    /// Start after a crash; a failed attempt counts as another crash
    fn retry_start(&mut self, name: &str) {
        if let Err(e) = self.start_service(name) {
            log::warn!("Failed to restart {}: {}", name, e);
            if let Some(service) = self.services.get_mut(name) {
                service.state.crashes += 1;
            }
        }
    }
}
