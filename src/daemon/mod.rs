//! Daemon runtime
//!
//! Bootstrap helpers used by `svcmgrd` and the event loop that serves the
//! control socket.

pub mod connection;
pub mod handler;
pub mod reactor;
pub mod signals;

pub use reactor::Reactor;
pub use signals::SignalRelay;

use std::io;
use std::path::PathBuf;

use nix::sys::stat::{umask, Mode};

use crate::config::Paths;
use crate::manager::Manager;

/// The daemon's `.pid` and `.start` files, removed again on drop
#[derive(Debug)]
pub struct LifetimeFiles {
    pid_file: PathBuf,
    start_marker: PathBuf,
}

impl LifetimeFiles {
    /// Write the daemon pid and the start marker
    pub fn create(paths: &Paths) -> io::Result<Self> {
        let files = Self {
            pid_file: paths.daemon_pid_file(),
            start_marker: paths.start_marker(),
        };
        std::fs::write(&files.pid_file, format!("{}\n", std::process::id()))?;
        std::fs::write(
            &files.start_marker,
            format!("{}\n", chrono::Local::now().to_rfc3339()),
        )?;
        Ok(files)
    }
}

impl Drop for LifetimeFiles {
    fn drop(&mut self) {
        for path in [&self.pid_file, &self.start_marker] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Whether the daemon recorded in `<data>/.pid` is alive
pub fn is_running(paths: &Paths) -> bool {
    let Ok(content) = std::fs::read_to_string(paths.daemon_pid_file()) else {
        return false;
    };
    match content.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => std::path::Path::new(&format!("/proc/{}", pid)).is_dir(),
        _ => false,
    }
}

/// Register and start every enabled service whose definition still exists
pub fn reconcile(manager: &mut Manager) {
    for name in manager.enabled_services() {
        if !manager.is_declared(&name) {
            log::warn!("{} is enabled but has no definition, skipping", name);
            continue;
        }
        let result = manager.enable(&name).and_then(|()| manager.start(&name));
        match result {
            Ok(()) => log::info!("Started enabled service {}", name),
            Err(e) => crate::notify!("Failed to start enabled service {}: {}", name, e),
        }
    }
}

/// Make `cores/` the working directory so core dumps land there
pub fn enter_cores_dir(paths: &Paths) {
    let cores = paths.cores_dir();
    if let Err(e) = std::env::set_current_dir(&cores) {
        crate::notify!("Failed to change directory to {}: {}", cores.display(), e);
    }
}

/// Restrict files created by the daemon and its services to owner and group
pub fn set_umask() {
    umask(Mode::from_bits_truncate(0o007));
}
