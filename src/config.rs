//! Daemon configuration
//!
//! Everything svcmgr keeps on disk lives under one data directory:
//!
//! ```text
//! <data>/
//! ├── services/<name>.service   declared definitions (JSON)
//! ├── enabled/<name>.service    symlinks to declared definitions
//! ├── active/<name>.pid         pid of each running service
//! ├── cores/                    daemon working directory (core dumps land here)
//! ├── .pid                      daemon pid (read by svcmgr-keepalive)
//! ├── .start                    start marker
//! ├── svcmgrd.log
//! └── notify.log                operator alerts only
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default control socket path
pub const SOCKET_PATH: &str = "/tmp/svcmgr";

/// Data directory used when nothing else is configured and it exists
pub const DEFAULT_DATA_DIR: &str = "/data/svcmgr";

/// Suffix of service definition files and enable markers
pub const SERVICE_SUFFIX: &str = ".service";

/// Resolve the data directory when none was given on the command line.
///
/// Prefers the traditional `/data/svcmgr` if present, otherwise the
/// per-user data directory (`~/.local/share/svcmgr`).
pub fn default_data_dir() -> PathBuf {
    let traditional = PathBuf::from(DEFAULT_DATA_DIR);
    if traditional.is_dir() {
        return traditional;
    }
    dirs::data_local_dir()
        .map(|d| d.join("svcmgr"))
        .unwrap_or(traditional)
}

/// Strip quote characters from a command-line value
pub fn strip_quotes(value: &str) -> String {
    value.chars().filter(|c| *c != '\'' && *c != '"').collect()
}

/// On-disk locations derived from the data directory
#[derive(Debug, Clone)]
pub struct Paths {
    data: PathBuf,
}

impl Paths {
    pub fn new(data: impl Into<PathBuf>) -> Self {
        Self { data: data.into() }
    }

    pub fn data(&self) -> &Path {
        &self.data
    }

    pub fn services_dir(&self) -> PathBuf {
        self.data.join("services")
    }

    pub fn enabled_dir(&self) -> PathBuf {
        self.data.join("enabled")
    }

    pub fn active_dir(&self) -> PathBuf {
        self.data.join("active")
    }

    pub fn cores_dir(&self) -> PathBuf {
        self.data.join("cores")
    }

    /// Declared definition: `services/<name>.service`
    pub fn definition(&self, name: &str) -> PathBuf {
        self.services_dir().join(format!("{}{}", name, SERVICE_SUFFIX))
    }

    /// Enable marker: `enabled/<name>.service`
    pub fn enabled_link(&self, name: &str) -> PathBuf {
        self.enabled_dir().join(format!("{}{}", name, SERVICE_SUFFIX))
    }

    /// Persisted pid of a running service: `active/<name>.pid`
    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.active_dir().join(format!("{}.pid", name))
    }

    pub fn daemon_pid_file(&self) -> PathBuf {
        self.data.join(".pid")
    }

    pub fn start_marker(&self) -> PathBuf {
        self.data.join(".start")
    }

    pub fn log_file(&self) -> PathBuf {
        self.data.join("svcmgrd.log")
    }

    pub fn notify_log_file(&self) -> PathBuf {
        self.data.join("notify.log")
    }

    /// Create the data directory and its subdirectories if missing
    pub fn ensure_layout(&self) -> Result<(), ConfigError> {
        for dir in [
            self.data.clone(),
            self.services_dir(),
            self.enabled_dir(),
            self.active_dir(),
            self.cores_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Layout {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Resolve the data directory to an absolute path.
    ///
    /// Enable markers are symlinks, so their targets must not depend on the
    /// daemon's working directory.
    pub fn canonicalize(self) -> Result<Self, ConfigError> {
        let data = self
            .data
            .canonicalize()
            .map_err(|source| ConfigError::Layout {
                path: self.data.clone(),
                source,
            })?;
        Ok(Self { data })
    }
}

/// Timings of the supervision policy
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    /// How long `stop` waits after SIGTERM before escalating to SIGKILL
    pub stop_timeout: Duration,
    /// Delay between exit checks while stopping
    pub stop_poll_interval: Duration,
    /// How long to wait for a detached service to write its PID file
    pub detach_timeout: Duration,
    /// Pause before the first PID file read
    pub detach_settle: Duration,
    /// Delay between PID file reads
    pub detach_poll_interval: Duration,
    /// Crashes closer together than this count as rapid
    pub crash_window: Duration,
    /// Rapid crashes after which a service is left stopped
    pub max_crashes: u32,
    /// Reactor poll timeout
    pub tick: Duration,
    /// How often the control socket file is verified
    pub socket_check_interval: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(300),
            stop_poll_interval: Duration::from_millis(250),
            detach_timeout: Duration::from_secs(5),
            detach_settle: Duration::from_millis(250),
            detach_poll_interval: Duration::from_millis(100),
            crash_window: Duration::from_secs(60),
            max_crashes: 10,
            tick: Duration::from_millis(250),
            socket_check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to prepare {}: {source}", path.display())]
    Layout {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
