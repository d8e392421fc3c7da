//! Typed service definitions
//!
//! A definition is one JSON object per service:
//!
//! ```json
//! {
//!   "ExecStart": "/usr/bin/worker --port 8080",
//!   "ExecStartPre": "mkdir -p /tmp/worker",
//!   "Environment": ["HOME=/home/worker", "PORT=8080"],
//!   "LimitCORE": "infinity",
//!   "LimitNOFILE": "4096",
//!   "PIDFile": "/tmp/worker/worker.pid",
//!   "Restart": "always"
//! }
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Restart policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Restart whenever the process disappears
    #[default]
    Always,
    /// Anything other than "always": never restart automatically
    No,
}

impl RestartPolicy {
    pub fn parse(s: &str) -> Self {
        if s == "always" {
            Self::Always
        } else {
            Self::No
        }
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Self::Always)
    }
}

/// A resource limit request: a number or "infinity"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSpec {
    Infinity,
    Value(u64),
}

impl LimitSpec {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s == "infinity" {
            return Some(Self::Infinity);
        }
        s.parse().ok().map(Self::Value)
    }

    /// Value in `rlim_t` terms
    pub fn as_rlim(&self) -> u64 {
        match self {
            Self::Infinity => libc::RLIM_INFINITY as u64,
            Self::Value(v) => *v,
        }
    }
}

impl fmt::Display for LimitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infinity => f.write_str("infinity"),
            Self::Value(v) => write!(f, "{}", v),
        }
    }
}

/// Immutable configuration of one service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    pub exec_start: String,
    pub exec_start_pre: Option<String>,
    pub exec_start_post: Option<String>,
    pub exec_stop_post: Option<String>,
    /// `KEY=VALUE` assignments; when non-empty they replace the inherited environment
    pub environment: Vec<String>,
    pub limit_core: LimitSpec,
    pub limit_nofile: LimitSpec,
    /// Set for services that daemonize themselves
    pub pid_file: Option<PathBuf>,
    pub restart: RestartPolicy,
}

pub const DEFAULT_LIMIT_CORE: LimitSpec = LimitSpec::Value(0);
pub const DEFAULT_LIMIT_NOFILE: LimitSpec = LimitSpec::Value(1024);

impl ServiceConfig {
    /// Minimal config with defaults for everything but the start command
    pub fn new(name: impl Into<String>, exec_start: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exec_start: exec_start.into(),
            exec_start_pre: None,
            exec_start_post: None,
            exec_stop_post: None,
            environment: Vec::new(),
            limit_core: DEFAULT_LIMIT_CORE,
            limit_nofile: DEFAULT_LIMIT_NOFILE,
            pid_file: None,
            restart: RestartPolicy::default(),
        }
    }

    /// Build a config from the text of a definition file.
    ///
    /// Malformed JSON is not an error by itself: it yields a definition with
    /// no fields set, which is then rejected for lacking `ExecStart`.
    pub fn from_json(name: &str, content: &str) -> Result<Self, LoadError> {
        let def: Definition = match serde_json::from_str(content) {
            Ok(def) => def,
            Err(e) => {
                log::debug!("{}: unreadable definition ({}), ignoring fields", name, e);
                Definition::default()
            }
        };

        let exec_start = def
            .exec_start
            .ok_or_else(|| LoadError::MissingExecStart(name.to_string()))?;

        let mut config = Self::new(name, exec_start);
        config.exec_start_pre = def.exec_start_pre;
        config.exec_start_post = def.exec_start_post;
        config.exec_stop_post = def.exec_stop_post;
        config.environment = def
            .environment
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty())
            .collect();
        config.limit_core = parse_limit(name, "LimitCORE", def.limit_core, DEFAULT_LIMIT_CORE);
        config.limit_nofile =
            parse_limit(name, "LimitNOFILE", def.limit_nofile, DEFAULT_LIMIT_NOFILE);
        config.pid_file = def.pid_file.map(PathBuf::from);
        if let Some(restart) = def.restart {
            config.restart = RestartPolicy::parse(&restart);
        }

        Ok(config)
    }

    /// Argument vector: the start command split on whitespace
    pub fn argv(&self) -> Vec<String> {
        self.exec_start.split_whitespace().map(str::to_string).collect()
    }

    /// Whether the service double-forks and reports its real pid in a file
    pub fn is_detachable(&self) -> bool {
        self.pid_file.is_some()
    }
}

fn parse_limit(name: &str, key: &str, raw: Option<String>, default: LimitSpec) -> LimitSpec {
    let Some(raw) = raw else {
        return default;
    };
    LimitSpec::parse(&raw).unwrap_or_else(|| {
        log::warn!("{}: invalid {} {:?}, using {}", name, key, raw, default);
        default
    })
}

/// Raw definition file contents
#[derive(Debug, Default, Deserialize)]
struct Definition {
    #[serde(rename = "ExecStart", default, deserialize_with = "lenient_string")]
    exec_start: Option<String>,
    #[serde(rename = "ExecStartPre", default, deserialize_with = "lenient_string")]
    exec_start_pre: Option<String>,
    #[serde(rename = "ExecStartPost", default, deserialize_with = "lenient_string")]
    exec_start_post: Option<String>,
    #[serde(rename = "ExecStopPost", default, deserialize_with = "lenient_string")]
    exec_stop_post: Option<String>,
    #[serde(rename = "Environment", default)]
    environment: Option<Vec<Value>>,
    #[serde(rename = "LimitCORE", default, deserialize_with = "lenient_string")]
    limit_core: Option<String>,
    #[serde(rename = "LimitNOFILE", default, deserialize_with = "lenient_string")]
    limit_nofile: Option<String>,
    #[serde(rename = "PIDFile", default, deserialize_with = "lenient_string")]
    pid_file: Option<String>,
    #[serde(rename = "Restart", default, deserialize_with = "lenient_string")]
    restart: Option<String>,
}

/// Accept strings, numbers and booleans; treat empty strings as absent
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let s = match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    };
    Ok(s.filter(|s| !s.is_empty()))
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Service {0} has no ExecStart")]
    MissingExecStart(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_definition() {
        let json = r#"{
            "ExecStart": "/usr/bin/worker --port 8080",
            "ExecStartPre": "mkdir -p /tmp/worker",
            "ExecStartPost": "echo started",
            "ExecStopPost": "echo stopped",
            "Environment": ["HOME=/home/worker", "", "PORT=8080"],
            "LimitCORE": "infinity",
            "LimitNOFILE": "4096",
            "PIDFile": "/tmp/worker/worker.pid",
            "Restart": "no"
        }"#;
        let config = ServiceConfig::from_json("worker", json).unwrap();
        assert_eq!(config.name, "worker");
        assert_eq!(config.exec_start, "/usr/bin/worker --port 8080");
        assert_eq!(config.exec_start_pre.as_deref(), Some("mkdir -p /tmp/worker"));
        assert_eq!(config.exec_start_post.as_deref(), Some("echo started"));
        assert_eq!(config.exec_stop_post.as_deref(), Some("echo stopped"));
        assert_eq!(config.environment, vec!["HOME=/home/worker", "PORT=8080"]);
        assert_eq!(config.limit_core, LimitSpec::Infinity);
        assert_eq!(config.limit_nofile, LimitSpec::Value(4096));
        assert_eq!(config.pid_file, Some(PathBuf::from("/tmp/worker/worker.pid")));
        assert_eq!(config.restart, RestartPolicy::No);
        assert!(config.is_detachable());
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::from_json("web", r#"{"ExecStart": "/bin/sleep 60"}"#).unwrap();
        assert_eq!(config.limit_core, LimitSpec::Value(0));
        assert_eq!(config.limit_nofile, LimitSpec::Value(1024));
        assert_eq!(config.restart, RestartPolicy::Always);
        assert!(config.environment.is_empty());
        assert!(config.exec_start_pre.is_none());
        assert!(!config.is_detachable());
    }

    #[test]
    fn test_missing_exec_start() {
        let err = ServiceConfig::from_json("web", r#"{"Restart": "always"}"#).unwrap_err();
        assert!(matches!(err, LoadError::MissingExecStart(ref n) if n == "web"));

        assert!(ServiceConfig::from_json("web", r#"{"ExecStart": ""}"#).is_err());
    }

    #[test]
    fn test_malformed_json_has_no_fields() {
        assert!(ServiceConfig::from_json("web", "{ExecStart: nope").is_err());
        assert!(ServiceConfig::from_json("web", "").is_err());
    }

    #[test]
    fn test_numeric_limits() {
        let config = ServiceConfig::from_json(
            "web",
            r#"{"ExecStart": "/bin/true", "LimitNOFILE": 2048, "LimitCORE": 0}"#,
        )
        .unwrap();
        assert_eq!(config.limit_nofile, LimitSpec::Value(2048));
        assert_eq!(config.limit_core, LimitSpec::Value(0));
    }

    #[test]
    fn test_invalid_limit_falls_back() {
        let config = ServiceConfig::from_json(
            "web",
            r#"{"ExecStart": "/bin/true", "LimitNOFILE": "lots"}"#,
        )
        .unwrap();
        assert_eq!(config.limit_nofile, DEFAULT_LIMIT_NOFILE);
    }

    #[test]
    fn test_restart_policy() {
        assert_eq!(RestartPolicy::parse("always"), RestartPolicy::Always);
        assert_eq!(RestartPolicy::parse("no"), RestartPolicy::No);
        assert_eq!(RestartPolicy::parse("on-failure"), RestartPolicy::No);
        assert_eq!(RestartPolicy::parse("Always"), RestartPolicy::No);
    }

    #[test]
    fn test_argv_splits_on_whitespace() {
        let config = ServiceConfig::new("web", "  /usr/bin/web   --port\t8080 ");
        assert_eq!(config.argv(), vec!["/usr/bin/web", "--port", "8080"]);
    }

    #[test]
    fn test_limit_spec() {
        assert_eq!(LimitSpec::parse("infinity"), Some(LimitSpec::Infinity));
        assert_eq!(LimitSpec::parse("12"), Some(LimitSpec::Value(12)));
        assert_eq!(LimitSpec::parse("-1"), None);
        assert_eq!(LimitSpec::Infinity.to_string(), "infinity");
        assert_eq!(LimitSpec::Infinity.as_rlim(), libc::RLIM_INFINITY as u64);
    }
}
