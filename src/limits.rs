//! Resource limits
//!
//! At startup the daemon raises its own soft limits for core dumps and open
//! files to the hard limits. Each service then asks for its own values,
//! which are clamped so a child never gets more than the daemon itself has.

use nix::sys::resource::{getrlimit, setrlimit, Resource};

use crate::units::{LimitSpec, ServiceConfig};

const INFINITY: u64 = libc::RLIM_INFINITY as u64;

/// Soft/hard pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub soft: u64,
    pub hard: u64,
}

impl Limit {
    pub const UNLIMITED: Limit = Limit {
        soft: INFINITY,
        hard: INFINITY,
    };
}

/// Limits svcmgr propagates to services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Core,
    NoFile,
}

impl LimitKind {
    pub fn resource(&self) -> Resource {
        match self {
            Self::Core => Resource::RLIMIT_CORE,
            Self::NoFile => Resource::RLIMIT_NOFILE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "RLIMIT_CORE",
            Self::NoFile => "RLIMIT_NOFILE",
        }
    }
}

/// A limit to apply in a child before exec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitChange {
    pub kind: LimitKind,
    pub limit: Limit,
}

impl LimitChange {
    /// Apply in the current process. Only does a syscall, so it is safe to
    /// run between fork and exec.
    pub fn apply(&self) -> nix::Result<()> {
        setrlimit(self.kind.resource(), self.limit.soft, self.limit.hard)
    }
}

/// The daemon's own limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    pub core: Limit,
    pub nofile: Limit,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            core: Limit::UNLIMITED,
            nofile: Limit::UNLIMITED,
        }
    }
}

impl ProcessLimits {
    /// Read and raise the daemon's limits.
    ///
    /// Failures are alerted but never fatal; a limit that could not be read
    /// is treated as unlimited so services are not clamped by a guess.
    pub fn raise() -> Self {
        Self {
            core: raise_limit(LimitKind::Core),
            nofile: raise_limit(LimitKind::NoFile),
        }
    }

    pub fn get(&self, kind: LimitKind) -> Limit {
        match kind {
            LimitKind::Core => self.core,
            LimitKind::NoFile => self.nofile,
        }
    }

    /// Limit changes a service needs before exec
    pub fn plan(&self, config: &ServiceConfig) -> Vec<LimitChange> {
        [
            (LimitKind::Core, config.limit_core),
            (LimitKind::NoFile, config.limit_nofile),
        ]
        .into_iter()
        .filter_map(|(kind, requested)| {
            clamp(self.get(kind), requested).map(|limit| LimitChange { kind, limit })
        })
        .collect()
    }
}

/// Clamp a requested limit against the daemon's own.
///
/// The hard limit stays at the daemon's hard limit. The soft limit is the
/// request, capped at the daemon's soft limit when that is finite. Returns
/// `None` when the result equals what the child inherits anyway.
pub fn clamp(current: Limit, requested: LimitSpec) -> Option<Limit> {
    let mut soft = requested.as_rlim();
    if current.soft != INFINITY && (soft == INFINITY || soft > current.soft) {
        soft = current.soft;
    }
    (soft != current.soft).then_some(Limit {
        soft,
        hard: current.hard,
    })
}

/// Render an rlim value for logs
pub fn describe(value: u64) -> String {
    if value == INFINITY {
        "infinity".to_string()
    } else {
        value.to_string()
    }
}

fn raise_limit(kind: LimitKind) -> Limit {
    let (soft, hard) = match getrlimit(kind.resource()) {
        Ok(pair) => pair,
        Err(e) => {
            crate::notify!("getrlimit({}) failed: {}", kind.as_str(), e);
            return Limit::UNLIMITED;
        }
    };
    log::info!(
        "{}: soft limit {}, hard limit {}",
        kind.as_str(),
        describe(soft),
        describe(hard)
    );

    if soft == INFINITY || (hard != INFINITY && soft >= hard) {
        return Limit { soft, hard };
    }

    match setrlimit(kind.resource(), hard, hard) {
        Ok(()) => {
            log::info!(
                "{}: raised soft limit to {} (hard {})",
                kind.as_str(),
                describe(hard),
                describe(hard)
            );
            Limit { soft: hard, hard }
        }
        Err(e) => {
            crate::notify!("setrlimit({}) failed: {}", kind.as_str(), e);
            Limit { soft, hard }
        }
    }
}
