//! Process spawning and management

use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use super::ManagerError;
use crate::config::SupervisorPolicy;
use crate::limits::ProcessLimits;
use crate::units::ServiceConfig;

/// How a stopped process went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own or after SIGTERM
    Exited,
    /// Needed SIGKILL after the grace window
    Killed,
}

/// Spawn the main process of a service and return its pid.
///
/// The child gets the clamped core and open-file limits applied between
/// fork and exec. An exec failure is reported here and never runs any
/// daemon code in the child.
pub fn spawn_service(config: &ServiceConfig, limits: &ProcessLimits) -> Result<i32, SpawnError> {
    let argv = config.argv();
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| SpawnError::InvalidCommand(config.exec_start.clone()))?;

    let mut cmd = Command::new(program);
    cmd.args(args);

    // A declared environment replaces the inherited one
    if !config.environment.is_empty() {
        cmd.env_clear();
        for entry in &config.environment {
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    cmd.env(key, value);
                }
                _ => log::warn!(
                    "{}: ignoring environment entry without KEY=: {:?}",
                    config.name,
                    entry
                ),
            }
        }
    }

    let plan = limits.plan(config);
    for change in &plan {
        log::debug!(
            "{}: {} soft {} hard {}",
            config.name,
            change.kind.as_str(),
            crate::limits::describe(change.limit.soft),
            crate::limits::describe(change.limit.hard)
        );
    }

    // Runs after fork, before exec: syscalls only
    unsafe {
        cmd.pre_exec(move || {
            for change in &plan {
                change.apply()?;
            }
            Ok(())
        });
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(|e| SpawnError::Exec {
        program: program.clone(),
        errno: errno_of(&e),
    })?;

    // The child is reaped through waitpid in has_exited
    Ok(child.id() as i32)
}

/// Run a hook command through the shell and wait for it.
///
/// The exit status is only logged.
pub fn run_hook(service: &str, hook: &str, command: &str) {
    log::debug!("{}: running {}: {}", service, hook, command);
    match Command::new("/bin/sh").arg("-c").arg(command).status() {
        Ok(status) => log::debug!("{}: {} finished with {}", service, hook, status),
        Err(e) => log::warn!("{}: failed to run {}: {}", service, hook, e),
    }
}

/// Persist a pid as `<pid>\n`
pub fn write_pid_file(path: &Path, pid: i32) -> io::Result<()> {
    std::fs::write(path, format!("{}\n", pid))
}

pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Read a positive pid from a PID file
pub fn read_pid_file(path: &Path) -> Option<i32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

/// Whether a tracked process is gone.
///
/// Our own children are reaped here, so an exited child never lingers as a
/// zombie that looks alive. Anything else is looked up in `/proc`.
pub fn has_exited(pid: i32) -> bool {
    if pid <= 0 {
        return true;
    }
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(WaitStatus::Exited(_, code)) => {
            log::debug!("PID {} exited with status {}", pid, code);
            true
        }
        Ok(WaitStatus::Signaled(_, signal, core)) => {
            log::debug!(
                "PID {} killed by {}{}",
                pid,
                signal,
                if core { " (core dumped)" } else { "" }
            );
            true
        }
        Ok(_) => false,
        Err(Errno::ECHILD) => !process_present(pid),
        Err(Errno::EINTR) => false,
        Err(e) => {
            log::warn!("waitpid({}) failed: {}", pid, e);
            !process_present(pid)
        }
    }
}

/// Whether `/proc/<pid>` describes a live (non-zombie) process
pub fn process_present(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The state field follows the parenthesized command name
    let state = stat
        .rfind(')')
        .and_then(|i| stat[i + 1..].split_whitespace().next());
    !matches!(state, Some("Z") | Some("X"))
}

/// Stop a process: SIGTERM, wait out the grace window, then SIGKILL.
///
/// A process that is already gone counts as stopped. A signal the kernel
/// refuses is an error right away.
pub fn terminate(pid: i32, policy: &SupervisorPolicy) -> Result<Termination, ManagerError> {
    let target = Pid::from_raw(pid);

    if let Some(done) = sigterm_outcome(pid, kill(target, Signal::SIGTERM))? {
        return Ok(done);
    }

    let deadline = Instant::now() + policy.stop_timeout;
    loop {
        if has_exited(pid) {
            return Ok(Termination::Exited);
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(policy.stop_poll_interval);
    }

    log::warn!(
        "PID {} still running after {:?}, sending SIGKILL",
        pid,
        policy.stop_timeout
    );
    match kill(target, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => return Err(ManagerError::Os { call: "kill", errno }),
    }

    // Collect the zombie if it is ours
    let deadline = Instant::now() + Duration::from_secs(1);
    while !has_exited(pid) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    Ok(Termination::Killed)
}

/// Map the SIGTERM result; `None` means the grace window starts
fn sigterm_outcome(
    pid: i32,
    sent: nix::Result<()>,
) -> Result<Option<Termination>, ManagerError> {
    match sent {
        Ok(()) => Ok(None),
        Err(Errno::ESRCH) => {
            has_exited(pid);
            Ok(Some(Termination::Exited))
        }
        Err(errno) => {
            log::warn!("kill({}, SIGTERM) failed: {}", pid, errno);
            Err(ManagerError::Os { call: "kill", errno })
        }
    }
}

/// Wait for a daemonizing service to report its real pid.
///
/// Gives the launcher a moment to settle, then reads the PID file until a
/// positive pid shows up or the discovery window closes.
pub fn discover_pid(path: &Path, policy: &SupervisorPolicy) -> Option<i32> {
    std::thread::sleep(policy.detach_settle);
    let deadline = Instant::now() + policy.detach_timeout;
    loop {
        if let Some(pid) = read_pid_file(path) {
            return Some(pid);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(policy.detach_poll_interval);
    }
}

/// Errno carried by an I/O error
pub fn errno_of(e: &io::Error) -> Errno {
    Errno::from_raw(e.raw_os_error().unwrap_or(0))
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Invalid command: {0:?}")]
    InvalidCommand(String),

    #[error("{} ({program})", super::os_message("execve", .errno))]
    Exec { program: String, errno: Errno },
}
