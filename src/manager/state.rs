//! Service runtime state
//!
//! ```text
//!     ┌──────────┐   start    ┌─────────┐
//!     │ Inactive │───────────▶│ Running │──┐ launcher exits,
//!     └──────────┘            └────┬────┘  │ PID file found
//!          ▲                       │       ▼
//!          │ stop / crash     ┌────┴─────────┐
//!          └──────────────────│   Detached   │
//!                             └──────────────┘
//! ```
//!
//! Crash backoff works in two phases. A crash within the crash window of
//! the last start bumps the counter; only the first rapid crash restarts
//! immediately. The periodic scan then retries deferred services once per
//! window until the counter reaches the cap.

use std::time::{Duration, Instant};

use crate::config::SupervisorPolicy;
use crate::units::RestartPolicy;

/// Mutable runtime state, owned by the manager
#[derive(Debug, Clone, Default)]
pub struct ServiceState {
    /// Tracked pid (`None` when not running)
    pub pid: Option<i32>,
    /// Set while an intentional stop is in progress
    pub stopped: bool,
    /// Set once the real pid of a daemonizing service has been adopted
    pub detached: bool,
    /// Last start attempt
    pub started_at: Option<Instant>,
    /// Consecutive rapid crashes
    pub crashes: u32,
}

/// What the periodic scan should do about a service with pending crashes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    Nothing,
    Attempt,
    GiveUp,
}

impl ServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.pid.is_some()
    }

    /// Record a start attempt (successful or not)
    pub fn set_starting(&mut self, now: Instant) {
        self.started_at = Some(now);
    }

    pub fn set_running(&mut self, pid: i32) {
        self.pid = Some(pid);
        self.stopped = false;
    }

    pub fn set_stopping(&mut self) {
        self.stopped = true;
    }

    pub fn set_stopped(&mut self) {
        self.pid = None;
        self.detached = false;
    }

    /// Track the real pid of a daemonized service instead of its launcher
    pub fn adopt(&mut self, pid: i32) {
        self.pid = Some(pid);
        self.detached = true;
    }

    fn since_start(&self, now: Instant) -> Duration {
        self.started_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::MAX)
    }

    /// Count a crash and decide whether to restart right away.
    ///
    /// A crash within the window of the last start counts as rapid;
    /// anything slower resets the counter. Only the first rapid crash
    /// restarts immediately.
    pub fn record_crash(&mut self, now: Instant, window: Duration) -> bool {
        if self.since_start(now) < window {
            self.crashes += 1;
        } else {
            self.crashes = 0;
        }
        self.crashes <= 1
    }

    /// Decide the delayed retry for a service with pending crashes
    pub fn retry(
        &mut self,
        restart: &RestartPolicy,
        now: Instant,
        policy: &SupervisorPolicy,
    ) -> Retry {
        if self.crashes == 0 {
            return Retry::Nothing;
        }

        if !restart.is_always() {
            self.crashes = 0;
            return Retry::Nothing;
        }

        if self.crashes >= policy.max_crashes {
            self.crashes = 0;
            return Retry::GiveUp;
        }

        if self.since_start(now) < policy.crash_window {
            return Retry::Nothing;
        }

        if self.is_active() {
            // Up for a whole window since the last start: it recovered
            self.crashes = 0;
            return Retry::Nothing;
        }

        Retry::Attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SupervisorPolicy {
        SupervisorPolicy::default()
    }

    #[test]
    fn test_state_new() {
        let state = ServiceState::new();
        assert!(!state.is_active());
        assert!(!state.stopped);
        assert!(!state.detached);
        assert_eq!(state.crashes, 0);
    }

    #[test]
    fn test_running_clears_stopped() {
        let mut state = ServiceState::new();
        state.set_stopping();
        state.set_running(1234);
        assert!(state.is_active());
        assert!(!state.stopped);
        assert_eq!(state.pid, Some(1234));
    }

    #[test]
    fn test_stopped_clears_detached() {
        let mut state = ServiceState::new();
        state.set_running(1234);
        state.adopt(5678);
        assert!(state.detached);
        assert_eq!(state.pid, Some(5678));
        state.set_stopped();
        assert!(!state.detached);
        assert!(!state.is_active());
    }

    #[test]
    fn test_first_rapid_crash_restarts() {
        let now = Instant::now();
        let mut state = ServiceState::new();
        state.set_starting(now);
        assert!(state.record_crash(now + Duration::from_secs(5), Duration::from_secs(60)));
        assert_eq!(state.crashes, 1);
    }

    #[test]
    fn test_second_rapid_crash_defers() {
        let now = Instant::now();
        let mut state = ServiceState::new();
        state.set_starting(now);
        assert!(state.record_crash(now, Duration::from_secs(60)));
        state.set_starting(now);
        assert!(!state.record_crash(now + Duration::from_secs(1), Duration::from_secs(60)));
        assert_eq!(state.crashes, 2);
    }

    #[test]
    fn test_slow_crash_resets() {
        let now = Instant::now();
        let mut state = ServiceState::new();
        state.crashes = 4;
        state.set_starting(now);
        assert!(state.record_crash(now + Duration::from_secs(61), Duration::from_secs(60)));
        assert_eq!(state.crashes, 0);
    }

    #[test]
    fn test_retry_waits_for_window() {
        let now = Instant::now();
        let mut state = ServiceState::new();
        state.crashes = 2;
        state.set_starting(now);
        let restart = RestartPolicy::Always;
        assert_eq!(
            state.retry(&restart, now + Duration::from_secs(30), &policy()),
            Retry::Nothing
        );
        assert_eq!(
            state.retry(&restart, now + Duration::from_secs(60), &policy()),
            Retry::Attempt
        );
        // counter is left for the next evaluation
        assert_eq!(state.crashes, 2);
    }

    #[test]
    fn test_retry_gives_up_at_cap() {
        let mut state = ServiceState::new();
        state.crashes = 10;
        assert_eq!(
            state.retry(&RestartPolicy::Always, Instant::now(), &policy()),
            Retry::GiveUp
        );
        assert_eq!(state.crashes, 0);
    }

    #[test]
    fn test_retry_never_for_no_restart() {
        let mut state = ServiceState::new();
        state.crashes = 3;
        assert_eq!(
            state.retry(&RestartPolicy::No, Instant::now(), &policy()),
            Retry::Nothing
        );
        assert_eq!(state.crashes, 0);
    }

    #[test]
    fn test_stable_run_decays_counter() {
        let now = Instant::now();
        let mut state = ServiceState::new();
        state.crashes = 3;
        state.set_starting(now);
        state.set_running(42);
        assert_eq!(
            state.retry(&RestartPolicy::Always, now + Duration::from_secs(61), &policy()),
            Retry::Nothing
        );
        assert_eq!(state.crashes, 0);
    }

    #[test]
    fn test_crash_loop_reaches_cap() {
        let window = Duration::from_secs(60);
        let mut now = Instant::now();
        let mut state = ServiceState::new();
        state.set_starting(now);

        // every crash happens 1s after the previous start
        for _ in 0..10 {
            now += Duration::from_secs(1);
            state.record_crash(now, window);
            state.set_starting(now);
        }
        assert_eq!(state.crashes, 10);
        assert_eq!(
            state.retry(&RestartPolicy::Always, now, &policy()),
            Retry::GiveUp
        );
    }
}
