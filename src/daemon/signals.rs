//! Signal relay
//!
//! The handler only records `(signal, sender pid)` into a fixed ring of
//! atomics. The reactor drains the ring once per tick and decides what each
//! signal means: a signal sent by the daemon itself or by one of its
//! supervised processes is noise, anything else shuts the daemon down.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

const CAPACITY: usize = 32;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: AtomicU64 = AtomicU64::new(0);

static SLOTS: [AtomicU64; CAPACITY] = [EMPTY; CAPACITY];
static WRITE: AtomicUsize = AtomicUsize::new(0);
static READ: AtomicUsize = AtomicUsize::new(0);
static OVERFLOW: AtomicBool = AtomicBool::new(false);

/// Signals that stop the daemon
pub const RELAYED: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

/// A delivered signal and the pid that sent it (0 for the kernel)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalEvent {
    pub signo: i32,
    pub pid: i32,
}

impl SignalEvent {
    fn encode(&self) -> u64 {
        ((self.signo as u32 as u64) << 32) | self.pid as u32 as u64
    }

    fn decode(raw: u64) -> Self {
        Self {
            signo: (raw >> 32) as u32 as i32,
            pid: raw as u32 as i32,
        }
    }

    /// Signal name for logs
    pub fn name(&self) -> String {
        Signal::try_from(self.signo)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| format!("signal {}", self.signo))
    }
}

/// What the reactor does with a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Sent by ourselves or a supervised process
    Ignore,
    /// Shut down; `alert` when the signal was not a plain INT/TERM
    Shutdown { alert: bool },
}

/// Decide what a signal means
pub fn classify(event: SignalEvent, own_pid: i32, tracked: impl Fn(i32) -> bool) -> Disposition {
    if event.pid > 0 && (event.pid == own_pid || tracked(event.pid)) {
        return Disposition::Ignore;
    }
    let routine = event.signo == Signal::SIGINT as i32 || event.signo == Signal::SIGTERM as i32;
    Disposition::Shutdown { alert: !routine }
}

/// Handle to the installed relay
#[derive(Debug)]
pub struct SignalRelay {
    _installed: (),
}

impl SignalRelay {
    /// Install the handler for every relayed signal
    pub fn install() -> nix::Result<Self> {
        let action = SigAction::new(
            SigHandler::SigAction(on_signal),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in RELAYED {
            // The handler only touches atomics
            unsafe { sigaction(signal, &action) }?;
        }
        Ok(Self { _installed: () })
    }

    /// Take every recorded signal, oldest first
    pub fn drain(&self) -> Vec<SignalEvent> {
        drain_events()
    }

    /// Whether signals were dropped because the ring was full
    pub fn take_overflow(&self) -> bool {
        OVERFLOW.swap(false, Ordering::AcqRel)
    }
}

extern "C" fn on_signal(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let pid = if info.is_null() {
        0
    } else {
        unsafe { (*info).si_pid() }
    };
    record(SignalEvent { signo, pid });
}

/// Push an event into the ring; async-signal-safe.
///
/// A slot is reserved only while there is room, so a full ring drops the
/// event and sets the overflow flag without leaving a gap behind.
pub(crate) fn record(event: SignalEvent) {
    let mut index = WRITE.load(Ordering::Acquire);
    loop {
        if index.wrapping_sub(READ.load(Ordering::Acquire)) >= CAPACITY {
            OVERFLOW.store(true, Ordering::Release);
            return;
        }
        match WRITE.compare_exchange_weak(
            index,
            index.wrapping_add(1),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(current) => index = current,
        }
    }
    SLOTS[index % CAPACITY].store(event.encode(), Ordering::Release);
}

fn drain_events() -> Vec<SignalEvent> {
    let mut events = Vec::new();
    loop {
        let read = READ.load(Ordering::Acquire);
        if read == WRITE.load(Ordering::Acquire) {
            break;
        }
        let raw = SLOTS[read % CAPACITY].swap(0, Ordering::AcqRel);
        if raw == 0 {
            // Reserved, not written yet
            break;
        }
        events.push(SignalEvent::decode(raw));
        READ.store(read.wrapping_add(1), Ordering::Release);
    }
    events
}

/// Serializes tests that share the global ring
#[cfg(test)]
pub(crate) static RING_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
impl SignalRelay {
    /// A relay over the ring without installing handlers
    pub(crate) fn uninstalled() -> Self {
        drain_events();
        OVERFLOW.store(false, Ordering::Release);
        Self { _installed: () }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWN: i32 = 100;

    fn event(signal: Signal, pid: i32) -> SignalEvent {
        SignalEvent {
            signo: signal as i32,
            pid,
        }
    }

    #[test]
    fn test_operator_term_shuts_down_quietly() {
        assert_eq!(
            classify(event(Signal::SIGTERM, 1), OWN, |_| false),
            Disposition::Shutdown { alert: false }
        );
        assert_eq!(
            classify(event(Signal::SIGINT, 0), OWN, |_| false),
            Disposition::Shutdown { alert: false }
        );
    }

    #[test]
    fn test_unexpected_signal_alerts() {
        assert_eq!(
            classify(event(Signal::SIGHUP, 1), OWN, |_| false),
            Disposition::Shutdown { alert: true }
        );
        assert_eq!(
            classify(event(Signal::SIGQUIT, 0), OWN, |_| false),
            Disposition::Shutdown { alert: true }
        );
    }

    #[test]
    fn test_own_and_tracked_senders_ignored() {
        assert_eq!(
            classify(event(Signal::SIGTERM, OWN), OWN, |_| false),
            Disposition::Ignore
        );
        assert_eq!(
            classify(event(Signal::SIGHUP, 4242), OWN, |pid| pid == 4242),
            Disposition::Ignore
        );
        assert_eq!(
            classify(event(Signal::SIGHUP, 4243), OWN, |pid| pid == 4242),
            Disposition::Shutdown { alert: true }
        );
    }

    #[test]
    fn test_event_encoding() {
        let e = event(Signal::SIGQUIT, 123456);
        assert_eq!(SignalEvent::decode(e.encode()), e);
        assert_eq!(e.name(), "SIGQUIT");
    }

    #[test]
    fn test_ring_records_and_overflows() {
        let _ring = RING_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        drain_events();
        OVERFLOW.store(false, Ordering::Release);

        record(event(Signal::SIGTERM, 7));
        record(event(Signal::SIGHUP, 8));
        assert_eq!(
            drain_events(),
            vec![event(Signal::SIGTERM, 7), event(Signal::SIGHUP, 8)]
        );
        assert!(drain_events().is_empty());

        for pid in 0..(CAPACITY as i32 + 3) {
            record(event(Signal::SIGINT, pid + 1));
        }
        assert!(OVERFLOW.swap(false, Ordering::AcqRel));
        let events = drain_events();
        assert_eq!(events.len(), CAPACITY);
        assert_eq!(events[0].pid, 1);
        assert!(drain_events().is_empty());

        // usable again after an overflow
        record(event(Signal::SIGTERM, 9));
        assert_eq!(drain_events(), vec![event(Signal::SIGTERM, 9)]);
    }
}
