//! Control socket reactor
//!
//! One thread, one `poll(2)` per tick. Every tick:
//! 1. drain the signal relay
//! 2. every `socket_check_interval`, make sure the control socket file is
//!    still there and rebind it if not
//! 3. poll the listener and all clients (write interest only with output
//!    pending)
//! 4. accept, read and dispatch complete lines, write queued output
//! 5. drop closed clients
//! 6. run the supervision scan

use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::connection::ClientConnection;
use super::handler;
use super::signals::{classify, Disposition, SignalRelay};
use crate::manager::Manager;

/// The daemon's event loop
pub struct Reactor {
    manager: Manager,
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    clients: Vec<ClientConnection>,
    last_check: Option<Instant>,
    shutdown: Arc<AtomicBool>,
    relay: Option<SignalRelay>,
}

impl Reactor {
    pub fn new(manager: Manager, socket_path: impl Into<PathBuf>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            manager,
            socket_path: socket_path.into(),
            listener: None,
            clients: Vec::new(),
            last_check: None,
            shutdown,
            relay: None,
        }
    }

    /// Feed signals from an installed relay into the shutdown decision
    pub fn with_signal_relay(mut self, relay: SignalRelay) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Run until shutdown is requested, then tear everything down
    pub fn run(mut self) {
        log::info!("Control socket {}", self.socket_path.display());
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.tick() {
                crate::notify!("poll failed: {}", e);
                break;
            }
        }
        self.close();
    }

    /// One loop iteration; only a poll failure is fatal
    fn tick(&mut self) -> nix::Result<()> {
        self.handle_signals();
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        let interval = self.manager.policy().socket_check_interval;
        if self.last_check.map_or(true, |t| t.elapsed() >= interval) {
            self.check_socket();
            self.last_check = Some(Instant::now());
        }

        let (listener_ready, client_events) = self.poll_once()?;

        if listener_ready {
            self.accept();
        }

        // Clients accepted this tick have no events yet
        for (client, events) in self.clients.iter_mut().zip(client_events) {
            if events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                client.read_available();
                for line in client.take_lines() {
                    let response = handler::handle_line(&mut self.manager, &line);
                    client.queue(&response);
                }
            }
            if events.contains(PollFlags::POLLOUT) || client.wants_write() {
                client.flush();
            }
        }

        self.clients.retain(|c| !c.is_closing());

        self.manager.scan();
        Ok(())
    }

    /// Poll the listener and clients; returns listener readiness and the
    /// events of each client in order
    fn poll_once(&self) -> nix::Result<(bool, Vec<PollFlags>)> {
        let mut fds = Vec::with_capacity(self.clients.len() + 1);
        if let Some(listener) = &self.listener {
            fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        }
        for client in &self.clients {
            let mut flags = PollFlags::POLLIN;
            if client.wants_write() {
                flags |= PollFlags::POLLOUT;
            }
            fds.push(PollFd::new(client.as_fd(), flags));
        }

        let millis = u16::try_from(self.manager.policy().tick.as_millis()).unwrap_or(u16::MAX);
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                return Ok((false, vec![PollFlags::empty(); self.clients.len()]));
            }
            Err(e) => return Err(e),
        }

        let mut events = fds
            .iter()
            .map(|fd| fd.revents().unwrap_or(PollFlags::empty()));
        let listener_ready = match &self.listener {
            Some(_) => events.next().is_some_and(|e| !e.is_empty()),
            None => false,
        };
        Ok((listener_ready, events.collect()))
    }

    fn accept(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        match listener.accept() {
            Ok((stream, _)) => match ClientConnection::new(stream) {
                Ok(client) => {
                    log::debug!("Client connected");
                    self.clients.push(client);
                }
                Err(e) => log::warn!("Failed to set up client: {}", e),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                crate::notify!("accept failed on {}: {}", self.socket_path.display(), e);
                // Recreated on the next socket check
                self.listener = None;
            }
        }
    }

    /// Rebind the control socket unless it is up and still on disk
    fn check_socket(&mut self) {
        let on_disk = std::fs::symlink_metadata(&self.socket_path)
            .map(|m| m.file_type().is_socket())
            .unwrap_or(false);
        if self.listener.is_some() && on_disk {
            return;
        }
        if self.listener.is_some() {
            log::warn!(
                "Control socket {} disappeared, recreating",
                self.socket_path.display()
            );
        }
        self.bind();
    }

    fn bind(&mut self) {
        self.listener = None;
        remove_socket_file(&self.socket_path);

        let listener = match UnixListener::bind(&self.socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                crate::notify!(
                    "Failed to bind control socket {}: {}",
                    self.socket_path.display(),
                    e
                );
                return;
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            crate::notify!("Failed to configure control socket: {}", e);
            return;
        }
        log::debug!("Bound {}", self.socket_path.display());
        self.listener = Some(listener);
    }

    fn handle_signals(&mut self) {
        let Some(relay) = &self.relay else {
            return;
        };
        let own_pid = std::process::id() as i32;

        for event in relay.drain() {
            match classify(event, own_pid, |pid| self.manager.tracks_pid(pid)) {
                Disposition::Ignore => {
                    log::debug!("Ignoring {} from PID {}", event.name(), event.pid);
                }
                Disposition::Shutdown { alert: false } => {
                    log::info!("Received {} from PID {}, shutting down", event.name(), event.pid);
                    self.shutdown.store(true, Ordering::SeqCst);
                }
                Disposition::Shutdown { alert: true } => {
                    crate::notify!("Received {} from PID {}, shutting down", event.name(), event.pid);
                    self.shutdown.store(true, Ordering::SeqCst);
                }
            }
        }

        if relay.take_overflow() {
            crate::notify!("Signals lost while the relay was full, shutting down");
            self.shutdown.store(true, Ordering::SeqCst);
        }
    }

    /// Close clients and the socket, then stop every service
    fn close(&mut self) {
        log::info!("Shutting down");
        self.clients.clear();
        self.listener = None;
        remove_socket_file(&self.socket_path);
        self.manager.shutdown();
    }
}

fn remove_socket_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Paths, SupervisorPolicy};
    use crate::daemon::signals::{self, SignalEvent, RING_LOCK};
    use nix::sys::signal::Signal;
    use crate::limits::ProcessLimits;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn reactor(name: &str) -> Reactor {
        let policy = SupervisorPolicy {
            tick: Duration::from_millis(20),
            socket_check_interval: Duration::ZERO,
            ..SupervisorPolicy::default()
        };
        let manager = Manager::new(
            Paths::new("/nonexistent/svcmgr"),
            ProcessLimits::default(),
            policy,
        );
        let socket = std::env::temp_dir().join(format!(
            "svcmgr-reactor-{}-{}.sock",
            name,
            std::process::id()
        ));
        Reactor::new(manager, socket, Arc::new(AtomicBool::new(false)))
    }

    fn is_socket(path: &Path) -> bool {
        std::fs::symlink_metadata(path)
            .map(|m| m.file_type().is_socket())
            .unwrap_or(false)
    }

    #[test]
    fn test_socket_recreated_after_removal() {
        let mut reactor = reactor("heal");
        reactor.tick().unwrap();
        assert!(is_socket(reactor.socket_path()));

        std::fs::remove_file(reactor.socket_path()).unwrap();
        reactor.tick().unwrap();
        assert!(is_socket(reactor.socket_path()));

        reactor.close();
        assert!(!reactor.socket_path().exists());
    }

    #[test]
    fn test_stale_file_replaced() {
        let mut reactor = reactor("stale");
        std::fs::write(reactor.socket_path(), "not a socket").unwrap();
        reactor.tick().unwrap();
        assert!(is_socket(reactor.socket_path()));
        reactor.close();
    }

    #[test]
    fn test_request_round_trip() {
        let mut reactor = reactor("rpc");
        reactor.tick().unwrap();

        let mut client = UnixStream::connect(reactor.socket_path()).unwrap();
        client
            .write_all(b"{\"Function\":\"list\"}\n{\"Function\":\"start\",\"Service\":\"web\"}\n")
            .unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // accept, then read and answer
        for _ in 0..5 {
            reactor.tick().unwrap();
        }

        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "{\"Status\":\"okay\",\"Response\":{}}\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(
            line,
            "{\"Status\":\"error\",\"Error\":\"Please provide a valid Service.\"}\n"
        );

        drop(reader);
        for _ in 0..3 {
            reactor.tick().unwrap();
        }
        assert!(reactor.clients.is_empty());
        reactor.close();
    }

    #[test]
    fn test_close_unlinks_socket_after_accept_failure() {
        let mut reactor = reactor("dropped");
        reactor.tick().unwrap();
        assert!(is_socket(reactor.socket_path()));

        // an accept error leaves the file behind without a listener
        reactor.listener = None;
        reactor.close();
        assert!(!reactor.socket_path().exists());
    }

    fn sigterm_from(pid: i32) -> SignalEvent {
        SignalEvent {
            signo: Signal::SIGTERM as i32,
            pid,
        }
    }

    #[test]
    fn test_signals_from_outside_stop_the_reactor() {
        let _ring = RING_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let dir = std::env::temp_dir()
            .join(format!("svcmgr-reactor-signals-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let paths = Paths::new(dir.join("data"));
        paths.ensure_layout().unwrap();
        std::fs::write(paths.definition("web"), r#"{"ExecStart": "/bin/sleep 60"}"#).unwrap();

        let policy = SupervisorPolicy {
            tick: Duration::from_millis(20),
            stop_timeout: Duration::from_secs(2),
            stop_poll_interval: Duration::from_millis(20),
            ..SupervisorPolicy::default()
        };
        let mut manager = Manager::new(paths.clone(), ProcessLimits::default(), policy);
        manager.enable("web").unwrap();
        manager.start("web").unwrap();
        let child = manager.get("web").and_then(|s| s.state.pid).unwrap();

        let socket = dir.join("svcmgr.sock");
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut reactor = Reactor::new(manager, socket.clone(), Arc::clone(&shutdown))
            .with_signal_relay(SignalRelay::uninstalled());
        reactor.tick().unwrap();
        assert!(is_socket(&socket));

        // from ourselves and from a supervised process
        signals::record(sigterm_from(std::process::id() as i32));
        signals::record(sigterm_from(child));
        reactor.tick().unwrap();
        assert!(!shutdown.load(Ordering::SeqCst));
        assert!(reactor.manager().is_active("web"));

        signals::record(sigterm_from(1));
        reactor.run();

        assert!(shutdown.load(Ordering::SeqCst));
        assert!(!socket.exists());
        assert!(crate::manager::has_exited(child));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_signal_overflow_stops_the_reactor() {
        let _ring = RING_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut reactor = reactor("overflow").with_signal_relay(SignalRelay::uninstalled());
        reactor.shutdown = Arc::clone(&shutdown);
        reactor.tick().unwrap();

        let own = std::process::id() as i32;
        for _ in 0..64 {
            signals::record(sigterm_from(own));
        }
        reactor.tick().unwrap();
        assert!(shutdown.load(Ordering::SeqCst));
        reactor.close();
        assert!(!reactor.socket_path().exists());
    }
}
