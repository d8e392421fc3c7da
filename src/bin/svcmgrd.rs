//! svcmgrd - Non-root process supervisor daemon
//!
//! Listens on the control socket (/tmp/svcmgr by default) for commands from
//! svcmgr, starts every enabled service at boot and keeps supervised
//! services running.
//!
//! Bootstrap order:
//! - Prepare the data directory and open the log files
//! - Install the signal relay and write the lifetime files
//! - Raise resource limits, start enabled services
//! - Serve the control socket until a shutdown signal arrives

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use log::{info, LevelFilter};

use svcmgr::config::{self, Paths, SupervisorPolicy};
use svcmgr::daemon::{self, LifetimeFiles, Reactor, SignalRelay};
use svcmgr::limits::ProcessLimits;
use svcmgr::logging;
use svcmgr::manager::Manager;

#[derive(Parser)]
#[command(name = "svcmgrd")]
#[command(version, about = "Non-root process supervisor daemon")]
#[command(
    long_about = "svcmgrd starts, stops and monitors the services declared under \
    <data>/services. It listens on a Unix socket for commands from svcmgr."
)]
struct Args {
    /// Detach from the controlling terminal
    #[arg(long, short = 'd')]
    daemon: bool,

    /// Data directory (services/, enabled/, active/, logs)
    #[arg(long, env = "SVCMGR_DATA")]
    data: Option<String>,

    /// Control socket path
    #[arg(long, env = "SVCMGR_SOCKET", default_value = config::SOCKET_PATH)]
    socket: String,

    /// Log debug records
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let data = args
        .data
        .as_deref()
        .map(|d| PathBuf::from(config::strip_quotes(d)))
        .unwrap_or_else(config::default_data_dir);
    let socket = PathBuf::from(config::strip_quotes(&args.socket));

    let paths = Paths::new(data);
    let paths = match paths.ensure_layout().and_then(|()| paths.canonicalize()) {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("svcmgrd: {}", e);
            std::process::exit(1);
        }
    };

    if args.daemon {
        if let Err(e) = nix::unistd::daemon(true, false) {
            eprintln!("svcmgrd: failed to daemonize: {}", e);
            std::process::exit(1);
        }
    }

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = logging::init(&paths, level, !args.daemon) {
        eprintln!("svcmgrd: {}", e);
        std::process::exit(1);
    }

    info!(
        "svcmgrd {} starting (PID {}, data {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id(),
        paths.data().display()
    );

    let relay = SignalRelay::install()?;
    let _lifetime = LifetimeFiles::create(&paths)?;

    daemon::enter_cores_dir(&paths);
    let limits = ProcessLimits::raise();

    let mut manager = Manager::new(paths, limits, SupervisorPolicy::default());
    daemon::reconcile(&mut manager);

    daemon::set_umask();

    let shutdown = Arc::new(AtomicBool::new(false));
    Reactor::new(manager, socket, shutdown)
        .with_signal_relay(relay)
        .run();

    info!("svcmgrd stopped");
    Ok(())
}
