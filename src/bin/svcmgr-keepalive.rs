//! svcmgr-keepalive - Relaunch svcmgrd when it is not running
//!
//! Meant to be run periodically (cron, a login script). Reads the daemon pid
//! from `<data>/.pid` and runs the launch command through the shell when that
//! process is gone.

use std::path::PathBuf;
use std::process::Command;

use clap::Parser;

use svcmgr::config::{self, Paths};
use svcmgr::daemon;

#[derive(Parser)]
#[command(name = "svcmgr-keepalive")]
#[command(version, about = "Relaunch svcmgrd when it is not running")]
struct Args {
    /// Shell command that launches the daemon
    #[arg(long)]
    command: String,

    /// Data directory of the daemon
    #[arg(long, env = "SVCMGR_DATA")]
    data: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let data = args
        .data
        .as_deref()
        .map(|d| PathBuf::from(config::strip_quotes(d)))
        .unwrap_or_else(config::default_data_dir);
    let paths = Paths::new(data);

    if daemon::is_running(&paths) {
        log::debug!("svcmgrd is running");
        return Ok(());
    }

    log::info!("svcmgrd is not running, launching: {}", args.command);
    let status = Command::new("/bin/sh").arg("-c").arg(&args.command).status()?;
    if !status.success() {
        log::warn!("Launch command finished with {}", status);
    }
    Ok(())
}
