//! Log dispatch for the daemon
//!
//! Operational records go to `svcmgrd.log` (and stderr when running in the
//! foreground). Operator alerts are ordinary `error` records with the
//! `notify` target; they additionally land in `notify.log`.

use log::LevelFilter;

use crate::config::Paths;

/// Log target used for operator alerts
pub const NOTIFY_TARGET: &str = "notify";

/// Emit an operator alert.
///
/// Alerts carry a higher severity than routine log records and are split
/// into their own file so they can be watched separately.
#[macro_export]
macro_rules! notify {
    ($($arg:tt)+) => {
        ::log::error!(target: $crate::logging::NOTIFY_TARGET, $($arg)+)
    };
}

/// Install the global logger
pub fn init(paths: &Paths, level: LevelFilter, console: bool) -> Result<(), LoggingError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(fern::log_file(paths.log_file())?)
        .chain(
            fern::Dispatch::new()
                .filter(|meta| meta.target() == NOTIFY_TARGET)
                .chain(fern::log_file(paths.notify_log_file())?),
        );

    if console {
        dispatch = dispatch.chain(std::io::stderr());
    }

    dispatch.apply()?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to open log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logger already installed: {0}")]
    Logger(#[from] log::SetLoggerError),
}
