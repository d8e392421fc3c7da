//! svcmgr - CLI for svcmgrd
//!
//! Sends one request over the control socket and prints the answer.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use svcmgr::client::{self, ClientError};
use svcmgr::config;
use svcmgr::protocol::{Function, Request, Response};

#[derive(Parser)]
#[command(name = "svcmgr")]
#[command(version, about = "Control the svcmgrd process supervisor")]
struct Args {
    /// Control socket path
    #[arg(long, global = true, env = "SVCMGR_SOCKET", default_value = config::SOCKET_PATH)]
    socket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the status of one service, or of every known service
    List {
        /// Service name
        name: Option<String>,
    },

    /// Start a service
    Start {
        /// Service name
        name: String,
    },

    /// Stop a service
    Stop {
        /// Service name
        name: String,
    },

    /// Stop and start a running service
    Restart {
        /// Service name
        name: String,
    },

    /// Send SIGHUP to a running service
    Reload {
        /// Service name
        name: String,
    },

    /// Start a service at daemon startup and register it now
    Enable {
        /// Service name
        name: String,
    },

    /// Stop and unregister a service and stop starting it at daemon startup
    Disable {
        /// Service name
        name: String,
    },
}

impl Command {
    fn to_request(&self) -> Request {
        match self {
            Command::List { name } => Request::new(Function::List, name.as_deref()),
            Command::Start { name } => Request::new(Function::Start, Some(name)),
            Command::Stop { name } => Request::new(Function::Stop, Some(name)),
            Command::Restart { name } => Request::new(Function::Restart, Some(name)),
            Command::Reload { name } => Request::new(Function::Reload, Some(name)),
            Command::Enable { name } => Request::new(Function::Enable, Some(name)),
            Command::Disable { name } => Request::new(Function::Disable, Some(name)),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let socket = PathBuf::from(config::strip_quotes(&args.socket));
    let request = args.command.to_request();
    log::debug!("Sending {:?} to {}", request, socket.display());

    match client::call(&socket, &request).await {
        Ok(response) => print_response(response),
        Err(e @ ClientError::Connect { .. }) => {
            eprintln!("svcmgr: {}", e);
            eprintln!("  is svcmgrd running?");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("svcmgr: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_response(response: Response) {
    if !response.is_ok() {
        eprintln!(
            "error: {}",
            response.error.as_deref().unwrap_or("request failed")
        );
        std::process::exit(1);
    }

    match response.response {
        None => {} // Silent success
        Some(Value::String(status)) => println!("{}", status),
        Some(Value::Object(services)) => {
            if services.is_empty() {
                println!("No services");
                return;
            }
            let width = services.keys().map(|k| k.len()).max().unwrap_or(0);
            for (name, status) in &services {
                let status = status.as_str().unwrap_or("unknown");
                println!("{:<width$}  {}", format!("{}:", name), status, width = width + 1);
            }
        }
        Some(other) => println!("{}", other),
    }
}
