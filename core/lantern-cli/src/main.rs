//! lantern: operator CLI for the Lantern debugging assistant.
//!
//! ## Subcommands
//!
//! - `watch`: Start the workers and log session changes until interrupted
//! - `ping`: Probe a worker on the bus
//! - `args`: Print the resolved worker command lines
//! - `ask`: Run one command against a ready session and print the answer

mod commands;
mod logging;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lantern")]
#[command(about = "Lantern debugging assistant")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $LANTERN_CONFIG or ~/.lantern/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the workers and log session changes until interrupted
    Watch {
        /// Kill workers this process launched when the starter fails
        #[arg(long)]
        terminate_on_failure: bool,
    },

    /// Probe a worker; exits 0 when it answers
    Ping {
        /// Probe the model server instead of the analysis worker
        #[arg(long)]
        model: bool,
    },

    /// Print the worker command lines the config resolves to
    Args {
        /// Print as JSON arrays
        #[arg(long)]
        json: bool,
    },

    /// Run one command against a session once it is ready
    Ask {
        /// Candidate session id
        #[arg(value_name = "SESSION")]
        session: String,

        /// QUERY, EXPLAIN, LOCATIONS or REPAIRS
        #[arg(value_name = "COMMAND")]
        command: String,

        /// Question text for QUERY
        #[arg(value_name = "TEXT")]
        text: Option<String>,

        /// How long to wait for the session to become ready
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Watch {
            terminate_on_failure,
        } => commands::watch(cli.config, terminate_on_failure),
        Commands::Ping { model } => commands::ping(cli.config, model),
        Commands::Args { json } => commands::args(cli.config, json),
        Commands::Ask {
            session,
            command,
            text,
            wait_secs,
        } => commands::ask(cli.config, &session, &command, text, wait_secs),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "lantern failed");
            std::process::exit(2);
        }
    }
}
