//! Command-line binary for `tasksync`.
//!
//! A thin wrapper that sets up logging and delegates to the library.

use clap::Parser;
use std::process::ExitCode;
use tasksync::cli::{run, Cli};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `TASKSYNC_LOG=debug`.
const LOG_ENV: &str = "TASKSYNC_LOG";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_logging();
    let output = run(Cli::parse()).await;

    for line in &output.stdout {
        println!("{line}");
    }
    for line in &output.stderr {
        eprintln!("{line}");
    }

    output.exit_code
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}
