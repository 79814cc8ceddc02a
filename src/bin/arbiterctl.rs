//! Operator-facing alias for the same command surface `arbiter` exposes.
//! Shipped as a separate binary so a deployment can install the control
//! commands (`status`, `drain`) without implying the caller also runs
//! `serve` from this host.

use arbiter::cli::{run, Cli};
use clap::Parser;
use std::process::ExitCode;
use tracing::Level;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();
    run(Cli::parse()).await
}
