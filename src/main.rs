use arbiter::cli::{run, Cli};
use clap::Parser;
use std::process::ExitCode;
use tracing::Level;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();
    run(Cli::parse()).await
}
