//! Command-line surface (§6): operational tooling, not the core runtime.
//! `serve` boots the orchestrator and API server in-process; `validate-spec`
//! is a local, offline check against a working-spec JSON file; `status` and
//! `drain` are thin `reqwest` clients against a running instance's
//! `/status` and `/control/drain` endpoints.
//!
//! Exit codes: 0 success, 1 generic failure, 2 invalid input, 3 unhealthy
//! or unreachable server.

use crate::error::{ArbiterError, Result};
use crate::models::WorkingSpec;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "arbiter", about = "Multi-agent task orchestrator", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the orchestrator and API server and block until shutdown.
    Serve,
    /// Validate a working-spec JSON file without starting the server.
    ValidateSpec { file: PathBuf },
    /// Fetch /status from a running instance.
    Status {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 7878)]
        port: u16,
        #[arg(long, env = "ARBITER_TOKEN")]
        token: String,
    },
    /// Stop admitting new tasks and clear the queue of a running instance.
    Drain {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 7878)]
        port: u16,
        #[arg(long, env = "ARBITER_TOKEN")]
        token: String,
    },
}

pub async fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Serve => crate::run_server(load_config_or_exit()).await,
        Command::ValidateSpec { file } => validate_spec(&file),
        Command::Status { host, port, token } => http_client::get(&host, port, &token, "/status").await.map(drop),
        Command::Drain { host, port, token } => {
            http_client::post(&host, port, &token, "/control/drain", "{}").await.map(drop)
        }
    };
    exit_code_for(result)
}

fn load_config_or_exit() -> crate::config::Config {
    match crate::config::Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(2);
        }
    }
}

fn exit_code_for(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            eprintln!("{err}");
            match err {
                ArbiterError::Validation(_) | ArbiterError::Configuration(_) => ExitCode::from(2),
                ArbiterError::Unavailable(_) | ArbiterError::Timeout(_) => ExitCode::from(3),
                _ => ExitCode::from(1),
            }
        }
    }
}

fn validate_spec(path: &std::path::Path) -> Result<()> {
    let content = std::fs::read_to_string(path).map_err(ArbiterError::Io)?;
    let spec: WorkingSpec =
        serde_json::from_str(&content).map_err(|err| ArbiterError::Validation(format!("invalid working spec: {err}")))?;
    if spec.acceptance.is_empty() {
        return Err(ArbiterError::Validation("working spec has no acceptance criteria".into()));
    }
    if spec.scope.r#in.is_empty() {
        return Err(ArbiterError::Validation("working spec scope.in must not be empty".into()));
    }
    println!("{} is a valid working spec (risk tier {:?})", spec.id, spec.risk_tier);
    Ok(())
}

mod http_client {
    use crate::error::{ArbiterError, Result};
    use std::time::Duration;

    async fn request(host: &str, port: u16, token: &str, method: reqwest::Method, path: &str, body: &str) -> Result<String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| ArbiterError::internal("cli-http-client", err.to_string()))?;

        let response = client
            .request(method, format!("http://{host}:{port}{path}"))
            .bearer_auth(token)
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|err| ArbiterError::Unavailable(format!("cannot reach {host}:{port}: {err}")))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            println!("{text}");
            Ok(text)
        } else if status.is_server_error() {
            Err(ArbiterError::Unavailable(format!("{status}: {text}")))
        } else {
            Err(ArbiterError::Validation(format!("{status}: {text}")))
        }
    }

    pub async fn get(host: &str, port: u16, token: &str, path: &str) -> Result<String> {
        request(host, port, token, reqwest::Method::GET, path, "").await
    }

    pub async fn post(host: &str, port: u16, token: &str, path: &str, body: &str) -> Result<String> {
        request(host, port, token, reqwest::Method::POST, path, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn validate_spec_rejects_missing_acceptance() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"id":"s1","risk_tier":"tier1","mode":"default","blast_radius":"low","scope":{{"in":["x"],"out":[]}},"invariants":[],"acceptance":[],"non_functional":{{}},"contracts":[],"waiver":null}}"#
        )
        .unwrap();
        let err = validate_spec(file.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn validate_spec_accepts_well_formed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"id":"s1","risk_tier":"tier1","mode":"default","blast_radius":"low","scope":{{"in":["x"],"out":[]}},"invariants":[],"acceptance":[{{"id":"ac-1","given":"g","when":"w","then":"t"}}],"non_functional":{{}},"contracts":[],"waiver":null}}"#
        )
        .unwrap();
        validate_spec(file.path()).unwrap();
    }
}
