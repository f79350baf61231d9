//! almox-cli: operator tool for the almoxarifado custody policy
//!
//! Validates policy files, prints the effective policy and the default role
//! groups, and evaluates single withdrawal or return operations the same way
//! the custody service does.
//!
//! Exit codes: 0 on success or an allowed evaluation, 1 on error, 2 when an
//! evaluation is denied.

mod commands;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use custody_policy::CustodyPolicy;
use tracing::{error, info};

use commands::Command;

#[derive(Parser)]
#[command(name = "almox-cli")]
#[command(about = "Custody policy tool for the GCM almoxarifado")]
struct Cli {
    /// Policy file (YAML); without one the built-in defaults plus ALMOX_* variables apply
    #[arg(short, long, env = "ALMOX_POLICY_FILE")]
    policy: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("almox_cli=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let policy = match load_policy(cli.policy.as_deref()) {
        Ok(policy) => policy,
        Err(e) => {
            error!("{:#}", e);
            return Ok(ExitCode::FAILURE);
        }
    };
    info!(fingerprint = %policy.fingerprint(), "Policy loaded");

    let output = commands::execute(&cli.command, policy)?;
    println!("{}", output.text.trim_end());

    Ok(if output.denied {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

fn load_policy(path: Option<&Path>) -> anyhow::Result<CustodyPolicy> {
    match path {
        Some(path) => CustodyPolicy::load(path)
            .with_context(|| format!("loading policy from {}", path.display())),
        None => CustodyPolicy::from_env().context("loading policy from environment"),
    }
}
