//! `workorder` CLI.
//!
//! Validates work-order documents and executes them against a git repository,
//! one commit per successful work order on a dedicated working branch.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing::debug;

use workorder::batch::{BatchOutcome, run_batch};
use workorder::core::types::RunVerdict;
use workorder::core::validator::validate_batch;
use workorder::engine::Engine;
use workorder::errors::EngineError;
use workorder::exit_codes;
use workorder::io::config::{DEFAULT_CONFIG_PATH, EngineConfig, load_config, write_config};
use workorder::io::document::load_documents;
use workorder::io::oracle::CommandOracle;
use workorder::io::verify::ProcessVerifier;
use workorder::logging;

#[derive(Parser)]
#[command(
    name = "workorder",
    version,
    about = "Execute scoped work orders: propose, write, verify, commit or roll back"
)]
struct Cli {
    /// Repository to operate on.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,
    /// Config file (defaults to `<repo>/.workorder/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log engine progress at info level (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a batch of work-order documents without running them.
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Validate and execute a batch, stopping at the first failed work order.
    Run {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Working branch (created from HEAD when missing).
        #[arg(long)]
        branch: Option<String>,
    },
    /// Write the default config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.repo.join(DEFAULT_CONFIG_PATH));
    match cli.command {
        Command::InitConfig { force } => cmd_init_config(&config_path, force),
        Command::Validate { files } => {
            let config = load_config(&config_path)?;
            Ok(cmd_validate(&config, &files))
        }
        Command::Run { files, branch } => {
            let config = load_config(&config_path)?;
            Ok(cmd_run(&cli.repo, &config, &files, branch.as_deref()))
        }
    }
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &EngineConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(config: &EngineConfig, files: &[PathBuf]) -> i32 {
    let result = load_documents(files).and_then(|docs| {
        validate_batch(&docs, &config.validation_rules()).map_err(EngineError::Schema)
    });
    match result {
        Ok(orders) => {
            for order in &orders {
                println!("{} ok", order.id());
            }
            exit_codes::OK
        }
        Err(err) => report_error(&err),
    }
}

fn cmd_run(repo: &Path, config: &EngineConfig, files: &[PathBuf], branch: Option<&str>) -> i32 {
    let docs = match load_documents(files) {
        Ok(docs) => docs,
        Err(err) => return report_error(&err),
    };
    let oracle = CommandOracle::new(config.oracle.command.clone());
    let verifier = ProcessVerifier;
    let engine = Engine::new(repo, config, &oracle, &verifier);
    debug!(repo = %repo.display(), orders = docs.len(), "running batch");
    match run_batch(&engine, config, &docs, branch) {
        Ok(outcome) => {
            print_outcome(&outcome);
            outcome.exit_code()
        }
        Err(err) => report_error(&err),
    }
}

fn print_outcome(outcome: &BatchOutcome) {
    println!("branch {}", outcome.branch);
    for summary in &outcome.summaries {
        let verdict = match summary.verdict {
            RunVerdict::Success => "SUCCESS",
            RunVerdict::Failed if summary.cancelled => "CANCELLED",
            RunVerdict::Failed => "FAILED",
        };
        let mut line = format!(
            "{} {verdict} attempts={}",
            summary.work_order_id,
            summary.attempts.len()
        );
        if let Some(commit) = &summary.result_commit {
            line.push_str(&format!(" commit={}", &commit[..commit.len().min(12)]));
        }
        if let Some(brief) = summary.briefs().last() {
            line.push_str(&format!(" last_failure={}", brief.kind));
        }
        println!("{line}");
    }
    for id in &outcome.skipped {
        println!("{id} SKIPPED");
    }
}

fn report_error(err: &EngineError) -> i32 {
    match err {
        EngineError::Schema(errors) => {
            eprintln!("work order validation failed:");
            for error in errors {
                eprintln!("- {error}");
            }
        }
        other => eprintln!("error [{}]: {other}", other.kind()),
    }
    exit_codes::INVALID
}
