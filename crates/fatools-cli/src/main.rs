use std::io::{BufRead, IsTerminal};
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use dialoguer::Confirm;
use fatools_cli::{Args, RunMode};
use fatools_core::FatoolsError;
use tracing_subscriber::EnvFilter;

fn main() {
    // RUST_LOG wins; FATOOLS_LOG is the tool-specific fallback
    let log_level = std::env::var("FATOOLS_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mode = args.run_mode();
    if mode != RunMode::Commit {
        eprintln!("{}", "WARNING -- running without committing to database!".yellow());
    }
    if mode == RunMode::Confirm && !confirm()? {
        return Err(FatoolsError::Declined.into());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(fatools_cli::execute(&args))?;
    Ok(())
}

fn confirm() -> Result<bool> {
    let prompt = "Do you want to continue?";
    if std::io::stdin().is_terminal() {
        return Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("failed to read confirmation");
    }

    // Piped input: one line, as answered by `echo y | dbmgr ...`
    eprint!("{prompt} [y/N] ");
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation from stdin")?;
    Ok(fatools_cli::confirmed(&answer))
}
