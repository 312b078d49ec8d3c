use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::{self, CommandReport};

#[derive(Debug, Parser)]
#[command(
    name = "gazette",
    about = "Windowed digest pipeline for pseudonymized chat exports",
    version
)]
struct Cli {
    /// Emit the command report as JSON instead of plain lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process a message export into digest artifacts.
    Run {
        /// Path to the JSONL message export.
        input: PathBuf,
    },
    /// Show checkpoint rows and the task backlog.
    Status {
        /// Maximum number of window rows to print.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Reset a failed window to pending.
    Retry {
        /// Window id, e.g. w0002 or w0002.1
        window_id: String,
    },
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{}: {}", report.command, if report.ok { "ok" } else { "failed" });
    for detail in &report.details {
        println!("  {detail}");
    }
    for issue in &report.issues {
        println!("  issue: {issue}");
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let report = match &cli.command {
        Command::Run { input } => commands::run::run(input)?,
        Command::Status { limit } => commands::status::run(*limit)?,
        Command::Retry { window_id } => commands::retry::run(window_id)?,
    };

    print_report(&report, cli.json)?;
    if !report.ok {
        std::process::exit(1);
    }
    Ok(())
}
