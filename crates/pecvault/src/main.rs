//! `pecvault` - Daily archiver for PEC (certified mail) mailboxes.
//!
//! Fetches each account's folders over IMAP, stores messages as `.eml`
//! files with CSV/JSON indexes, builds a deterministic tar.gz with a
//! SHA-256 digest, and optionally ships the bundle to S3-compatible
//! object storage.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{Duration, Local, NaiveDate, NaiveTime, Timelike};
use clap::{Parser, Subcommand};
use pecvault_core::{Orchestrator, RunReport, RunStatus, Settings};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pecvault", version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, short, env = "PECVAULT_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Archive one date for every account and exit.
    Run {
        /// Date to archive (YYYY-MM-DD); defaults to yesterday.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run daily at the configured time, archiving the previous day.
    Daemon,
    /// Validate the configuration and print a summary.
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pecvault=info,pecvault_core=info,pecvault_imap=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let settings = match Settings::load(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            error!(config = %cli.config.display(), error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Run { date } => {
            let date = date.unwrap_or_else(yesterday);
            let orchestrator = Orchestrator::new(settings).await;
            let report = orchestrator.run(date).await;
            print_report(&report);
            exit_code(&report)
        }
        Command::Daemon => daemon(settings).await,
        Command::CheckConfig => {
            check_config(&settings);
            ExitCode::SUCCESS
        }
    }
}

/// The default archive target: the last fully elapsed day.
fn yesterday() -> NaiveDate {
    Local::now().date_naive() - Duration::days(1)
}

fn print_report(report: &RunReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "cannot render report"),
    }
}

/// A partial run still archived something, so only a failed run is a
/// process-level failure.
fn exit_code(report: &RunReport) -> ExitCode {
    if report.overall_status == RunStatus::Failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Sleeps until the configured run time each day, then archives the
/// previous day. Runs until the process is stopped.
async fn daemon(settings: Settings) -> ExitCode {
    let run_time = match parse_run_time(&settings.scheduler.run_time) {
        Ok(time) => time,
        Err(e) => {
            error!(error = %e, "invalid scheduler.run_time");
            return ExitCode::FAILURE;
        }
    };

    let orchestrator = Orchestrator::new(settings).await;
    info!(run_time = %run_time, "daemon started");

    loop {
        let wait = until_next(run_time);
        info!(wait_secs = wait.as_secs(), "sleeping until next run");
        tokio::time::sleep(wait).await;

        let date = yesterday();
        let report = orchestrator.run(date).await;
        print_report(&report);
        if report.overall_status == RunStatus::Failed {
            error!(%date, "scheduled run failed");
        }
    }
}

/// Parses "HH:MM" into a time of day.
fn parse_run_time(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|e| format!("expected HH:MM, got {raw:?}: {e}"))
}

/// Time remaining until the next local occurrence of `run_time`.
fn until_next(run_time: NaiveTime) -> std::time::Duration {
    let now = Local::now();
    let today_run = now
        .date_naive()
        .and_hms_opt(run_time.hour(), run_time.minute(), 0)
        .unwrap_or_else(|| now.naive_local());
    let next = if today_run > now.naive_local() {
        today_run
    } else {
        today_run + Duration::days(1)
    };
    (next - now.naive_local())
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(60))
}

fn check_config(settings: &Settings) {
    println!("configuration OK");
    println!("  base_path:   {}", settings.base_path.display());
    println!("  backup_mode: {}", settings.backup_mode);
    println!("  concurrency: {}", settings.concurrency);
    println!("  accounts:    {}", settings.accounts.len());
    for account in &settings.accounts {
        println!(
            "    {} @ {}:{} ({} folders)",
            account.address,
            account.host,
            account.port,
            account.folders.len()
        );
    }
    if let Some(s3) = &settings.s3 {
        println!(
            "  s3:          s3://{}/{} ({})",
            s3.bucket, s3.prefix, s3.region
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_time() {
        assert_eq!(
            parse_run_time("01:00").unwrap(),
            NaiveTime::from_hms_opt(1, 0, 0).unwrap()
        );
        assert_eq!(
            parse_run_time("23:59").unwrap(),
            NaiveTime::from_hms_opt(23, 59, 0).unwrap()
        );
        assert!(parse_run_time("25:00").is_err());
        assert!(parse_run_time("noon").is_err());
    }

    #[test]
    fn test_cli_parses_run_with_date() {
        let cli = Cli::parse_from(["pecvault", "run", "--date", "2024-01-15"]);
        match cli.command {
            Command::Run { date } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2024, 1, 15));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_cli_default_config_path() {
        let cli = Cli::parse_from(["pecvault", "check-config"]);
        assert_eq!(cli.config, PathBuf::from("config.toml"));
    }
}
