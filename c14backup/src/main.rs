//! `c14backup`: back up local trees to C14 cold storage and rotate archives.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::error;

use c14backup::backup::{BackupOrchestrator, run_with_courtesy_retry};
use c14backup::error::is_config_error;
use c14backup::exit_codes;
use c14backup::io::api::{C14Api, HttpTransport};
use c14backup::io::config::{
    BackupConfig, DEFAULT_CONFIG_PATH, DEFAULT_PROFILE, Profile, load_config,
};
use c14backup::io::process::SystemRunner;
use c14backup::logging;
use c14backup::rotate::{RotationReport, rotate, rotate_safe};

#[derive(Parser)]
#[command(
    name = "c14backup",
    version,
    about = "Incremental, optionally encrypted backups to C14 cold storage"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one backup for a profile.
    Backup {
        #[arg(default_value = DEFAULT_PROFILE)]
        profile: String,
        /// Run a rotation pass after a successful backup.
        #[arg(long)]
        rotate: bool,
        /// Fail on the first fatal error instead of running once more.
        #[arg(long)]
        no_outer_retry: bool,
    },
    /// Delete archives not retained by the profile's rotation buckets.
    Rotate {
        #[arg(default_value = DEFAULT_PROFILE)]
        profile: String,
    },
    /// Validate the configuration and print the resolved profile.
    Check {
        #[arg(default_value = DEFAULT_PROFILE)]
        profile: String,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match run(&cli) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            eprintln!("{err:#}");
            if is_config_error(&err) {
                exit_codes::CONFIG
            } else {
                exit_codes::FAILED
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<()> {
    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            logging::init("info");
            return Err(err);
        }
    };
    logging::init(&config.log_level);

    match &cli.command {
        Command::Backup {
            profile,
            rotate,
            no_outer_retry,
        } => cmd_backup(&config, profile, *rotate, *no_outer_retry),
        Command::Rotate { profile } => cmd_rotate(&config, profile),
        Command::Check { profile } => cmd_check(&config, profile),
    }
}

fn cmd_backup(
    config: &BackupConfig,
    name: &str,
    then_rotate: bool,
    no_outer_retry: bool,
) -> Result<()> {
    let profile = config.profile(name)?;
    let enabled = profile.enabled_buckets()?;
    let api = C14Api::new(HttpTransport::new(&profile.api_key)?);
    let runner = system_runner(config);
    let orchestrator =
        BackupOrchestrator::new(&api, &runner, &config.retry, &config.mount_root, profile);

    let outcome = if no_outer_retry {
        orchestrator.run()?
    } else {
        let delay = Duration::from_secs(config.retry.outer_retry_delay_secs);
        run_with_courtesy_retry(delay, || orchestrator.run())?
    };
    println!("backup {} committed to archive {}", outcome.timestamp, outcome.archive_id);

    if then_rotate {
        let report = rotate(&api, &outcome.safe_id, &enabled, Utc::now())?;
        print_rotation(&report)?;
    }
    Ok(())
}

fn cmd_rotate(config: &BackupConfig, name: &str) -> Result<()> {
    let profile = config.profile(name)?;
    let enabled = profile.enabled_buckets()?;
    let api = C14Api::new(HttpTransport::new(&profile.api_key)?);
    let report = rotate_safe(&api, &profile.safe_name, &enabled, Utc::now())?;
    print_rotation(&report)
}

fn cmd_check(config: &BackupConfig, name: &str) -> Result<()> {
    let profile = config.profile(name)?;
    print_profile(name, profile, config)
}

fn print_rotation(report: &RotationReport) -> Result<()> {
    for uuid in &report.deleted {
        println!("deleted {uuid}");
    }
    for (uuid, reason) in &report.failed {
        println!("failed {uuid}: {reason}");
    }
    if !report.is_clean() {
        bail!("{} archive deletion(s) failed", report.failed.len());
    }
    Ok(())
}

fn print_profile(name: &str, profile: &Profile, config: &BackupConfig) -> Result<()> {
    let buckets: Vec<&str> = profile
        .enabled_buckets()?
        .into_iter()
        .map(|b| b.config_key())
        .collect();
    println!("profile: {name}");
    println!("safe: {}", profile.safe_name);
    println!("mount root: {}", config.mount_root.display());
    println!("encrypt: {}", profile.encrypt);
    println!("incremental: {}", profile.incremental);
    println!("include: {}", profile.include.join(", "));
    println!("exclude: {}", profile.exclude.join(", "));
    if buckets.is_empty() {
        println!("rotation: keep everything");
    } else {
        println!("rotation: {}", buckets.join(", "));
    }
    Ok(())
}

fn system_runner(config: &BackupConfig) -> SystemRunner {
    SystemRunner {
        timeout: config.retry.command_timeout(),
        output_limit_bytes: config.retry.output_limit_bytes,
    }
}
