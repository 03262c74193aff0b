// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use backsync::{
    config::BackupConfig,
    exit_code_for,
    layout::{confirm_adoption, Layout},
    path::default_config_path,
    publish::PublishOutcome,
    schedule::{Registrar, ScheduleEntry, SystemCrontab},
    tick,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use std::{path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "backsync [options] <backsync-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let config_path = match self.config {
            Some(path) => path,
            None => default_config_path()?,
        };
        let config = BackupConfig::load(&config_path)
            .with_context(|| format!("cannot load configuration {:?}", config_path.display()))?;

        match self.command {
            Command::Init(opts) => run_init(&config, opts),
            Command::Mirror => run_mirror(&config),
            Command::Commit => run_commit(&config),
            Command::Tick => run_tick(&config),
            Command::Schedule(opts) => run_schedule(config, config_path, opts),
            Command::Unschedule => run_unschedule(&config),
            Command::ShowConfig => {
                print!("{config}");
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Create service layout, repositories, and remote wiring.
    #[command(override_usage = "backsync init [options]")]
    Init(InitOptions),

    /// Mirror source into mirror tree.
    Mirror,

    /// Commit pending changes of mirror tree and push them.
    Commit,

    /// Mirror, then commit and push if mirroring succeeded.
    Tick,

    /// Install periodic trigger running tick.
    #[command(override_usage = "backsync schedule [options]")]
    Schedule(ScheduleOptions),

    /// Remove periodic trigger.
    Unschedule,

    /// Print effective configuration.
    ShowConfig,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// Adopt a populated mirror tree without asking.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ScheduleOptions {
    /// Cron expression to use instead of the configured one.
    #[arg(long, value_name = "expr")]
    pub cron: Option<String>,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = Cli::parse().run() {
        error!("{error:?}");
        exit(exit_code_for(&error));
    }

    exit(0)
}

fn run_init(config: &BackupConfig, opts: InitOptions) -> Result<()> {
    let layout = Layout::from_config(config)?;
    let report = layout.init(&config.publish.remote, |path| {
        if opts.yes {
            Ok(true)
        } else {
            confirm_adoption(path)
        }
    })?;

    if report.is_noop() {
        info!("layout at {:?} already initialized", layout.root().display());
    }

    Ok(())
}

fn run_mirror(config: &BackupConfig) -> Result<()> {
    let report = tick::run_mirror(config, ProgressBar::new_spinner())?;
    info!(
        "{} copied, {} deleted, {} unchanged",
        report.copied, report.deleted, report.unchanged
    );

    Ok(())
}

fn run_commit(config: &BackupConfig) -> Result<()> {
    log_publish(&tick::run_commit(config)?);
    Ok(())
}

fn run_tick(config: &BackupConfig) -> Result<()> {
    let outcome = tick::run(config, ProgressBar::new_spinner())?;
    log_publish(&outcome.publish);
    Ok(())
}

fn log_publish(outcome: &PublishOutcome) {
    match outcome {
        PublishOutcome::NothingToCommit => info!("mirror tree unchanged"),
        PublishOutcome::Published { commit, branches } => {
            info!("published {commit} on {}", branches.join(", "))
        }
    }
}

fn run_schedule(mut config: BackupConfig, config_path: PathBuf, opts: ScheduleOptions) -> Result<()> {
    if let Some(cron) = opts.cron {
        config.schedule.cron = cron;
    }

    // INVARIANT: Cron runs with a different working directory, so paths must be absolute.
    let exe = std::env::current_exe().context("cannot locate backsync executable")?;
    let config_path = config_path
        .canonicalize()
        .with_context(|| format!("cannot resolve {:?}", config_path.display()))?;

    let entry = ScheduleEntry::for_tick(&config.schedule, exe, config_path)?;
    let registrar = Registrar::new(SystemCrontab::for_user(config.service.user.clone()));
    registrar.register(&entry)?;

    Ok(())
}

fn run_unschedule(config: &BackupConfig) -> Result<()> {
    let registrar = Registrar::new(SystemCrontab::for_user(config.service.user.clone()));
    registrar.unregister(&config.schedule.tag)?;

    Ok(())
}
