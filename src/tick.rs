// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Scheduled backup runs.
//!
//! A __tick__ is one scheduled run: the mirror job followed by the commit/push
//! job. The second job only runs when the first one succeeded, so a broken
//! mirror never gets committed. Every run holds the service [`Lease`] for its
//! whole duration. A run that finds the lease taken does nothing and exits
//! with `EX_TEMPFAIL`, leaving the work to the next tick.
//!
//! Each job writes its own journal under the logs directory, named after the
//! job: `mirror.log` and `commit.log`.

use crate::{
    config::{BackupConfig, ConfigError},
    journal::{Journal, JournalError},
    layout::{Layout, LayoutError},
    lease::{Lease, LeaseError},
    mirror::{Engine, MirrorError, MirrorJob, MirrorReport},
    publish::{PublishError, PublishOutcome, Publisher},
    schedule::ScheduleError,
    syscall::SyscallError,
};

use indicatif::ProgressBar;
use tracing::{info, instrument};

/// Journal name of the mirror job.
pub const MIRROR_JOB: &str = "mirror";

/// Journal name of the commit/push job.
pub const COMMIT_JOB: &str = "commit";

/// Outcome of a full tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    /// Summary of the mirror pass.
    pub mirror: MirrorReport,

    /// Outcome of the commit/push job.
    pub publish: PublishOutcome,
}

/// Run mirror job on its own.
///
/// # Errors
///
/// - Return [`JobError::Lease`] if another run holds the lease.
/// - Return [`JobError::Mirror`] if the mirror job fails.
#[instrument(skip(config, bar), level = "debug")]
pub fn run_mirror(config: &BackupConfig, bar: ProgressBar) -> Result<MirrorReport> {
    let layout = Layout::from_config(config)?;
    let _lease = Lease::acquire(layout.lease_path())?;

    mirror(config, &layout, bar)
}

/// Run commit/push job on its own.
///
/// # Errors
///
/// - Return [`JobError::Lease`] if another run holds the lease.
/// - Return [`JobError::Publish`] if the commit/push job fails.
#[instrument(skip(config), level = "debug")]
pub fn run_commit(config: &BackupConfig) -> Result<PublishOutcome> {
    let layout = Layout::from_config(config)?;
    let _lease = Lease::acquire(layout.lease_path())?;

    commit(config, &layout)
}

/// Run mirror job, then commit/push job if mirroring succeeded.
///
/// # Errors
///
/// - Return [`JobError::Lease`] if another run holds the lease.
/// - Return [`JobError::Mirror`] if the mirror job fails. The commit/push
///   job does not run in that case.
/// - Return [`JobError::Publish`] if the commit/push job fails.
#[instrument(skip(config, bar), level = "debug")]
pub fn run(config: &BackupConfig, bar: ProgressBar) -> Result<TickOutcome> {
    let layout = Layout::from_config(config)?;
    let _lease = Lease::acquire(layout.lease_path())?;

    let mirror = mirror(config, &layout, bar)?;
    let publish = commit(config, &layout)?;
    info!("tick finished");

    Ok(TickOutcome { mirror, publish })
}

fn mirror(config: &BackupConfig, layout: &Layout, bar: ProgressBar) -> Result<MirrorReport> {
    let mut journal = Journal::open(layout.logs_dir(), MIRROR_JOB, config.service.retention)?;
    let job = MirrorJob::new(
        config.mirror.source.as_path(),
        layout.mirror_dir(),
        config.exclusion_rules(),
        Engine::from_backend(config.mirror.backend, bar),
    )?
    .protect([
        layout.bare_repo().to_path_buf(),
        layout.service_dir(),
        layout.logs_dir(),
        layout.install_dir(),
    ]);

    Ok(job.run(&mut journal)?)
}

fn commit(config: &BackupConfig, layout: &Layout) -> Result<PublishOutcome> {
    let mut journal = Journal::open(layout.logs_dir(), COMMIT_JOB, config.service.retention)?;

    // INVARIANT: A mirror tree that cannot be opened is still journaled.
    let publisher = match Publisher::open(layout.mirror_dir(), config.publish.clone()) {
        Ok(publisher) => publisher,
        Err(err) => {
            journal.record(format!(
                "commit failed with exit code {}: {err}",
                err.exit_code()
            ))?;
            return Err(err.into());
        }
    };

    Ok(publisher.run(&mut journal)?)
}

/// Map error chain to process exit code.
///
/// Walks the chain for the first typed error carrying its own exit code.
/// Anything unrecognized exits with 1.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<JobError>() {
            return err.exit_code();
        }
        if let Some(err) = cause.downcast_ref::<MirrorError>() {
            return err.exit_code();
        }
        if let Some(err) = cause.downcast_ref::<PublishError>() {
            return err.exit_code();
        }
        if let Some(err) = cause.downcast_ref::<LeaseError>() {
            return err.exit_code();
        }
        if let Some(err) = cause.downcast_ref::<ScheduleError>() {
            return err.exit_code();
        }
        if let Some(err) = cause.downcast_ref::<SyscallError>() {
            return err.exit_code();
        }
    }

    1
}

/// Scheduled job error types.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Configuration cannot be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Layout cannot be derived.
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// Lease cannot be acquired.
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Journal cannot be opened or written.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Mirror job fails.
    #[error(transparent)]
    Mirror(#[from] MirrorError),

    /// Commit/push job fails.
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl JobError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Lease(err) => err.exit_code(),
            Self::Mirror(err) => err.exit_code(),
            Self::Publish(err) => err.exit_code(),
            Self::Config(_) | Self::Layout(_) | Self::Journal(_) => 1,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = JobError> = std::result::Result<T, E>;
