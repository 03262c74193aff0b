// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mirror job.
//!
//! The __mirror job__ copies a live source tree into the __mirror tree__, a
//! directory that doubles as a Git working tree. The copy is filtered by an
//! [`ExclusionPolicy`], and is authoritative: entries missing from the source
//! are deleted from the mirror tree, unless an exclusion rule covers them.
//!
//! # Guards
//!
//! Mirroring deletes things. Thus, the job refuses to run when the source and
//! the target are the same directory, when the source lives inside the target,
//! when the source is missing, or when the target has no Git metadata. These
//! are configuration errors, so they are never retried.
//!
//! # Engines
//!
//! The copy itself is delegated to a [`Mirror`] engine. The [`NativeMirror`]
//! engine does everything in-process, while the [`RsyncMirror`] engine hands
//! the work to rsync and propagates its exit code.

pub mod exclude;
pub mod native;
pub mod rsync;

pub use native::NativeMirror;
pub use rsync::RsyncMirror;

use crate::{
    config::MirrorBackend,
    journal::{Journal, JournalError},
    mirror::exclude::{nested_path, ExcludeError, ExclusionPolicy, ExclusionRule},
    syscall::SyscallError,
};

use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Exit code used when the native engine fails part way through.
///
/// Same meaning as rsync's "partial transfer due to error".
pub const PARTIAL_TRANSFER: i32 = 23;

/// Summary of a mirror pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MirrorReport {
    /// Entries copied or recreated in the target.
    pub copied: usize,

    /// Entries deleted from the target.
    pub deleted: usize,

    /// Entries already up to date.
    pub unchanged: usize,
}

/// Engine that makes a target tree mirror a source tree.
pub trait Mirror {
    /// Mirror source into target under an exclusion policy.
    fn mirror(&self, source: &Path, target: &Path, policy: &ExclusionPolicy) -> Result<MirrorReport>;
}

/// Engine selected by configuration.
#[derive(Debug)]
pub enum Engine {
    Native(NativeMirror),
    Rsync(RsyncMirror),
}

impl Engine {
    /// Construct engine for configured backend.
    pub fn from_backend(backend: MirrorBackend, bar: ProgressBar) -> Self {
        match backend {
            MirrorBackend::Native => Self::Native(NativeMirror::new(bar)),
            MirrorBackend::Rsync => Self::Rsync(RsyncMirror::default()),
        }
    }
}

impl Mirror for Engine {
    fn mirror(&self, source: &Path, target: &Path, policy: &ExclusionPolicy) -> Result<MirrorReport> {
        match self {
            Self::Native(engine) => engine.mirror(source, target, policy),
            Self::Rsync(engine) => engine.mirror(source, target, policy),
        }
    }
}

/// Filtered copy of a source tree into a mirror tree.
#[derive(Debug)]
pub struct MirrorJob<M = Engine>
where
    M: Mirror,
{
    source: PathBuf,
    target: PathBuf,
    policy: ExclusionPolicy,
    protected: Vec<PathBuf>,
    engine: M,
}

impl<M> MirrorJob<M>
where
    M: Mirror,
{
    /// Construct new mirror job.
    ///
    /// # Errors
    ///
    /// - Return [`MirrorError::Exclude`] if exclusion rules cannot be
    ///   compiled.
    pub fn new(
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        rules: impl IntoIterator<Item = ExclusionRule>,
        engine: M,
    ) -> Result<Self> {
        Ok(Self {
            source: source.into(),
            target: target.into(),
            policy: ExclusionPolicy::new(rules)?,
            protected: Vec::new(),
            engine,
        })
    }

    /// Never mirror target paths when they live inside the source.
    ///
    /// Meant for directories the service itself writes to during a run, e.g.,
    /// the push target or the journal directory. Copying those would change
    /// the mirror tree on every run.
    pub fn protect(mut self, paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.protected.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Exclusion policy in use.
    pub fn policy(&self) -> &ExclusionPolicy {
        &self.policy
    }

    /// Validate source and target before anything is touched.
    ///
    /// Returns canonical source and target paths.
    ///
    /// # Errors
    ///
    /// - Return [`MirrorError::MissingSource`] if source does not exist.
    /// - Return [`MirrorError::NotARepository`] if target has no Git
    ///   metadata.
    /// - Return [`MirrorError::SameSourceAndTarget`] if both resolve to the
    ///   same directory.
    /// - Return [`MirrorError::SourceInsideTarget`] if source lives inside
    ///   target.
    pub fn preflight(&self) -> Result<(PathBuf, PathBuf)> {
        let source = self
            .source
            .canonicalize()
            .ok()
            .filter(|path| path.is_dir())
            .ok_or_else(|| MirrorError::MissingSource {
                path: self.source.clone(),
            })?;

        // INVARIANT: Identity check comes first, so equal paths never reach the
        // metadata check and get reported as something else.
        let target = self.target.canonicalize().unwrap_or_else(|_| self.target.clone());
        if source == target {
            return Err(MirrorError::SameSourceAndTarget { path: source });
        }

        if !target.join(".git").exists() {
            return Err(MirrorError::NotARepository { path: target });
        }

        if source.starts_with(&target) {
            return Err(MirrorError::SourceInsideTarget {
                source_dir: source,
                target_dir: target,
            });
        }

        Ok((source, target))
    }

    /// Run mirror job, recording progress into journal.
    ///
    /// # Errors
    ///
    /// - Return any guard error of [`MirrorJob::preflight`].
    /// - Return engine errors as is.
    /// - Return [`MirrorError::Journal`] if journal cannot be written.
    #[instrument(skip(self, journal), level = "debug")]
    pub fn run(&self, journal: &mut Journal) -> Result<MirrorReport> {
        journal.record(format!(
            "mirror started: {} -> {}",
            self.source.display(),
            self.target.display()
        ))?;

        let result = self.preflight().and_then(|(source, target)| {
            let policy = self.effective_policy(&source, &target)?;
            self.engine.mirror(&source, &target, &policy)
        });

        match result {
            Ok(report) => {
                journal.record(format!(
                    "mirror completed: {} copied, {} deleted, {} unchanged",
                    report.copied, report.deleted, report.unchanged
                ))?;
                Ok(report)
            }
            Err(err) => {
                journal.record(format!(
                    "mirror failed with exit code {}: {err}",
                    err.exit_code()
                ))?;
                Err(err)
            }
        }
    }

    /// Exclusion policy extended by anchored rules for the target and every
    /// protected path nested inside the source.
    fn effective_policy(&self, source: &Path, target: &Path) -> Result<ExclusionPolicy> {
        let owned = std::iter::once(target.to_path_buf()).chain(
            self.protected
                .iter()
                .map(|path| path.canonicalize().unwrap_or_else(|_| path.clone())),
        );

        // INVARIANT: Nothing the service writes itself is mirrored into the target.
        let mut policy = self.policy.clone();
        for path in owned {
            if let Some(relative) = nested_path(source, &path) {
                debug!("protect nested path {:?}", relative.display());
                policy = policy.with_rule(ExclusionRule::anchored_dir(relative)?)?;
            }
        }

        Ok(policy)
    }
}

/// Mirror job error types.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// Source and target resolve to the same directory.
    #[error("source and target are the same directory {:?}", path.display())]
    SameSourceAndTarget { path: PathBuf },

    /// Source lives inside target, so mirroring would delete it.
    #[error("source {:?} lives inside target {:?}", source_dir.display(), target_dir.display())]
    SourceInsideTarget {
        source_dir: PathBuf,
        target_dir: PathBuf,
    },

    /// Source directory does not exist.
    #[error("source directory {:?} does not exist", path.display())]
    MissingSource { path: PathBuf },

    /// Target has no Git metadata.
    #[error("target {:?} is not a git repository", path.display())]
    NotARepository { path: PathBuf },

    /// Exclusion rules cannot be compiled.
    #[error(transparent)]
    Exclude(#[from] ExcludeError),

    /// Native engine fails to copy or delete an entry.
    #[error("failed to mirror entry {:?}", path.display())]
    Copy {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Native engine finished its pass, but some entries failed.
    #[error("mirror incomplete, {failed} entries failed")]
    Incomplete {
        failed: usize,
        #[source]
        source: Box<MirrorError>,
    },

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Rsync fails.
    #[error(transparent)]
    Rsync(#[from] SyscallError),

    /// Journal cannot be written.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

impl MirrorError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Copy { .. } | Self::Incomplete { .. } => PARTIAL_TRANSFER,
            Self::Rsync(err) => err.exit_code(),
            _ => 1,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = MirrorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{cell::Cell, fs};

    #[derive(Debug, Default)]
    struct CountingMirror {
        calls: Cell<usize>,
        rules: std::cell::RefCell<Vec<String>>,
    }

    impl Mirror for CountingMirror {
        fn mirror(&self, _: &Path, _: &Path, policy: &ExclusionPolicy) -> Result<MirrorReport> {
            self.calls.set(self.calls.get() + 1);
            *self.rules.borrow_mut() = policy.rules().iter().map(ToString::to_string).collect();
            Ok(MirrorReport::default())
        }
    }

    #[test]
    fn refuse_identical_source_and_target() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join(".git"))?;
        let mut journal = Journal::open(dir.path().join("logs"), "mirror", 25)?;

        let job = MirrorJob::new(dir.path(), dir.path(), Vec::<ExclusionRule>::new(), CountingMirror::default())?;
        let err = job.run(&mut journal).unwrap_err();

        assert!(matches!(err, MirrorError::SameSourceAndTarget { .. }));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(job.engine.calls.get(), 0);

        Ok(())
    }

    #[test]
    fn refuse_target_without_git_metadata() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("work"))?;
        fs::create_dir_all(dir.path().join("gitrepo"))?;
        let mut journal = Journal::open(dir.path().join("logs"), "mirror", 25)?;

        let job = MirrorJob::new(
            dir.path().join("work"),
            dir.path().join("gitrepo"),
            Vec::<ExclusionRule>::new(),
            CountingMirror::default(),
        )?;
        let err = job.run(&mut journal).unwrap_err();

        assert!(matches!(err, MirrorError::NotARepository { .. }));
        assert_eq!(job.engine.calls.get(), 0);
        let log = fs::read_to_string(journal.path())?;
        assert!(log.contains("mirror failed with exit code 1"));

        Ok(())
    }

    #[test]
    fn refuse_source_inside_target() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("gitrepo/.git"))?;
        fs::create_dir_all(dir.path().join("gitrepo/work"))?;
        let mut journal = Journal::open(dir.path().join("logs"), "mirror", 25)?;

        let job = MirrorJob::new(
            dir.path().join("gitrepo/work"),
            dir.path().join("gitrepo"),
            Vec::<ExclusionRule>::new(),
            CountingMirror::default(),
        )?;
        let err = job.run(&mut journal).unwrap_err();

        assert!(matches!(err, MirrorError::SourceInsideTarget { .. }));
        assert_eq!(job.engine.calls.get(), 0);

        Ok(())
    }

    #[test]
    fn protected_paths_inside_source_are_excluded() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("gitrepo/.git"))?;
        fs::create_dir_all(dir.path().join("gitrepo.git"))?;
        fs::create_dir_all(dir.path().join("services/backup"))?;
        let mut journal = Journal::open(dir.path().join("logs"), "mirror", 25)?;

        let job = MirrorJob::new(
            dir.path(),
            dir.path().join("gitrepo"),
            Vec::<ExclusionRule>::new(),
            CountingMirror::default(),
        )?
        .protect([
            dir.path().join("gitrepo.git"),
            dir.path().join("services/backup"),
            dir.path().join("logs"),
            PathBuf::from("/elsewhere/install"),
        ]);
        job.run(&mut journal)?;

        assert_eq!(
            *job.engine.rules.borrow(),
            vec![
                "/gitrepo/".to_string(),
                "/gitrepo.git/".to_string(),
                "/services/backup/".to_string(),
                "/logs/".to_string(),
            ]
        );

        Ok(())
    }

    #[test]
    fn nested_target_is_excluded_from_source() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("gitrepo/.git"))?;
        let mut journal = Journal::open(dir.path().join("logs"), "mirror", 25)?;

        let job = MirrorJob::new(
            dir.path(),
            dir.path().join("gitrepo"),
            ["*.key".parse()?],
            CountingMirror::default(),
        )?;
        job.run(&mut journal)?;

        assert_eq!(job.engine.calls.get(), 1);
        assert_eq!(
            *job.engine.rules.borrow(),
            vec!["*.key".to_string(), "/gitrepo/".to_string()]
        );

        Ok(())
    }
}
