// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Commit/push job.
//!
//! The __commit/push job__ turns whatever the mirror job left in the mirror
//! tree into exactly one commit, and publishes every local branch to a remote.
//! When the mirror tree matches its last commit there is nothing to do, which
//! is the common case: no commit is made, and no push is attempted.
//!
//! # Authentication
//!
//! Pushes run unattended, so credentials are never prompted for. The
//! authenticator tries the ssh agent, the configured deploy key, and the
//! default keys in `~/.ssh`. A remote that still refuses the push fails the
//! job, and the next tick tries again.

use crate::{
    config::PublishSettings,
    journal::{Journal, JournalError},
};

use auth_git2::GitAuthenticator;
use chrono::Local;
use git2::{
    BranchType, Commit, ErrorCode, IndexAddOption, Oid, PushOptions, RemoteCallbacks,
    Repository, Signature,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Prefix of every backup commit message.
pub const COMMIT_PREFIX: &str = "Automated backup: ";

/// Timestamp layout used in commit messages.
pub const COMMIT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Outcome of a commit/push run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Mirror tree matches its last commit.
    NothingToCommit,

    /// New commit created and branches pushed.
    Published {
        /// Id of the new commit.
        commit: Oid,

        /// Branches pushed to the remote.
        branches: Vec<String>,
    },
}

/// Commit and push pending changes of a mirror tree.
pub struct Publisher {
    repository: Repository,
    settings: PublishSettings,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Publisher")
            .field("repository", &self.repository.path())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Publisher {
    /// Open mirror tree at target path.
    ///
    /// # Errors
    ///
    /// - Return [`PublishError::NotARepository`] if path is missing, has no
    ///   Git metadata, or is a bare repository.
    #[instrument(skip(path, settings), level = "debug")]
    pub fn open(path: impl AsRef<Path>, settings: PublishSettings) -> Result<Self> {
        let path = path.as_ref();
        let not_a_repo = || PublishError::NotARepository {
            path: path.to_path_buf(),
        };

        if !path.join(".git").exists() {
            return Err(not_a_repo());
        }

        let repository = Repository::open(path).map_err(|_| not_a_repo())?;
        if repository.is_bare() {
            return Err(not_a_repo());
        }
        debug!("open mirror tree {:?}", path.display());

        Ok(Self {
            repository,
            settings,
        })
    }

    /// Stage every change in the working tree, deletions included.
    ///
    /// Returns the tree id of the staged index, or [`None`] when the staged
    /// index does not differ from the last commit.
    ///
    /// # Errors
    ///
    /// - Return [`PublishError::Stage`] if the index cannot be updated.
    pub fn stage_all(&self) -> Result<Option<Oid>> {
        let stage = |err: git2::Error| PublishError::Stage(err);

        let mut index = self.repository.index().map_err(stage)?;
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .map_err(stage)?;
        index.update_all(["*"].iter(), None).map_err(stage)?;
        index.write().map_err(stage)?;
        let tree = index.write_tree().map_err(stage)?;

        let changed = match self.head_commit().map_err(stage)? {
            Some(parent) => parent.tree_id() != tree,
            None => !index.is_empty(),
        };

        Ok(changed.then_some(tree))
    }

    /// Run commit/push job, recording progress into journal.
    ///
    /// # Errors
    ///
    /// - Return [`PublishError::Stage`] if staging fails.
    /// - Return [`PublishError::Commit`] if commit cannot be created.
    /// - Return [`PublishError::Push`] if push transport fails.
    /// - Return [`PublishError::Rejected`] if the remote refuses a branch.
    /// - Return [`PublishError::Journal`] if journal cannot be written.
    #[instrument(skip(self, journal), level = "debug")]
    pub fn run(&self, journal: &mut Journal) -> Result<PublishOutcome> {
        journal.record(format!("commit started: {}", self.workdir().display()))?;

        let result = self.stage_all().and_then(|tree| match tree {
            None => Ok(PublishOutcome::NothingToCommit),
            Some(tree) => {
                let commit = self.commit(tree)?;
                let branches = self.push_all()?;
                Ok(PublishOutcome::Published { commit, branches })
            }
        });

        match &result {
            Ok(PublishOutcome::NothingToCommit) => journal.record("nothing to commit")?,
            Ok(PublishOutcome::Published { commit, branches }) => journal.record(format!(
                "committed {commit} and pushed {} to {}",
                branches.join(", "),
                self.settings.remote
            ))?,
            Err(err) => journal.record(format!(
                "commit failed with exit code {}: {err}",
                err.exit_code()
            ))?,
        }

        result
    }

    fn workdir(&self) -> &Path {
        self.repository
            .workdir()
            .unwrap_or_else(|| self.repository.path())
    }

    fn head_commit(&self) -> std::result::Result<Option<Commit<'_>>, git2::Error> {
        match self.repository.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn signature(&self) -> std::result::Result<Signature<'static>, git2::Error> {
        match (&self.settings.name, &self.settings.email) {
            (Some(name), Some(email)) => Signature::now(name, email),
            _ => self.repository.signature(),
        }
    }

    fn commit(&self, tree: Oid) -> Result<Oid> {
        let commit_err = |err: git2::Error| PublishError::Commit(err);

        let signature = self.signature().map_err(commit_err)?;
        let tree = self.repository.find_tree(tree).map_err(commit_err)?;
        let parent = self.head_commit().map_err(commit_err)?;
        let parents = parent.iter().collect::<Vec<_>>();
        let message = format!(
            "{COMMIT_PREFIX}{}",
            Local::now().format(COMMIT_TIMESTAMP_FORMAT)
        );

        let oid = self
            .repository
            .commit(Some("HEAD"), &signature, &signature, &message, &tree, &parents)
            .map_err(commit_err)?;
        info!("created commit {oid}: {message}");

        Ok(oid)
    }

    fn local_branches(&self) -> std::result::Result<Vec<String>, git2::Error> {
        let mut names = Vec::new();
        for branch in self.repository.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            if let Some(name) = branch.name()? {
                names.push(name.to_string());
            }
        }
        names.sort();

        Ok(names)
    }

    /// Push every local branch to the configured remote.
    fn push_all(&self) -> Result<Vec<String>> {
        let push_err = |err: git2::Error| PublishError::Push(err);

        let branches = self.local_branches().map_err(push_err)?;
        let refspecs = branches
            .iter()
            .map(|name| format!("refs/heads/{name}:refs/heads/{name}"))
            .collect::<Vec<_>>();

        let mut remote = self
            .repository
            .find_remote(&self.settings.remote)
            .map_err(push_err)?;
        let config = self.repository.config().map_err(push_err)?;
        let authenticator = self.authenticator();

        let mut rejected = Vec::new();
        {
            let mut callbacks = RemoteCallbacks::new();
            callbacks.credentials(authenticator.credentials(&config));
            callbacks.push_update_reference(|refname, status| {
                if let Some(status) = status {
                    rejected.push(format!("{refname}: {status}"));
                }
                Ok(())
            });

            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);
            remote
                .push(refspecs.as_slice(), Some(&mut options))
                .map_err(push_err)?;
        }

        if !rejected.is_empty() {
            return Err(PublishError::Rejected(rejected));
        }

        Ok(branches)
    }

    fn authenticator(&self) -> GitAuthenticator {
        let authenticator = GitAuthenticator::default()
            .try_password_prompt(0)
            .prompt_ssh_key_password(false);

        match &self.settings.ssh_key {
            Some(key) => authenticator.add_ssh_key_from_file(key.clone(), None::<String>),
            None => authenticator,
        }
    }
}

/// Commit/push job error types.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Path is missing or is not a Git working tree.
    #[error("{:?} is not a git working tree", path.display())]
    NotARepository { path: PathBuf },

    /// Changes cannot be staged.
    #[error("failed to stage changes")]
    Stage(#[source] git2::Error),

    /// Commit cannot be created, e.g., identity is not configured.
    #[error("failed to create commit")]
    Commit(#[source] git2::Error),

    /// Push transport fails, e.g., authentication or network trouble.
    #[error("failed to push")]
    Push(#[source] git2::Error),

    /// Remote refused one or more branches.
    #[error("remote rejected {}", .0.join(", "))]
    Rejected(Vec<String>),

    /// Journal cannot be written.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

impl PublishError {
    /// Process exit code for this failure.
    ///
    /// Follows git: fatal errors exit 128, a rejected push exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Stage(_) | Self::Commit(_) | Self::Push(_) => 128,
            Self::NotARepository { .. } | Self::Rejected(_) | Self::Journal(_) => 1,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = PublishError> = std::result::Result<T, E>;
