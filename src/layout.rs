// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Service directory layout.
//!
//! Backsync keeps everything it owns under one __service root__, usually the
//! home directory of a dedicated service account:
//!
//! ```text
//! <root>/
//! ├── install/             configuration and helper files
//! ├── services/backup/     runtime state, e.g., the tick lease
//! ├── logs/                per-job journals and their archives
//! ├── gitrepo/             mirror tree, a Git working tree
//! └── gitrepo.git/         local bare repository used as push target
//! ```
//!
//! The mirror tree and the bare repository can be moved elsewhere through
//! configuration. Everything else is fixed relative to the root.
//!
//! # Bootstrap
//!
//! [`Layout::init`] creates the layout once, before anything is scheduled.
//! Scheduled runs never bootstrap anything, so a missing mirror tree shows up
//! as a failed run instead of being silently recreated.

use crate::{config::BackupConfig, path::NoWayHome};

use git2::{ErrorCode, Repository, RepositoryInitOptions};
use inquire::Confirm;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Name of the default branch of freshly initialized repositories.
pub const INITIAL_BRANCH: &str = "main";

/// Fixed paths derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
    mirror_dir: PathBuf,
    bare_repo: PathBuf,
}

impl Layout {
    /// Derive layout from configuration.
    ///
    /// # Errors
    ///
    /// - Return [`LayoutError::NoWayHome`] if no root is configured, and the
    ///   home directory cannot be determined.
    pub fn from_config(config: &BackupConfig) -> Result<Self> {
        let root = match &config.service.root {
            Some(root) => root.clone(),
            None => crate::path::home_dir()?,
        };
        let mirror_dir = config
            .mirror
            .target
            .clone()
            .unwrap_or_else(|| root.join("gitrepo"));
        let bare_repo = config
            .publish
            .bare_repo
            .clone()
            .unwrap_or_else(|| root.join("gitrepo.git"));

        Ok(Self {
            root,
            mirror_dir,
            bare_repo,
        })
    }

    /// Service root.
    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    /// Directory for configuration and helper files.
    pub fn install_dir(&self) -> PathBuf {
        self.root.join("install")
    }

    /// Directory for runtime state.
    pub fn service_dir(&self) -> PathBuf {
        self.root.join("services").join("backup")
    }

    /// Directory for job journals.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Mirror tree.
    pub fn mirror_dir(&self) -> &Path {
        self.mirror_dir.as_path()
    }

    /// Local bare repository.
    pub fn bare_repo(&self) -> &Path {
        self.bare_repo.as_path()
    }

    /// Lease file guarding runs.
    pub fn lease_path(&self) -> PathBuf {
        self.service_dir().join("tick.lock")
    }

    /// Create layout, repositories, and remote wiring.
    ///
    /// Every step is skipped when its result already exists, so running this
    /// again on an initialized layout changes nothing. If the mirror tree
    /// already holds files but no Git metadata, `confirm` decides whether it
    /// gets adopted as is.
    ///
    /// # Errors
    ///
    /// - Return [`LayoutError::CreateDir`] if a directory cannot be created.
    /// - Return [`LayoutError::Declined`] if adoption of a populated mirror
    ///   tree is declined.
    /// - Return [`LayoutError::Git2`] if a repository cannot be initialized,
    ///   or the remote cannot be added.
    #[instrument(skip(self, confirm), level = "debug")]
    pub fn init(
        &self,
        remote: &str,
        confirm: impl FnOnce(&Path) -> Result<bool>,
    ) -> Result<InitReport> {
        let mut report = InitReport::default();

        for dir in [self.install_dir(), self.service_dir(), self.logs_dir()] {
            if dir.is_dir() {
                continue;
            }

            mkdirp::mkdirp(&dir).map_err(|err| LayoutError::CreateDir {
                source: err,
                path: dir.clone(),
            })?;
            info!("create directory {:?}", dir.display());
            report.created_dirs.push(dir);
        }

        if !self.bare_repo.exists() {
            init_repository(&self.bare_repo, true)?;
            info!("initialize bare repository {:?}", self.bare_repo.display());
            report.bare_repo_created = true;
        }

        let mirror = if self.mirror_dir.join(".git").exists() {
            Repository::open(&self.mirror_dir).map_err(git2_err(&self.mirror_dir))?
        } else {
            if is_populated(&self.mirror_dir) && !confirm(&self.mirror_dir)? {
                return Err(LayoutError::Declined {
                    path: self.mirror_dir.clone(),
                });
            }

            let repository = init_repository(&self.mirror_dir, false)?;
            info!("initialize mirror tree {:?}", self.mirror_dir.display());
            report.mirror_created = true;
            repository
        };

        match mirror.find_remote(remote) {
            Ok(existing) => debug!("remote {remote:?} already set to {:?}", existing.url()),
            Err(err) if err.code() == ErrorCode::NotFound => {
                let url = self.bare_repo.to_string_lossy();
                mirror
                    .remote(remote, url.as_ref())
                    .map_err(git2_err(&self.mirror_dir))?;
                info!("add remote {remote:?} pointing at {url:?}");
                report.remote_added = true;
            }
            Err(err) => return Err(git2_err(&self.mirror_dir)(err)),
        }

        Ok(report)
    }
}

/// Changes made by [`Layout::init`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InitReport {
    /// Directories created.
    pub created_dirs: Vec<PathBuf>,

    /// Bare repository was initialized.
    pub bare_repo_created: bool,

    /// Mirror tree was initialized.
    pub mirror_created: bool,

    /// Remote was added to mirror tree.
    pub remote_added: bool,
}

impl InitReport {
    /// Check if nothing had to be done.
    pub fn is_noop(&self) -> bool {
        self.created_dirs.is_empty()
            && !self.bare_repo_created
            && !self.mirror_created
            && !self.remote_added
    }
}

/// Ask user whether a populated directory may become the mirror tree.
///
/// # Errors
///
/// - Return [`LayoutError::Prompt`] if the prompt cannot be shown.
pub fn confirm_adoption(path: &Path) -> Result<bool> {
    let answer = Confirm::new(&format!(
        "{:?} is not empty and has no git metadata, use it as the mirror tree?",
        path.display()
    ))
    .with_default(false)
    .with_help_message("its contents are replaced by the next mirror run")
    .prompt()?;

    Ok(answer)
}

fn init_repository(path: &Path, bare: bool) -> Result<Repository> {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head(INITIAL_BRANCH);
    opts.bare(bare);

    Repository::init_opts(path, &opts).map_err(git2_err(path))
}

fn is_populated(path: &Path) -> bool {
    path.read_dir()
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn git2_err(path: &Path) -> impl FnOnce(git2::Error) -> LayoutError + '_ {
    move |err| LayoutError::Git2 {
        source: err,
        path: path.to_path_buf(),
    }
}

/// Layout error types.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    /// Service root cannot be determined.
    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),

    /// Directory cannot be created.
    #[error("failed to create directory {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// User declined to adopt a populated mirror tree.
    #[error("refusing to adopt populated directory {:?} as mirror tree", path.display())]
    Declined { path: PathBuf },

    /// Confirmation prompt fails.
    #[error(transparent)]
    Prompt(#[from] inquire::InquireError),

    /// Operations from libgit2 fail.
    #[error("git operation failed at {:?}", path.display())]
    Git2 {
        #[source]
        source: git2::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = LayoutError> = std::result::Result<T, E>;
