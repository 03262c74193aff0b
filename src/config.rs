// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the configuration file that backsync uses. Every
//! component receives its settings from one [`BackupConfig`] value instead of
//! relying on hard-coded paths, which keeps the jobs testable against
//! temporary directories.
//!
//! # General Layout
//!
//! The configuration is split into four tables: `service` for the service
//! account and its root directory, `mirror` for the mirror job, `publish` for
//! the commit/push job, and `schedule` for the registrar. Every path field
//! goes through shell expansion, so `~` and environment variables can be used
//! freely.

use crate::mirror::exclude::{ExclusionPolicy, ExclusionRule};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Number of rotated log archives kept per job by default.
pub const DEFAULT_RETENTION: usize = 25;

/// Top-level configuration.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct BackupConfig {
    /// Service account settings.
    #[serde(default)]
    pub service: ServiceSettings,

    /// Mirror job settings.
    pub mirror: MirrorSettings,

    /// Commit/push job settings.
    #[serde(default)]
    pub publish: PublishSettings,

    /// Schedule registrar settings.
    #[serde(default)]
    pub schedule: ScheduleSettings,
}

impl BackupConfig {
    /// Load configuration from file.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file content is malformed.
    /// - Return [`ConfigError::ShellExpansion`] if a path cannot be expanded.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_to_string(path.as_ref()).map_err(|err| ConfigError::Read {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;

        content.parse()
    }

    /// Exclusion rules to apply during mirroring.
    ///
    /// Falls back to the built-in rule listing when none are configured.
    pub fn exclusion_rules(&self) -> Vec<ExclusionRule> {
        match &self.mirror.exclude {
            Some(rules) => rules.clone(),
            None => ExclusionPolicy::default_rules(),
        }
    }
}

impl FromStr for BackupConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: BackupConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        config.service.root = config.service.root.as_deref().map(expand).transpose()?;
        config.mirror.source = expand(&config.mirror.source)?;
        config.mirror.target = config.mirror.target.as_deref().map(expand).transpose()?;
        config.publish.bare_repo = config.publish.bare_repo.as_deref().map(expand).transpose()?;
        config.publish.ssh_key = config.publish.ssh_key.as_deref().map(expand).transpose()?;

        Ok(config)
    }
}

impl Display for BackupConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Service account settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Name of service account owning the schedule table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Root directory of the service account, usually its home.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Number of rotated log archives to keep per job.
    pub retention: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            user: None,
            root: None,
            retention: DEFAULT_RETENTION,
        }
    }
}

/// Mirror job settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct MirrorSettings {
    /// Live working directory to mirror.
    pub source: PathBuf,

    /// Mirror tree to copy into. Defaults to `gitrepo` under the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,

    /// Engine performing the copy.
    #[serde(default)]
    pub backend: MirrorBackend,

    /// Exclusion rules. Defaults to the built-in listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<ExclusionRule>>,
}

/// Engine performing the mirror copy.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorBackend {
    /// Mirror in-process.
    #[default]
    Native,

    /// Mirror through the rsync binary.
    Rsync,
}

/// Commit/push job settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PublishSettings {
    /// Remote to push every local branch to.
    pub remote: String,

    /// Local bare repository used as push target by `init`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bare_repo: Option<PathBuf>,

    /// Deploy key to authenticate pushes with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<PathBuf>,

    /// Commit author name, overriding `user.name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Commit author email, overriding `user.email`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            remote: "origin".into(),
            bare_repo: None,
            ssh_key: None,
            name: None,
            email: None,
        }
    }
}

/// Schedule registrar settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Cron expression of the periodic trigger.
    pub cron: String,

    /// Identifier of the managed schedule entry.
    pub tag: String,

    /// Run jobs at reduced CPU and IO priority.
    pub low_priority: bool,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            cron: "0 * * * *".into(),
            tag: "backsync".into(),
            low_priority: true,
        }
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
