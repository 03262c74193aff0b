// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Exclusion rule handling.
//!
//! Utilities to decide which entries of a source tree must never reach the
//! mirror tree.
//!
//! # Rule Syntax
//!
//! An __exclusion rule__ uses gitignore pattern syntax. A leading slash
//! anchors the rule to the top-level of the source tree, a trailing slash
//! limits the rule to directories, and `*` or `**` act as wildcards. A rule
//! without a slash in the middle matches at any depth. Negated rules are not
//! supported, because the rsync backend and the native backend would disagree
//! on their meaning.
//!
//! # Semantics
//!
//! Rules are evaluated against paths relative to the top-level of the source
//! tree. An entry that matches a rule is left alone in both directions: it is
//! never copied into the mirror tree, and a copy of it that already lives in
//! the mirror tree is never deleted. The mirror tree's own Git metadata relies
//! on the latter.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};

/// Built-in exclusion rules.
///
/// Credentials, secrets, caches, VCS metadata, logs, databases, editor and
/// session state, dependency trees, and trash directories.
const DEFAULT_RULES: &[&str] = &[
    // Credentials.
    ".ssh/",
    ".gnupg/",
    "*.pem",
    "*.key",
    "id_rsa*",
    "id_ed25519*",
    // Secrets.
    ".env",
    ".env.*",
    "*.secret",
    ".netrc",
    ".git-credentials",
    // Caches.
    ".cache/",
    "__pycache__/",
    // VCS metadata.
    ".git/",
    ".svn/",
    ".hg/",
    // Logs.
    "*.log",
    "logs/",
    // Databases.
    "*.db",
    "*.sqlite",
    "*.sqlite3",
    // Editor and session state.
    ".vscode/",
    ".idea/",
    "*.swp",
    ".viminfo",
    ".bash_history",
    ".lesshst",
    // Dependency trees.
    "node_modules/",
    "target/",
    ".venv/",
    // Trash.
    ".Trash/",
    ".local/share/Trash/",
];

/// A single exclusion rule.
///
/// # Invariant
///
/// - Rule is never empty, never a comment, and never negated.
/// - Rule is valid gitignore glob syntax.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExclusionRule(String);

impl ExclusionRule {
    /// Treat rule as string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Construct anchored rule that excludes one directory relative to the
    /// top-level of the source tree.
    pub fn anchored_dir(relative: impl AsRef<Path>) -> Result<Self> {
        let relative = relative.as_ref().to_string_lossy();
        format!("/{}/", relative.trim_matches('/')).parse()
    }
}

impl FromStr for ExclusionRule {
    type Err = ExcludeError;

    fn from_str(rule: &str) -> Result<Self, Self::Err> {
        let trimmed = rule.trim();
        if trimmed.is_empty() || trimmed == "/" || trimmed.starts_with('#') {
            return Err(ExcludeError::Empty(rule.into()));
        }

        if trimmed.starts_with('!') {
            return Err(ExcludeError::Negated(rule.into()));
        }

        GitignoreBuilder::new("/")
            .add_line(None, trimmed)
            .map_err(|err| ExcludeError::InvalidRule {
                source: err,
                rule: rule.into(),
            })?;

        Ok(Self(trimmed.into()))
    }
}

impl TryFrom<String> for ExclusionRule {
    type Error = ExcludeError;

    fn try_from(rule: String) -> Result<Self, Self::Error> {
        rule.parse()
    }
}

impl From<ExclusionRule> for String {
    fn from(rule: ExclusionRule) -> Self {
        rule.0
    }
}

impl Display for ExclusionRule {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Compiled, ordered set of exclusion rules.
#[derive(Debug, Clone)]
pub struct ExclusionPolicy {
    rules: Vec<ExclusionRule>,
    matcher: Gitignore,
}

impl ExclusionPolicy {
    /// Compile a listing of exclusion rules.
    ///
    /// Duplicate rules are dropped, first occurrence wins.
    ///
    /// # Errors
    ///
    /// - Return [`ExcludeError::Compile`] if the matcher cannot be built.
    pub fn new(rules: impl IntoIterator<Item = ExclusionRule>) -> Result<Self> {
        let mut unique: Vec<ExclusionRule> = Vec::new();
        for rule in rules {
            if !unique.contains(&rule) {
                unique.push(rule);
            }
        }

        let mut builder = GitignoreBuilder::new("/");
        for rule in &unique {
            builder
                .add_line(None, rule.as_str())
                .map_err(|err| ExcludeError::InvalidRule {
                    source: err,
                    rule: rule.to_string(),
                })?;
        }
        let matcher = builder.build().map_err(ExcludeError::Compile)?;

        Ok(Self {
            rules: unique,
            matcher,
        })
    }

    /// Built-in rule listing.
    pub fn default_rules() -> Vec<ExclusionRule> {
        DEFAULT_RULES
            .iter()
            .map(|rule| ExclusionRule(rule.to_string()))
            .collect()
    }

    /// Compile the built-in rule listing.
    ///
    /// # Errors
    ///
    /// - Return [`ExcludeError::Compile`] if the matcher cannot be built.
    pub fn defaults() -> Result<Self> {
        Self::new(Self::default_rules())
    }

    /// Extend policy with one more rule.
    ///
    /// # Errors
    ///
    /// - Return [`ExcludeError::Compile`] if the matcher cannot be rebuilt.
    pub fn with_rule(self, rule: ExclusionRule) -> Result<Self> {
        let mut rules = self.rules;
        rules.push(rule);
        Self::new(rules)
    }

    /// Current rules in evaluation order.
    pub fn rules(&self) -> &[ExclusionRule] {
        self.rules.as_slice()
    }

    /// Check if entry relative to the top-level of the source tree is
    /// excluded.
    ///
    /// An entry is excluded when it, or any of its parent directories, match
    /// a rule.
    pub fn is_excluded(&self, relative: impl AsRef<Path>, is_dir: bool) -> bool {
        let relative = relative.as_ref();
        if relative.as_os_str().is_empty() || relative.has_root() {
            return false;
        }

        self.matcher
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }
}

/// Relative path of `target` inside `source`, if it lives there.
pub(crate) fn nested_path(source: &Path, target: &Path) -> Option<PathBuf> {
    target
        .strip_prefix(source)
        .ok()
        .filter(|relative| !relative.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

/// Exclusion rule error types.
#[derive(Debug, thiserror::Error)]
pub enum ExcludeError {
    /// Rule has no pattern.
    #[error("exclusion rule {0:?} is empty")]
    Empty(String),

    /// Rule tries to re-include something.
    #[error("exclusion rule {0:?} is negated, negation is not supported")]
    Negated(String),

    /// Rule is not valid glob syntax.
    #[error("exclusion rule {rule:?} is invalid")]
    InvalidRule {
        #[source]
        source: ignore::Error,
        rule: String,
    },

    /// Rule listing cannot be compiled.
    #[error("failed to compile exclusion rules")]
    Compile(#[source] ignore::Error),
}

/// Friendly result alias :3
pub type Result<T, E = ExcludeError> = std::result::Result<T, E>;
