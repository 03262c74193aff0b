// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Rsync mirror engine.
//!
//! Hands the copy to `rsync -a --delete`. Exclusion rules are passed as
//! `--exclude` filters. Without `--delete-excluded`, rsync leaves excluded
//! entries in the target alone, which matches the native engine.
//!
//! Rsync and gitignore mostly agree on pattern syntax. The one difference that
//! matters is a slash in the middle of a pattern: gitignore anchors such a
//! pattern to the top-level, rsync lets it match at any depth. Those patterns
//! get an explicit leading slash before they are handed over.

use crate::{
    mirror::{exclude::ExclusionPolicy, Mirror, MirrorReport, Result},
    syscall::syscall_non_interactive,
};

use std::{ffi::OsString, path::Path};
use tracing::{debug, instrument};

/// Mirror engine backed by rsync.
#[derive(Debug, Clone)]
pub struct RsyncMirror {
    program: OsString,
}

impl RsyncMirror {
    /// Construct new rsync engine using target program.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Build full rsync argument listing.
    pub fn args(&self, source: &Path, target: &Path, policy: &ExclusionPolicy) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-a".into(),
            "--delete".into(),
            "--itemize-changes".into(),
            "--exclude=/.git".into(),
        ];
        args.extend(
            policy
                .rules()
                .iter()
                .map(|rule| OsString::from(format!("--exclude={}", rsync_pattern(rule.as_str())))),
        );
        args.push(with_trailing_slash(source));
        args.push(with_trailing_slash(target));

        args
    }
}

impl Default for RsyncMirror {
    fn default() -> Self {
        Self::new("rsync")
    }
}

impl Mirror for RsyncMirror {
    #[instrument(skip(self, policy), level = "debug")]
    fn mirror(&self, source: &Path, target: &Path, policy: &ExclusionPolicy) -> Result<MirrorReport> {
        let output = syscall_non_interactive(&self.program, self.args(source, target, policy))?;
        debug!("rsync output:\n{output}");

        Ok(parse_itemized(&output))
    }
}

fn rsync_pattern(rule: &str) -> String {
    let body = rule.trim_end_matches('/');
    if !rule.starts_with('/') && !rule.starts_with("**") && body.contains('/') {
        format!("/{rule}")
    } else {
        rule.to_string()
    }
}

fn with_trailing_slash(path: &Path) -> OsString {
    let mut path = path.as_os_str().to_os_string();
    if !path.to_string_lossy().ends_with('/') {
        path.push("/");
    }

    path
}

/// Tally itemized change lines into a report.
///
/// Lines look like `>f+++++++++ notes/todo.md` or `*deleting   old.txt`.
fn parse_itemized(output: &str) -> MirrorReport {
    let mut report = MirrorReport::default();
    for line in output.lines() {
        if line.starts_with("*deleting") {
            report.deleted += 1;
        } else if line.starts_with(">f") || line.starts_with("cd+") || line.starts_with("cL") {
            report.copied += 1;
        }
    }

    report
}
