// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! In-process mirror engine.
//!
//! Walks the source tree once. For every directory it first copies what the
//! source has, then deletes what only the target has. Exclusion rules are
//! consulted in both phases, so excluded entries are never touched. Decisions
//! are flat: an entry is judged by its relative path and type, never by what
//! it contains.

use crate::mirror::{exclude::ExclusionPolicy, Mirror, MirrorError, MirrorReport, Result};

use indicatif::{ProgressBar, ProgressStyle};
use std::{
    collections::HashSet,
    ffi::OsString,
    fs::{self, File, Metadata},
    io::{self, Read},
    path::Path,
    time::Duration,
};
use tracing::{debug, instrument, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// Mirror engine that copies entries itself.
#[derive(Debug, Clone)]
pub struct NativeMirror {
    bar: ProgressBar,
}

impl NativeMirror {
    /// Construct new native engine reporting progress through a spinner.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }

    /// Mirror one directory level, then recurse.
    ///
    /// Failures are collected instead of returned, so one bad entry does not
    /// stop the rest of the pass. A directory that cannot be listed in the
    /// source is never cleaned up in the target.
    fn sync_dir(
        &self,
        source: &Path,
        target: &Path,
        relative: &Path,
        policy: &ExclusionPolicy,
        report: &mut MirrorReport,
        failures: &mut Vec<MirrorError>,
    ) {
        let at_root = relative.as_os_str().is_empty();
        let mut kept: HashSet<OsString> = HashSet::new();

        let entries = match sorted_entries(&source.join(relative)) {
            Ok(entries) => entries,
            Err(err) => return fail(failures, err),
        };

        for (name, meta) in entries {
            let entry = relative.join(&name);
            // INVARIANT: The mirror tree's own Git metadata is never replaced
            // nor deleted.
            if at_root && name == ".git" {
                continue;
            }

            if policy.is_excluded(&entry, meta.is_dir()) {
                debug!("exclude {:?}", entry.display());
                continue;
            }

            let from = source.join(&entry);
            let to = target.join(&entry);
            self.bar.set_message(entry.display().to_string());
            self.bar.inc(1);

            if meta.is_dir() {
                kept.insert(name);
                match ensure_dir(&to) {
                    Ok(created) => {
                        if created {
                            report.copied += 1;
                        }
                        self.sync_dir(source, target, &entry, policy, report, failures);
                    }
                    Err(err) => fail(failures, err),
                }
            } else if meta.file_type().is_symlink() {
                kept.insert(name);
                if let Err(err) = sync_link(&from, &to, report) {
                    fail(failures, err);
                }
            } else if meta.is_file() {
                kept.insert(name);
                if let Err(err) = sync_file(&from, &meta, &to, report) {
                    fail(failures, err);
                }
            } else {
                warn!("skip special file {:?}", from.display());
            }
        }

        let stale = match sorted_entries(&target.join(relative)) {
            Ok(entries) => entries,
            Err(err) => return fail(failures, err),
        };

        for (name, meta) in stale {
            if kept.contains(&name) || (at_root && name == ".git") {
                continue;
            }

            let entry = relative.join(&name);
            if policy.is_excluded(&entry, meta.is_dir()) {
                continue;
            }

            let path = target.join(&entry);
            debug!("delete {:?}", path.display());
            match remove_entry(&path, &meta) {
                Ok(()) => report.deleted += 1,
                Err(err) => fail(failures, err),
            }
        }
    }
}

impl Default for NativeMirror {
    fn default() -> Self {
        Self::new(ProgressBar::hidden())
    }
}

impl Mirror for NativeMirror {
    #[instrument(skip(self, policy), level = "debug")]
    fn mirror(&self, source: &Path, target: &Path, policy: &ExclusionPolicy) -> Result<MirrorReport> {
        let style = ProgressStyle::with_template("{spinner:.green} {pos:>7} entries  {wide_msg}")?;
        self.bar.set_style(style);
        self.bar.enable_steady_tick(Duration::from_millis(100));

        let mut report = MirrorReport::default();
        let mut failures = Vec::new();
        self.sync_dir(source, target, Path::new(""), policy, &mut report, &mut failures);
        self.bar.finish_and_clear();

        let failed = failures.len();
        match failures.into_iter().next() {
            Some(first) => Err(MirrorError::Incomplete {
                failed,
                source: Box::new(first),
            }),
            None => Ok(report),
        }
    }
}

fn fail(failures: &mut Vec<MirrorError>, err: MirrorError) {
    warn!("{err:?}");
    failures.push(err);
}

fn copy_err(path: &Path) -> impl FnOnce(io::Error) -> MirrorError + '_ {
    move |err| MirrorError::Copy {
        source: err,
        path: path.to_path_buf(),
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<(OsString, Metadata)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(copy_err(dir))? {
        let entry = entry.map_err(copy_err(dir))?;
        let path = entry.path();
        let meta = path.symlink_metadata().map_err(copy_err(&path))?;
        entries.push((entry.file_name(), meta));
    }
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    Ok(entries)
}

/// Make sure a directory exists at target path. Returns whether one had to be
/// created.
fn ensure_dir(path: &Path) -> Result<bool> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => return Ok(false),
        Ok(meta) => remove_entry(path, &meta)?,
        Err(_) => {}
    }
    fs::create_dir(path).map_err(copy_err(path))?;

    Ok(true)
}

fn sync_file(from: &Path, meta: &Metadata, to: &Path, report: &mut MirrorReport) -> Result<()> {
    if let Ok(existing) = to.symlink_metadata() {
        if existing.is_file() && existing.len() == meta.len() && same_content(from, to)? {
            if existing.permissions() != meta.permissions() {
                fs::set_permissions(to, meta.permissions()).map_err(copy_err(to))?;
            }
            report.unchanged += 1;
            return Ok(());
        }

        remove_entry(to, &existing)?;
    }

    fs::copy(from, to).map_err(copy_err(from))?;
    report.copied += 1;

    Ok(())
}

#[cfg(unix)]
fn sync_link(from: &Path, to: &Path, report: &mut MirrorReport) -> Result<()> {
    let link = fs::read_link(from).map_err(copy_err(from))?;
    if let Ok(existing) = to.symlink_metadata() {
        if existing.file_type().is_symlink() && fs::read_link(to).ok().as_ref() == Some(&link) {
            report.unchanged += 1;
            return Ok(());
        }

        remove_entry(to, &existing)?;
    }

    std::os::unix::fs::symlink(&link, to).map_err(copy_err(to))?;
    report.copied += 1;

    Ok(())
}

#[cfg(not(unix))]
fn sync_link(from: &Path, _to: &Path, _report: &mut MirrorReport) -> Result<()> {
    warn!("skip symbolic link {:?}", from.display());
    Ok(())
}

fn remove_entry(path: &Path, meta: &Metadata) -> Result<()> {
    if meta.is_dir() {
        fs::remove_dir_all(path).map_err(copy_err(path))
    } else {
        fs::remove_file(path).map_err(copy_err(path))
    }
}

fn same_content(a: &Path, b: &Path) -> Result<bool> {
    let mut left = File::open(a).map_err(copy_err(a))?;
    let mut right = File::open(b).map_err(copy_err(b))?;
    let mut left_buf = vec![0u8; CHUNK_SIZE];
    let mut right_buf = vec![0u8; CHUNK_SIZE];

    loop {
        let left_len = fill(&mut left, &mut left_buf).map_err(copy_err(a))?;
        let right_len = fill(&mut right, &mut right_buf).map_err(copy_err(b))?;
        if left_len != right_len || left_buf[..left_len] != right_buf[..right_len] {
            return Ok(false);
        }

        if left_len == 0 {
            return Ok(true);
        }
    }
}

/// Read until buffer is full or input is exhausted.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::exclude::ExclusionRule;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn write(root: &Path, relative: &str, contents: &str) -> io::Result<()> {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)
    }

    #[test]
    fn copy_new_entries_and_skip_excluded() -> anyhow::Result<()> {
        let source = tempfile::tempdir()?;
        let target = tempfile::tempdir()?;
        write(source.path(), "notes/todo.md", "buy milk")?;
        write(source.path(), "deploy/server.key", "secret")?;
        write(source.path(), "app/node_modules/pkg/index.js", "module")?;

        let policy = ExclusionPolicy::defaults()?;
        let report = NativeMirror::default().mirror(source.path(), target.path(), &policy)?;

        assert_eq!(fs::read_to_string(target.path().join("notes/todo.md"))?, "buy milk");
        assert!(!target.path().join("deploy/server.key").exists());
        assert!(!target.path().join("app/node_modules").exists());
        assert_eq!(report.deleted, 0);

        Ok(())
    }

    #[test]
    fn delete_stale_entries_but_keep_excluded_and_git() -> anyhow::Result<()> {
        let source = tempfile::tempdir()?;
        let target = tempfile::tempdir()?;
        write(source.path(), "keep.txt", "keep")?;
        write(target.path(), "keep.txt", "old")?;
        write(target.path(), "stale/file.txt", "stale")?;
        write(target.path(), "cache.log", "excluded")?;
        write(target.path(), ".git/HEAD", "ref: refs/heads/main")?;

        let policy = ExclusionPolicy::defaults()?;
        let report = NativeMirror::default().mirror(source.path(), target.path(), &policy)?;

        assert_eq!(fs::read_to_string(target.path().join("keep.txt"))?, "keep");
        assert!(!target.path().join("stale").exists());
        assert!(target.path().join("cache.log").exists());
        assert!(target.path().join(".git/HEAD").exists());
        assert_eq!(report.copied, 1);
        assert_eq!(report.deleted, 1);

        Ok(())
    }

    #[test]
    fn unchanged_entries_are_not_copied() -> anyhow::Result<()> {
        let source = tempfile::tempdir()?;
        let target = tempfile::tempdir()?;
        write(source.path(), "a/b.txt", "same")?;

        let policy = ExclusionPolicy::new(Vec::<ExclusionRule>::new())?;
        let engine = NativeMirror::default();
        engine.mirror(source.path(), target.path(), &policy)?;
        let report = engine.mirror(source.path(), target.path(), &policy)?;

        assert_eq!(report.copied, 0);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.unchanged, 1);

        Ok(())
    }

    #[test]
    fn source_git_metadata_never_replaces_target_metadata() -> anyhow::Result<()> {
        let source = tempfile::tempdir()?;
        let target = tempfile::tempdir()?;
        write(source.path(), ".git/HEAD", "ref: refs/heads/other")?;
        write(source.path(), "file.txt", "data")?;
        write(target.path(), ".git/HEAD", "ref: refs/heads/main")?;

        let policy = ExclusionPolicy::new(Vec::<ExclusionRule>::new())?;
        NativeMirror::default().mirror(source.path(), target.path(), &policy)?;

        assert_eq!(
            fs::read_to_string(target.path().join(".git/HEAD"))?,
            "ref: refs/heads/main"
        );
        assert!(target.path().join("file.txt").exists());

        Ok(())
    }

    #[test]
    fn type_change_replaces_entry() -> anyhow::Result<()> {
        let source = tempfile::tempdir()?;
        let target = tempfile::tempdir()?;
        write(source.path(), "thing/inner.txt", "now a directory")?;
        write(target.path(), "thing", "was a file")?;

        let policy = ExclusionPolicy::new(Vec::<ExclusionRule>::new())?;
        NativeMirror::default().mirror(source.path(), target.path(), &policy)?;

        assert!(target.path().join("thing").is_dir());
        assert_eq!(
            fs::read_to_string(target.path().join("thing/inner.txt"))?,
            "now a directory"
        );

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_entry_does_not_stop_the_pass() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let source = tempfile::tempdir()?;
        let target = tempfile::tempdir()?;
        write(source.path(), "before.txt", "before")?;
        write(source.path(), "locked/secret.txt", "hidden")?;
        write(source.path(), "zebra/after.txt", "after")?;
        write(target.path(), "locked/old.txt", "old")?;
        write(target.path(), "stale.txt", "stale")?;

        let locked = source.path().join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000))?;
        if fs::read_dir(&locked).is_ok() {
            // Privileged user reads through any mode, nothing to observe.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755))?;
            return Ok(());
        }

        let policy = ExclusionPolicy::new(Vec::<ExclusionRule>::new())?;
        let result = NativeMirror::default().mirror(source.path(), target.path(), &policy);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755))?;

        let err = result.unwrap_err();
        assert!(matches!(err, MirrorError::Incomplete { failed: 1, .. }));
        assert_eq!(err.exit_code(), 23);
        assert_eq!(fs::read_to_string(target.path().join("before.txt"))?, "before");
        assert_eq!(fs::read_to_string(target.path().join("zebra/after.txt"))?, "after");
        assert!(!target.path().join("stale.txt").exists());
        assert!(target.path().join("locked/old.txt").exists());

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recreated_not_followed() -> anyhow::Result<()> {
        let source = tempfile::tempdir()?;
        let target = tempfile::tempdir()?;
        write(source.path(), "real.txt", "data")?;
        std::os::unix::fs::symlink("real.txt", source.path().join("alias.txt"))?;

        let policy = ExclusionPolicy::new(Vec::<ExclusionRule>::new())?;
        NativeMirror::default().mirror(source.path(), target.path(), &policy)?;

        let alias = target.path().join("alias.txt");
        assert!(alias.symlink_metadata()?.file_type().is_symlink());
        assert_eq!(fs::read_link(alias)?, PathBuf::from("real.txt"));

        Ok(())
    }
}
