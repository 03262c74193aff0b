// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{tree_has, BackupFixture};

use anyhow::Result;
use backsync::{
    exit_code_for,
    lease::Lease,
    publish::{PublishOutcome, COMMIT_PREFIX, COMMIT_TIMESTAMP_FORMAT},
    tick, JobError,
};
use chrono::NaiveDateTime;
use indicatif::ProgressBar;
use pretty_assertions::assert_eq;
use std::fs;

#[test]
fn tick_commits_and_pushes_changes() -> Result<()> {
    let fixture = BackupFixture::new()?;
    fixture.write_source("notes/todo.md", "buy milk")?;
    fixture.write_source("README.md", "hello")?;

    let outcome = tick::run(fixture.config(), ProgressBar::hidden())?;
    assert!(matches!(outcome.publish, PublishOutcome::Published { .. }));
    assert_eq!(fixture.pushed_commits()?, 1);

    let bare = fixture.bare()?;
    let commit = bare.find_reference("refs/heads/main")?.peel_to_commit()?;
    let message = commit.message().unwrap_or_default();
    let stamp = message
        .strip_prefix(COMMIT_PREFIX)
        .expect("commit message carries backup prefix");
    assert!(NaiveDateTime::parse_from_str(stamp.trim_end(), COMMIT_TIMESTAMP_FORMAT).is_ok());
    assert!(tree_has(&commit, "notes/todo.md")?);
    assert!(tree_has(&commit, "README.md")?);

    let log = fs::read_to_string(fixture.journal("commit"))?;
    assert!(log.contains("committed"));

    Ok(())
}

#[test]
fn unchanged_mirror_tree_makes_no_commit() -> Result<()> {
    let fixture = BackupFixture::new()?;
    fixture.write_source("notes/todo.md", "buy milk")?;

    tick::run(fixture.config(), ProgressBar::hidden())?;
    let outcome = tick::run(fixture.config(), ProgressBar::hidden())?;

    assert_eq!(outcome.publish, PublishOutcome::NothingToCommit);
    assert_eq!(fixture.pushed_commits()?, 1);
    let log = fs::read_to_string(fixture.journal("commit"))?;
    assert!(log.contains("nothing to commit"));

    Ok(())
}

#[test]
fn excluded_entries_never_reach_mirror_or_remote() -> Result<()> {
    let fixture = BackupFixture::new()?;
    fixture.write_source("notes.md", "keep")?;
    fixture.write_source(".ssh/id_ed25519", "private key")?;
    fixture.write_source("deploy/server.key", "secret")?;
    fixture.write_source(".env", "TOKEN=abc")?;
    fixture.write_source("app/node_modules/pkg/index.js", "module")?;
    fixture.write_source("app/__pycache__/mod.pyc", "bytecode")?;

    tick::run(fixture.config(), ProgressBar::hidden())?;

    let bare = fixture.bare()?;
    let commit = bare.find_reference("refs/heads/main")?.peel_to_commit()?;
    assert!(tree_has(&commit, "notes.md")?);
    assert_eq!(
        fs::read(fixture.mirror().join("notes.md"))?,
        fs::read(fixture.source().join("notes.md"))?
    );
    for excluded in [
        ".ssh/id_ed25519",
        "deploy/server.key",
        ".env",
        "app/node_modules",
        "app/__pycache__",
    ] {
        assert!(!fixture.mirror().join(excluded).exists(), "{excluded} mirrored");
        assert!(!tree_has(&commit, excluded)?, "{excluded} committed");
    }

    Ok(())
}

#[test]
fn configured_rules_replace_defaults() -> Result<()> {
    let fixture = BackupFixture::with_extra(r#"exclude = ["*.tmp", "/scratch/"]"#)?;
    fixture.write_source("draft.tmp", "draft")?;
    fixture.write_source("scratch/notes.md", "scratch")?;
    fixture.write_source("deep/scratch/notes.md", "kept")?;
    fixture.write_source("server.key", "no longer excluded")?;

    tick::run_mirror(fixture.config(), ProgressBar::hidden())?;

    assert!(!fixture.mirror().join("draft.tmp").exists());
    assert!(!fixture.mirror().join("scratch").exists());
    assert!(fixture.mirror().join("deep/scratch/notes.md").exists());
    assert!(fixture.mirror().join("server.key").exists());

    Ok(())
}

#[test]
fn deletions_propagate_to_remote() -> Result<()> {
    let fixture = BackupFixture::new()?;
    fixture.write_source("keep.md", "keep")?;
    fixture.write_source("old/gone.md", "gone")?;
    tick::run(fixture.config(), ProgressBar::hidden())?;

    fs::remove_dir_all(fixture.source().join("old"))?;
    let outcome = tick::run(fixture.config(), ProgressBar::hidden())?;

    assert_eq!(outcome.mirror.deleted, 1);
    assert!(!fixture.mirror().join("old").exists());
    let bare = fixture.bare()?;
    let commit = bare.find_reference("refs/heads/main")?.peel_to_commit()?;
    assert!(!tree_has(&commit, "old/gone.md")?);
    assert!(tree_has(&commit, "keep.md")?);
    assert_eq!(fixture.pushed_commits()?, 2);

    Ok(())
}

#[test]
fn service_root_as_source_settles_after_one_commit() -> Result<()> {
    let fixture = BackupFixture::new()?;
    let mut config = fixture.config().clone();
    config.mirror.source = fixture.layout().root().to_path_buf();
    fs::write(fixture.layout().root().join("notes.md"), "data")?;

    let first = tick::run(&config, ProgressBar::hidden())?;
    let second = tick::run(&config, ProgressBar::hidden())?;

    assert!(matches!(first.publish, PublishOutcome::Published { .. }));
    assert_eq!(second.publish, PublishOutcome::NothingToCommit);
    assert_eq!(fixture.pushed_commits()?, 1);
    assert!(fixture.mirror().join("notes.md").exists());
    for owned in ["gitrepo.git", "services/backup", "logs", "install", "gitrepo"] {
        assert!(!fixture.mirror().join(owned).exists(), "{owned} mirrored");
    }

    Ok(())
}

#[test]
fn same_source_and_target_is_refused() -> Result<()> {
    let fixture = BackupFixture::new()?;
    fs::write(fixture.mirror().join("precious.txt"), "do not touch")?;
    let mut config = fixture.config().clone();
    config.mirror.source = fixture.mirror().to_path_buf();

    let err = tick::run(&config, ProgressBar::hidden()).unwrap_err();

    assert!(matches!(err, JobError::Mirror(_)));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(
        fs::read_to_string(fixture.mirror().join("precious.txt"))?,
        "do not touch"
    );
    assert!(!fixture.journal("commit").exists());
    assert_eq!(fixture.pushed_commits()?, 0);

    Ok(())
}

#[test]
fn mirror_failure_prevents_commit() -> Result<()> {
    let fixture = BackupFixture::new()?;
    fixture.write_source("notes.md", "data")?;
    fs::remove_dir_all(fixture.mirror().join(".git"))?;

    let err = tick::run(fixture.config(), ProgressBar::hidden()).unwrap_err();

    assert_eq!(exit_code_for(&anyhow::Error::new(err)), 1);
    let log = fs::read_to_string(fixture.journal("mirror"))?;
    assert!(log.contains("mirror failed with exit code 1"));
    assert!(!fixture.journal("commit").exists());
    assert!(!fixture.mirror().join("notes.md").exists());
    assert_eq!(fixture.pushed_commits()?, 0);

    Ok(())
}

#[test]
fn held_lease_refuses_concurrent_tick() -> Result<()> {
    let fixture = BackupFixture::new()?;
    fixture.write_source("notes.md", "data")?;
    let held = Lease::acquire(fixture.layout().lease_path())?;

    let err = tick::run(fixture.config(), ProgressBar::hidden()).unwrap_err();
    assert_eq!(err.exit_code(), 75);
    assert!(!fixture.journal("mirror").exists());
    assert!(!fixture.mirror().join("notes.md").exists());

    drop(held);
    tick::run(fixture.config(), ProgressBar::hidden())?;
    assert!(fixture.mirror().join("notes.md").exists());

    Ok(())
}

#[test]
fn journals_stay_bounded_after_many_runs() -> Result<()> {
    let fixture = BackupFixture::new()?;
    fixture.write_source("notes.md", "data")?;

    for _ in 0..30 {
        tick::run(fixture.config(), ProgressBar::hidden())?;
    }

    for job in ["mirror", "commit"] {
        let archives = fs::read_dir(fixture.layout().logs_dir())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(&format!("{job}.log.")) && name.ends_with(".zst"))
            .count();
        assert_eq!(archives, 25, "{job} archives");
        assert!(fixture.journal(job).exists());
    }

    Ok(())
}
