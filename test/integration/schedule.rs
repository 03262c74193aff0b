// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::BackupFixture;

use anyhow::Result;
use backsync::schedule::{
    CrontabStore, FileCrontab, RegisterOutcome, Registrar, ScheduleEntry, ScheduleTable,
};
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::fs;

#[test]
fn registration_is_idempotent() -> Result<()> {
    let fixture = BackupFixture::new()?;
    let table = fixture.layout().install_dir().join("crontab");
    fs::write(
        &table,
        indoc! {"
            MAILTO=root
            30 2 * * * /usr/bin/updatedb
        "},
    )?;

    let registrar = Registrar::new(FileCrontab::new(&table));
    let entry = ScheduleEntry::for_tick(
        &fixture.config().schedule,
        "/usr/local/bin/backsync",
        fixture.layout().install_dir().join("backsync.toml"),
    )?;

    assert_eq!(registrar.register(&entry)?, RegisterOutcome::Installed);
    let first = fs::read_to_string(&table)?;
    assert_eq!(registrar.register(&entry)?, RegisterOutcome::Unchanged);
    assert_eq!(fs::read_to_string(&table)?, first);

    let parsed = ScheduleTable::from(registrar.store().load()?);
    assert_eq!(parsed.count_line(entry.line()), 1);
    assert_eq!(parsed.count_line("30 2 * * * /usr/bin/updatedb"), 1);
    assert!(entry.line().starts_with("0 * * * * nice -n 19 ionice -c 3 "));
    assert!(entry.line().ends_with(" tick"));

    Ok(())
}

#[test]
fn moved_executable_updates_entry_in_place() -> Result<()> {
    let fixture = BackupFixture::new()?;
    let table = fixture.layout().install_dir().join("crontab");
    let registrar = Registrar::new(FileCrontab::new(&table));
    let config_path = fixture.layout().install_dir().join("backsync.toml");

    let old = ScheduleEntry::for_tick(&fixture.config().schedule, "/opt/backsync", &config_path)?;
    let new = ScheduleEntry::for_tick(
        &fixture.config().schedule,
        "/usr/local/bin/backsync",
        &config_path,
    )?;
    registrar.register(&old)?;

    assert_eq!(registrar.register(&new)?, RegisterOutcome::Updated);
    assert_eq!(registrar.entries()?, vec![("backsync".to_string(), new.line())]);

    assert!(registrar.unregister("backsync")?);
    assert!(registrar.entries()?.is_empty());

    Ok(())
}
