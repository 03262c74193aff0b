// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Schedule table editing.
//!
//! A schedule table is the text of a crontab. Backsync owns only the entries
//! it manages, and leaves every other line exactly as it found it.
//!
//! # Managed Entries
//!
//! A __managed entry__ is a marker comment naming the entry's tag, followed by
//! the entry line itself:
//!
//! ```text
//! # backsync:backsync
//! 0 * * * * nice -n 19 ionice -c 3 /usr/local/bin/backsync --config /home/backup/install/backsync.toml tick
//! ```
//!
//! The tag, not the command text, identifies the entry. Changing the command
//! therefore updates the entry in place instead of adding a second one.

use crate::schedule::ScheduleEntry;

use std::fmt::{Display, Formatter, Result as FmtResult};

/// Prefix of marker comments of managed entries.
pub const MARKER_PREFIX: &str = "# backsync:";

/// Change applied to a schedule table by an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryChange {
    /// Entry already present as is.
    Unchanged,

    /// Entry was missing and has been added.
    Installed,

    /// Entry was present with a different line, and has been replaced.
    Updated,
}

/// Schedule table editor.
///
/// # Invariant
///
/// - At most one managed entry per tag.
/// - Lines that are not managed entries are never reordered or altered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScheduleTable {
    lines: Vec<String>,
    changed: bool,
}

impl ScheduleTable {
    /// Construct new empty schedule table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if any edit modified the table.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Insert entry, or replace the managed entry sharing its tag.
    ///
    /// An unmanaged line that already equals the entry line is adopted by
    /// placing a marker above it. Any other unmanaged copy of the entry line
    /// is dropped, so the line appears exactly once.
    pub fn upsert(&mut self, entry: &ScheduleEntry) -> EntryChange {
        let marker = entry.marker();
        let line = entry.line();

        // INVARIANT: Collapse duplicate markers of the same tag first.
        while self.marker_positions(&marker).len() > 1 {
            if let Some(&last) = self.marker_positions(&marker).last() {
                self.remove_at(last);
            }
        }

        let change = if let Some(&at) = self.marker_positions(&marker).first() {
            let current = self.lines.get(at + 1).cloned();
            match current {
                Some(current) if current == line => EntryChange::Unchanged,
                Some(current) if !is_comment(&current) => {
                    self.lines[at + 1] = line.clone();
                    self.changed = true;
                    EntryChange::Updated
                }
                _ => {
                    self.lines.insert(at + 1, line.clone());
                    self.changed = true;
                    EntryChange::Updated
                }
            }
        } else if let Some(at) = self.unmanaged_positions(&line).first().copied() {
            self.lines.insert(at, marker);
            self.changed = true;
            EntryChange::Installed
        } else {
            self.lines.push(marker);
            self.lines.push(line.clone());
            self.changed = true;
            EntryChange::Installed
        };

        let copies = self.unmanaged_positions(&line);
        if copies.is_empty() {
            return change;
        }

        for at in copies.into_iter().rev() {
            self.lines.remove(at);
        }
        self.changed = true;
        match change {
            EntryChange::Unchanged => EntryChange::Updated,
            other => other,
        }
    }

    /// Remove managed entry with target tag.
    ///
    /// Returns whether anything was removed.
    pub fn remove(&mut self, tag: impl AsRef<str>) -> bool {
        let marker = format!("{MARKER_PREFIX}{}", tag.as_ref());
        let mut removed = false;
        while let Some(&at) = self.marker_positions(&marker).first() {
            self.remove_at(at);
            removed = true;
        }

        removed
    }

    /// List managed entries as tag and line pairs.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut entries = Vec::new();
        for (at, current) in self.lines.iter().enumerate() {
            let Some(tag) = current.strip_prefix(MARKER_PREFIX) else {
                continue;
            };

            if let Some(line) = self.lines.get(at + 1).filter(|line| !is_comment(line)) {
                entries.push((tag.trim().to_string(), line.clone()));
            }
        }

        entries
    }

    /// Count lines exactly equal to target line.
    pub fn count_line(&self, line: impl AsRef<str>) -> usize {
        self.lines
            .iter()
            .filter(|current| current.as_str() == line.as_ref())
            .count()
    }

    fn marker_positions(&self, marker: &str) -> Vec<usize> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, current)| current.trim_end() == marker)
            .map(|(at, _)| at)
            .collect()
    }

    /// Positions of lines equal to target line with no marker above them.
    fn unmanaged_positions(&self, line: &str) -> Vec<usize> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(at, current)| {
                let managed = at
                    .checked_sub(1)
                    .and_then(|above| self.lines.get(above))
                    .is_some_and(|above| above.starts_with(MARKER_PREFIX));
                current.as_str() == line && !managed
            })
            .map(|(at, _)| at)
            .collect()
    }

    /// Remove marker at index together with the entry line below it.
    fn remove_at(&mut self, at: usize) {
        let has_line = self
            .lines
            .get(at + 1)
            .map(|line| !is_comment(line))
            .unwrap_or(false);
        if has_line {
            self.lines.remove(at + 1);
        }
        self.lines.remove(at);
        self.changed = true;
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

impl Display for ScheduleTable {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        // INVARIANT: Cron requires a trailing newline after the last entry.
        for line in &self.lines {
            writeln!(fmt, "{line}")?;
        }

        Ok(())
    }
}

impl From<String> for ScheduleTable {
    fn from(content: String) -> Self {
        Self::from(content.as_str())
    }
}

impl From<&str> for ScheduleTable {
    fn from(content: &str) -> Self {
        Self {
            lines: content.lines().map(str::to_owned).collect(),
            changed: false,
        }
    }
}
