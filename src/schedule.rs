// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Schedule registrar.
//!
//! Installs the periodic trigger that drives backups. Registration is
//! idempotent: it can be run on every deployment, and the schedule table ends
//! up with exactly one managed entry per tag no matter how many times it ran.
//!
//! The schedule table itself lives behind the [`CrontabStore`] trait. The
//! [`SystemCrontab`] store talks to the `crontab` command of the host, while
//! the [`FileCrontab`] store edits a plain file, e.g., a drop-in under
//! `/etc/cron.d`, or a scratch file in tests.

pub mod table;

pub use table::{EntryChange as RegisterOutcome, ScheduleTable};

use crate::{
    config::ScheduleSettings,
    syscall::{syscall_non_interactive, syscall_with_stdin, SyscallError},
};

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Periodic trigger managed by backsync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    tag: String,
    cron: String,
    command: String,
}

impl ScheduleEntry {
    /// Construct new schedule entry.
    ///
    /// # Errors
    ///
    /// - Return [`ScheduleError::InvalidTag`] if tag is empty or contains
    ///   whitespace.
    /// - Return [`ScheduleError::InvalidCron`] if cron expression does not
    ///   have five fields, and is not an `@` shorthand.
    pub fn new(
        tag: impl Into<String>,
        cron: impl Into<String>,
        command: impl Into<String>,
    ) -> Result<Self> {
        let tag = tag.into();
        let cron = cron.into();

        if tag.is_empty() || tag.chars().any(char::is_whitespace) {
            return Err(ScheduleError::InvalidTag(tag));
        }

        let fields = cron.split_whitespace().count();
        let shorthand = cron.starts_with('@') && fields == 1;
        if fields != 5 && !shorthand {
            return Err(ScheduleError::InvalidCron(cron));
        }

        Ok(Self {
            tag,
            cron: cron.split_whitespace().collect::<Vec<_>>().join(" "),
            command: command.into(),
        })
    }

    /// Compose entry that runs `backsync tick` through target executable.
    ///
    /// With low priority enabled the command is wrapped in `nice` and
    /// `ionice`, so backups yield to interactive work.
    ///
    /// # Errors
    ///
    /// - Return any error of [`ScheduleEntry::new`].
    pub fn for_tick(
        settings: &ScheduleSettings,
        exe: impl AsRef<Path>,
        config_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let mut parts: Vec<String> = Vec::new();
        if settings.low_priority {
            parts.extend(["nice", "-n", "19", "ionice", "-c", "3"].map(String::from));
        }
        parts.push(quote(exe.as_ref()));
        parts.push("--config".into());
        parts.push(quote(config_path.as_ref()));
        parts.push("tick".into());

        Self::new(settings.tag.as_str(), settings.cron.as_str(), parts.join(" "))
    }

    /// Identifier of entry.
    pub fn tag(&self) -> &str {
        self.tag.as_str()
    }

    /// Command run by entry.
    pub fn command(&self) -> &str {
        self.command.as_str()
    }

    /// Schedule table line of entry.
    pub fn line(&self) -> String {
        format!("{} {}", self.cron, self.command)
    }

    /// Marker comment placed above entry line.
    pub fn marker(&self) -> String {
        format!("{}{}", table::MARKER_PREFIX, self.tag)
    }
}

/// Quote path for the shell that cron runs commands with.
fn quote(path: &Path) -> String {
    // INVARIANT: Cron turns a bare `%` into a newline.
    shell_escape::escape(path.to_string_lossy()).replace('%', "\\%")
}

/// Storage of a schedule table.
pub trait CrontabStore {
    /// Load full table text. A missing table is empty.
    fn load(&self) -> Result<String>;

    /// Replace full table text.
    fn store(&self, table: &str) -> Result<()>;
}

/// Schedule table of the host's cron daemon.
#[derive(Debug, Default, Clone)]
pub struct SystemCrontab {
    user: Option<String>,
}

impl SystemCrontab {
    /// Construct store for table of target user.
    ///
    /// The `-u` flag needs privileges, so it is only used when the target
    /// user is not the invoking user.
    pub fn for_user(user: Option<String>) -> Self {
        Self {
            user: skip_invoking_user(user, invoking_user()),
        }
    }

    fn args<'a>(&'a self, action: &'a str) -> Vec<&'a str> {
        let mut args = Vec::new();
        if let Some(user) = &self.user {
            args.extend(["-u", user.as_str()]);
        }
        args.push(action);

        args
    }
}

/// Name of the real user running this process, if it can be determined.
fn invoking_user() -> Option<String> {
    syscall_non_interactive("id", ["-r", "-u", "-n"])
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Drop target user when it is the invoking user.
///
/// An unknown invoking user keeps the target user, since `-u` must then be
/// passed to be sure the right table is edited.
fn skip_invoking_user(user: Option<String>, invoking: Option<String>) -> Option<String> {
    user.filter(|name| invoking.as_ref() != Some(name))
}

impl CrontabStore for SystemCrontab {
    fn load(&self) -> Result<String> {
        match syscall_non_interactive("crontab", self.args("-l")) {
            Ok(table) => Ok(table),
            Err(SyscallError::Failed { stderr, .. }) if stderr.contains("no crontab for") => {
                debug!("no schedule table installed yet");
                Ok(String::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, table: &str) -> Result<()> {
        syscall_with_stdin("crontab", self.args("-"), table)?;
        Ok(())
    }
}

/// Schedule table kept in a plain file.
#[derive(Debug, Clone)]
pub struct FileCrontab {
    path: PathBuf,
}

impl FileCrontab {
    /// Construct store over file at target path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path to table file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

impl CrontabStore for FileCrontab {
    fn load(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(table) => Ok(table),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(ScheduleError::Io {
                source: err,
                path: self.path.clone(),
            }),
        }
    }

    fn store(&self, table: &str) -> Result<()> {
        let io_err = |err| ScheduleError::Io {
            source: err,
            path: self.path.clone(),
        };

        if let Some(parent) = self.path.parent() {
            mkdirp::mkdirp(parent).map_err(io_err)?;
        }
        fs::write(&self.path, table).map_err(io_err)
    }
}

/// Register and unregister managed schedule entries.
#[derive(Debug, Clone)]
pub struct Registrar<S>
where
    S: CrontabStore,
{
    store: S,
}

impl<S> Registrar<S>
where
    S: CrontabStore,
{
    /// Construct new registrar over target store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Underlying table store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Install or update schedule entry.
    ///
    /// The table is only rewritten when something changed.
    ///
    /// # Errors
    ///
    /// - Return [`ScheduleError::Syscall`] or [`ScheduleError::Io`] if the
    ///   table cannot be loaded or stored.
    #[instrument(skip(self, entry), fields(tag = entry.tag()), level = "debug")]
    pub fn register(&self, entry: &ScheduleEntry) -> Result<RegisterOutcome> {
        let mut table = ScheduleTable::from(self.store.load()?);
        let outcome = table.upsert(entry);

        if table.is_changed() {
            self.store.store(table.to_string().as_str())?;
        }

        match outcome {
            RegisterOutcome::Unchanged => info!("schedule entry {:?} already installed", entry.tag()),
            RegisterOutcome::Installed => info!("install schedule entry {:?}", entry.line()),
            RegisterOutcome::Updated => info!("update schedule entry {:?}", entry.line()),
        }

        Ok(outcome)
    }

    /// Remove schedule entry with target tag.
    ///
    /// Returns whether an entry was removed.
    ///
    /// # Errors
    ///
    /// - Return [`ScheduleError::Syscall`] or [`ScheduleError::Io`] if the
    ///   table cannot be loaded or stored.
    #[instrument(skip(self), level = "debug")]
    pub fn unregister(&self, tag: &str) -> Result<bool> {
        let mut table = ScheduleTable::from(self.store.load()?);
        let removed = table.remove(tag);

        if removed {
            self.store.store(table.to_string().as_str())?;
            info!("remove schedule entry {tag:?}");
        } else {
            info!("no schedule entry {tag:?} to remove");
        }

        Ok(removed)
    }

    /// List managed entries as tag and line pairs.
    ///
    /// # Errors
    ///
    /// - Return [`ScheduleError::Syscall`] or [`ScheduleError::Io`] if the
    ///   table cannot be loaded.
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        Ok(ScheduleTable::from(self.store.load()?).entries())
    }
}

/// Schedule registrar error types.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// Cron expression is malformed.
    #[error("invalid cron expression {0:?}")]
    InvalidCron(String),

    /// Entry tag is malformed.
    #[error("invalid schedule entry tag {0:?}")]
    InvalidTag(String),

    /// Crontab command fails.
    #[error(transparent)]
    Syscall(#[from] SyscallError),

    /// Table file cannot be read or written.
    #[error("failed to access schedule table {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl ScheduleError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Syscall(err) => err.exit_code(),
            _ => 1,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = ScheduleError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    #[test_case(Some("backup"), Some("backup"), None; "same user")]
    #[test_case(Some("backup"), Some("root"), Some("backup"); "other user")]
    #[test_case(Some("backup"), None, Some("backup"); "unknown invoking user")]
    #[test_case(None, Some("root"), None; "no target user")]
    #[test]
    fn crontab_user_flag_only_for_other_users(
        user: Option<&str>,
        invoking: Option<&str>,
        expect: Option<&str>,
    ) {
        let result = skip_invoking_user(user.map(String::from), invoking.map(String::from));
        pretty_assertions::assert_eq!(result.as_deref(), expect);
    }

    #[test_case("0 * * * *"; "five fields")]
    #[test_case("*/15  2-5 * * 1"; "extra spacing")]
    #[test_case("@hourly"; "shorthand")]
    #[test]
    fn accept_cron_expression(cron: &str) {
        assert!(ScheduleEntry::new("backsync", cron, "true").is_ok());
    }

    #[test_case("0 * * *"; "four fields")]
    #[test_case("@hourly now"; "shorthand with extra field")]
    #[test_case(""; "empty")]
    #[test]
    fn reject_cron_expression(cron: &str) {
        let result = ScheduleEntry::new("backsync", cron, "true");
        assert!(matches!(result, Err(ScheduleError::InvalidCron(_))));
    }

    #[test]
    fn reject_tag_with_whitespace() {
        let result = ScheduleEntry::new("back sync", "@hourly", "true");
        assert!(matches!(result, Err(ScheduleError::InvalidTag(_))));
    }

    #[test]
    fn compose_tick_entry() -> anyhow::Result<()> {
        let settings = ScheduleSettings::default();
        let entry = ScheduleEntry::for_tick(
            &settings,
            "/usr/local/bin/backsync",
            "/home/backup/install/my config.toml",
        )?;

        pretty_assertions::assert_eq!(
            entry.line(),
            "0 * * * * nice -n 19 ionice -c 3 /usr/local/bin/backsync \
             --config '/home/backup/install/my config.toml' tick"
        );
        pretty_assertions::assert_eq!(entry.marker(), "# backsync:backsync");

        Ok(())
    }

    #[test]
    fn compose_tick_entry_without_priority_wrapper() -> anyhow::Result<()> {
        let settings = ScheduleSettings {
            low_priority: false,
            ..Default::default()
        };
        let entry = ScheduleEntry::for_tick(&settings, "/opt/backsync", "/etc/backsync/50%.toml")?;

        pretty_assertions::assert_eq!(entry.command(), "/opt/backsync --config '/etc/backsync/50\\%.toml' tick");

        Ok(())
    }

    #[test]
    fn register_twice_yields_one_entry() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registrar = Registrar::new(FileCrontab::new(dir.path().join("crontab")));
        let entry = ScheduleEntry::new("backsync", "0 * * * *", "backsync tick")?;

        pretty_assertions::assert_eq!(registrar.register(&entry)?, RegisterOutcome::Installed);
        pretty_assertions::assert_eq!(registrar.register(&entry)?, RegisterOutcome::Unchanged);

        let table = ScheduleTable::from(registrar.store().load()?);
        pretty_assertions::assert_eq!(table.count_line(entry.line()), 1);
        pretty_assertions::assert_eq!(registrar.entries()?.len(), 1);

        Ok(())
    }

    #[test]
    fn changed_command_updates_entry() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registrar = Registrar::new(FileCrontab::new(dir.path().join("crontab")));
        let old = ScheduleEntry::new("backsync", "0 * * * *", "/old/backsync tick")?;
        let new = ScheduleEntry::new("backsync", "0 * * * *", "/new/backsync tick")?;

        registrar.register(&old)?;
        pretty_assertions::assert_eq!(registrar.register(&new)?, RegisterOutcome::Updated);
        pretty_assertions::assert_eq!(
            registrar.entries()?,
            vec![("backsync".to_string(), new.line())]
        );

        Ok(())
    }

    #[test]
    fn unregister_missing_entry_leaves_table_alone() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("crontab");
        fs::write(&path, "MAILTO=root\n")?;
        let registrar = Registrar::new(FileCrontab::new(&path));

        assert!(!registrar.unregister("backsync")?);
        pretty_assertions::assert_eq!(fs::read_to_string(&path)?, "MAILTO=root\n");

        Ok(())
    }
}
