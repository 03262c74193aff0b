// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Per-job log with rotation.
//!
//! Every job owns a __journal__: an append-only plain text file named after
//! the job, e.g., `logs/mirror.log`. Each line has the form
//! `[<timestamp>] <message>`.
//!
//! # Rotation
//!
//! Opening a journal rotates it. The active log is compressed with zstd into
//! `<job>.log.1.zst`, older archives shift up by one index, and any archive
//! whose index exceeds the retention window is deleted. Thus, the journal
//! directory never holds more than `retention` archives per job plus the
//! active log.

use chrono::Local;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, ErrorKind, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Timestamp layout used for every journal line.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// Append-only job log.
#[derive(Debug)]
pub struct Journal {
    job: String,
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Rotate and open journal of target job inside target directory.
    ///
    /// Creates the directory if it does not exist yet.
    ///
    /// # Errors
    ///
    /// - Return [`JournalError::CreateDir`] if directory cannot be created.
    /// - Return [`JournalError::Rotate`] if rotation fails.
    /// - Return [`JournalError::Open`] if active log cannot be opened.
    #[instrument(skip(dir), level = "debug")]
    pub fn open(dir: impl AsRef<Path>, job: &str, retention: usize) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|err| JournalError::CreateDir {
            source: err,
            path: dir.to_path_buf(),
        })?;

        let rotator = Rotator::new(dir, job, retention);
        rotator.rotate()?;

        let path = rotator.active_path();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| JournalError::Open {
                source: err,
                path: path.clone(),
            })?;

        Ok(Self {
            job: job.into(),
            path,
            file,
        })
    }

    /// Append timestamped message to journal.
    ///
    /// # Errors
    ///
    /// - Return [`JournalError::Write`] if message cannot be written.
    pub fn record(&mut self, message: impl AsRef<str>) -> Result<()> {
        let stamp = Local::now().format(TIMESTAMP_FORMAT);
        info!("{}: {}", self.job, message.as_ref());
        writeln!(self.file, "[{stamp}] {}", message.as_ref())
            .and_then(|_| self.file.flush())
            .map_err(|err| JournalError::Write {
                source: err,
                path: self.path.clone(),
            })
    }

    /// Path to active log.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

/// Log rotation over numbered zstd archives.
#[derive(Debug, Clone)]
pub struct Rotator {
    dir: PathBuf,
    job: String,
    retention: usize,
}

impl Rotator {
    /// Construct new rotator for target job.
    pub fn new(dir: impl Into<PathBuf>, job: impl Into<String>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            job: job.into(),
            retention,
        }
    }

    /// Path to active log.
    pub fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.job))
    }

    /// Path to archive at target index.
    pub fn archive_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{index}.zst", self.job))
    }

    /// List existing archives sorted by index, newest first.
    ///
    /// # Errors
    ///
    /// - Return [`JournalError::Pattern`] if archive pattern is malformed.
    pub fn archives(&self) -> Result<Vec<(usize, PathBuf)>> {
        let prefix = format!("{}.log.", self.job);
        let pattern = format!(
            "{}/{}*.zst",
            glob::Pattern::escape(self.dir.to_string_lossy().as_ref()),
            glob::Pattern::escape(prefix.as_str())
        );

        let mut archives = glob::glob(pattern.as_str())?
            .filter_map(std::result::Result::ok)
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                let index = name
                    .strip_prefix(prefix.as_str())?
                    .strip_suffix(".zst")?
                    .parse::<usize>()
                    .ok()?;
                Some((index, path))
            })
            .collect::<Vec<_>>();
        archives.sort_by_key(|(index, _)| *index);

        Ok(archives)
    }

    /// Rotate active log into archives, and prune archives beyond retention.
    ///
    /// An empty or missing active log is not archived.
    ///
    /// # Errors
    ///
    /// - Return [`JournalError::Rotate`] if archives cannot be renamed,
    ///   compressed, or deleted.
    #[instrument(skip(self), level = "debug")]
    pub fn rotate(&self) -> Result<()> {
        let active = self.active_path();
        let has_content = match fs::metadata(&active) {
            Ok(meta) => meta.len() > 0,
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                return Err(JournalError::Rotate {
                    source: err,
                    path: active,
                })
            }
        };

        if has_content {
            // INVARIANT: Shift from highest index down so nothing is overwritten.
            let mut archives = self.archives()?;
            archives.reverse();
            for (index, path) in archives {
                if index >= self.retention {
                    remove(&path)?;
                } else {
                    let next = self.archive_path(index + 1);
                    fs::rename(&path, &next).map_err(|err| JournalError::Rotate {
                        source: err,
                        path: path.clone(),
                    })?;
                }
            }

            if self.retention > 0 {
                self.compress(&active, &self.archive_path(1))?;
            }
            remove(&active)?;
            debug!("rotated {:?}", active.display());
        }

        // INVARIANT: Prune every run, so lowered retention applies immediately.
        for (index, path) in self.archives()? {
            if index > self.retention || index == 0 {
                remove(&path)?;
            }
        }

        Ok(())
    }

    fn compress(&self, from: &Path, to: &Path) -> Result<()> {
        let rotate_err = |err: io::Error| JournalError::Rotate {
            source: err,
            path: from.to_path_buf(),
        };

        let mut input = BufReader::new(File::open(from).map_err(rotate_err)?);
        let output = File::create(to).map_err(rotate_err)?;
        let mut encoder = zstd::Encoder::new(output, 3).map_err(rotate_err)?;
        io::copy(&mut input, &mut encoder).map_err(rotate_err)?;
        encoder.finish().map_err(rotate_err)?;

        Ok(())
    }
}

fn remove(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(|err| JournalError::Rotate {
        source: err,
        path: path.to_path_buf(),
    })
}

/// Journal error types.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Journal directory cannot be created.
    #[error("failed to create journal directory at {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Active log cannot be opened.
    #[error("failed to open journal at {:?}", path.display())]
    Open {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Message cannot be appended.
    #[error("failed to write to journal at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Rotation step fails.
    #[error("failed to rotate journal file {:?}", path.display())]
    Rotate {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Archive listing pattern is malformed.
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

/// Friendly result alias :3
pub type Result<T, E = JournalError> = std::result::Result<T, E>;
