// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Exclusive lease around a backup run.
//!
//! The mirror tree and its index are shared by every run. Two overlapping
//! runs would race on them, so each run holds an advisory lock on a lease file
//! for its whole duration. The lock is tied to the open file handle: dropping
//! the [`Lease`] releases it, and so does the kernel when the process dies.

use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Held exclusive lease.
#[derive(Debug)]
pub struct Lease {
    file: File,
    path: PathBuf,
}

impl Lease {
    /// Try to acquire lease without blocking.
    ///
    /// Records the process id of the holder in the lease file.
    ///
    /// # Errors
    ///
    /// - Return [`LeaseError::Busy`] if another process holds the lease.
    /// - Return [`LeaseError::Io`] if lease file cannot be opened or locked.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let io_err = |err: std::io::Error| LeaseError::Io {
            source: err,
            path: path.clone(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return Err(LeaseError::Busy { path });
            }
            Err(err) => return Err(io_err(err)),
        }

        // INVARIANT: Holder pid is only informational, failure to write it is fine.
        let _ = file
            .set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()));
        debug!("acquired lease {:?}", path.display());

        Ok(Self { file, path })
    }

    /// Path to lease file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("released lease {:?}", self.path.display());
    }
}

/// Lease error types.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// Another run holds the lease.
    #[error("another run holds the lease at {:?}", path.display())]
    Busy { path: PathBuf },

    /// Lease file cannot be opened or locked.
    #[error("failed to lock lease at {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl LeaseError {
    /// Process exit code for this failure.
    ///
    /// Busy maps to `EX_TEMPFAIL`, so the next tick simply tries again.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Busy { .. } => 75,
            Self::Io { .. } => 1,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = LeaseError> = std::result::Result<T, E>;
