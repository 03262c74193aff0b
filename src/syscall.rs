// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External process invocation.
//!
//! Thin wrappers around [`Command`] that capture output, and keep the exit
//! code of failed invocations around so callers can propagate it.

use std::{
    ffi::{OsStr, OsString},
    io::Write,
    process::{Command, Output, Stdio},
};
use tracing::debug;

/// Run external command to completion, and capture its stdout.
///
/// # Errors
///
/// - Return [`SyscallError::Spawn`] if command cannot be started.
/// - Return [`SyscallError::Failed`] if command exits unsuccessfully.
pub fn syscall_non_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<String> {
    debug!("run {:?}", cmd.as_ref());
    let output = Command::new(cmd.as_ref())
        .args(args)
        .output()
        .map_err(|err| SyscallError::Spawn {
            source: err,
            program: cmd.as_ref().to_os_string(),
        })?;

    finish(cmd.as_ref(), output)
}

/// Run external command with data piped into its stdin, and capture its
/// stdout.
///
/// # Errors
///
/// - Return [`SyscallError::Spawn`] if command cannot be started, or stdin
///   cannot be written.
/// - Return [`SyscallError::Failed`] if command exits unsuccessfully.
pub fn syscall_with_stdin(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    input: impl AsRef<[u8]>,
) -> Result<String> {
    debug!("run {:?} with piped input", cmd.as_ref());
    let spawn_err = |err: std::io::Error| SyscallError::Spawn {
        source: err,
        program: cmd.as_ref().to_os_string(),
    };

    let mut child = Command::new(cmd.as_ref())
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_ref()).map_err(spawn_err)?;
    }
    let output = child.wait_with_output().map_err(spawn_err)?;

    finish(cmd.as_ref(), output)
}

fn finish(cmd: &OsStr, output: Output) -> Result<String> {
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();

    if !output.status.success() {
        // INVARIANT: Chomp trailing newlines.
        let stderr = stderr.trim_end().to_string();
        return Err(SyscallError::Failed {
            program: cmd.to_os_string(),
            code: output.status.code(),
            stderr,
        });
    }

    Ok(stdout)
}

/// External process error types.
#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    /// Command cannot be started.
    #[error("failed to run command {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: OsString,
    },

    /// Command exited unsuccessfully.
    #[error("command {program:?} failed with exit code {code:?}: {stderr}")]
    Failed {
        program: OsString,
        code: Option<i32>,
        stderr: String,
    },
}

impl SyscallError {
    /// Exit code of failed command.
    ///
    /// Mirrors shell conventions: 127 when the command cannot be started, 1
    /// when it was killed by a signal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Spawn { .. } => 127,
            Self::Failed { code, .. } => code.unwrap_or(1),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = SyscallError> = std::result::Result<T, E>;
