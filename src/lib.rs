// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Idempotent local Git mirror with unattended commit and push.
//!
//! Backsync keeps a filtered copy of a live working directory inside a Git
//! working tree called the __mirror tree__, and periodically turns whatever
//! changed into one commit that gets pushed to a remote. Three pieces make
//! that work:
//!
//! 1. The mirror job in [`mirror`] copies the source into the mirror tree,
//!    skipping credentials, caches, and other excluded entries.
//! 2. The commit/push job in [`publish`] stages everything, commits only when
//!    something changed, and pushes every local branch.
//! 3. The registrar in [`schedule`] installs one periodic trigger that runs
//!    both jobs in order through [`tick`].
//!
//! Every run appends to a per-job [`journal`], and holds the service
//! [`lease`] so runs never overlap.

pub mod config;
pub mod journal;
pub mod layout;
pub mod lease;
pub mod mirror;
pub mod path;
pub mod publish;
pub mod schedule;
pub mod syscall;
pub mod tick;

pub use config::BackupConfig;
pub use layout::Layout;
pub use tick::{exit_code_for, JobError};
