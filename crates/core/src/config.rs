//! Resolved sync configuration.
//!
//! The engine consumes a fully resolved [`SyncConfig`]; assembling it from
//! config files and CLI flags is the caller's job.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SyncError};

/// Name of the ignore-pattern file in the local root.
pub const IGNORE_FILE: &str = ".dsignore";
/// Name of the persistent state file in the local root.
pub const STATE_FILE: &str = ".sync_state.csv";
/// Name of the per-session progress checkpoint in the local root.
pub const PROGRESS_FILE: &str = ".sync_progress.json";

/// Everything the engine needs for one sync session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Absolute local root directory.
    pub local_root: PathBuf,
    /// Absolute root directory on the remote (POSIX path).
    pub remote_root: String,
    /// Remote host.
    pub server: String,
    /// SSH port.
    pub port: u16,
    /// Remote username.
    pub username: String,
    /// Ignore file name, relative to the local root.
    pub ignore_file: String,
    /// Remote directory for scan output and bundles.
    pub remote_tmp: String,
    /// mtime window in seconds under which a file counts as unchanged.
    pub change_threshold_secs: f64,
    /// Seconds between remote-scan polls.
    pub poll_interval_secs: u64,
    /// Max seconds to wait for the remote scan sentinel.
    pub poll_timeout_secs: u64,
    /// Max paths per transfer bundle before the batch is split.
    pub batch_high_water: usize,
    /// Max attempts for a remote operation.
    pub retry_max: u32,
    /// Base backoff delay in seconds; doubles per attempt, capped at 60.
    pub retry_base_delay_secs: f64,
    /// Per-call timeout for remote commands, in seconds.
    pub command_timeout_secs: u64,
    /// Ignore persisted state and progress; also removes the progress file.
    pub force: bool,
    /// Only push local changes to the remote.
    pub push_only: bool,
    /// Only pull remote changes to the local side.
    pub pull_only: bool,
    /// Compute and report the plan without applying anything.
    pub dry_run: bool,
    /// Report every considered path, not just actions.
    pub verbose: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_root: PathBuf::new(),
            remote_root: String::new(),
            server: String::new(),
            port: 22,
            username: String::new(),
            ignore_file: IGNORE_FILE.to_string(),
            remote_tmp: "/tmp".to_string(),
            change_threshold_secs: 180.0,
            poll_interval_secs: 5,
            poll_timeout_secs: 120,
            batch_high_water: 100,
            retry_max: 5,
            retry_base_delay_secs: 2.0,
            command_timeout_secs: 120,
            force: false,
            push_only: false,
            pull_only: false,
            dry_run: false,
            verbose: false,
        }
    }
}

impl SyncConfig {
    /// Validate the resolved configuration.
    ///
    /// # Errors
    /// Returns [`SyncError::Config`] for any violation; the engine calls
    /// this before opening any connection.
    pub fn validate(&self) -> Result<()> {
        if !self.local_root.is_absolute() {
            return Err(SyncError::Config(format!(
                "local_root must be absolute, got {}",
                self.local_root.display()
            )));
        }
        if !self.remote_root.starts_with('/') {
            return Err(SyncError::Config(format!(
                "remote_root must be absolute, got {}",
                self.remote_root
            )));
        }
        if self.server.is_empty() {
            return Err(SyncError::Config("server must not be empty".into()));
        }
        if self.username.is_empty() {
            return Err(SyncError::Config("username must not be empty".into()));
        }
        if self.push_only && self.pull_only {
            return Err(SyncError::Config(
                "push_only and pull_only are mutually exclusive".into(),
            ));
        }
        if self.change_threshold_secs < 0.0 {
            return Err(SyncError::Config(
                "change_threshold_secs must be non-negative".into(),
            ));
        }
        if self.batch_high_water == 0 {
            return Err(SyncError::Config("batch_high_water must be at least 1".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.local_root.join(STATE_FILE)
    }

    #[must_use]
    pub fn progress_file(&self) -> PathBuf {
        self.local_root.join(PROGRESS_FILE)
    }
}
