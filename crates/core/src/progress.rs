//! Session progress checkpointing.
//!
//! A small JSON document in the local root records every per-path outcome
//! of the current session, rewritten atomically after each action. A
//! leftover file from an interrupted session becomes the resume hint for
//! the next run.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decide::ActionKind;
use crate::error::{Result, SyncError};
use crate::session::SyncSession;
use crate::state::write_atomic;

/// Outcome of one recorded action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Done,
    Failed,
}

/// One per-path checkpoint entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub action: ActionKind,
    pub status: ProgressStatus,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProgressDoc {
    session: String,
    started: DateTime<Utc>,
    entries: BTreeMap<String, ProgressEntry>,
}

/// Crash-safe log of what the current session has completed.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    doc: ProgressDoc,
}

impl ProgressStore {
    /// Open the progress file and bind it to the given session.
    ///
    /// Entries from a prior interrupted session are retained as resume
    /// hints; the session id and start time are replaced.
    ///
    /// # Errors
    /// An unreadable or unparseable existing file is
    /// [`SyncError::StateCorruption`].
    pub fn begin(path: impl Into<PathBuf>, session: &SyncSession) -> Result<Self> {
        let path = path.into();
        let prior_entries = match std::fs::read_to_string(&path) {
            Ok(text) => {
                let doc: ProgressDoc = serde_json::from_str(&text).map_err(|err| {
                    SyncError::StateCorruption(format!(
                        "progress file {}: {err}",
                        path.display()
                    ))
                })?;
                doc.entries
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(SyncError::StateCorruption(format!(
                    "cannot read {}: {err}",
                    path.display()
                )));
            }
        };

        Ok(Self {
            path,
            doc: ProgressDoc {
                session: session.id().to_string(),
                started: session.started(),
                entries: prior_entries,
            },
        })
    }

    /// Delete any existing progress file and start clean. Used by
    /// `--force`.
    pub fn begin_fresh(path: impl Into<PathBuf>, session: &SyncSession) -> Result<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Self::begin(path, session)
    }

    /// Record an outcome and rewrite the file atomically.
    pub fn record(&mut self, path: &str, action: ActionKind, status: ProgressStatus) -> Result<()> {
        self.doc.entries.insert(
            path.to_string(),
            ProgressEntry {
                action,
                status,
                ts: Utc::now(),
            },
        );
        self.flush()
    }

    /// Whether `path` already completed with the given action in this or
    /// the resumed prior session. A done PUSH does not satisfy a planned
    /// PULL.
    #[must_use]
    pub fn is_done(&self, path: &str, action: ActionKind) -> bool {
        self.doc
            .entries
            .get(path)
            .is_some_and(|e| e.action == action && e.status == ProgressStatus::Done)
    }

    /// Paths recorded done, with the action that completed them.
    pub fn completed_paths(&self) -> impl Iterator<Item = (&str, ActionKind)> {
        self.doc
            .entries
            .iter()
            .filter(|(_, e)| e.status == ProgressStatus::Done)
            .map(|(p, e)| (p.as_str(), e.action))
    }

    /// Number of done entries carried over as resume hints.
    #[must_use]
    pub fn resumable_count(&self) -> usize {
        self.completed_paths().count()
    }

    /// Remove the progress file after a clean session.
    pub fn clear(&mut self) -> Result<()> {
        self.doc.entries.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn flush(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.doc)
            .map_err(|err| SyncError::StateCorruption(format!("serializing progress: {err}")))?;
        write_atomic(&self.path, json.as_bytes())?;
        Ok(())
    }
}
