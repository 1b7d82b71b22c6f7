//! Structured event reporting.
//!
//! The engine emits every user-visible event through a [`Reporter`]; the
//! default implementation logs via `tracing`, tests use [`NullReporter`].

use tracing::{error, info, warn};

use crate::decide::{Action, ActionKind};

/// Which side a scan event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSide {
    Local,
    Remote,
}

/// Executor phase names for batch events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Conflicts,
    Push,
    Pull,
    DeleteRemote,
    DeleteLocal,
}

impl Phase {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Conflicts => "conflicts",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::DeleteRemote => "delete-remote",
            Self::DeleteLocal => "delete-local",
        }
    }
}

/// Counters for a completed session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub pushed: usize,
    pub pulled: usize,
    pub deleted_remote: usize,
    pub deleted_local: usize,
    pub conflicts: usize,
    pub skipped: usize,
}

impl SyncSummary {
    /// Total number of mutations (everything except skips).
    #[must_use]
    pub fn total_actions(&self) -> usize {
        self.pushed + self.pulled + self.deleted_remote + self.deleted_local + self.conflicts
    }
}

/// Sink for structured engine events. Every method defaults to a no-op
/// so sinks only override what they surface.
pub trait Reporter: Send + Sync {
    fn scan_started(&self, _side: ScanSide) {}
    fn scan_done(&self, _side: ScanSide, _files: usize) {}
    fn action_decided(&self, _action: &Action) {}
    fn batch_started(&self, _phase: Phase, _paths: usize) {}
    fn batch_done(&self, _phase: Phase, _paths: usize) {}
    fn conflict(&self, _path: &str, _reason: &str) {}
    fn warn(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
    fn session_done(&self, _summary: &SyncSummary) {}
}

/// Reporter that forwards everything to `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct LogReporter {
    /// Report SKIP decisions too, not just actions.
    pub verbose: bool,
}

impl Reporter for LogReporter {
    fn scan_started(&self, side: ScanSide) {
        info!("scanning {side:?} files");
    }

    fn scan_done(&self, side: ScanSide, files: usize) {
        info!("{side:?} scan found {files} file(s)");
    }

    fn action_decided(&self, action: &Action) {
        match action.kind {
            ActionKind::Skip => {
                if self.verbose {
                    info!("  [SKIP] {}", action.path);
                }
            }
            kind => info!("  [{}] {}", kind.label().to_uppercase(), action.path),
        }
    }

    fn batch_started(&self, phase: Phase, paths: usize) {
        info!("[{}] batch of {paths} path(s)", phase.label());
    }

    fn batch_done(&self, phase: Phase, paths: usize) {
        info!("[{}] batch done ({paths} path(s))", phase.label());
    }

    fn conflict(&self, path: &str, reason: &str) {
        warn!("[conflict] {path}: {reason}");
    }

    fn warn(&self, message: &str) {
        warn!("{message}");
    }

    fn error(&self, message: &str) {
        error!("{message}");
    }

    fn session_done(&self, summary: &SyncSummary) {
        info!(
            "session done: pushed={} pulled={} del_remote={} del_local={} conflicts={} skipped={}",
            summary.pushed,
            summary.pulled,
            summary.deleted_remote,
            summary.deleted_local,
            summary.conflicts,
            summary.skipped
        );
    }
}

/// Reporter that swallows everything. For tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {}
