//! The per-path decision algorithm.
//!
//! A pure function over `(local fingerprint, remote fingerprint, recorded
//! state)` that classifies every path into push, pull, delete, conflict or
//! skip. Absence on either side is a first-class input, distinct from
//! "unchanged".

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// What the executor should do with a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Push,
    Pull,
    DeleteLocal,
    DeleteRemote,
    Conflict,
    Skip,
}

impl ActionKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::DeleteLocal => "delete-local",
            Self::DeleteRemote => "delete-remote",
            Self::Conflict => "conflict",
            Self::Skip => "skip",
        }
    }
}

/// A decided action for one path.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub path: String,
    pub local: Option<Fingerprint>,
    pub remote: Option<Fingerprint>,
    /// Human-readable explanation, set for conflicts.
    pub reason: Option<String>,
}

/// State-table maintenance the orchestrator applies alongside the action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateEffect {
    /// Leave the recorded entry alone.
    Keep,
    /// Record the fingerprint as synced (adopt-on-first-sight).
    Adopt(Fingerprint),
    /// Drop the recorded entry (path gone from both sides).
    Forget,
}

/// An action plus its state side-effect.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub action: Action,
    pub state: StateEffect,
}

/// The pure decision function. Holds only configuration, never I/O.
#[derive(Debug, Clone, Copy)]
pub struct Decider {
    pub threshold_secs: f64,
    pub push_only: bool,
    pub pull_only: bool,
}

impl Decider {
    /// Classify one path.
    ///
    /// Total over all eight presence combinations; identical inputs always
    /// produce identical verdicts.
    #[must_use]
    pub fn decide(
        &self,
        path: &str,
        local: Option<Fingerprint>,
        remote: Option<Fingerprint>,
        recorded: Option<Fingerprint>,
    ) -> Verdict {
        match (local, remote) {
            (None, None) => self.verdict(path, ActionKind::Skip, None, None, None, StateEffect::Forget),

            // Only local. Either a new file, or the remote deleted a
            // once-synced one.
            (Some(l), None) => match recorded {
                Some(_) => self.gated(path, ActionKind::DeleteLocal, Some(l), None, None),
                None => self.gated(path, ActionKind::Push, Some(l), None, None),
            },

            // Only remote, mirrored.
            (None, Some(r)) => match recorded {
                Some(_) => self.gated(path, ActionKind::DeleteRemote, None, Some(r), None),
                None => self.gated(path, ActionKind::Pull, None, Some(r), None),
            },

            (Some(l), Some(r)) => self.decide_both(path, l, r, recorded),
        }
    }

    fn decide_both(&self, path: &str, l: Fingerprint, r: Fingerprint, recorded: Option<Fingerprint>) -> Verdict {
        let Some(prev) = recorded else {
            // First sight of a path present on both sides.
            if l.agrees_with(&r, self.threshold_secs) {
                return self.verdict(
                    path,
                    ActionKind::Skip,
                    Some(l),
                    Some(r),
                    None,
                    StateEffect::Adopt(l),
                );
            }
            let reason =
                "file exists on both sides with no sync history and the copies differ".to_string();
            return self.verdict(
                path,
                ActionKind::Conflict,
                Some(l),
                Some(r),
                Some(reason),
                StateEffect::Keep,
            );
        };

        let l_changed = l.changed_since(&prev, self.threshold_secs);
        let r_changed = r.changed_since(&prev, self.threshold_secs);

        match (l_changed, r_changed) {
            (false, false) => self.verdict(path, ActionKind::Skip, Some(l), Some(r), None, StateEffect::Keep),
            (true, false) => self.gated(path, ActionKind::Push, Some(l), Some(r), None),
            (false, true) => self.gated(path, ActionKind::Pull, Some(l), Some(r), None),
            (true, true) => {
                let reason = format!(
                    "local changed (mtime \u{394}={:.0}s, size {}\u{2192}{}); \
                     remote changed (mtime \u{394}={:.0}s, size {}\u{2192}{})",
                    (l.mtime - prev.mtime).abs(),
                    prev.size,
                    l.size,
                    (r.mtime - prev.mtime).abs(),
                    prev.size,
                    r.size,
                );
                self.verdict(
                    path,
                    ActionKind::Conflict,
                    Some(l),
                    Some(r),
                    Some(reason),
                    StateEffect::Keep,
                )
            }
        }
    }

    /// Apply the direction gates: `push_only` demotes pulls and local
    /// deletes to skips, `pull_only` the reverse. Conflicts are never
    /// gated.
    fn gated(
        &self,
        path: &str,
        kind: ActionKind,
        local: Option<Fingerprint>,
        remote: Option<Fingerprint>,
        reason: Option<String>,
    ) -> Verdict {
        let demoted = match kind {
            ActionKind::Pull | ActionKind::DeleteLocal if self.push_only => true,
            ActionKind::Push | ActionKind::DeleteRemote if self.pull_only => true,
            _ => false,
        };
        let kind = if demoted { ActionKind::Skip } else { kind };
        self.verdict(path, kind, local, remote, reason, StateEffect::Keep)
    }

    fn verdict(
        &self,
        path: &str,
        kind: ActionKind,
        local: Option<Fingerprint>,
        remote: Option<Fingerprint>,
        reason: Option<String>,
        state: StateEffect,
    ) -> Verdict {
        Verdict {
            action: Action {
                kind,
                path: path.to_string(),
                local,
                remote,
                reason,
            },
            state,
        }
    }
}
