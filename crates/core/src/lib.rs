//! driftsync-core: the sync engine
//!
//! Bidirectional file synchronization between a local tree and a remote
//! tree reached over SSH, built to tolerate unstable connections: one
//! detached remote walk instead of per-directory round-trips, mtime+size
//! change detection against persisted state, tar.gz transfer batches, and
//! crash-safe progress checkpoints for resume.

pub mod config;
pub mod decide;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod ignore;
pub mod progress;
pub mod remote;
pub mod remote_scan;
pub mod report;
pub mod retry;
pub mod scan;
pub mod session;
pub mod state;

pub use config::SyncConfig;
pub use decide::{Action, ActionKind, Decider, StateEffect, Verdict};
pub use engine::run_sync;
pub use error::{Result, SyncError};
pub use fingerprint::Fingerprint;
pub use ignore::IgnoreMatcher;
pub use progress::{ProgressStatus, ProgressStore};
pub use remote::{ExecOutput, RemoteSession, SharedSession};
pub use report::{LogReporter, NullReporter, Reporter, SyncSummary};
pub use session::SyncSession;
pub use state::StateStore;
