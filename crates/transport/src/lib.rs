//! driftsync-transport: SSH transport layer
//!
//! Implements the engine's [`RemoteSession`] capability: a russh-based
//! session for real hosts and an in-process one that runs commands
//! against the local filesystem for tests.

pub mod local;
pub mod ssh;

pub use local::LocalSession;
pub use ssh::SshSession;

pub use driftsync_core::remote::{ExecOutput, RemoteSession};
