//! The remote-side capability consumed by the engine.
//!
//! The engine never talks SSH directly; it drives an abstract
//! [`RemoteSession`] that can execute shell commands and move byte streams.
//! The transport crate provides the russh implementation and an in-process
//! one for tests.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

/// Output of a remote command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// An authenticated session against the remote host.
///
/// Implementations must be safe to drive from a single task at a time; the
/// engine serializes access through a shared mutex so keep-alives can
/// interleave with transfers.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run a shell command and wait for it to exit.
    async fn exec(&mut self, command: &str) -> Result<ExecOutput>;

    /// Upload a local file to the given remote path.
    async fn upload(&mut self, local: &Path, remote: &str) -> Result<()>;

    /// Download a remote file to the given local path.
    async fn download(&mut self, remote: &str, local: &Path) -> Result<()>;

    /// Cheap liveness probe.
    async fn heartbeat(&mut self) -> Result<()>;

    /// Tear down and re-establish the underlying connection.
    async fn reconnect(&mut self) -> Result<()>;
}

/// A session shared between the orchestrator, executor and keep-alive task.
///
/// All remote operations lock the mutex per call, so long transfers release
/// it between operations and heartbeats can interleave.
pub type SharedSession<S> = Arc<Mutex<S>>;

/// Quote a string for safe interpolation into a POSIX shell command line.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':'))
    {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}
