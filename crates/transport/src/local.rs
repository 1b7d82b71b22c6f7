//! Local in-process session for testing.
//!
//! Runs "remote" commands through `sh -c` on this machine and moves
//! files with plain copies, so the whole engine can be exercised
//! end-to-end without SSH.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use driftsync_core::error::{Result, SyncError};
use driftsync_core::remote::{ExecOutput, RemoteSession};

/// A [`RemoteSession`] whose "remote" is the local machine.
#[derive(Debug, Default)]
pub struct LocalSession;

impl LocalSession {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|err| SyncError::transport(format!("spawning sh: {err}")))?;
        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<()> {
        if let Some(parent) = Path::new(remote).parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(local, remote)?;
        Ok(())
    }

    async fn download(&mut self, remote: &str, local: &Path) -> Result<()> {
        std::fs::copy(remote, local)?;
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<()> {
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }
}
