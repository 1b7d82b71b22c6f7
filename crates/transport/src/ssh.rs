//! SSH session implementation using russh (pure Rust).
//!
//! Authenticates via the SSH agent when available, falling back to the
//! usual key files. Byte transfers ride plain `cat` channels so the
//! remote side needs nothing beyond a POSIX shell.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::agent::client::AgentClient;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{load_secret_key, PublicKey};
use russh::{ChannelMsg, Disconnect};
use tracing::{debug, info};

use driftsync_core::error::{Result, SyncError};
use driftsync_core::remote::{shell_quote, ExecOutput, RemoteSession};

/// SSH-backed [`RemoteSession`].
pub struct SshSession {
    handle: Option<russh::client::Handle<ClientHandler>>,
    host: String,
    port: u16,
    user: String,
}

struct ClientHandler;

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // TODO: host key pinning against known_hosts
        Ok(true)
    }
}

impl SshSession {
    /// Connect and authenticate.
    pub async fn connect(host: &str, port: u16, user: &str) -> Result<Self> {
        let mut session = Self {
            handle: None,
            host: host.to_string(),
            port,
            user: user.to_string(),
        };
        session.establish().await?;
        Ok(session)
    }

    async fn establish(&mut self) -> Result<()> {
        info!("connecting to {}@{}:{}", self.user, self.host, self.port);

        let config = Arc::new(russh::client::Config::default());
        let mut handle =
            russh::client::connect(config, (self.host.as_str(), self.port), ClientHandler)
                .await
                .map_err(|err| SyncError::transport(format!("connect: {err}")))?;

        if !Self::authenticate(&mut handle, &self.user).await? {
            return Err(SyncError::transport_fatal(format!(
                "SSH authentication failed for {}@{}",
                self.user, self.host
            )));
        }

        info!("connected");
        self.handle = Some(handle);
        Ok(())
    }

    /// Try the SSH agent first, then the default key files.
    async fn authenticate(
        handle: &mut russh::client::Handle<ClientHandler>,
        user: &str,
    ) -> Result<bool> {
        if let Ok(sock) = std::env::var("SSH_AUTH_SOCK") {
            match AgentClient::connect_uds(&sock).await {
                Ok(mut agent) => match agent.request_identities().await {
                    Ok(identities) => {
                        debug!("SSH agent offered {} identit(ies)", identities.len());
                        for identity in identities {
                            if let Ok(result) = handle
                                .authenticate_publickey_with(user, identity, None, &mut agent)
                                .await
                            {
                                if result.success() {
                                    info!("authenticated via SSH agent");
                                    return Ok(true);
                                }
                            }
                        }
                    }
                    Err(err) => debug!("agent identities unavailable: {err}"),
                },
                Err(err) => debug!("no usable SSH agent at {sock}: {err}"),
            }
        }

        let Some(home) = dirs::home_dir() else {
            return Ok(false);
        };
        for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
            let key_path = home.join(".ssh").join(name);
            if !key_path.exists() {
                continue;
            }
            match load_secret_key(&key_path, None) {
                Ok(key) => {
                    let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                    if let Ok(result) = handle.authenticate_publickey(user, key).await {
                        if result.success() {
                            info!("authenticated with key {}", key_path.display());
                            return Ok(true);
                        }
                    }
                }
                Err(err) => debug!("cannot load key {}: {err}", key_path.display()),
            }
        }

        Ok(false)
    }

    fn handle(&self) -> Result<&russh::client::Handle<ClientHandler>> {
        self.handle
            .as_ref()
            .ok_or_else(|| SyncError::transport("not connected"))
    }

    /// Run a command, optionally feeding `stdin` and streaming stdout
    /// into `sink`.
    async fn run(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        mut sink: Option<&mut Vec<u8>>,
    ) -> Result<ExecOutput> {
        let to_transport = |err: russh::Error| SyncError::transport(format!("channel: {err}"));

        let channel = self
            .handle()?
            .channel_open_session()
            .await
            .map_err(to_transport)?;
        channel.exec(true, command).await.map_err(to_transport)?;

        if let Some(data) = stdin {
            channel.data(data).await.map_err(to_transport)?;
            channel.eof().await.map_err(to_transport)?;
        }

        let mut channel = channel;
        let mut stdout = Vec::new();
        let mut stderr = String::new();
        let mut exit_code = 0;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => match sink.as_deref_mut() {
                    Some(sink) => sink.extend_from_slice(&data),
                    None => stdout.extend_from_slice(&data),
                },
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    stderr.push_str(&String::from_utf8_lossy(&data));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = exit_status as i32;
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Disconnect cleanly.
    pub async fn disconnect(mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|err| SyncError::transport(format!("disconnect: {err}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        self.run(command, None, None).await
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<()> {
        let data = std::fs::read(local)?;
        let cmd = format!("cat > {}", shell_quote(remote));
        let out = self.run(&cmd, Some(&data), None).await?;
        if out.exit_code != 0 {
            return Err(SyncError::Remote {
                command: cmd,
                code: out.exit_code,
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    async fn download(&mut self, remote: &str, local: &Path) -> Result<()> {
        let cmd = format!("cat {}", shell_quote(remote));
        let mut bytes = Vec::new();
        let out = self.run(&cmd, None, Some(&mut bytes)).await?;
        if out.exit_code != 0 {
            return Err(SyncError::Remote {
                command: cmd,
                code: out.exit_code,
                stderr: out.stderr,
            });
        }
        std::fs::write(local, &bytes)?;
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<()> {
        let out = self.run(":", None, None).await?;
        if out.exit_code != 0 {
            return Err(SyncError::transport("heartbeat returned non-zero"));
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.disconnect(Disconnect::ByApplication, "", "English").await;
        }
        self.establish().await
    }
}
