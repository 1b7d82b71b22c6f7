//! Config-file resolution.
//!
//! Two TOML layers feed the resolved [`SyncConfig`]: global defaults in
//! the user config directory, overlaid by a per-project `.driftsync.toml`
//! in the local root. CLI flags override both.

use std::path::Path;

use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::Deserialize;

use driftsync_core::SyncConfig;

/// Per-project config file name, looked up in the local root.
pub const PROJECT_CONFIG: &str = ".driftsync.toml";
/// Global config file under the user config directory.
pub const GLOBAL_CONFIG: &str = "driftsync/config.toml";

/// One layer of configuration; every field optional.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub server: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub remote_root: Option<String>,
    pub ignore_file: Option<String>,
    pub remote_tmp: Option<String>,
    pub change_threshold_secs: Option<f64>,
    pub poll_interval_secs: Option<u64>,
    pub poll_timeout_secs: Option<u64>,
    pub batch_high_water: Option<usize>,
    pub retry_max: Option<u32>,
    pub retry_base_delay_secs: Option<f64>,
    pub command_timeout_secs: Option<u64>,
}

impl Profile {
    /// Overlay `other` on top of `self`; set fields in `other` win.
    #[must_use]
    pub fn merged(self, other: Profile) -> Profile {
        Profile {
            server: other.server.or(self.server),
            port: other.port.or(self.port),
            username: other.username.or(self.username),
            remote_root: other.remote_root.or(self.remote_root),
            ignore_file: other.ignore_file.or(self.ignore_file),
            remote_tmp: other.remote_tmp.or(self.remote_tmp),
            change_threshold_secs: other.change_threshold_secs.or(self.change_threshold_secs),
            poll_interval_secs: other.poll_interval_secs.or(self.poll_interval_secs),
            poll_timeout_secs: other.poll_timeout_secs.or(self.poll_timeout_secs),
            batch_high_water: other.batch_high_water.or(self.batch_high_water),
            retry_max: other.retry_max.or(self.retry_max),
            retry_base_delay_secs: other.retry_base_delay_secs.or(self.retry_base_delay_secs),
            command_timeout_secs: other.command_timeout_secs.or(self.command_timeout_secs),
        }
    }

    /// Fold this profile into a [`SyncConfig`], keeping engine defaults
    /// for unset fields.
    #[must_use]
    pub fn apply(self, mut config: SyncConfig) -> SyncConfig {
        if let Some(v) = self.server {
            config.server = v;
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.username {
            config.username = v;
        }
        if let Some(v) = self.remote_root {
            config.remote_root = v;
        }
        if let Some(v) = self.ignore_file {
            config.ignore_file = v;
        }
        if let Some(v) = self.remote_tmp {
            config.remote_tmp = v;
        }
        if let Some(v) = self.change_threshold_secs {
            config.change_threshold_secs = v;
        }
        if let Some(v) = self.poll_interval_secs {
            config.poll_interval_secs = v;
        }
        if let Some(v) = self.poll_timeout_secs {
            config.poll_timeout_secs = v;
        }
        if let Some(v) = self.batch_high_water {
            config.batch_high_water = v;
        }
        if let Some(v) = self.retry_max {
            config.retry_max = v;
        }
        if let Some(v) = self.retry_base_delay_secs {
            config.retry_base_delay_secs = v;
        }
        if let Some(v) = self.command_timeout_secs {
            config.command_timeout_secs = v;
        }
        config
    }
}

fn load_file(path: &Path) -> Result<Profile> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    toml::from_str(&content).wrap_err_with(|| format!("parsing {}", path.display()))
}

/// Load global defaults overlaid with the project profile found in
/// `project_root` (if any).
pub fn resolve(project_root: &Path) -> Result<Profile> {
    let mut profile = Profile::default();

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join(GLOBAL_CONFIG);
        if global.exists() {
            profile = profile.merged(load_file(&global)?);
        }
    }

    let project = project_root.join(PROJECT_CONFIG);
    if project.exists() {
        profile = profile.merged(load_file(&project)?);
    }

    Ok(profile)
}

/// Parse a `user@host:/path` remote destination.
pub fn parse_remote(remote: &str) -> Result<(String, String, String)> {
    let (user, rest) = remote
        .split_once('@')
        .ok_or_else(|| eyre!("remote must look like user@host:/path, got {remote:?}"))?;
    let (host, path) = rest
        .split_once(':')
        .ok_or_else(|| eyre!("remote must look like user@host:/path, got {remote:?}"))?;
    if user.is_empty() || host.is_empty() {
        return Err(eyre!("remote must look like user@host:/path, got {remote:?}"));
    }
    if !path.starts_with('/') {
        return Err(eyre!("remote path must be absolute, got {path:?}"));
    }
    Ok((user.to_string(), host.to_string(), path.to_string()))
}
