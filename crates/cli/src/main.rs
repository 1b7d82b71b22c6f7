//! driftsync: bidirectional SSH sync for unstable connections
//!
//! One detached remote walk instead of per-directory round-trips,
//! mtime+size change detection, tar.gz transfer batches with retry and
//! resume, and conflict artifacts for manual merge.

mod config;

use std::path::PathBuf;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{builder::Styles, Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use tracing::info;

use driftsync_core::{run_sync, IgnoreMatcher, LogReporter, SyncConfig};
use driftsync_core::scan::LocalScanner;
use driftsync_transport::SshSession;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "driftsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Bidirectional SSH sync that tolerates flaky connections")]
#[command(long_about = r#"
driftsync keeps a local tree and a remote tree in step over SSH, built
for connections that drop.

How it stays fast and safe:
  • One detached find on the remote   - no per-directory round-trips
  • mtime+size change detection       - no content reads on either side
  • tar.gz batches                    - N files, one upload, one command
  • Checkpointed progress             - a crashed run resumes exactly
  • Conflicts become .conflict files  - your copy is never overwritten

Examples:
  driftsync sync dev@host:/srv/project        Sync the current directory
  driftsync sync -n dev@host:/srv/project     Preview only
  driftsync sync --push-only dev@host:/srv/p  One-way upload
  driftsync scan .                            List what would be synced
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync session
    Sync {
        /// Remote destination (user@host:/path); optional when a config
        /// profile provides it
        remote: Option<String>,

        /// Local directory to sync (default: current directory)
        #[arg(short, long)]
        local: Option<PathBuf>,

        /// SSH port
        #[arg(short, long)]
        port: Option<u16>,

        /// Preview without applying changes
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Ignore state and progress cache (full resync)
        #[arg(short, long)]
        force: bool,

        /// Only push local changes to the remote
        #[arg(long, conflicts_with = "pull_only")]
        push_only: bool,

        /// Only pull remote changes to the local side
        #[arg(long)]
        pull_only: bool,

        /// Seconds between remote-scan polls
        #[arg(long, value_name = "N")]
        poll_interval: Option<u64>,

        /// Max seconds to wait for the remote scan
        #[arg(long, value_name = "N")]
        poll_timeout: Option<u64>,
    },

    /// Scan a local directory and list syncable files
    Scan {
        /// Directory to scan (default: current directory)
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Scan { path } => scan_command(path)?,
        Commands::Sync {
            remote,
            local,
            port,
            dry_run,
            force,
            push_only,
            pull_only,
            poll_interval,
            poll_timeout,
        } => {
            let local_root = match local {
                Some(path) => path.canonicalize()?,
                None => std::env::current_dir()?,
            };

            let profile = config::resolve(&local_root)?;
            let mut cfg = profile.apply(SyncConfig::default());
            cfg.local_root = local_root;
            if let Some(remote) = remote {
                let (user, host, path) = config::parse_remote(&remote)?;
                cfg.username = user;
                cfg.server = host;
                cfg.remote_root = path;
            }
            if let Some(port) = port {
                cfg.port = port;
            }
            if let Some(n) = poll_interval {
                cfg.poll_interval_secs = n;
            }
            if let Some(n) = poll_timeout {
                cfg.poll_timeout_secs = n;
            }
            cfg.dry_run = dry_run;
            cfg.force = force;
            cfg.push_only = push_only;
            cfg.pull_only = pull_only;
            cfg.verbose = cli.verbose;

            sync_command(cfg).await?;
        }
    }

    Ok(())
}

async fn sync_command(cfg: SyncConfig) -> Result<()> {
    cfg.validate()
        .map_err(|err| eyre!("{err} (set it in {} or pass user@host:/path)", config::PROJECT_CONFIG))?;

    info!(
        "sync {} <-> {}@{}:{}:{}",
        cfg.local_root.display(),
        cfg.username,
        cfg.server,
        cfg.port,
        cfg.remote_root
    );
    if cfg.dry_run {
        info!("dry run: no files will be changed");
    }

    let session = SshSession::connect(&cfg.server, cfg.port, &cfg.username).await?;
    let reporter = LogReporter { verbose: cfg.verbose };
    let summary = run_sync(session, &cfg, &reporter).await?;

    println!();
    println!("  pushed     : {}", summary.pushed);
    println!("  pulled     : {}", summary.pulled);
    println!("  del remote : {}", summary.deleted_remote);
    println!("  del local  : {}", summary.deleted_local);
    println!("  conflicts  : {}", summary.conflicts);
    if summary.conflicts > 0 {
        println!();
        println!("  conflicts were saved as *.conflict files in the local tree;");
        println!("  merge them by hand, delete the artifacts, then sync again.");
    }
    Ok(())
}

fn scan_command(path: Option<PathBuf>) -> Result<()> {
    let root = match path {
        Some(path) => path.canonicalize()?,
        None => std::env::current_dir()?,
    };

    let cfg = SyncConfig {
        local_root: root.clone(),
        ..SyncConfig::default()
    };
    let matcher = IgnoreMatcher::load(&root, &cfg.ignore_file)?;
    let files = LocalScanner::new(&cfg, &matcher).scan()?;

    for (path, fp) in &files {
        println!("{path}\t{}\t{}", fp.mtime, fp.size);
    }
    info!("{} file(s), {} ignore pattern(s)", files.len(), matcher.pattern_count());
    Ok(())
}
