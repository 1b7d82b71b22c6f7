//! The sync orchestrator.
//!
//! Drives a session through its phases: scan both sides in parallel,
//! decide per path, execute conflicts then transfers then deletes, and
//! finalize state. A keep-alive task shares the session so drops are
//! noticed mid-transfer, and state/progress are flushed before every
//! phase transition so an interrupted run resumes cleanly.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::decide::{Decider, StateEffect};
use crate::error::{Result, SyncError};
use crate::executor::{Executor, Plan};
use crate::ignore::IgnoreMatcher;
use crate::progress::ProgressStore;
use crate::remote::{shell_quote, RemoteSession, SharedSession};
use crate::remote_scan;
use crate::report::{Reporter, ScanSide, SyncSummary};
use crate::retry::RetryPolicy;
use crate::scan::LocalScanner;
use crate::session::SyncSession;
use crate::state::StateStore;

/// Seconds between keep-alive heartbeats.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle of a session, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Init,
    Scanning,
    Deciding,
    ExecutingConflicts,
    ExecutingPushPull,
    ExecutingDeletes,
    Finalizing,
    Done,
    Aborted,
}

fn enter(phase: SessionPhase) {
    debug!("session phase: {phase:?}");
}

/// Run one full sync session over the given remote session.
///
/// Consumes the session and serializes all use of it (scans, transfers,
/// keep-alives) through one mutex. Returns the per-kind counters on
/// success; on any error, state and progress have already been flushed so
/// the next run resumes.
pub async fn run_sync<S>(
    session: S,
    config: &SyncConfig,
    reporter: &dyn Reporter,
) -> Result<SyncSummary>
where
    S: RemoteSession + 'static,
{
    enter(SessionPhase::Init);
    config.validate()?;

    let matcher = Arc::new(IgnoreMatcher::load(&config.local_root, &config.ignore_file)?);
    debug!("{} ignore pattern(s) loaded", matcher.pattern_count());

    check_existing_conflicts(config, reporter)?;

    let mut state = load_state(config, reporter)?;
    let run = SyncSession::new(&config.remote_tmp);
    let mut progress = open_progress(config, &run, reporter)?;
    if progress.resumable_count() > 0 {
        reporter.warn(&format!(
            "resuming previous session ({} path(s) already done)",
            progress.resumable_count()
        ));
    }

    let session: SharedSession<S> = Arc::new(Mutex::new(session));
    let policy = RetryPolicy::from_config(config);
    let keepalive = spawn_keepalive(Arc::clone(&session), policy);

    let result = drive(
        &session,
        config,
        &run,
        &matcher,
        &mut state,
        &mut progress,
        reporter,
        policy,
    )
    .await;

    keepalive.abort();

    if result.is_err() {
        enter(SessionPhase::Aborted);
        if !config.dry_run {
            // Flush whatever the failed phase left behind; the progress
            // file already records per-path outcomes.
            if let Err(err) = state.save() {
                reporter.error(&format!("could not flush state after failure: {err}"));
            }
            reporter.warn("progress saved; the next run will resume from the last checkpoint");
        }
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn drive<S: RemoteSession>(
    session: &SharedSession<S>,
    config: &SyncConfig,
    run: &SyncSession,
    matcher: &Arc<IgnoreMatcher>,
    state: &mut StateStore,
    progress: &mut ProgressStore,
    reporter: &dyn Reporter,
    policy: RetryPolicy,
) -> Result<SyncSummary> {
    sweep_orphans(session, config).await;

    // Fire the detached remote walk, then scan locally while it runs.
    enter(SessionPhase::Scanning);
    reporter.scan_started(ScanSide::Remote);
    remote_scan::launch(session, config, run, matcher).await?;

    reporter.scan_started(ScanSide::Local);
    let local_task = tokio::task::spawn_blocking({
        let config = config.clone();
        let matcher = Arc::clone(matcher);
        move || LocalScanner::new(&config, &matcher).scan()
    });

    let remote_files_raw = poll_with_reconnect(session, config, run).await?;
    let local_files = local_task
        .await
        .map_err(|err| SyncError::Local(std::io::Error::other(err)))??;
    reporter.scan_done(ScanSide::Local, local_files.len());

    // The prune is best-effort; the matcher is authoritative.
    let remote_files: std::collections::BTreeMap<_, _> = remote_files_raw
        .into_iter()
        .filter(|(path, _)| !matcher.matches(path))
        .collect();
    reporter.scan_done(ScanSide::Remote, remote_files.len());

    enter(SessionPhase::Deciding);
    let decider = Decider {
        threshold_secs: config.change_threshold_secs,
        push_only: config.push_only,
        pull_only: config.pull_only,
    };

    let mut keys: BTreeSet<String> = BTreeSet::new();
    keys.extend(local_files.keys().cloned());
    keys.extend(remote_files.keys().cloned());
    keys.extend(state.paths().map(str::to_string));

    let mut plan = Plan::default();
    for path in &keys {
        let verdict = decider.decide(
            path,
            local_files.get(path).copied(),
            remote_files.get(path).copied(),
            state.lookup(path),
        );
        if !config.dry_run {
            match verdict.state {
                StateEffect::Adopt(fp) => state.upsert(path, fp),
                StateEffect::Forget => state.remove(path),
                StateEffect::Keep => {}
            }
        }
        reporter.action_decided(&verdict.action);
        plan.add(verdict.action);
    }
    plan.drop_completed(progress);

    debug!(
        "plan: push={} pull={} del_remote={} del_local={} conflicts={} skipped={}",
        plan.pushes.len(),
        plan.pulls.len(),
        plan.delete_remote.len(),
        plan.delete_local.len(),
        plan.conflicts.len(),
        plan.skipped
    );

    let mut summary = SyncSummary {
        skipped: plan.skipped,
        ..SyncSummary::default()
    };

    if config.dry_run {
        summary.pushed = plan.pushes.len();
        summary.pulled = plan.pulls.len();
        summary.deleted_remote = plan.delete_remote.len();
        summary.deleted_local = plan.delete_local.len();
        summary.conflicts = plan.conflicts.len();
        remote_scan::cleanup(session, run).await;
        reporter.session_done(&summary);
        return Ok(summary);
    }

    let executor = Executor {
        session,
        config,
        run,
        policy,
        reporter,
    };

    // Conflict artifacts land on disk before any same-run mutation near
    // them; deletes come after transfers.
    enter(SessionPhase::ExecutingConflicts);
    summary.conflicts = executor.handle_conflicts(&plan.conflicts, state).await?;

    enter(SessionPhase::ExecutingPushPull);
    summary.pushed = executor.push_all(&plan.pushes, state, progress).await?;
    summary.pulled = executor.pull_all(&plan.pulls, state, progress).await?;

    enter(SessionPhase::ExecutingDeletes);
    summary.deleted_remote = executor
        .delete_remote_all(&plan.delete_remote, state, progress)
        .await?;
    summary.deleted_local = executor.delete_local_all(&plan.delete_local, state, progress)?;

    enter(SessionPhase::Finalizing);
    state.save()?;
    progress.clear()?;
    remote_scan::cleanup(session, run).await;

    enter(SessionPhase::Done);
    reporter.session_done(&summary);
    Ok(summary)
}

/// Poll the remote scan, retrying whole timed-out cycles after a
/// reconnect. The walk itself keeps running detached on the remote, so it
/// is never relaunched.
async fn poll_with_reconnect<S: RemoteSession>(
    session: &SharedSession<S>,
    config: &SyncConfig,
    run: &SyncSession,
) -> Result<std::collections::BTreeMap<String, crate::fingerprint::Fingerprint>> {
    let mut attempt = 0;
    loop {
        match remote_scan::poll(session, config, run).await {
            Ok(files) => return Ok(files),
            Err(err @ SyncError::ScanTimeout { .. }) => {
                attempt += 1;
                if attempt >= config.retry_max.max(1) {
                    return Err(err);
                }
                warn!("remote scan timed out, reconnecting and polling again: {err}");
                if let Err(rc) = session.lock().await.reconnect().await {
                    warn!("reconnect failed: {rc}");
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Purge leftover temp files of prior aborted runs. Best-effort; files
/// younger than two hours are left alone in case a concurrent session
/// owns them.
async fn sweep_orphans<S: RemoteSession>(session: &SharedSession<S>, config: &SyncConfig) {
    let tmp = config.remote_tmp.trim_end_matches('/');
    let cmd = format!(
        "find {} -maxdepth 1 -name '{}' -mmin +120 -delete 2>/dev/null",
        shell_quote(tmp),
        SyncSession::orphan_glob()
    );
    if let Err(err) = session.lock().await.exec(&cmd).await {
        debug!("orphan sweep failed (ignored): {err}");
    }
}

fn spawn_keepalive<S: RemoteSession + 'static>(
    session: SharedSession<S>,
    policy: RetryPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            let beat = session.lock().await.heartbeat().await;
            if let Err(err) = beat {
                warn!("heartbeat failed: {err}");
                let mut attempt = 0;
                while attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    match session.lock().await.reconnect().await {
                        Ok(()) => {
                            debug!("reconnected after heartbeat failure");
                            break;
                        }
                        Err(err) => {
                            attempt += 1;
                            warn!(
                                "reconnect attempt {attempt}/{} failed: {err}",
                                policy.max_attempts
                            );
                        }
                    }
                }
            }
        }
    })
}

/// Refuse to run over unresolved conflict artifacts unless forced.
fn check_existing_conflicts(config: &SyncConfig, reporter: &dyn Reporter) -> Result<()> {
    let mut leftovers = Vec::new();
    collect_conflict_files(&config.local_root, &mut leftovers);
    if leftovers.is_empty() {
        return Ok(());
    }
    for path in &leftovers {
        reporter.warn(&format!("unresolved conflict artifact: {path}"));
    }
    if config.force {
        reporter.warn("proceeding past conflict artifacts (--force)");
        return Ok(());
    }
    Err(SyncError::Config(format!(
        "{} unresolved conflict artifact(s) in the local tree; merge and delete them, or rerun with --force",
        leftovers.len()
    )))
}

fn collect_conflict_files(root: &std::path::Path, out: &mut Vec<String>) {
    let walker = ignore::WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .require_git(false)
        .filter_entry(|e| e.file_name() != ".git")
        .build();
    for entry in walker.flatten() {
        let name = entry.file_name().to_string_lossy();
        if name.contains(".conflict") && entry.path().is_file() {
            if let Ok(rel) = entry.path().strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    out.sort();
}

fn load_state(config: &SyncConfig, reporter: &dyn Reporter) -> Result<StateStore> {
    if config.force {
        return Ok(StateStore::empty(config.state_file()));
    }
    match StateStore::load(config.state_file()) {
        Ok(state) => Ok(state),
        Err(SyncError::StateCorruption(msg)) => {
            reporter.error(&format!(
                "state file unreadable ({msg}); rerun with --force to start from scratch"
            ));
            Err(SyncError::StateCorruption(msg))
        }
        Err(err) => Err(err),
    }
}

fn open_progress(
    config: &SyncConfig,
    run: &SyncSession,
    reporter: &dyn Reporter,
) -> Result<ProgressStore> {
    if config.force && !config.dry_run {
        return ProgressStore::begin_fresh(config.progress_file(), run);
    }
    match ProgressStore::begin(config.progress_file(), run) {
        Ok(progress) => Ok(progress),
        Err(SyncError::StateCorruption(msg)) => {
            reporter.error(&format!(
                "progress file unreadable ({msg}); rerun with --force to discard it"
            ));
            Err(SyncError::StateCorruption(msg))
        }
        Err(err) => Err(err),
    }
}
