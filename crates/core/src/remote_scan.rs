//! Remote directory scanner.
//!
//! The remote tree is enumerated by one detached `find` process so the
//! walk costs a single command instead of one SFTP round-trip per
//! directory. The process writes `path \t mtime \t size` lines plus a
//! terminal sentinel to a gzipped, session-unique temp file which the
//! client polls. Losing the control connection does not kill the walk.

use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::GzDecoder;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::fingerprint::{is_canonical_rel, Fingerprint};
use crate::ignore::IgnoreMatcher;
use crate::remote::{shell_quote, RemoteSession, SharedSession};
use crate::session::SyncSession;

/// Terminal line the remote walk appends on success.
pub const SCAN_SENTINEL: &str = "SCAN_DONE";

/// Build the fire-and-forget command that launches the remote walk.
///
/// The inner process is detached (`nohup … &`, streams redirected) so it
/// survives the invoking channel. Prune fragments from the ignore matcher
/// are spliced in front of `-type f` so heavy subtrees are never walked.
#[must_use]
pub fn launch_command(config: &SyncConfig, session: &SyncSession, matcher: &IgnoreMatcher) -> String {
    let inner = format!(
        "( find {root} {prunes} -type f -printf \"%P\\t%T@\\t%s\\n\" 2>/dev/null ; echo {SCAN_SENTINEL} ) | gzip -c > {out}",
        root = shell_quote(&config.remote_root),
        prunes = matcher.prune_expression(),
        out = shell_quote(&session.scan_file()),
    );
    format!("nohup sh -c {} >/dev/null 2>&1 &", shell_quote(&inner))
}

/// Fire the remote scan. Returns as soon as the launcher command does.
pub async fn launch<S: RemoteSession>(
    session: &SharedSession<S>,
    config: &SyncConfig,
    run: &SyncSession,
    matcher: &IgnoreMatcher,
) -> Result<()> {
    let cmd = launch_command(config, run, matcher);
    debug!("firing remote scan -> {}", run.scan_file());
    let out = session.lock().await.exec(&cmd).await?;
    if out.exit_code != 0 {
        return Err(SyncError::Remote {
            command: cmd,
            code: out.exit_code,
            stderr: out.stderr,
        });
    }
    Ok(())
}

/// Poll the scan output until the sentinel appears or the timeout
/// elapses.
///
/// A missing file or a partially written gzip counts as "not ready".
/// Transport faults trigger a reconnect and polling continues against the
/// same file; the walk itself is never relaunched here.
///
/// # Errors
/// [`SyncError::ScanTimeout`] when the sentinel is not observed in time.
pub async fn poll<S: RemoteSession>(
    session: &SharedSession<S>,
    config: &SyncConfig,
    run: &SyncSession,
) -> Result<BTreeMap<String, Fingerprint>> {
    let deadline = Instant::now() + config.poll_timeout();
    let scan_file = run.scan_file();
    let mut polls: u32 = 0;

    loop {
        if Instant::now() >= deadline {
            return Err(SyncError::ScanTimeout {
                timeout_secs: config.poll_timeout_secs,
                polls,
            });
        }
        polls += 1;

        match try_fetch(session, &scan_file).await {
            Ok(Some(files)) => {
                debug!("remote scan complete after {polls} poll(s)");
                return Ok(files);
            }
            Ok(None) => debug!("remote scan not ready (poll {polls})"),
            Err(err) if err.is_retryable() => {
                warn!("poll error, reconnecting: {err}");
                if let Err(rc) = session.lock().await.reconnect().await {
                    warn!("reconnect failed, will poll again: {rc}");
                }
            }
            Err(err) => return Err(err),
        }

        sleep(config.poll_interval()).await;
    }
}

/// Download and decode one snapshot of the scan file. `Ok(None)` means
/// the sentinel is not there yet.
async fn try_fetch<S: RemoteSession>(
    session: &SharedSession<S>,
    scan_file: &str,
) -> Result<Option<BTreeMap<String, Fingerprint>>> {
    let probe = format!("test -f {}", shell_quote(scan_file));
    let out = session.lock().await.exec(&probe).await?;
    if out.exit_code != 0 {
        return Ok(None);
    }

    let tmp = tempfile::NamedTempFile::new()?;
    match session.lock().await.download(scan_file, tmp.path()).await {
        Ok(()) => {}
        Err(err) if err.is_retryable() => return Err(err),
        // Lost a race with the writer; poll again.
        Err(_) => return Ok(None),
    }

    let compressed = std::fs::read(tmp.path())?;
    let mut text_bytes = Vec::new();
    if GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut text_bytes)
        .is_err()
    {
        // Still being written.
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&text_bytes);

    let (files, complete) = parse_scan_output(&text);
    Ok(complete.then_some(files))
}

/// Delete the remote scan file once consumed. Best-effort.
pub async fn cleanup<S: RemoteSession>(session: &SharedSession<S>, run: &SyncSession) {
    let cmd = format!("rm -f {}", shell_quote(&run.scan_file()));
    if let Err(err) = session.lock().await.exec(&cmd).await {
        debug!("scan file cleanup failed (ignored): {err}");
    }
}

/// Parse `find -printf "%P\t%T@\t%s\n"` output. Returns the parsed table
/// and whether the final line is the sentinel. Unparseable lines are
/// skipped.
#[must_use]
pub fn parse_scan_output(text: &str) -> (BTreeMap<String, Fingerprint>, bool) {
    let mut files = BTreeMap::new();
    let mut last_line = "";

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        last_line = line;
        if line == SCAN_SENTINEL {
            continue;
        }

        // mtime and size carry no tabs, so split from the right and let
        // the path keep any embedded ones.
        let mut fields = line.rsplitn(3, '\t');
        let (Some(size_raw), Some(mtime_raw), Some(path)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !is_canonical_rel(path) {
            continue;
        }
        let (Ok(size), Ok(mtime)) = (size_raw.parse::<u64>(), mtime_raw.parse::<f64>()) else {
            continue;
        };
        files.insert(path.to_string(), Fingerprint::new(mtime, size));
    }

    (files, last_line == SCAN_SENTINEL)
}
