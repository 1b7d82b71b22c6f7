//! Batched action execution.
//!
//! Converts the decided plan into the minimum number of network
//! operations: one tar.gz bundle per transfer batch, one `rm -f` per
//! delete batch, one download per conflict. Every completed path is
//! checkpointed in the progress store immediately; a failed batch marks
//! its paths failed and aborts without partial commits.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::decide::{Action, ActionKind};
use crate::error::{Result, SyncError};
use crate::fingerprint::Fingerprint;
use crate::progress::{ProgressStatus, ProgressStore};
use crate::remote::{shell_quote, ExecOutput, RemoteSession, SharedSession};
use crate::report::{Phase, Reporter};
use crate::retry::{with_session_retry, RetryPolicy};
use crate::session::SyncSession;
use crate::state::StateStore;

/// Decided actions grouped by executor phase.
#[derive(Debug, Default)]
pub struct Plan {
    pub conflicts: Vec<Action>,
    pub pushes: Vec<Action>,
    pub pulls: Vec<Action>,
    pub delete_remote: Vec<Action>,
    pub delete_local: Vec<Action>,
    pub skipped: usize,
}

impl Plan {
    /// Sort actions into phases. Deletion of anything under `.git` is
    /// refused outright, whatever stale state suggests.
    pub fn add(&mut self, action: Action) {
        match action.kind {
            ActionKind::Skip => self.skipped += 1,
            ActionKind::Conflict => self.conflicts.push(action),
            ActionKind::Push => self.pushes.push(action),
            ActionKind::Pull => self.pulls.push(action),
            ActionKind::DeleteRemote | ActionKind::DeleteLocal => {
                if action.path.contains(".git/") || action.path.ends_with("/.git") {
                    self.skipped += 1;
                } else if action.kind == ActionKind::DeleteRemote {
                    self.delete_remote.push(action);
                } else {
                    self.delete_local.push(action);
                }
            }
        }
    }

    /// Drop actions already checkpointed done in a matching direction.
    pub fn drop_completed(&mut self, progress: &ProgressStore) {
        for list in [
            &mut self.pushes,
            &mut self.pulls,
            &mut self.delete_remote,
            &mut self.delete_local,
        ] {
            list.retain(|a| {
                let done = progress.is_done(&a.path, a.kind);
                if done {
                    debug!("  [resume-skip] {}", a.path);
                }
                !done
            });
        }
    }

    #[must_use]
    pub fn total_actions(&self) -> usize {
        self.conflicts.len()
            + self.pushes.len()
            + self.pulls.len()
            + self.delete_remote.len()
            + self.delete_local.len()
    }
}

/// Executes one session's plan over a shared remote session.
pub struct Executor<'a, S: RemoteSession> {
    pub session: &'a SharedSession<S>,
    pub config: &'a SyncConfig,
    pub run: &'a SyncSession,
    pub policy: RetryPolicy,
    pub reporter: &'a dyn Reporter,
}

impl<'a, S: RemoteSession> Executor<'a, S> {
    /// Write conflict artifacts for every conflicting path.
    ///
    /// Only the remote copy is downloaded; the local file is never
    /// touched. Identical content on both sides is adopted as synced
    /// instead of producing artifacts. Artifact write failures degrade
    /// to warnings.
    pub async fn handle_conflicts(
        &self,
        conflicts: &[Action],
        state: &mut StateStore,
    ) -> Result<usize> {
        if conflicts.is_empty() {
            return Ok(0);
        }
        self.reporter.batch_started(Phase::Conflicts, conflicts.len());
        let mut materialized = 0;

        for action in conflicts {
            let reason = action.reason.as_deref().unwrap_or("both sides changed since last sync");
            let remote_path = format!("{}/{}", self.config.remote_root, action.path);
            let local_path = self.config.local_root.join(&action.path);

            let tmp = tempfile::NamedTempFile::new()?;
            self.download_with_retry("download conflicting file", &remote_path, tmp.path())
                .await?;

            let remote_bytes = std::fs::read(tmp.path())?;
            let local_bytes = match std::fs::read(&local_path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.reporter
                        .warn(&format!("cannot read local {} for conflict: {err}", action.path));
                    continue;
                }
            };
            if remote_bytes == local_bytes {
                // Same content on both sides, just divergent metadata.
                let meta = std::fs::metadata(&local_path)?;
                state.upsert(&action.path, Fingerprint::from_metadata(&meta));
                debug!("  [conflict-skip] {} content identical", action.path);
                continue;
            }

            let token = Utc::now().format("%Y%m%dT%H%M%SZ");
            let copy_name = format!("{}.remote.{token}.conflict", action.path);
            let info_name = format!("{}.{token}.conflict-info", action.path);

            if let Err(err) = self.write_conflict_artifacts(
                action,
                reason,
                &remote_bytes,
                &self.config.local_root.join(&copy_name),
                &self.config.local_root.join(&info_name),
                &remote_path,
            ) {
                self.reporter
                    .warn(&format!("could not write conflict artifacts for {}: {err}", action.path));
                continue;
            }

            self.reporter.conflict(&action.path, reason);
            materialized += 1;
        }

        self.reporter.batch_done(Phase::Conflicts, conflicts.len());
        Ok(materialized)
    }

    fn write_conflict_artifacts(
        &self,
        action: &Action,
        reason: &str,
        remote_bytes: &[u8],
        copy_path: &Path,
        info_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        std::fs::write(copy_path, remote_bytes)?;

        let describe = |fp: Option<Fingerprint>| match fp {
            Some(fp) => format!("mtime={:.3} size={}", fp.mtime, fp.size),
            None => "missing".to_string(),
        };
        let info = format!(
            "SYNC CONFLICT\n\
             file   : {path}\n\
             local  : {local_root}/{path} ({local})\n\
             remote : {user}@{server}:{port}:{remote_path} ({remote})\n\
             \n\
             reason:\n  {reason}\n\
             \n\
             remote copy saved as:\n  {copy}\n\
             \n\
             to resolve:\n\
             \x20 1. merge the remote copy into the local file by hand\n\
             \x20 2. delete the .conflict and .conflict-info files\n\
             \x20 3. run the sync again\n",
            path = action.path,
            local_root = self.config.local_root.display(),
            local = describe(action.local),
            user = self.config.username,
            server = self.config.server,
            port = self.config.port,
            remote = describe(action.remote),
            copy = copy_path.display(),
        );
        std::fs::write(info_path, info)?;
        Ok(())
    }

    /// Push all planned paths, splitting into bundles above the
    /// high-water mark.
    pub async fn push_all(
        &self,
        pushes: &[Action],
        state: &mut StateStore,
        progress: &mut ProgressStore,
    ) -> Result<usize> {
        let mut done = 0;
        for (index, batch) in split_batches(pushes, self.config.batch_high_water).enumerate() {
            self.reporter.batch_started(Phase::Push, batch.len());
            self.push_batch(index, batch, state, progress).await?;
            self.reporter.batch_done(Phase::Push, batch.len());
            done += batch.len();
        }
        Ok(done)
    }

    async fn push_batch(
        &self,
        index: usize,
        batch: &[Action],
        state: &mut StateStore,
        progress: &mut ProgressStore,
    ) -> Result<()> {
        let bundle = self.build_push_bundle(batch)?;
        let remote_bundle = self.run.push_bundle(index);

        let result = self.push_transfer(&bundle, &remote_bundle).await;
        if let Err(err) = result {
            for action in batch {
                progress.record(&action.path, ActionKind::Push, ProgressStatus::Failed)?;
            }
            return Err(err);
        }

        for action in batch {
            let meta = std::fs::metadata(self.config.local_root.join(&action.path))?;
            state.upsert(&action.path, Fingerprint::from_metadata(&meta));
            progress.record(&action.path, ActionKind::Push, ProgressStatus::Done)?;
        }
        state.save()?;
        Ok(())
    }

    /// Pack the batch into a local tar.gz. Entries are written in sorted
    /// order so bundle contents are deterministic.
    fn build_push_bundle(&self, batch: &[Action]) -> Result<tempfile::NamedTempFile> {
        let tmp = tempfile::NamedTempFile::new()?;
        let encoder = GzEncoder::new(tmp.reopen()?, Compression::new(6));
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(true);

        let mut paths: Vec<&str> = batch.iter().map(|a| a.path.as_str()).collect();
        paths.sort_unstable();
        for path in paths {
            builder.append_path_with_name(self.config.local_root.join(path), path)?;
        }
        builder.into_inner()?.finish()?.flush()?;
        Ok(tmp)
    }

    async fn push_transfer(&self, bundle: &tempfile::NamedTempFile, remote_bundle: &str) -> Result<()> {
        self.upload_with_retry("upload push bundle", bundle.path(), remote_bundle)
            .await?;

        let extract = format!(
            "cd {root} && tar xzf {bundle} --no-same-owner && rm -f {bundle}",
            root = shell_quote(&self.config.remote_root),
            bundle = shell_quote(remote_bundle),
        );
        let out = self.exec_with_retry("extract push bundle", &extract).await?;
        check_exit(&extract, &out)
    }

    /// Pull all planned paths, splitting like pushes.
    pub async fn pull_all(
        &self,
        pulls: &[Action],
        state: &mut StateStore,
        progress: &mut ProgressStore,
    ) -> Result<usize> {
        let mut done = 0;
        for (index, batch) in split_batches(pulls, self.config.batch_high_water).enumerate() {
            self.reporter.batch_started(Phase::Pull, batch.len());
            done += self.pull_batch(index, batch, state, progress).await?;
            self.reporter.batch_done(Phase::Pull, batch.len());
        }
        Ok(done)
    }

    async fn pull_batch(
        &self,
        index: usize,
        batch: &[Action],
        state: &mut StateStore,
        progress: &mut ProgressStore,
    ) -> Result<usize> {
        let remote_bundle = self.run.pull_bundle(index);
        let file_list = self.run.file_list(index);

        let result = self.pull_transfer(batch, &remote_bundle, &file_list).await;
        // Remote temps are this executor's to clean up, success or not.
        let cleanup = format!(
            "rm -f {} {}",
            shell_quote(&remote_bundle),
            shell_quote(&file_list)
        );
        if let Err(err) = self.session.lock().await.exec(&cleanup).await {
            debug!("pull temp cleanup failed (ignored): {err}");
        }

        if let Err(err) = result {
            for action in batch {
                progress.record(&action.path, ActionKind::Pull, ProgressStatus::Failed)?;
            }
            return Err(err);
        }

        let mut done = 0;
        for action in batch {
            let local = self.config.local_root.join(&action.path);
            match std::fs::metadata(&local) {
                Ok(meta) => {
                    state.upsert(&action.path, Fingerprint::from_metadata(&meta));
                    progress.record(&action.path, ActionKind::Pull, ProgressStatus::Done)?;
                    done += 1;
                }
                Err(_) => {
                    // The remote side dropped it between scan and pack.
                    self.reporter
                        .warn(&format!("pulled bundle did not contain {}", action.path));
                    progress.record(&action.path, ActionKind::Pull, ProgressStatus::Failed)?;
                }
            }
        }
        state.save()?;
        Ok(done)
    }

    async fn pull_transfer(
        &self,
        batch: &[Action],
        remote_bundle: &str,
        file_list: &str,
    ) -> Result<()> {
        // Ship the path list as a file to sidestep ARG_MAX and quoting.
        let mut paths: Vec<&str> = batch.iter().map(|a| a.path.as_str()).collect();
        paths.sort_unstable();
        let mut list = tempfile::NamedTempFile::new()?;
        for path in &paths {
            writeln!(list, "{path}")?;
        }
        list.flush()?;

        self.upload_with_retry("upload pull file list", list.path(), file_list)
            .await?;

        let pack = format!(
            "cd {root} && tar czf {bundle} --no-recursion --ignore-failed-read -T {list}",
            root = shell_quote(&self.config.remote_root),
            bundle = shell_quote(remote_bundle),
            list = shell_quote(file_list),
        );
        let out = self.exec_with_retry("pack pull bundle", &pack).await?;
        check_exit(&pack, &out)?;

        let tmp = tempfile::NamedTempFile::new()?;
        self.download_with_retry("download pull bundle", remote_bundle, tmp.path())
            .await?;

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(tmp.path())?));
        archive.set_preserve_mtime(true);
        archive.unpack(&self.config.local_root)?;
        Ok(())
    }

    /// Delete remote paths with one `rm -f` per chunk, falling back to
    /// per-path deletes when the batch fails.
    pub async fn delete_remote_all(
        &self,
        deletes: &[Action],
        state: &mut StateStore,
        progress: &mut ProgressStore,
    ) -> Result<usize> {
        if deletes.is_empty() {
            return Ok(0);
        }
        let mut done = 0;
        for batch in split_batches(deletes, self.config.batch_high_water) {
            self.reporter.batch_started(Phase::DeleteRemote, batch.len());

            let quoted: Vec<String> = batch
                .iter()
                .map(|a| shell_quote(&format!("{}/{}", self.config.remote_root, a.path)))
                .collect();
            let cmd = format!("rm -f {}", quoted.join(" "));
            let batch_ok = match self.exec_with_retry("batch remote delete", &cmd).await {
                Ok(out) => check_exit(&cmd, &out).is_ok(),
                Err(_) => false,
            };

            if batch_ok {
                for action in batch {
                    state.remove(&action.path);
                    progress.record(&action.path, ActionKind::DeleteRemote, ProgressStatus::Done)?;
                    done += 1;
                }
            } else {
                warn!("batch remote delete failed; retrying one by one");
                for action in batch {
                    let cmd = format!(
                        "rm -f {}",
                        shell_quote(&format!("{}/{}", self.config.remote_root, action.path))
                    );
                    match self.exec_with_retry("remote delete", &cmd).await {
                        Ok(out) if out.exit_code == 0 => {
                            state.remove(&action.path);
                            progress.record(&action.path, ActionKind::DeleteRemote, ProgressStatus::Done)?;
                            done += 1;
                        }
                        _ => {
                            self.reporter
                                .warn(&format!("could not delete remote {}", action.path));
                            progress.record(&action.path, ActionKind::DeleteRemote, ProgressStatus::Failed)?;
                        }
                    }
                }
            }

            state.save()?;
            self.reporter.batch_done(Phase::DeleteRemote, batch.len());
        }
        Ok(done)
    }

    /// Delete local paths that the remote side removed.
    pub fn delete_local_all(
        &self,
        deletes: &[Action],
        state: &mut StateStore,
        progress: &mut ProgressStore,
    ) -> Result<usize> {
        if deletes.is_empty() {
            return Ok(0);
        }
        self.reporter.batch_started(Phase::DeleteLocal, deletes.len());
        let mut done = 0;
        for action in deletes {
            let path = self.config.local_root.join(&action.path);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    self.reporter
                        .warn(&format!("could not delete local {}: {err}", action.path));
                    progress.record(&action.path, ActionKind::DeleteLocal, ProgressStatus::Failed)?;
                    continue;
                }
            }
            state.remove(&action.path);
            progress.record(&action.path, ActionKind::DeleteLocal, ProgressStatus::Done)?;
            done += 1;
        }
        state.save()?;
        self.reporter.batch_done(Phase::DeleteLocal, deletes.len());
        Ok(done)
    }

    async fn exec_with_retry(&self, what: &str, cmd: &str) -> Result<ExecOutput> {
        with_session_retry(&self.policy, self.session, what, || {
            let cmd = cmd.to_string();
            async move { self.session.lock().await.exec(&cmd).await }
        })
        .await
    }

    async fn upload_with_retry(&self, what: &str, local: &Path, remote: &str) -> Result<()> {
        with_session_retry(&self.policy, self.session, what, || {
            let local = local.to_path_buf();
            let remote = remote.to_string();
            async move { self.session.lock().await.upload(&local, &remote).await }
        })
        .await
    }

    async fn download_with_retry(&self, what: &str, remote: &str, local: &Path) -> Result<()> {
        with_session_retry(&self.policy, self.session, what, || {
            let remote = remote.to_string();
            let local = local.to_path_buf();
            async move { self.session.lock().await.download(&remote, &local).await }
        })
        .await
    }
}

fn check_exit(command: &str, out: &ExecOutput) -> Result<()> {
    if out.exit_code == 0 {
        Ok(())
    } else {
        Err(SyncError::Remote {
            command: command.to_string(),
            code: out.exit_code,
            stderr: out.stderr.clone(),
        })
    }
}

/// Split actions into chunks of roughly equal size, none larger than
/// `high_water`.
fn split_batches(actions: &[Action], high_water: usize) -> impl Iterator<Item = &[Action]> {
    let chunk = if actions.is_empty() {
        high_water.max(1)
    } else {
        let batches = actions.len().div_ceil(high_water.max(1));
        actions.len().div_ceil(batches)
    };
    actions.chunks(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    fn action(kind: ActionKind, path: &str) -> Action {
        Action {
            kind,
            path: path.to_string(),
            local: Some(Fingerprint::new(1.0, 1)),
            remote: None,
            reason: None,
        }
    }

    #[test]
    fn plan_groups_by_phase() {
        let mut plan = Plan::default();
        plan.add(action(ActionKind::Push, "a"));
        plan.add(action(ActionKind::Pull, "b"));
        plan.add(action(ActionKind::Conflict, "c"));
        plan.add(action(ActionKind::DeleteRemote, "d"));
        plan.add(action(ActionKind::DeleteLocal, "e"));
        plan.add(action(ActionKind::Skip, "f"));

        assert_eq!(plan.pushes.len(), 1);
        assert_eq!(plan.pulls.len(), 1);
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.delete_remote.len(), 1);
        assert_eq!(plan.delete_local.len(), 1);
        assert_eq!(plan.skipped, 1);
        assert_eq!(plan.total_actions(), 5);
    }

    #[test]
    fn git_paths_are_never_deleted() {
        let mut plan = Plan::default();
        plan.add(action(ActionKind::DeleteRemote, "sub/.git/config"));
        plan.add(action(ActionKind::DeleteLocal, "vendor/.git"));
        assert!(plan.delete_remote.is_empty());
        assert!(plan.delete_local.is_empty());
        assert_eq!(plan.skipped, 2);
    }

    #[test]
    fn batches_split_roughly_equally() {
        let actions: Vec<Action> = (0..250)
            .map(|i| action(ActionKind::Push, &format!("f{i:03}")))
            .collect();
        let sizes: Vec<usize> = split_batches(&actions, 100).map(<[Action]>::len).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 250);
        assert!(sizes.iter().all(|&s| s <= 100));
        assert_eq!(sizes.len(), 3);
        // Roughly equal: largest and smallest differ by at most the
        // remainder of one chunk.
        assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 84);
    }

    #[test]
    fn small_sets_stay_in_one_batch() {
        let actions: Vec<Action> = (0..5)
            .map(|i| action(ActionKind::Push, &format!("f{i}")))
            .collect();
        let sizes: Vec<usize> = split_batches(&actions, 100).map(<[Action]>::len).collect();
        assert_eq!(sizes, vec![5]);
    }
}
