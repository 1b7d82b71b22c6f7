//! Per-run session identity and remote temp-file naming.
//!
//! Every remote temp file carries the session UUID so concurrent runs do
//! not collide and orphans from aborted runs can be swept by pattern.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Prefix shared by every remote temp file a session creates. The orphan
/// sweep matches on it, so new temp names must keep it.
const REMOTE_TEMP_PREFIX: &str = "sync_";

/// Identity and transient resources of one sync run.
#[derive(Debug, Clone)]
pub struct SyncSession {
    id: String,
    started: DateTime<Utc>,
    remote_tmp: String,
}

impl SyncSession {
    #[must_use]
    pub fn new(remote_tmp: &str) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            started: Utc::now(),
            remote_tmp: remote_tmp.trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// Remote path of the gzipped scan output.
    #[must_use]
    pub fn scan_file(&self) -> String {
        self.temp_path(&format!("scan_{}.tsv.gz", self.id))
    }

    /// Remote path for an uploaded push bundle. `index` distinguishes
    /// split batches within one session.
    #[must_use]
    pub fn push_bundle(&self, index: usize) -> String {
        self.temp_path(&format!("push_{}_{index}.tar.gz", self.id))
    }

    /// Remote path for a remote-packed pull bundle.
    #[must_use]
    pub fn pull_bundle(&self, index: usize) -> String {
        self.temp_path(&format!("pull_{}_{index}.tar.gz", self.id))
    }

    /// Remote path for the pull file-list.
    #[must_use]
    pub fn file_list(&self, index: usize) -> String {
        self.temp_path(&format!("filelist_{}_{index}.txt", self.id))
    }

    /// `find -name` glob matching every temp file any session leaves
    /// behind. The best-effort orphan sweep at session start matches
    /// against it.
    #[must_use]
    pub fn orphan_glob() -> String {
        format!("{REMOTE_TEMP_PREFIX}*")
    }

    fn temp_path(&self, name: &str) -> String {
        format!("{}/{REMOTE_TEMP_PREFIX}{name}", self.remote_tmp)
    }
}
