//! File fingerprints: the (mtime, size) pair used to detect change
//! without reading file bytes.

use std::fs::Metadata;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

/// Cheap identity of a file's content at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Modification time, fractional seconds since the Unix epoch.
    pub mtime: f64,
    /// Size in bytes.
    pub size: u64,
}

impl Fingerprint {
    #[must_use]
    pub fn new(mtime: f64, size: u64) -> Self {
        Self { mtime, size }
    }

    /// Build a fingerprint from filesystem metadata.
    ///
    /// Files with a modification time before the epoch get mtime 0.
    #[must_use]
    pub fn from_metadata(meta: &Metadata) -> Self {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0.0, |d| d.as_secs_f64());
        Self {
            mtime,
            size: meta.len(),
        }
    }

    /// Whether this fingerprint differs from a previously recorded one.
    ///
    /// A file counts as changed when its size differs or its mtime moved
    /// by more than `threshold_secs`. The window absorbs coarse filesystem
    /// timestamp granularity and minor clock skew between the two sides.
    #[must_use]
    pub fn changed_since(&self, recorded: &Fingerprint, threshold_secs: f64) -> bool {
        self.size != recorded.size || (self.mtime - recorded.mtime).abs() > threshold_secs
    }

    /// Whether two observed fingerprints agree with each other under the
    /// same window rule. Used for adopt-on-first-sight.
    #[must_use]
    pub fn agrees_with(&self, other: &Fingerprint, threshold_secs: f64) -> bool {
        !self.changed_since(other, threshold_secs)
    }
}

/// Validates a relative path in canonical form: POSIX `/` separators, no
/// empty, `.` or `..` components, no leading or trailing slash.
#[must_use]
pub fn is_canonical_rel(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    if path.contains('\\') {
        return false;
    }
    path.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}
