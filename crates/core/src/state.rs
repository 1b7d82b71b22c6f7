//! Persistent last-synced state.
//!
//! One entry per path: the fingerprint both sides agreed on after the last
//! successful transfer or no-op match. On disk this is a tab-separated
//! file in the local root (`path \t mtime \t size`, no header, LF). An
//! older JSON-shaped file is read once and rewritten as TSV on next save.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Result, SyncError};
use crate::fingerprint::Fingerprint;

/// The `StateEntry` table, keyed by canonical relative path.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    entries: BTreeMap<String, Fingerprint>,
}

impl StateStore {
    /// An empty store that will save to `path`.
    #[must_use]
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Load the state file, tolerating the legacy JSON shape.
    ///
    /// A missing file yields an empty store. Individual unparseable lines
    /// are discarded with a warning; a file that is unreadable as a whole
    /// is [`SyncError::StateCorruption`].
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::empty(path));
            }
            Err(err) => {
                return Err(SyncError::StateCorruption(format!(
                    "cannot read {}: {err}",
                    path.display()
                )));
            }
        };

        let entries = if text.trim_start().starts_with('{') {
            parse_legacy_json(&text)
                .map_err(|err| SyncError::StateCorruption(format!("legacy JSON state: {err}")))?
        } else {
            parse_tsv(&text)
        };

        Ok(Self { path, entries })
    }

    /// Write the table as TSV via a sibling temp file and atomic rename.
    ///
    /// # Errors
    /// Returns [`SyncError::Local`] on I/O failure; the previous file is
    /// left intact in that case.
    pub fn save(&self) -> Result<()> {
        let mut out = String::new();
        for (path, fp) in &self.entries {
            out.push_str(&encode_path(path));
            out.push('\t');
            out.push_str(&fp.mtime.to_string());
            out.push('\t');
            out.push_str(&fp.size.to_string());
            out.push('\n');
        }
        write_atomic(&self.path, out.as_bytes())?;
        Ok(())
    }

    pub fn upsert(&mut self, path: &str, fp: Fingerprint) {
        self.entries.insert(path.to_string(), fp);
    }

    pub fn remove(&mut self, path: &str) {
        self.entries.remove(path);
    }

    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<Fingerprint> {
        self.entries.get(path).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Paths currently recorded, in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Write `data` to a sibling temp file and rename it over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

/// Quote a path for the TSV if it contains the delimiter or quote marks.
fn encode_path(path: &str) -> String {
    if path.contains('\t') || path.contains('\n') || path.contains('"') {
        format!("\"{}\"", path.replace('"', "\"\""))
    } else {
        path.to_string()
    }
}

fn parse_tsv(text: &str) -> BTreeMap<String, Fingerprint> {
    let mut entries = BTreeMap::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        match parse_tsv_line(line) {
            Some((path, fp)) => {
                entries.insert(path, fp);
            }
            None => warn!("discarding unparseable state line: {line:?}"),
        }
    }
    entries
}

fn parse_tsv_line(line: &str) -> Option<(String, Fingerprint)> {
    let (path, rest) = if let Some(quoted) = line.strip_prefix('"') {
        // Closing quote is the first `"` not doubled.
        let mut path = String::new();
        let mut chars = quoted.char_indices();
        let mut end = None;
        while let Some((i, ch)) = chars.next() {
            if ch == '"' {
                if quoted[i + 1..].starts_with('"') {
                    path.push('"');
                    chars.next();
                } else {
                    end = Some(i + 1);
                    break;
                }
            } else {
                path.push(ch);
            }
        }
        let rest = quoted[end?..].strip_prefix('\t')?;
        (path, rest)
    } else {
        let (path, rest) = line.split_once('\t')?;
        if path.is_empty() {
            return None;
        }
        (path.to_string(), rest)
    };

    let (mtime_raw, size_raw) = rest.split_once('\t')?;
    let mtime: f64 = mtime_raw.parse().ok()?;
    let size: u64 = size_raw.parse().ok()?;
    Some((path, Fingerprint::new(mtime, size)))
}

/// Parse the pre-TSV JSON map. Accepts both the flat
/// `{path: {mtime, size}}` shape and the older per-side
/// `{path: {lmtime, lsize, ...}}` one (local side wins there).
fn parse_legacy_json(text: &str) -> serde_json::Result<BTreeMap<String, Fingerprint>> {
    let doc: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
    let mut entries = BTreeMap::new();
    for (path, value) in doc {
        let mtime = value
            .get("mtime")
            .or_else(|| value.get("lmtime"))
            .and_then(serde_json::Value::as_f64);
        let size = value
            .get("size")
            .or_else(|| value.get("lsize"))
            .and_then(serde_json::Value::as_u64);
        match (mtime, size) {
            (Some(mtime), Some(size)) => {
                entries.insert(path, Fingerprint::new(mtime, size));
            }
            _ => warn!("discarding legacy state entry without fingerprint: {path:?}"),
        }
    }
    Ok(entries)
}
