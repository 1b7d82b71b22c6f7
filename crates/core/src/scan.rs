//! Local directory scanner.
//!
//! Walks the local root and produces a fingerprint per regular file,
//! filtering through the ignore matcher. Bookkeeping files (state,
//! progress, the ignore file itself) and conflict artifacts are never
//! emitted, and `.git` contents are excluded to mirror the remote prune.

use std::collections::BTreeMap;
use std::path::Path;

use ignore::WalkBuilder;
use tracing::warn;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::ignore::IgnoreMatcher;

/// Scanner over the local root.
pub struct LocalScanner<'a> {
    root: &'a Path,
    matcher: &'a IgnoreMatcher,
    skip_names: Vec<String>,
}

impl<'a> LocalScanner<'a> {
    #[must_use]
    pub fn new(config: &'a SyncConfig, matcher: &'a IgnoreMatcher) -> Self {
        let skip_names = vec![
            file_name(&config.state_file()),
            file_name(&config.progress_file()),
            config.ignore_file.clone(),
        ];
        Self {
            root: &config.local_root,
            matcher,
            skip_names,
        }
    }

    /// Walk the tree and fingerprint every syncable file.
    ///
    /// Symlinks are followed only when the target is a regular file;
    /// broken links are skipped with a warning. Unreadable entries are
    /// skipped likewise rather than aborting the scan.
    pub fn scan(&self) -> Result<BTreeMap<String, Fingerprint>> {
        let mut files = BTreeMap::new();

        let walker = WalkBuilder::new(self.root)
            .hidden(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .follow_links(false)
            .filter_entry(|e| e.file_name() != ".git")
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("scan: skipping unreadable entry: {err}");
                    continue;
                }
            };
            let path = entry.path();
            if path == self.root {
                continue;
            }

            // One metadata query per entry; follows symlinks.
            let meta = match std::fs::metadata(path) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!("scan: skipping {} (broken link?): {err}", path.display());
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }

            let Ok(rel) = path.strip_prefix(self.root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.contains(".conflict") {
                continue;
            }
            if !rel.contains('/') && self.skip_names.iter().any(|s| *s == rel) {
                continue;
            }
            if self.matcher.matches(&rel) {
                continue;
            }

            files.insert(rel, Fingerprint::from_metadata(&meta));
        }

        Ok(files)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config(root: &Path) -> SyncConfig {
        SyncConfig {
            local_root: root.to_path_buf(),
            remote_root: "/srv/p".into(),
            server: "host".into(),
            username: "u".into(),
            ..SyncConfig::default()
        }
    }

    fn scan(root: &Path, ignore_lines: &[&str]) -> BTreeMap<String, Fingerprint> {
        let cfg = config(root);
        let matcher = IgnoreMatcher::from_lines(root, ignore_lines.iter().copied());
        LocalScanner::new(&cfg, &matcher).scan().unwrap()
    }

    #[test]
    fn finds_nested_files_with_posix_paths() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        fs::write(dir.path().join("root.txt"), "r").unwrap();
        fs::write(dir.path().join("sub/deep/leaf.txt"), "leaf").unwrap();

        let files = scan(dir.path(), &[]);
        assert!(files.contains_key("root.txt"));
        assert!(files.contains_key("sub/deep/leaf.txt"));
        assert_eq!(files["sub/deep/leaf.txt"].size, 4);
    }

    #[test]
    fn respects_ignore_patterns() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.txt"), "k").unwrap();
        fs::write(dir.path().join("skip.log"), "s").unwrap();

        let files = scan(dir.path(), &["*.log"]);
        assert!(files.contains_key("keep.txt"));
        assert!(!files.contains_key("skip.log"));
    }

    #[test]
    fn bookkeeping_files_are_not_emitted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".sync_state.csv"), "x\t1\t1\n").unwrap();
        fs::write(dir.path().join(".sync_progress.json"), "{}").unwrap();
        fs::write(dir.path().join(".dsignore"), "*.log\n").unwrap();
        fs::write(dir.path().join("data.txt"), "d").unwrap();

        let files = scan(dir.path(), &[]);
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["data.txt"]);
    }

    #[test]
    fn conflict_artifacts_are_not_emitted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("a.txt.remote.20250101T000000Z.conflict"), "r").unwrap();
        fs::write(dir.path().join("a.txt.20250101T000000Z.conflict-info"), "i").unwrap();

        let files = scan(dir.path(), &[]);
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["a.txt"]);
    }

    #[test]
    fn git_contents_are_excluded() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join(".git/objects/aa"), "blob").unwrap();
        fs::write(dir.path().join("tracked.txt"), "t").unwrap();

        let files = scan(dir.path(), &[]);
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["tracked.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_followed_only_to_regular_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("target.txt"), "t").unwrap();
        std::os::unix::fs::symlink(dir.path().join("target.txt"), dir.path().join("link.txt"))
            .unwrap();
        std::os::unix::fs::symlink(PathBuf::from("/nonexistent"), dir.path().join("broken.txt"))
            .unwrap();

        let files = scan(dir.path(), &[]);
        assert!(files.contains_key("target.txt"));
        assert!(files.contains_key("link.txt"));
        assert!(!files.contains_key("broken.txt"));
    }
}
