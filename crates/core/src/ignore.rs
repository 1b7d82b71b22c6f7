//! Ignore-pattern matching and remote pre-pruning.
//!
//! Patterns come from an ignore file in the local root (gitignore-style
//! globs, `#` comments, `!` negation, last match wins). The matcher is the
//! authoritative filter on both sides; it also emits `find` prune
//! fragments so the remote walk skips heavy subtrees entirely.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::warn;

use crate::error::Result;

/// Compiled ignore rules plus the raw lines they came from.
pub struct IgnoreMatcher {
    matcher: Gitignore,
    raw_lines: Vec<String>,
}

impl IgnoreMatcher {
    /// Load patterns from `root/file_name`. A missing file yields an
    /// empty matcher; malformed lines are warned and skipped.
    ///
    /// # Errors
    /// Returns an error only for an unreadable (existing) file.
    pub fn load(root: &Path, file_name: &str) -> Result<Self> {
        let path = root.join(file_name);
        if !path.exists() {
            return Ok(Self::from_lines(root, std::iter::empty::<&str>()));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Self::from_lines(root, content.lines()))
    }

    /// Build a matcher from pattern lines.
    pub fn from_lines<I, S>(root: &Path, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GitignoreBuilder::new(root);
        let mut raw_lines = Vec::new();
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Err(err) = builder.add_line(None, line) {
                warn!("skipping malformed ignore pattern {line:?}: {err}");
                continue;
            }
            raw_lines.push(line.to_string());
        }
        let matcher = builder.build().unwrap_or_else(|err| {
            warn!("ignore patterns unusable, matching nothing: {err}");
            Gitignore::empty()
        });
        Self { matcher, raw_lines }
    }

    /// Whether the given canonical relative path is excluded from sync.
    #[must_use]
    pub fn matches(&self, rel_path: &str) -> bool {
        self.matcher
            .matched_path_or_any_parents(rel_path, false)
            .is_ignore()
    }

    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.raw_lines.len()
    }

    /// `find` expression fragments pruning whole subtrees on the remote.
    ///
    /// Only cheaply translatable shapes are emitted; everything else is
    /// caught by [`matches`](Self::matches) on the returned paths.
    /// `.git` contents are always pruned.
    #[must_use]
    pub fn remote_prune_args(&self) -> Vec<String> {
        let mut name_prunes = Vec::new();
        let mut path_prunes = Vec::new();

        for line in &self.raw_lines {
            if line.starts_with('!') {
                continue; // re-includes need the full matcher
            }
            if let Some(tail) = line.strip_prefix("**/") {
                if tail.is_empty() {
                    continue;
                }
                if tail.contains('/') {
                    path_prunes.push(format!("-path \"*/{tail}\""));
                } else {
                    name_prunes.push(format!("-name \"{tail}\""));
                }
            } else if !line.contains('/') {
                name_prunes.push(format!("-name \"{line}\""));
            } else if line.starts_with("*/") {
                path_prunes.push(format!("-path \"{line}\""));
            } else if let Some(tail) = line.strip_prefix("./") {
                path_prunes.push(format!("-path \"*/{tail}\""));
            } else if let Some(tail) = line.strip_suffix("/**") {
                let tail = tail.strip_prefix("./").unwrap_or(tail);
                if !tail.is_empty() {
                    path_prunes.push(format!("-path \"*/{tail}\""));
                }
            }
            // Leading-slash and other complex shapes fall through to the
            // client-side filter.
        }

        path_prunes.push("-path \"*/.git/*\"".to_string());
        name_prunes.into_iter().chain(path_prunes).collect()
    }

    /// Full prune expression spliced in front of `-type f` in the remote
    /// walk, shell-escaped for an inner `sh -c` level.
    #[must_use]
    pub fn prune_expression(&self) -> String {
        let fragments = self.remote_prune_args();
        let parts: Vec<String> = fragments
            .iter()
            .map(|frag| format!(r"\( {frag} -prune \)"))
            .collect();
        format!(r"\( {} \) -o", parts.join(" -o "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn matcher(lines: &[&str]) -> IgnoreMatcher {
        IgnoreMatcher::from_lines(&PathBuf::from("/tmp/sync-test"), lines.iter().copied())
    }

    #[test]
    fn glob_matches_any_segment() {
        let m = matcher(&["*.log"]);
        assert!(m.matches("debug.log"));
        assert!(m.matches("logs/app/debug.log"));
        assert!(!m.matches("debug.txt"));
    }

    #[test]
    fn directory_pattern_matches_contents() {
        let m = matcher(&["node_modules/"]);
        assert!(m.matches("node_modules/pkg/index.js"));
        assert!(!m.matches("src/main.rs"));
    }

    #[test]
    fn negation_reincludes_and_last_match_wins() {
        let m = matcher(&["*.env", "!keep.env"]);
        assert!(m.matches("secret.env"));
        assert!(!m.matches("keep.env"));
    }

    #[test]
    fn double_star_spans_directories() {
        let m = matcher(&["**/target/classes"]);
        assert!(m.matches("service/target/classes/A.class"));
        assert!(!m.matches("service/target/sources/A.java"));
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let m = matcher(&["good.txt", "bad[", "also-good.txt"]);
        assert!(m.matches("good.txt"));
        assert!(m.matches("also-good.txt"));
        assert_eq!(m.pattern_count(), 2);
    }

    #[test]
    fn blank_and_comment_lines_ignored() {
        let m = matcher(&["", "# a comment", "*.tmp"]);
        assert_eq!(m.pattern_count(), 1);
        assert!(m.matches("x.tmp"));
    }

    #[test]
    fn prune_fragment_shapes() {
        let m = matcher(&[
            "*.jar",
            "**/node_modules",
            "**/target/classes",
            "./build",
            "dist/**",
            "!keep.jar",
        ]);
        let args = m.remote_prune_args();
        assert!(args.contains(&r#"-name "*.jar""#.to_string()));
        assert!(args.contains(&r#"-name "node_modules""#.to_string()));
        assert!(args.contains(&r#"-path "*/target/classes""#.to_string()));
        assert!(args.contains(&r#"-path "*/build""#.to_string()));
        assert!(args.contains(&r#"-path "*/dist""#.to_string()));
        // .git is always pruned, negations never are
        assert!(args.contains(&r#"-path "*/.git/*""#.to_string()));
        assert!(!args.iter().any(|a| a.contains("keep.jar")));
    }

    #[test]
    fn prune_expression_wraps_fragments() {
        let m = matcher(&["*.jar"]);
        let expr = m.prune_expression();
        assert!(expr.starts_with(r"\( "));
        assert!(expr.ends_with(r"\) -o"));
        assert!(expr.contains(r#"-name "*.jar" -prune"#));
    }

    #[test]
    fn empty_matcher_matches_nothing() {
        let m = matcher(&[]);
        assert!(!m.matches("anything/at/all.txt"));
        assert_eq!(m.pattern_count(), 0);
    }
}
