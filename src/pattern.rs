//! Exclude and include pattern compilation
//!
//! Patterns use glob syntax matched against `/`-rooted tree paths:
//!
//! - `*` and `?` never cross a `/`; `**` spans any number of components
//! - a pattern starting with `/` is anchored at the snapshot root
//! - any other pattern may match at any depth (`foo` behaves like `**/foo`)
//! - a pattern that matches a directory also matches everything below it
//!
//! Each option group compiles into at most two predicates: one for the
//! case-sensitive patterns (inline plus those read from files) and one for
//! the case-insensitive patterns. Groups without patterns yield nothing.

use crate::error::{Result, RestoreError};
use globset::{Glob, GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Returns true if the path should be excluded
pub type RejectPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Returns `(selected, child_may_match)` for a path
pub type IncludePredicate = Arc<dyn Fn(&str) -> (bool, bool) + Send + Sync>;

/// Exclude pattern sources
#[derive(Debug, Clone, Default)]
pub struct ExcludePatternOptions {
    /// Case-sensitive patterns
    pub excludes: Vec<String>,
    /// Case-insensitive patterns
    pub insensitive_excludes: Vec<String>,
    /// Files with one case-sensitive pattern per line
    pub exclude_files: Vec<PathBuf>,
    /// Files with one case-insensitive pattern per line
    pub insensitive_exclude_files: Vec<PathBuf>,
}

impl ExcludePatternOptions {
    /// Whether any exclude source was given
    pub fn is_empty(&self) -> bool {
        self.excludes.is_empty()
            && self.insensitive_excludes.is_empty()
            && self.exclude_files.is_empty()
            && self.insensitive_exclude_files.is_empty()
    }

    /// Compile the configured patterns into reject predicates
    pub fn collect_patterns(&self) -> Result<Vec<RejectPredicate>> {
        let mut predicates: Vec<RejectPredicate> = Vec::new();

        let sensitive = gather(&self.excludes, &self.exclude_files)?;
        if !sensitive.is_empty() {
            let set = PatternSet::compile(&sensitive, false)?;
            predicates.push(Arc::new(move |path: &str| set.matches(path)));
        }

        let insensitive = gather(&self.insensitive_excludes, &self.insensitive_exclude_files)?;
        if !insensitive.is_empty() {
            let set = PatternSet::compile(&insensitive, true)?;
            predicates.push(Arc::new(move |path: &str| set.matches(path)));
        }

        debug!("Compiled {} exclude predicate(s)", predicates.len());
        Ok(predicates)
    }
}

/// Include pattern sources
#[derive(Debug, Clone, Default)]
pub struct IncludePatternOptions {
    /// Case-sensitive patterns
    pub includes: Vec<String>,
    /// Case-insensitive patterns
    pub insensitive_includes: Vec<String>,
    /// Files with one case-sensitive pattern per line
    pub include_files: Vec<PathBuf>,
    /// Files with one case-insensitive pattern per line
    pub insensitive_include_files: Vec<PathBuf>,
}

impl IncludePatternOptions {
    /// Whether any include source was given
    pub fn is_empty(&self) -> bool {
        self.includes.is_empty()
            && self.insensitive_includes.is_empty()
            && self.include_files.is_empty()
            && self.insensitive_include_files.is_empty()
    }

    /// Compile the configured patterns into include predicates
    pub fn collect_patterns(&self) -> Result<Vec<IncludePredicate>> {
        let mut predicates: Vec<IncludePredicate> = Vec::new();

        let sensitive = gather(&self.includes, &self.include_files)?;
        if !sensitive.is_empty() {
            let set = PatternSet::compile(&sensitive, false)?;
            predicates.push(Arc::new(move |path: &str| (set.matches(path), set.child_may_match(path))));
        }

        let insensitive = gather(&self.insensitive_includes, &self.insensitive_include_files)?;
        if !insensitive.is_empty() {
            let set = PatternSet::compile(&insensitive, true)?;
            predicates.push(Arc::new(move |path: &str| (set.matches(path), set.child_may_match(path))));
        }

        debug!("Compiled {} include predicate(s)", predicates.len());
        Ok(predicates)
    }
}

/// Inline patterns followed by the contents of each pattern file
fn gather(inline: &[String], files: &[PathBuf]) -> Result<Vec<String>> {
    let mut patterns: Vec<String> = inline
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    for file in files {
        patterns.extend(read_pattern_file(file)?);
    }
    Ok(patterns)
}

/// Read patterns from a file, one per line
///
/// Blank lines and lines starting with `#` are skipped.
pub fn read_pattern_file(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).map_err(|source| RestoreError::PatternFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

/// A compiled group of patterns sharing one case mode
pub struct PatternSet {
    set: GlobSet,
    /// Per-pattern component matchers, `None` for patterns with `**`
    components: Vec<Option<Vec<GlobMatcher>>>,
}

impl PatternSet {
    /// Compile patterns; fails on the first invalid one
    pub fn compile(patterns: &[String], case_insensitive: bool) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut components = Vec::with_capacity(patterns.len());

        for raw in patterns {
            let normalized = normalize(raw);
            builder.add(build_glob(raw, &normalized, case_insensitive)?);

            if normalized.contains("**") {
                components.push(None);
            } else {
                let parts = normalized
                    .split('/')
                    .filter(|c| !c.is_empty())
                    .map(|c| build_glob(raw, c, case_insensitive).map(|g| g.compile_matcher()))
                    .collect::<Result<Vec<_>>>()?;
                components.push(Some(parts));
            }
        }

        let set = builder.build().map_err(|e| RestoreError::InvalidPattern {
            pattern: patterns.join(", "),
            reason: e.to_string(),
        })?;

        Ok(Self { set, components })
    }

    /// Whether the path or one of its ancestors matches a pattern
    pub fn matches(&self, path: &str) -> bool {
        let path = path.trim_end_matches('/');
        if self.set.is_match(path) {
            return true;
        }
        path.match_indices('/')
            .map(|(idx, _)| &path[..idx])
            .filter(|prefix| !prefix.is_empty())
            .any(|prefix| self.set.is_match(prefix))
    }

    /// Whether some descendant of `path` could match a pattern
    pub fn child_may_match(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        self.components.iter().any(|pattern| match pattern {
            None => true,
            Some(globs) => {
                parts.len() < globs.len()
                    && parts.iter().zip(globs).all(|(part, glob)| glob.is_match(part))
            }
        })
    }
}

fn normalize(pattern: &str) -> String {
    let trimmed = pattern.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("**/{}", trimmed)
    }
}

fn build_glob(raw: &str, glob: &str, case_insensitive: bool) -> Result<Glob> {
    GlobBuilder::new(glob)
        .literal_separator(true)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| RestoreError::InvalidPattern {
            pattern: raw.to_string(),
            reason: e.kind().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(patterns: &[&str]) -> PatternSet {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        PatternSet::compile(&patterns, false).unwrap()
    }

    #[test]
    fn test_unanchored_pattern_matches_any_depth() {
        let s = set(&["*.log"]);
        assert!(s.matches("/app.log"));
        assert!(s.matches("/var/log/app.log"));
        assert!(!s.matches("/var/log/app.txt"));
    }

    #[test]
    fn test_anchored_pattern() {
        let s = set(&["/etc/*.conf"]);
        assert!(s.matches("/etc/nginx.conf"));
        assert!(!s.matches("/usr/etc/nginx.conf"));
        assert!(!s.matches("/etc/nginx/site.conf"));
    }

    #[test]
    fn test_directory_match_covers_descendants() {
        let s = set(&["/home/user/cache"]);
        assert!(s.matches("/home/user/cache"));
        assert!(s.matches("/home/user/cache/deep/file"));
        assert!(!s.matches("/home/user/cached"));
        assert!(!s.matches("/home/user"));
    }

    #[test]
    fn test_child_may_match() {
        let s = set(&["/home/*/docs/*.md"]);
        assert!(s.child_may_match("/"));
        assert!(s.child_may_match("/home"));
        assert!(s.child_may_match("/home/alice"));
        assert!(s.child_may_match("/home/alice/docs"));
        assert!(!s.child_may_match("/home/alice/docs/readme.md"));
        assert!(!s.child_may_match("/srv"));

        let deep = set(&["secrets.txt"]);
        assert!(deep.child_may_match("/anything/at/all"));
    }

    #[test]
    fn test_case_insensitive() {
        let patterns = vec!["*.JPG".to_string()];
        let s = PatternSet::compile(&patterns, true).unwrap();
        assert!(s.matches("/photos/a.jpg"));
        assert!(s.matches("/photos/b.JpG"));
        assert!(!set(&["*.JPG"]).matches("/photos/a.jpg"));
    }

    #[test]
    fn test_invalid_pattern() {
        let opts = ExcludePatternOptions {
            excludes: vec!["[unclosed".to_string()],
            ..Default::default()
        };
        let err = opts.collect_patterns().err().unwrap();
        assert!(matches!(err, RestoreError::InvalidPattern { .. }));
        assert!(err.is_validation());
    }

    #[test]
    fn test_collect_groups() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("excludes.txt");
        fs::write(&file, "# comment\n\n*.tmp\n/build\n").unwrap();

        let opts = ExcludePatternOptions {
            excludes: vec!["*.bak".to_string()],
            exclude_files: vec![file],
            insensitive_excludes: vec!["*.ISO".to_string()],
            ..Default::default()
        };
        assert!(!opts.is_empty());

        let predicates = opts.collect_patterns().unwrap();
        assert_eq!(predicates.len(), 2);
        assert!(predicates[0]("/x.bak"));
        assert!(predicates[0]("/x.tmp"));
        assert!(predicates[0]("/build/out"));
        assert!(!predicates[0]("/disk.iso"));
        assert!(predicates[1]("/disk.iso"));

        assert!(ExcludePatternOptions::default().collect_patterns().unwrap().is_empty());
    }

    #[test]
    fn test_missing_pattern_file() {
        let opts = IncludePatternOptions {
            include_files: vec![PathBuf::from("/nonexistent/patterns.txt")],
            ..Default::default()
        };
        assert!(matches!(
            opts.collect_patterns().err().unwrap(),
            RestoreError::PatternFile { .. }
        ));
    }

    #[test]
    fn test_include_predicate() {
        let opts = IncludePatternOptions {
            includes: vec!["/src/*.rs".to_string()],
            ..Default::default()
        };
        let predicates = opts.collect_patterns().unwrap();
        assert_eq!(predicates.len(), 1);
        assert_eq!(predicates[0]("/src"), (false, true));
        assert_eq!(predicates[0]("/src/main.rs"), (true, false));
        assert_eq!(predicates[0]("/docs"), (false, false));
    }
}
