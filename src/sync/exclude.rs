//! Glob filter for paths whose changes are never propagated.
//!
//! Matching is done against the root-relative path, the file name, and every
//! directory component, so `.git` excludes `.git/config` as well.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::sync::error::Result;

/// Per-root ignore file, read by `ClientConfig::excludes_for` and parsed with
/// [`ExcludePatterns::parse_ignore_file`].
pub const IGNORE_FILE_NAME: &str = ".hubsyncignore";

/// Patterns that are almost never worth sending to the hub.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    // Version control
    ".git",
    ".git/**",
    ".svn",
    ".hg",
    // OS metadata
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    // Editor swap and backup files
    "*.swp",
    "*.swo",
    "*~",
    ".~lock.*#",
    // Partial downloads
    "*.part",
    "*.crdownload",
];

/// Compiled set of exclusion globs.
#[derive(Debug, Clone)]
pub struct ExcludePatterns {
    glob_set: GlobSet,
    patterns: Vec<String>,
}

impl Default for ExcludePatterns {
    /// Excludes nothing.
    fn default() -> Self {
        Self::new()
    }
}

impl ExcludePatterns {
    /// Empty set; every path passes.
    pub fn new() -> Self {
        Self {
            glob_set: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }

    pub fn with_defaults() -> Result<Self> {
        Self::from_patterns(DEFAULT_EXCLUDES)
    }

    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns: Vec<String> = patterns.iter().map(|p| p.as_ref().to_string()).collect();
        let glob_set = build(&patterns)?;
        Ok(Self { glob_set, patterns })
    }

    /// Parse an ignore file: one glob per line, `#` comments, blank lines
    /// skipped. Negations (`!pattern`) are not supported and are ignored.
    pub fn parse_ignore_file(content: &str) -> Result<Self> {
        let patterns: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
            .map(|line| line.trim_end_matches('/'))
            .collect();

        Self::from_patterns(&patterns)
    }

    /// Add a pattern, keeping the set unchanged if it does not compile.
    pub fn add_pattern(&mut self, pattern: &str) -> Result<()> {
        if self.patterns.iter().any(|p| p == pattern) {
            return Ok(());
        }

        let mut patterns = self.patterns.clone();
        patterns.push(pattern.to_string());
        self.glob_set = build(&patterns)?;
        self.patterns = patterns;
        Ok(())
    }

    /// Union with another set.
    pub fn merge(&mut self, other: &ExcludePatterns) -> Result<()> {
        for pattern in &other.patterns {
            self.add_pattern(pattern)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether a root-relative path (`/`-separated) is excluded.
    pub fn is_excluded(&self, relative: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        if self.glob_set.is_match(relative) {
            return true;
        }

        Path::new(relative)
            .components()
            .filter_map(|component| match component {
                std::path::Component::Normal(name) => Some(name),
                _ => None,
            })
            .any(|name| self.glob_set.is_match(name.to_string_lossy().as_ref()))
    }
}

fn build(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
