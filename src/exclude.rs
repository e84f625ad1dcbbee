//! Exclusion patterns applied while walking the source tree.
//!
//! Patterns follow tar's unanchored `--exclude` behaviour: a pattern
//! excludes an entry when it matches the entry's archive path or any
//! suffix of it that starts at a `/`. Wildcards may cross `/`, so
//! `project/*.log` also excludes `project/sub/x.log`.

use std::path::Path;

use glob::{MatchOptions, Pattern};

use crate::error::{ArchiveError, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<String>,
    compiled: Vec<Pattern>,
}

impl ExcludeSet {
    /// Builds a set from raw user values. Empty strings are dropped, so
    /// an empty `--exclude=` means "exclude nothing".
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().trim_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let compiled = patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|err| {
                    ArchiveError::InvalidArguments(format!("bad exclude pattern '{p}': {err}"))
                })
            })
            .collect::<Result<_>>()?;

        Ok(Self { patterns, compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether `archive_path` (relative, as stored in the tar) is excluded.
    pub fn is_excluded(&self, archive_path: &Path) -> bool {
        if self.compiled.is_empty() {
            return false;
        }

        let path = archive_path.to_string_lossy();
        let path = path.trim_matches('/');
        let suffixes = std::iter::once(path)
            .chain(path.match_indices('/').map(|(at, _)| &path[at + 1..]));

        // Children of an excluded directory are pruned by the walker.
        suffixes
            .filter(|s| !s.is_empty())
            .any(|s| self.compiled.iter().any(|p| p.matches_with(s, MATCH_OPTIONS)))
    }
}
