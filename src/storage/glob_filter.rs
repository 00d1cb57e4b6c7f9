//! File-name glob filter with `{a,b}` alternation.
//!
//! `glob::Pattern` has no brace syntax, so `*.{wav,mp3}` is expanded into one
//! pattern per alternative. Matching is case-insensitive and applies to the
//! file name only.

use glob::{MatchOptions, Pattern};

use super::{StorageError, StorageResult};
use crate::domain::formats;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled path glob filter
#[derive(Debug, Clone)]
pub struct PathGlobFilter {
    source: String,
    patterns: Vec<Pattern>,
}

impl PathGlobFilter {
    /// Compile a glob such as `*.{wav,mp3,flac}`
    pub fn new(glob: &str) -> StorageResult<Self> {
        let patterns = expand_braces(glob)
            .into_iter()
            .map(|p| {
                Pattern::new(&p).map_err(|source| StorageError::Pattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(Self {
            source: glob.to_string(),
            patterns,
        })
    }

    /// Filter admitting the given extensions
    pub fn for_extensions(extensions: &[String]) -> StorageResult<Self> {
        Self::new(&formats::path_glob_filter(extensions))
    }

    /// Check a file name against the filter
    pub fn matches(&self, file_name: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(file_name, MATCH_OPTIONS))
    }

    /// The glob as written
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Expand the first top-level `{...}` group, recursing into each alternative
fn expand_braces(pattern: &str) -> Vec<String> {
    let open = match pattern.find('{') {
        Some(idx) => idx,
        None => return vec![pattern.to_string()],
    };

    let mut depth = 0usize;
    let mut close = None;
    let mut commas = Vec::new();

    for (offset, c) in pattern[open..].char_indices() {
        let idx = open + offset;
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(idx);
                    break;
                }
            }
            ',' if depth == 1 => commas.push(idx),
            _ => {}
        }
    }

    // Unbalanced braces are matched literally
    let close = match close {
        Some(idx) => idx,
        None => return vec![pattern.to_string()],
    };

    let prefix = &pattern[..open];
    let suffix = &pattern[close + 1..];

    let mut bounds = vec![open];
    bounds.extend(commas);
    bounds.push(close);

    bounds
        .windows(2)
        .flat_map(|w| expand_braces(&format!("{}{}{}", prefix, &pattern[w[0] + 1..w[1]], suffix)))
        .collect()
}
