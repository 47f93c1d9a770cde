// src/identifier.rs
//
// Trace identifiers recovered from the local directory layout.
//
// The fetcher stores every trace under `<root>/<identifier>/<basename>`, and
// trace file names usually carry the identifier as their stem as well, so both
// directory names and file names (all extensions stripped) are candidates.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use crate::constants::DEFAULT_ID_PATTERN;

/// Compiled identifier shape
#[derive(Debug, Clone)]
pub struct IdShape {
    re: Regex,
}

impl Default for IdShape {
    fn default() -> Self {
        Self {
            re: Regex::new(DEFAULT_ID_PATTERN).expect("default id pattern is valid"),
        }
    }
}

impl IdShape {
    /// The pattern always has to match a whole segment; `task-\d+` behaves
    /// like `^(?:task-\d+)$`.
    pub fn new(pattern: &str) -> Result<Self> {
        // `a)|(b` only parses once wrapped; reject it as given
        Regex::new(pattern).with_context(|| format!("Invalid id pattern: {}", pattern))?;
        let re = Regex::new(&format!("^(?:{})$", pattern))
            .with_context(|| format!("Invalid id pattern: {}", pattern))?;
        Ok(Self { re })
    }

    /// The anchored pattern in use
    pub fn pattern(&self) -> &str {
        self.re.as_str()
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.re.is_match(candidate)
    }

    /// A directory name is an identifier when it has the id shape as-is
    pub fn parse_segment(&self, segment: &str) -> Option<String> {
        self.matches(segment).then(|| segment.to_string())
    }

    /// File names are tested with every extension removed
    /// (`abc.json.gz` -> `abc`)
    pub fn parse_file_name(&self, file_name: &str) -> Option<String> {
        let stem = file_name.split('.').next().unwrap_or(file_name);
        self.parse_segment(stem)
    }

    /// First path component (outermost first) that is an identifier.
    /// The last component is treated as a file name.
    pub fn identifier_in_path(&self, rel: &Path) -> Option<String> {
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let last = parts.len().saturating_sub(1);
        parts.iter().enumerate().find_map(|(i, part)| {
            if i == last {
                self.parse_file_name(part)
            } else {
                self.parse_segment(part)
            }
        })
    }

    /// Every distinct identifier found in directory or file names under `root`
    pub fn collect_from_tree(&self, root: &Path) -> Result<BTreeSet<String>> {
        if !root.is_dir() {
            anyhow::bail!("Data root is not a directory: {}", root.display());
        }
        let mut ids = BTreeSet::new();
        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            let name = entry.file_name().to_string_lossy();
            let found = if entry.file_type().is_dir() {
                self.parse_segment(&name)
            } else {
                self.parse_file_name(&name)
            };
            if let Some(id) = found {
                ids.insert(id);
            }
        }
        debug!("Collected {} identifiers under {}", ids.len(), root.display());
        Ok(ids)
    }
}
