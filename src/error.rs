// src/error.rs
//
// Fatal error classes. Per-item problems never surface here; they are counted
// by `tracker::ItemTracker` and the stage keeps going.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or unreadable input, bad flag, bad config file
    #[error("configuration error: {0}")]
    Config(String),

    /// A CSV lacks columns the stage depends on
    #[error(
        "schema error in {}: missing column(s) {:?}; available columns: {:?}",
        .path.display(), .missing, .available
    )]
    Schema {
        path: PathBuf,
        missing: Vec<String>,
        available: Vec<String>,
    },

    /// Items were attempted and every one of them failed
    #[error("{stage}: none of the {attempted} items succeeded")]
    NothingSucceeded { stage: &'static str, attempted: u64 },
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::Config(msg.into())
    }

    /// Build a schema error from the header row of a CSV and the columns
    /// the caller needs. Returns `None` when nothing is missing.
    pub fn check_columns(path: impl Into<PathBuf>, available: &[String], required: &[&str]) -> Option<Self> {
        let missing: Vec<String> = required
            .iter()
            .filter(|col| !available.iter().any(|a| a == *col))
            .map(|col| col.to_string())
            .collect();
        if missing.is_empty() {
            None
        } else {
            Some(PipelineError::Schema {
                path: path.into(),
                missing,
                available: available.to_vec(),
            })
        }
    }
}
