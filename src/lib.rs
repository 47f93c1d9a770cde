// src/lib.rs

use regex::escape;

pub mod config;
pub mod constants;
pub mod decompress; // Stage 2: .gz -> sibling file
pub mod distribution; // Stage 3: identifiers x agent metadata
pub mod error;
pub mod extract; // Stage 4: traces -> prompts CSV
pub mod fetch; // Stage 1: latest object per identifier
pub mod identifier;
pub mod prompt_stats; // Stage 5: token statistics
pub mod retry;
pub mod store;
pub mod tokenizer;
pub mod tool_call;
pub mod tracker;
pub mod tsv_export; // TSV export of per-conversation stats

pub use error::PipelineError;

/// Converts a simple glob (with `*`) into a fully-anchored regex string.
pub fn glob_to_regex(glob: &str) -> String {
    format!("^{}$", escape(glob).replace(r"\*", ".*"))
}
