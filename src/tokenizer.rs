// src/tokenizer.rs
//
// Token counting used by the prompt analyzer. One method is picked per run
// and applied to every count so the statistics stay comparable.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Letter runs, digit groups of at most three, punctuation runs.
/// Mirrors the pre-tokenization step of common BPE vocabularies.
const REGEX_TOKEN_PATTERN: &str = r"\p{L}+|\p{N}{1,3}|[^\s\p{L}\p{N}]+";

pub trait TokenCounter: Send + Sync {
    fn name(&self) -> &'static str;
    fn count(&self, text: &str) -> u64;
}

#[derive(Debug, Clone)]
pub struct RegexTokenizer {
    re: Regex,
}

impl Default for RegexTokenizer {
    fn default() -> Self {
        Self {
            re: Regex::new(REGEX_TOKEN_PATTERN).expect("token pattern is valid"),
        }
    }
}

impl TokenCounter for RegexTokenizer {
    fn name(&self) -> &'static str {
        "regex"
    }

    fn count(&self, text: &str) -> u64 {
        self.re.find_iter(text).count() as u64
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl TokenCounter for WhitespaceTokenizer {
    fn name(&self) -> &'static str {
        "whitespace"
    }

    fn count(&self, text: &str) -> u64 {
        text.split_whitespace().count() as u64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    #[default]
    Regex,
    Whitespace,
}

impl TokenizerKind {
    pub fn build(self) -> Box<dyn TokenCounter> {
        match self {
            TokenizerKind::Regex => Box::new(RegexTokenizer::default()),
            TokenizerKind::Whitespace => Box::new(WhitespaceTokenizer),
        }
    }
}
