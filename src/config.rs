// src/config.rs
//
// Optional YAML configuration. Every field has a default, so an empty file
// (or no file at all) gives the stock pipeline; flags given on the command
// line override whatever the file says.
//
// ```yaml
// id_pattern: "^[0-9a-f-]{36}$"
// fetch:
//   bucket_name: my-traces
//   max_threads: 64
// retry:
//   max_retries: 5
//   attempt_timeout: 2m
// analyze:
//   tokenizer: whitespace
// ```

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BUCKET_NAME, DEFAULT_COMPRESSED_SUFFIX, DEFAULT_DECOMPRESS_MAX_THREADS, DEFAULT_EXTRACT_MAX_THREADS,
    DEFAULT_FETCH_MAX_THREADS, DEFAULT_FOCUS_TOOL_TYPE, DEFAULT_ID_COLUMN, DEFAULT_ID_PATTERN,
    DEFAULT_REGION_NAME, DEFAULT_TOP_N, DEFAULT_TRACE_FILE_GLOB,
};
use crate::error::PipelineError;
use crate::extract::Role;
use crate::identifier::IdShape;
use crate::retry::RetryConfig;
use crate::tokenizer::TokenizerKind;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Shape of a trace identifier, shared by `distribution` and `extract`
    #[serde(default = "default_id_pattern")]
    pub id_pattern: String,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub decompress: DecompressConfig,

    #[serde(default)]
    pub distribution: DistributionConfig,

    #[serde(default)]
    pub extract: ExtractConfig,

    #[serde(default)]
    pub analyze: AnalyzeConfig,

    /// Backoff for object-store calls
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_id_pattern() -> String {
    DEFAULT_ID_PATTERN.to_string()
}

fn default_suffix() -> String {
    DEFAULT_COMPRESSED_SUFFIX.to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            id_pattern: default_id_pattern(),
            fetch: FetchConfig::default(),
            decompress: DecompressConfig::default(),
            distribution: DistributionConfig::default(),
            extract: ExtractConfig::default(),
            analyze: AnalyzeConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct FetchConfig {
    #[serde(default = "default_id_column")]
    pub id_column: String,

    #[serde(default = "default_bucket_name")]
    pub bucket_name: String,

    #[serde(default = "default_region_name")]
    pub region_name: String,

    /// Only objects ending in this suffix are downloaded
    #[serde(default = "default_suffix")]
    pub suffix: String,

    #[serde(default = "default_fetch_threads")]
    pub max_threads: usize,

    /// Default: `missing_ids.txt` next to the download root
    #[serde(default)]
    pub missing_out: Option<PathBuf>,
}

fn default_id_column() -> String {
    DEFAULT_ID_COLUMN.to_string()
}

fn default_bucket_name() -> String {
    DEFAULT_BUCKET_NAME.to_string()
}

fn default_region_name() -> String {
    DEFAULT_REGION_NAME.to_string()
}

fn default_fetch_threads() -> usize {
    DEFAULT_FETCH_MAX_THREADS
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            id_column: default_id_column(),
            bucket_name: default_bucket_name(),
            region_name: default_region_name(),
            suffix: default_suffix(),
            max_threads: default_fetch_threads(),
            missing_out: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DecompressConfig {
    #[serde(default = "default_suffix")]
    pub suffix: String,

    #[serde(default = "default_decompress_threads")]
    pub max_threads: usize,
}

fn default_decompress_threads() -> usize {
    DEFAULT_DECOMPRESS_MAX_THREADS
}

impl Default for DecompressConfig {
    fn default() -> Self {
        Self {
            suffix: default_suffix(),
            max_threads: default_decompress_threads(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DistributionConfig {
    /// Metadata CSV files or directories, used when `--csv-path` is not given
    #[serde(default)]
    pub csv_paths: Vec<PathBuf>,

    #[serde(default)]
    pub unmatched_out: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ExtractConfig {
    /// Simple `*` glob matched against file names
    #[serde(default = "default_file_glob")]
    pub file_glob: String,

    #[serde(default = "default_tool_call_roles")]
    pub tool_call_roles: Vec<Role>,

    #[serde(default = "default_extract_threads")]
    pub max_threads: usize,
}

fn default_file_glob() -> String {
    DEFAULT_TRACE_FILE_GLOB.to_string()
}

fn default_tool_call_roles() -> Vec<Role> {
    vec![Role::Assistant]
}

fn default_extract_threads() -> usize {
    DEFAULT_EXTRACT_MAX_THREADS
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            file_glob: default_file_glob(),
            tool_call_roles: default_tool_call_roles(),
            max_threads: default_extract_threads(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct AnalyzeConfig {
    #[serde(default)]
    pub tokenizer: TokenizerKind,

    #[serde(default = "default_top_n")]
    pub top_n: usize,

    #[serde(default = "default_focus_tool_type")]
    pub focus_tool_type: String,
}

fn default_top_n() -> usize {
    DEFAULT_TOP_N
}

fn default_focus_tool_type() -> String {
    DEFAULT_FOCUS_TOOL_TYPE.to_string()
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        Self {
            tokenizer: TokenizerKind::default(),
            top_n: default_top_n(),
            focus_tool_type: default_focus_tool_type(),
        }
    }
}

impl PipelineConfig {
    /// Read `path`, or return the defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::config(format!("cannot read config {}: {}", path.display(), e)))?;
        let cfg: PipelineConfig = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&text)
                .map_err(|e| PipelineError::config(format!("invalid config {}: {}", path.display(), e)))?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        for (name, n) in [
            ("fetch.max_threads", self.fetch.max_threads),
            ("decompress.max_threads", self.decompress.max_threads),
            ("extract.max_threads", self.extract.max_threads),
            ("analyze.top_n", self.analyze.top_n),
        ] {
            if n == 0 {
                return Err(PipelineError::config(format!("{} must be at least 1", name)));
            }
        }
        if self.fetch.suffix.is_empty() || self.decompress.suffix.is_empty() {
            return Err(PipelineError::config("compressed suffix must not be empty"));
        }
        if self.retry.backoff_multiplier < 1.0 || !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(PipelineError::config(
                "retry.backoff_multiplier must be >= 1.0 and retry.jitter_factor within 0.0..=1.0",
            ));
        }
        IdShape::new(&self.id_pattern).map_err(|e| PipelineError::config(format!("{:#}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_no_file_gives_defaults() {
        let cfg = PipelineConfig::load(None).unwrap();
        assert_eq!(cfg.fetch.bucket_name, DEFAULT_BUCKET_NAME);
        assert_eq!(cfg.fetch.max_threads, 30);
        assert_eq!(cfg.decompress.max_threads, 20);
        assert_eq!(cfg.extract.max_threads, 24);
        assert_eq!(cfg.extract.tool_call_roles, vec![Role::Assistant]);
        assert_eq!(cfg.retry.attempt_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(
            &path,
            "fetch:\n  bucket_name: other\nretry:\n  max_retries: 5\n  attempt_timeout: 3m\nanalyze:\n  tokenizer: whitespace\n",
        )
        .unwrap();

        let cfg = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.fetch.bucket_name, "other");
        assert_eq!(cfg.fetch.region_name, DEFAULT_REGION_NAME);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.initial_delay_ms, 100);
        assert_eq!(cfg.retry.attempt_timeout, Some(Duration::from_secs(180)));
        assert_eq!(cfg.analyze.tokenizer, TokenizerKind::Whitespace);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "decompress:\n  max_threads: 0\n").unwrap();
        let err = PipelineConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::Config(_))));

        std::fs::write(&path, "fetch:\n  bucket: typo\n").unwrap();
        assert!(PipelineConfig::load(Some(&path)).is_err());

        assert!(PipelineConfig::load(Some(Path::new("/nonexistent/cfg.yaml"))).is_err());
    }
}
