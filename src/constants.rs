// src/constants.rs
//
// Central location for all constants used throughout agent-trace-stats
// This makes tuning and maintenance easier by having all magic numbers in one place

use std::time::Duration;

// =============================================================================
// Fetch Defaults
// =============================================================================

/// Column in the input CSV that holds trace identifiers
pub const DEFAULT_ID_COLUMN: &str = "id";

/// Bucket that stores compressed chat traces
pub const DEFAULT_BUCKET_NAME: &str = "ninja-task-trace-beta";

/// Region of the trace bucket
pub const DEFAULT_REGION_NAME: &str = "us-west-2";

/// Suffix of compressed trace objects (and of the local files we decompress)
pub const DEFAULT_COMPRESSED_SUFFIX: &str = ".gz";

/// Maximum number of identifiers fetched concurrently
pub const DEFAULT_FETCH_MAX_THREADS: usize = 30;

/// Written next to the download root, one missing/failed identifier per line
pub const MISSING_IDS_FILENAME: &str = "missing_ids.txt";

/// In-flight downloads land here first and are renamed on success
pub const DOWNLOAD_PART_SUFFIX: &str = ".part";

/// Per-attempt timeout for a single LIST or GET call
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Retry with Exponential Backoff
// =============================================================================

/// Maximum retries per object-store call (attempts = retries + 1)
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Initial delay before first retry (milliseconds)
pub const DEFAULT_INITIAL_RETRY_DELAY_MS: u64 = 100;

/// Maximum delay between retries (milliseconds)
/// Caps exponential growth to prevent excessive waits
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 5000;

/// Multiplier for exponential backoff (delay * multiplier each retry)
/// 2.0 means delay doubles: 100ms -> 200ms -> 400ms -> 800ms -> ...
pub const DEFAULT_RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Jitter factor for retry delays (0.0 = no jitter, 1.0 = full jitter)
pub const DEFAULT_RETRY_JITTER_FACTOR: f64 = 0.2;

// =============================================================================
// Decompress / Extract Defaults
// =============================================================================

/// Maximum number of archives decompressed in parallel
pub const DEFAULT_DECOMPRESS_MAX_THREADS: usize = 20;

/// Maximum number of trace files parsed in parallel
pub const DEFAULT_EXTRACT_MAX_THREADS: usize = 24;

/// Trace files picked up by the extractor (simple `*` glob on the file name)
pub const DEFAULT_TRACE_FILE_GLOB: &str = "*.json";

/// Log extraction progress every N files
pub const EXTRACT_PROGRESS_INTERVAL: usize = 200;

// =============================================================================
// Identifiers & Metadata
// =============================================================================

/// Shape of a trace identifier: 16-64 chars of alphanumerics and dashes,
/// starting with an alphanumeric. Matches UUIDs and hex/base62 task ids.
pub const DEFAULT_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9-]{15,63}$";

pub const ID_COL: &str = "id";
pub const AGENT_TYPE_COL: &str = "agent_type";
pub const MODE_COL: &str = "agent_execution_mode";

/// Columns a metadata CSV must carry to be selected by the distribution stage
pub const METADATA_REQUIRED_COLUMNS: [&str; 3] = [ID_COL, AGENT_TYPE_COL, MODE_COL];

/// Label used for blank metadata values in frequency tables
pub const EMPTY_CATEGORY_LABEL: &str = "(empty)";

/// How many unmatched identifiers are echoed in the text report
pub const UNMATCHED_PRINT_LIMIT: usize = 20;

// =============================================================================
// Prompt CSV Contract (extract -> analyze)
// =============================================================================

pub const COL_CONVERSATION_ID: &str = "conversation_id";
pub const COL_IDENTIFIER: &str = "identifier";
pub const COL_SEQUENCE_INDEX: &str = "sequence_index";
pub const COL_ROLE: &str = "role";
pub const COL_CONTENT: &str = "content";
pub const COL_TOOL_CALL_TYPE: &str = "tool_call_type";

/// Column order written by the extractor
pub const PROMPT_CSV_COLUMNS: [&str; 6] = [
    COL_CONVERSATION_ID,
    COL_IDENTIFIER,
    COL_SEQUENCE_INDEX,
    COL_ROLE,
    COL_CONTENT,
    COL_TOOL_CALL_TYPE,
];

/// Columns the analyzer refuses to run without
pub const ANALYZE_REQUIRED_COLUMNS: [&str; 4] = [
    COL_CONVERSATION_ID,
    COL_ROLE,
    COL_CONTENT,
    COL_TOOL_CALL_TYPE,
];

// =============================================================================
// Prompt Analysis
// =============================================================================

/// Conversations whose tool-call tokens exceed this share of all tokens are
/// reported separately (strictly greater than)
pub const TOOL_CALL_SHARE_THRESHOLD_PCT: u64 = 80;

/// Tool type whose dominance is called out in the conversation summary
pub const DEFAULT_FOCUS_TOOL_TYPE: &str = "execute-command";

/// Tool-call types listed in the proportion table
pub const DEFAULT_TOP_N: usize = 10;

/// Percentiles reported for every token distribution
pub const PERCENTILES: [f64; 7] = [0.01, 0.05, 0.25, 0.50, 0.75, 0.95, 0.99];

/// Upper bounds (inclusive) of the tool-call share histogram
pub const SHARE_BUCKET_UPPER_BOUNDS: [f64; 5] = [20.0, 40.0, 60.0, 80.0, 100.0];

pub const SHARE_BUCKET_LABELS: [&str; 5] = ["0-20%", "20-40%", "40-60%", "60-80%", "80-100%"];

// =============================================================================
// Reporting
// =============================================================================

/// Failures echoed per stage summary; the rest are only counted
pub const MAX_LOGGED_FAILURES: usize = 20;

// Byte size constants (binary units)
pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Convert bytes to human-readable string (binary units: KiB, MiB, GiB)
pub fn format_bytes_binary(bytes: u64) -> String {
    if bytes >= TIB {
        format!("{:.2} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_binary() {
        assert_eq!(format_bytes_binary(0), "0 B");
        assert_eq!(format_bytes_binary(512), "512 B");
        assert_eq!(format_bytes_binary(1024), "1.00 KiB");
        assert_eq!(format_bytes_binary(1536), "1.50 KiB");
        assert_eq!(format_bytes_binary(1_048_576), "1.00 MiB");
        assert_eq!(format_bytes_binary(1_073_741_824), "1.00 GiB");
    }

    #[test]
    fn test_share_buckets_sorted() {
        for i in 1..SHARE_BUCKET_UPPER_BOUNDS.len() {
            assert!(SHARE_BUCKET_UPPER_BOUNDS[i] > SHARE_BUCKET_UPPER_BOUNDS[i-1],
                    "Bucket bounds must be strictly increasing");
        }
        assert_eq!(SHARE_BUCKET_LABELS.len(), SHARE_BUCKET_UPPER_BOUNDS.len());
        assert_eq!(*SHARE_BUCKET_UPPER_BOUNDS.last().unwrap(), 100.0);
    }

    #[test]
    fn test_analyze_columns_are_written_by_extract() {
        for col in ANALYZE_REQUIRED_COLUMNS {
            assert!(PROMPT_CSV_COLUMNS.contains(&col), "{} must be part of the prompt CSV", col);
        }
    }

    #[test]
    fn test_default_id_pattern_compiles() {
        let re = regex::Regex::new(DEFAULT_ID_PATTERN).unwrap();
        assert!(re.is_match("3f2c9a1e-8b7d-4c2a-9e1f-0a1b2c3d4e5f"));
        assert!(!re.is_match("short"));
    }
}
