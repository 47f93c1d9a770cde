// src/extract.rs
//
// Stage 4: flatten decompressed chat traces into one CSV row per user or
// assistant message.
//
// conversation_id is the trace file's path relative to the json root, so every
// row traces back to exactly one file. Token counts are left to the analyzer.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::constants::{
    DEFAULT_EXTRACT_MAX_THREADS, DEFAULT_TRACE_FILE_GLOB, EXTRACT_PROGRESS_INTERVAL, PROMPT_CSV_COLUMNS,
};
use crate::error::PipelineError;
use crate::glob_to_regex;
use crate::identifier::IdShape;
use crate::tool_call::{is_invocation_part, ToolCallScanner};
use crate::tracker::ItemTracker;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One extracted message; field order is the CSV column order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRow {
    pub conversation_id: String,
    pub identifier: String,
    pub sequence_index: u64,
    pub role: Role,
    pub content: String,
    pub tool_call_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub json_root: PathBuf,
    pub output_csv: PathBuf,
    pub file_glob: String,
    pub id_shape: IdShape,
    /// Roles whose messages are classified as tool calls
    pub tool_call_roles: Vec<Role>,
    pub max_threads: usize,
}

impl ExtractOptions {
    pub fn new(json_root: impl Into<PathBuf>, output_csv: impl Into<PathBuf>) -> Self {
        Self {
            json_root: json_root.into(),
            output_csv: output_csv.into(),
            file_glob: DEFAULT_TRACE_FILE_GLOB.to_string(),
            id_shape: IdShape::default(),
            tool_call_roles: vec![Role::Assistant],
            max_threads: DEFAULT_EXTRACT_MAX_THREADS,
        }
    }
}

/// Files under `root` whose name matches `file_glob`, sorted by path
pub fn find_trace_files(root: &Path, file_glob: &str) -> Result<Vec<PathBuf>> {
    let re = Regex::new(&glob_to_regex(file_glob)).with_context(|| format!("Invalid file glob: {}", file_glob))?;
    let mut out = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.file_type().is_file() && re.is_match(&entry.file_name().to_string_lossy()) {
            out.push(entry.into_path());
        }
    }
    out.sort();
    Ok(out)
}

/// Message sequence of a trace document: `request.messages`, `messages`,
/// or the document itself when it is an array
pub fn messages_of(doc: &Value) -> Option<&Vec<Value>> {
    doc.get("request")
        .and_then(|r| r.get("messages"))
        .and_then(Value::as_array)
        .or_else(|| doc.get("messages").and_then(Value::as_array))
        .or_else(|| doc.as_array())
}

/// Flatten message content to text.
///
/// Strings are trimmed, content-part arrays keep their text parts joined by
/// newlines followed by any tool invocation parts as compact JSON, and
/// anything without text is kept as compact JSON.
pub fn normalize_content(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|p| match p {
                    Value::String(s) => Some(s.trim()),
                    Value::Object(_) if p.get("type").and_then(Value::as_str) == Some("text") => {
                        p.get("text").and_then(Value::as_str).map(str::trim)
                    }
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect();
            if !texts.is_empty() {
                let mut text = texts.join("\n");
                let calls: Vec<&Value> = parts.iter().filter(|p| is_invocation_part(p)).collect();
                if !calls.is_empty() {
                    text.push('\n');
                    text.push_str(&Value::from(calls.into_iter().cloned().collect::<Vec<_>>()).to_string());
                }
                text
            } else if parts.is_empty() {
                String::new()
            } else {
                content.to_string()
            }
        }
        other => other.to_string(),
    }
}

fn message_text(message: &Value) -> String {
    let mut text = normalize_content(message.get("content").unwrap_or(&Value::Null));
    if let Some(calls) = message.get("tool_calls").filter(|c| c.as_array().is_some_and(|a| !a.is_empty())) {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&calls.to_string());
    }
    text
}

fn conversation_id(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Per-file result; `Skipped` files are counted, not fatal
#[derive(Debug)]
pub enum ParsedTrace {
    Rows(Vec<PromptRow>),
    Skipped(String),
}

/// Shared, read-only state for parsing trace files
pub struct TraceParser {
    root: PathBuf,
    id_shape: IdShape,
    scanner: ToolCallScanner,
    tool_call_roles: Vec<Role>,
}

impl TraceParser {
    pub fn new(opts: &ExtractOptions) -> Self {
        Self {
            root: opts.json_root.clone(),
            id_shape: opts.id_shape.clone(),
            scanner: ToolCallScanner::new(),
            tool_call_roles: opts.tool_call_roles.clone(),
        }
    }

    /// Rows for an already-parsed document found at `rel`
    pub fn rows_from_document(&self, rel: &Path, doc: &Value) -> Option<Vec<PromptRow>> {
        let messages = messages_of(doc)?;
        let conversation_id = conversation_id(rel);
        let identifier = self.id_shape.identifier_in_path(rel).unwrap_or_default();

        let mut rows = Vec::new();
        for message in messages {
            let Some(role) = message.get("role").and_then(Value::as_str).and_then(Role::parse) else {
                continue;
            };
            let content = message_text(message);
            let tool_call_type = if self.tool_call_roles.contains(&role) {
                self.scanner.classify(message, &content)
            } else {
                None
            };
            rows.push(PromptRow {
                conversation_id: conversation_id.clone(),
                identifier: identifier.clone(),
                sequence_index: rows.len() as u64,
                role,
                content,
                tool_call_type,
            });
        }
        Some(rows)
    }

    pub fn parse_file(&self, path: &Path) -> Result<ParsedTrace> {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let doc: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => return Ok(ParsedTrace::Skipped(format!("invalid JSON: {}", e))),
        };
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        Ok(match self.rows_from_document(rel, &doc) {
            Some(rows) => ParsedTrace::Rows(rows),
            None => ParsedTrace::Skipped("no message sequence".to_string()),
        })
    }
}

/// Write rows to `path` via a temp file in the same directory.
/// The header is written even when there are no rows.
pub fn write_prompt_csv(path: &Path, rows: &[PromptRow]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let mut tmp = NamedTempFile::new_in(dir).with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    {
        let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(tmp.as_file_mut());
        wtr.write_record(PROMPT_CSV_COLUMNS)?;
        for row in rows {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
    }
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub struct ExtractReport {
    pub files_found: usize,
    pub rows_written: usize,
    pub rows_by_role: BTreeMap<Role, u64>,
    pub tool_call_rows: u64,
    pub output_csv: PathBuf,
    pub tracker: ItemTracker,
    pub elapsed: Duration,
}

impl ExtractReport {
    pub fn print_summary(&self) {
        let s = self.tracker.summary();
        println!("\n=== Extract Summary ===");
        println!("Trace files found: {}", self.files_found);
        println!("Parsed:            {}", s.succeeded);
        println!("Skipped:           {}", s.skipped);
        println!("Failed:            {}", s.failed);
        println!("Rows written:      {}", self.rows_written);
        for (role, n) in &self.rows_by_role {
            println!("  {:<10}       {}", role, n);
        }
        println!("Tool-call rows:    {}", self.tool_call_rows);
        println!("Output:            {}", self.output_csv.display());
        println!("Elapsed:           {:.2}s", self.elapsed.as_secs_f64());
        print!("{}", self.tracker.format_problems());
    }
}

pub fn run_extract(opts: &ExtractOptions) -> Result<ExtractReport> {
    let start = Instant::now();
    if !opts.json_root.is_dir() {
        return Err(PipelineError::config(format!("json root does not exist: {}", opts.json_root.display())).into());
    }

    let files = find_trace_files(&opts.json_root, &opts.file_glob)?;
    info!("Found {} trace files matching {} under {}", files.len(), opts.file_glob, opts.json_root.display());

    let parser = TraceParser::new(opts);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.max_threads.max(1))
        .build()
        .context("Failed to build extract thread pool")?;

    let done = AtomicUsize::new(0);
    let total = files.len();
    let parsed: Vec<Result<ParsedTrace>> = pool.install(|| {
        files
            .par_iter()
            .map(|f| {
                let r = parser.parse_file(f);
                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                if n % EXTRACT_PROGRESS_INTERVAL == 0 {
                    info!("Processed {}/{} files", n, total);
                }
                r
            })
            .collect()
    });

    let mut tracker = ItemTracker::new("extract");
    let mut rows = Vec::new();
    for (file, outcome) in files.iter().zip(parsed) {
        let item = file.strip_prefix(&opts.json_root).unwrap_or(file).display().to_string();
        match outcome {
            Ok(ParsedTrace::Rows(r)) => {
                debug!("{}: {} rows", item, r.len());
                rows.extend(r);
                tracker.record_success();
            }
            Ok(ParsedTrace::Skipped(reason)) => tracker.record_skipped(item, reason),
            Err(e) => tracker.record_failure(item, format!("{:#}", e)),
        }
    }

    let mut rows_by_role = BTreeMap::new();
    let mut tool_call_rows = 0;
    for row in &rows {
        *rows_by_role.entry(row.role).or_insert(0u64) += 1;
        if row.tool_call_type.is_some() {
            tool_call_rows += 1;
        }
    }

    write_prompt_csv(&opts.output_csv, &rows)?;
    info!("Saved {} rows to {}", rows.len(), opts.output_csv.display());

    Ok(ExtractReport {
        files_found: files.len(),
        rows_written: rows.len(),
        rows_by_role,
        tool_call_rows,
        output_csv: opts.output_csv.clone(),
        tracker,
        elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> TraceParser {
        TraceParser::new(&ExtractOptions::new("/root", "/out.csv"))
    }

    #[test]
    fn test_normalize_content() {
        assert_eq!(normalize_content(&json!("  hi  ")), "hi");
        assert_eq!(normalize_content(&Value::Null), "");
        assert_eq!(
            normalize_content(&json!([{"type": "text", "text": " a "}, {"type": "image_url"}, "b"])),
            "a\nb"
        );
        assert_eq!(normalize_content(&json!([{"type": "image_url", "url": "x"}])), r#"[{"type":"image_url","url":"x"}]"#);
        assert_eq!(normalize_content(&json!({"k": 1})), r#"{"k":1}"#);
    }

    #[test]
    fn test_tool_use_parts_kept_after_text() {
        let content = json!([
            {"type": "text", "text": "let me check"},
            {"type": "tool_use", "name": "execute-command", "input": {"command": "find / -name marker"}}
        ]);
        assert_eq!(
            normalize_content(&content),
            "let me check\n[{\"input\":{\"command\":\"find / -name marker\"},\"name\":\"execute-command\",\"type\":\"tool_use\"}]"
        );
    }

    #[test]
    fn test_messages_lookup_order() {
        let nested = json!({"request": {"messages": [1]}, "messages": [1, 2]});
        assert_eq!(messages_of(&nested).unwrap().len(), 1);
        assert_eq!(messages_of(&json!({"messages": [1, 2]})).unwrap().len(), 2);
        assert_eq!(messages_of(&json!([1, 2, 3])).unwrap().len(), 3);
        assert!(messages_of(&json!({"response": {}})).is_none());
    }

    #[test]
    fn test_rows_keep_empty_messages_and_skip_other_roles() {
        let doc = json!({"messages": [
            {"role": "system", "content": "be nice"},
            {"role": "user", "content": "hello"},
            {"role": "assistant", "content": ""},
            {"role": "tool", "content": "out"},
            {"role": "assistant", "content": "<tool_result><execute-command>ls</execute-command></tool_result>"}
        ]});
        let rows = parser().rows_from_document(Path::new("batch/a.json"), &doc).unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows.iter().map(|r| r.sequence_index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(rows[1].content, "");
        assert_eq!(rows[2].tool_call_type.as_deref(), Some("execute-command"));
        assert_eq!(rows[0].conversation_id, "batch/a.json");
    }

    #[test]
    fn test_user_messages_not_classified_by_default() {
        let doc = json!([{"role": "user", "content": "<tool_result><web-search>q</web-search></tool_result>"}]);
        let rows = parser().rows_from_document(Path::new("a.json"), &doc).unwrap();
        assert_eq!(rows[0].tool_call_type, None);

        let mut opts = ExtractOptions::new("/root", "/out.csv");
        opts.tool_call_roles = vec![Role::User, Role::Assistant];
        let rows = TraceParser::new(&opts).rows_from_document(Path::new("a.json"), &doc).unwrap();
        assert_eq!(rows[0].tool_call_type.as_deref(), Some("web-search"));
    }

    #[test]
    fn test_assistant_tool_calls_are_kept_in_content() {
        let doc = json!([{"role": "assistant", "content": null,
            "tool_calls": [{"function": {"name": "read_file", "arguments": "{}"}}]}]);
        let rows = parser().rows_from_document(Path::new("a.json"), &doc).unwrap();
        assert!(rows[0].content.contains("read_file"));
        assert_eq!(rows[0].tool_call_type.as_deref(), Some("read_file"));
    }
}
