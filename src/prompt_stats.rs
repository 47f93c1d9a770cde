// src/prompt_stats.rs
//
// Stage 5: token statistics over the extracted prompts CSV.
//
// Every row gets `num_tokens` (tokens of its content) and `tool_tokens`
// (0 unless the row is a tool call; then the tokens of its tagged tool results,
// or of the whole content when there are none). Everything below is derived
// from those two numbers.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{
    ANALYZE_REQUIRED_COLUMNS, DEFAULT_FOCUS_TOOL_TYPE, DEFAULT_TOP_N, PERCENTILES, SHARE_BUCKET_LABELS,
    SHARE_BUCKET_UPPER_BOUNDS, TOOL_CALL_SHARE_THRESHOLD_PCT,
};
use crate::error::PipelineError;
use crate::extract::Role;
use crate::tokenizer::{TokenCounter, TokenizerKind};
use crate::tool_call::ToolCallScanner;
use crate::tsv_export::TsvExporter;

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub csv_path: PathBuf,
    pub tokenizer: TokenizerKind,
    pub top_n: usize,
    pub focus_tool_type: String,
    pub export_tsv: Option<PathBuf>,
}

impl AnalyzeOptions {
    pub fn new(csv_path: impl Into<PathBuf>) -> Self {
        Self {
            csv_path: csv_path.into(),
            tokenizer: TokenizerKind::default(),
            top_n: DEFAULT_TOP_N,
            focus_tool_type: DEFAULT_FOCUS_TOOL_TYPE.to_string(),
            export_tsv: None,
        }
    }
}

/// The columns of the prompts CSV the analyzer reads; others are ignored
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRecord {
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub tool_call_type: Option<String>,
}

pub fn load_prompt_records(path: &Path) -> Result<Vec<PromptRecord>> {
    let file = File::open(path)
        .map_err(|e| PipelineError::config(format!("cannot open prompts CSV {}: {}", path.display(), e)))?;
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
    let headers: Vec<String> = rdr
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();
    if let Some(err) = PipelineError::check_columns(path, &headers, &ANALYZE_REQUIRED_COLUMNS) {
        return Err(err.into());
    }

    let mut out = Vec::new();
    for (line, rec) in rdr.deserialize().enumerate() {
        let rec: PromptRecord = rec.with_context(|| format!("{}: bad record at line {}", path.display(), line + 2))?;
        out.push(rec);
    }
    Ok(out)
}

/// A record with its token counts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredRow {
    pub conversation_id: String,
    pub role: String,
    pub num_tokens: u64,
    pub tool_tokens: u64,
    pub tool_type: Option<String>,
}

pub fn score_rows(records: &[PromptRecord], tokenizer: &dyn TokenCounter, scanner: &ToolCallScanner) -> Vec<ScoredRow> {
    records
        .iter()
        .map(|r| {
            let num_tokens = tokenizer.count(&r.content);
            let tool_type = r
                .tool_call_type
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            let tool_tokens = if tool_type.is_some() {
                let results = scanner.tagged_results(&r.content);
                if results.is_empty() {
                    num_tokens
                } else {
                    // Bodies tokenized on their own can split where the full
                    // content does not; never exceed the row total.
                    let body_tokens: u64 = results.iter().map(|t| tokenizer.count(t.body)).sum();
                    body_tokens.min(num_tokens)
                }
            } else {
                0
            };
            ScoredRow {
                conversation_id: r.conversation_id.clone(),
                role: r.role.trim().to_string(),
                num_tokens,
                tool_tokens,
                tool_type,
            }
        })
        .collect()
}

// =============================================================================
// Distributions
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Distribution {
    pub count: u64,
    pub total: u64,
    /// `None` when there are no samples
    pub mean: Option<f64>,
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub percentiles: Vec<PercentileValue>,
}

/// Linear interpolation between closest ranks over sorted samples
pub fn percentile(sorted: &[u64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let (a, b) = (sorted[lo] as f64, sorted[hi] as f64);
    Some(a + (b - a) * (pos - lo as f64))
}

impl Distribution {
    pub fn from_values(mut values: Vec<u64>) -> Self {
        values.sort_unstable();
        let count = values.len() as u64;
        let total: u64 = values.iter().sum();
        let mean = (count > 0).then(|| total as f64 / count as f64);
        let percentiles = PERCENTILES
            .iter()
            .filter_map(|&p| percentile(&values, p).map(|value| PercentileValue { percentile: (p * 100.0).round(), value }))
            .collect();
        Self {
            count,
            total,
            mean,
            min: values.first().copied(),
            max: values.last().copied(),
            percentiles,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleStats {
    pub role: Role,
    pub num_tokens: Distribution,
    pub tool_tokens: Distribution,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolTypeStats {
    pub tool_type: String,
    pub count: u64,
    /// Share of all tool-call rows, percent
    pub share_pct: f64,
    pub total_tool_tokens: u64,
    pub avg_tool_tokens: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationStats {
    pub conversation_id: String,
    pub total_tokens: u64,
    pub tool_tokens: u64,
    pub tool_calls: u64,
    /// `None` when the conversation has no tokens at all
    pub tool_share_pct: Option<f64>,
    pub dominant_tool_type: Option<String>,
}

/// Strictly more than the threshold share, in integer arithmetic so that
/// 81/100 counts and 80/100 does not
pub fn exceeds_tool_share(tool_tokens: u64, total_tokens: u64) -> bool {
    total_tokens > 0 && tool_tokens * 100 > total_tokens * TOOL_CALL_SHARE_THRESHOLD_PCT
}

/// Index into `SHARE_BUCKET_UPPER_BOUNDS`: first bucket is `[0, 20]`, then `(lo, hi]`
pub fn share_bucket(pct: f64) -> usize {
    SHARE_BUCKET_UPPER_BOUNDS
        .iter()
        .position(|&upper| pct <= upper)
        .unwrap_or(SHARE_BUCKET_UPPER_BOUNDS.len() - 1)
}

#[derive(Debug, Clone, Serialize)]
pub struct ShareBucket {
    pub label: &'static str,
    pub conversations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeCount {
    pub tool_type: String,
    pub conversations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptAnalysis {
    pub source: PathBuf,
    pub tokenizer: &'static str,
    pub rows: u64,
    pub roles: Vec<RoleStats>,
    pub total_tokens: u64,
    pub tool_tokens: u64,
    pub tool_token_pct: f64,
    /// Sorted by frequency, then name
    pub tool_types: Vec<ToolTypeStats>,
    pub top_n: usize,
    pub conversation_count: u64,
    pub zero_token_conversations: u64,
    pub share_buckets: Vec<ShareBucket>,
    pub over_threshold_conversations: u64,
    pub dominant_tool_types: Vec<TypeCount>,
    pub focus_tool_type: String,
    pub focus_dominant_conversations: u64,
    #[serde(skip)]
    pub conversations: Vec<ConversationStats>,
}

fn dominant_type(types: &HashMap<String, (u64, u64)>) -> Option<String> {
    types
        .iter()
        .max_by(|(na, (ca, ta)), (nb, (cb, tb))| ca.cmp(cb).then(ta.cmp(tb)).then(nb.cmp(na)))
        .map(|(name, _)| name.clone())
}

pub fn analyze_rows(rows: &[ScoredRow], opts: &AnalyzeOptions, tokenizer_name: &'static str) -> PromptAnalysis {
    let roles = [Role::User, Role::Assistant]
        .into_iter()
        .map(|role| {
            let (tokens, tool): (Vec<u64>, Vec<u64>) = rows
                .iter()
                .filter(|r| r.role == role.as_str())
                .map(|r| (r.num_tokens, r.tool_tokens))
                .unzip();
            RoleStats {
                role,
                num_tokens: Distribution::from_values(tokens),
                tool_tokens: Distribution::from_values(tool),
            }
        })
        .collect();

    let total_tokens: u64 = rows.iter().map(|r| r.num_tokens).sum();
    let tool_tokens: u64 = rows.iter().map(|r| r.tool_tokens).sum();
    let tool_token_pct = if total_tokens > 0 {
        tool_tokens as f64 / total_tokens as f64 * 100.0
    } else {
        0.0
    };

    // Per tool type
    let mut by_type: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
    for r in rows {
        if let Some(t) = &r.tool_type {
            let e = by_type.entry(t.as_str()).or_default();
            e.0 += 1;
            e.1 += r.tool_tokens;
        }
    }
    let tool_rows: u64 = by_type.values().map(|(c, _)| c).sum();
    let mut tool_types: Vec<ToolTypeStats> = by_type
        .into_iter()
        .map(|(name, (count, tokens))| ToolTypeStats {
            tool_type: name.to_string(),
            count,
            share_pct: count as f64 / tool_rows as f64 * 100.0,
            total_tool_tokens: tokens,
            avg_tool_tokens: tokens as f64 / count as f64,
        })
        .collect();
    tool_types.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tool_type.cmp(&b.tool_type)));

    // Per conversation
    #[derive(Default)]
    struct Acc {
        total: u64,
        tool: u64,
        calls: u64,
        types: HashMap<String, (u64, u64)>,
    }
    let mut convs: BTreeMap<&str, Acc> = BTreeMap::new();
    for r in rows {
        let acc = convs.entry(r.conversation_id.as_str()).or_default();
        acc.total += r.num_tokens;
        acc.tool += r.tool_tokens;
        if let Some(t) = &r.tool_type {
            acc.calls += 1;
            let e = acc.types.entry(t.clone()).or_default();
            e.0 += 1;
            e.1 += r.tool_tokens;
        }
    }
    let conversations: Vec<ConversationStats> = convs
        .into_iter()
        .map(|(id, acc)| ConversationStats {
            conversation_id: id.to_string(),
            total_tokens: acc.total,
            tool_tokens: acc.tool,
            tool_calls: acc.calls,
            tool_share_pct: (acc.total > 0).then(|| acc.tool as f64 / acc.total as f64 * 100.0),
            dominant_tool_type: dominant_type(&acc.types),
        })
        .collect();

    let mut bucket_counts = [0u64; SHARE_BUCKET_UPPER_BOUNDS.len()];
    let mut zero_token_conversations = 0;
    let mut over_threshold_conversations = 0;
    let mut dominant: BTreeMap<&str, u64> = BTreeMap::new();
    for c in &conversations {
        match c.tool_share_pct {
            Some(pct) => bucket_counts[share_bucket(pct)] += 1,
            None => zero_token_conversations += 1,
        }
        if exceeds_tool_share(c.tool_tokens, c.total_tokens) {
            over_threshold_conversations += 1;
        }
        if let Some(t) = &c.dominant_tool_type {
            *dominant.entry(t.as_str()).or_default() += 1;
        }
    }
    let focus_dominant_conversations = dominant.get(opts.focus_tool_type.as_str()).copied().unwrap_or(0);
    let mut dominant_tool_types: Vec<TypeCount> = dominant
        .into_iter()
        .map(|(t, n)| TypeCount { tool_type: t.to_string(), conversations: n })
        .collect();
    dominant_tool_types.sort_by(|a, b| b.conversations.cmp(&a.conversations).then_with(|| a.tool_type.cmp(&b.tool_type)));

    PromptAnalysis {
        source: opts.csv_path.clone(),
        tokenizer: tokenizer_name,
        rows: rows.len() as u64,
        roles,
        total_tokens,
        tool_tokens,
        tool_token_pct,
        tool_types,
        top_n: opts.top_n,
        conversation_count: conversations.len() as u64,
        zero_token_conversations,
        share_buckets: SHARE_BUCKET_LABELS
            .iter()
            .zip(bucket_counts)
            .map(|(&label, conversations)| ShareBucket { label, conversations })
            .collect(),
        over_threshold_conversations,
        dominant_tool_types,
        focus_tool_type: opts.focus_tool_type.clone(),
        focus_dominant_conversations,
        conversations,
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{:.2}", x)).unwrap_or_else(|| "-".to_string())
}

fn write_distribution(s: &mut String, label: &str, d: &Distribution) {
    let _ = writeln!(
        s,
        "  {:<12} count={} total={} mean={} min={} max={}",
        label,
        d.count,
        d.total,
        fmt_opt(d.mean),
        d.min.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
        d.max.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
    );
    if !d.percentiles.is_empty() {
        let p: Vec<String> = d
            .percentiles
            .iter()
            .map(|p| format!("p{:.0}={:.2}", p.percentile, p.value))
            .collect();
        let _ = writeln!(s, "  {:<12} {}", "", p.join(" "));
    }
}

impl PromptAnalysis {
    pub fn format_text(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "Source:    {}", self.source.display());
        let _ = writeln!(s, "Tokenizer: {}", self.tokenizer);
        let _ = writeln!(s, "Rows:      {}", self.rows);

        let _ = writeln!(s, "\n===== Per-role token statistics =====");
        for r in &self.roles {
            let _ = writeln!(s, "[{}]", r.role.as_str().to_uppercase());
            write_distribution(&mut s, "num_tokens", &r.num_tokens);
            write_distribution(&mut s, "tool_tokens", &r.tool_tokens);
        }

        let _ = writeln!(s, "\n===== Tokens from tool calls =====");
        let _ = writeln!(s, "Total tokens:              {}", self.total_tokens);
        let _ = writeln!(s, "Tokens from tool calls:    {}", self.tool_tokens);
        let _ = writeln!(s, "Tool-call token share:     {:.2}%", self.tool_token_pct);

        let _ = writeln!(s, "\n===== Tool-call type proportion (top {}) =====", self.top_n);
        for t in self.tool_types.iter().take(self.top_n) {
            let _ = writeln!(s, "  {:<32} {:>8}  {:>6.2}%", t.tool_type, t.count, t.share_pct);
        }
        let _ = writeln!(s, "\n===== Average tool tokens per call, by type =====");
        let mut by_avg: Vec<&ToolTypeStats> = self.tool_types.iter().collect();
        by_avg.sort_by(|a, b| {
            b.avg_tool_tokens
                .total_cmp(&a.avg_tool_tokens)
                .then_with(|| a.tool_type.cmp(&b.tool_type))
        });
        for t in by_avg {
            let _ = writeln!(s, "  {:<32} {:>10.2}", t.tool_type, t.avg_tool_tokens);
        }

        let _ = writeln!(s, "\n===== Per-conversation tool-call token share =====");
        let _ = writeln!(s, "Conversations:             {}", self.conversation_count);
        if self.zero_token_conversations > 0 {
            let _ = writeln!(s, "Without tokens (excluded): {}", self.zero_token_conversations);
        }
        for b in &self.share_buckets {
            let _ = writeln!(s, "  {:<10} {:>8}", b.label, b.conversations);
        }
        let _ = writeln!(
            s,
            "Conversations with tool tokens > {}%: {}",
            TOOL_CALL_SHARE_THRESHOLD_PCT, self.over_threshold_conversations
        );

        let _ = writeln!(s, "\n===== Dominant tool-call type per conversation =====");
        for d in &self.dominant_tool_types {
            let _ = writeln!(s, "  {:<32} {:>8}", d.tool_type, d.conversations);
        }
        let _ = writeln!(
            s,
            "Conversations dominated by {}: {}",
            self.focus_tool_type, self.focus_dominant_conversations
        );
        s
    }
}

pub fn run_analyze(opts: &AnalyzeOptions) -> Result<PromptAnalysis> {
    let records = load_prompt_records(&opts.csv_path)?;
    info!("Loaded {} rows from {}", records.len(), opts.csv_path.display());

    let tokenizer = opts.tokenizer.build();
    let scanner = ToolCallScanner::new();
    let scored = score_rows(&records, tokenizer.as_ref(), &scanner);
    debug!("Scored {} rows with the {} tokenizer", scored.len(), tokenizer.name());

    let analysis = analyze_rows(&scored, opts, tokenizer.name());
    if let Some(path) = &opts.export_tsv {
        let exporter = TsvExporter::new(path.clone());
        exporter.export_conversations(&analysis.conversations)?;
        info!("Wrote per-conversation stats to {}", path.display());
    }
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(conv: &str, role: &str, tokens: u64, tool: u64, ty: Option<&str>) -> ScoredRow {
        ScoredRow {
            conversation_id: conv.to_string(),
            role: role.to_string(),
            num_tokens: tokens,
            tool_tokens: tool,
            tool_type: ty.map(str::to_string),
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        assert!(exceeds_tool_share(81, 100));
        assert!(!exceeds_tool_share(80, 100));
        assert!(!exceeds_tool_share(0, 0));
    }

    #[test]
    fn test_share_buckets() {
        assert_eq!(share_bucket(0.0), 0);
        assert_eq!(share_bucket(20.0), 0);
        assert_eq!(share_bucket(20.01), 1);
        assert_eq!(share_bucket(80.0), 3);
        assert_eq!(share_bucket(81.0), 4);
        assert_eq!(share_bucket(100.0), 4);
    }

    #[test]
    fn test_percentile_interpolation() {
        let v = [10, 20, 30, 40];
        assert_eq!(percentile(&v, 0.5), Some(25.0));
        assert_eq!(percentile(&v, 0.0), Some(10.0));
        assert_eq!(percentile(&v, 1.0), Some(40.0));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn test_distribution_mean() {
        let d = Distribution::from_values(vec![3, 1, 2]);
        assert_eq!(d.mean, Some(2.0));
        assert_eq!((d.min, d.max, d.total), (Some(1), Some(3), 6));
        assert!(Distribution::from_values(vec![]).mean.is_none());
    }

    #[test]
    fn test_dominant_type_tie_breaks() {
        let rows = vec![
            row("c1", "assistant", 10, 5, Some("b")),
            row("c1", "assistant", 10, 9, Some("a")),
            row("c1", "assistant", 10, 5, Some("b")),
            row("c2", "assistant", 10, 4, Some("z")),
            row("c2", "assistant", 10, 4, Some("y")),
            row("c3", "assistant", 10, 6, Some("q")),
            row("c3", "assistant", 10, 2, Some("p")),
        ];
        let a = analyze_rows(&rows, &AnalyzeOptions::new("p.csv"), "regex");
        let dom: Vec<_> = a.conversations.iter().map(|c| c.dominant_tool_type.clone().unwrap()).collect();
        // most frequent, then more tool tokens, then smallest name
        assert_eq!(dom, vec!["b", "y", "q"]);
    }

    #[test]
    fn test_zero_token_conversations_are_excluded_from_buckets() {
        let rows = vec![row("empty", "user", 0, 0, None), row("full", "user", 10, 0, None)];
        let a = analyze_rows(&rows, &AnalyzeOptions::new("p.csv"), "regex");
        assert_eq!(a.zero_token_conversations, 1);
        assert_eq!(a.share_buckets.iter().map(|b| b.conversations).sum::<u64>(), 1);
    }
}
