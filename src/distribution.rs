// src/distribution.rs
//
// Stage 3: join the identifiers found on disk against agent metadata and
// report how they spread over agent_type and agent_execution_mode.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::constants::{
    AGENT_TYPE_COL, EMPTY_CATEGORY_LABEL, ID_COL, METADATA_REQUIRED_COLUMNS, MODE_COL, UNMATCHED_PRINT_LIMIT,
};
use crate::error::PipelineError;
use crate::identifier::IdShape;

#[derive(Debug, Clone)]
pub struct DistributionOptions {
    pub data_root: PathBuf,
    /// Files or directories; a directory contributes every `*.csv` directly inside it
    pub csv_paths: Vec<PathBuf>,
    pub id_shape: IdShape,
    pub unmatched_out: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentMetadata {
    pub agent_type: String,
    pub agent_execution_mode: String,
}

// =============================================================================
// Metadata CSV
// =============================================================================

/// Expand `--csv-path` values into candidate files, sorted lexicographically
pub fn expand_csv_candidates(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = BTreeSet::new();
    for p in paths {
        if p.is_dir() {
            let entries = std::fs::read_dir(p).with_context(|| format!("Failed to list {}", p.display()))?;
            for entry in entries {
                let path = entry?.path();
                let is_csv = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("csv"))
                    .unwrap_or(false);
                if is_csv && path.is_file() {
                    out.insert(path);
                }
            }
        } else if p.is_file() {
            out.insert(p.clone());
        } else {
            return Err(PipelineError::config(format!("metadata CSV path does not exist: {}", p.display())).into());
        }
    }
    Ok(out.into_iter().collect())
}

fn read_headers(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
    Ok(rdr
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect())
}

/// First candidate (in the order given) whose header has every metadata column
pub fn select_metadata_csv(candidates: &[PathBuf]) -> Result<PathBuf> {
    let mut last_err = None;
    for path in candidates {
        let headers = read_headers(path)?;
        match PipelineError::check_columns(path, &headers, &METADATA_REQUIRED_COLUMNS) {
            None => {
                info!("Using metadata CSV {}", path.display());
                return Ok(path.clone());
            }
            Some(err) => {
                warn!("Skipping {}: {}", path.display(), err);
                last_err = Some(err);
            }
        }
    }
    Err(match last_err {
        Some(err) => err.into(),
        None => PipelineError::config("no metadata CSV candidates given").into(),
    })
}

/// Metadata keyed by id; the first row of a repeated id wins
#[derive(Debug, Clone)]
pub struct MetadataTable {
    pub source: PathBuf,
    pub rows: HashMap<String, AgentMetadata>,
    pub rows_read: usize,
    pub duplicate_ids: usize,
}

impl MetadataTable {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut rdr = csv::ReaderBuilder::new().has_headers(true).flexible(true).from_reader(file);
        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
        if let Some(err) = PipelineError::check_columns(path, &headers, &METADATA_REQUIRED_COLUMNS) {
            return Err(err.into());
        }
        let col = |name: &str| headers.iter().position(|h| h == name).unwrap_or_default();
        let (id_idx, type_idx, mode_idx) = (col(ID_COL), col(AGENT_TYPE_COL), col(MODE_COL));

        let mut rows = HashMap::new();
        let mut rows_read = 0;
        let mut duplicate_ids = 0;
        for (line, record) in rdr.records().enumerate() {
            let record = record.with_context(|| format!("{}: bad record at line {}", path.display(), line + 2))?;
            rows_read += 1;
            let id = record.get(id_idx).unwrap_or("").trim();
            if id.is_empty() {
                continue;
            }
            if rows.contains_key(id) {
                duplicate_ids += 1;
                continue;
            }
            rows.insert(
                id.to_string(),
                AgentMetadata {
                    agent_type: category(record.get(type_idx)),
                    agent_execution_mode: category(record.get(mode_idx)),
                },
            );
        }
        if duplicate_ids > 0 {
            warn!("{}: {} duplicate id rows ignored (first row wins)", path.display(), duplicate_ids);
        }
        Ok(Self {
            source: path.to_path_buf(),
            rows,
            rows_read,
            duplicate_ids,
        })
    }
}

fn category(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => EMPTY_CATEGORY_LABEL.to_string(),
    }
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryCount {
    pub value: String,
    pub count: u64,
}

/// agent_type (rows) x agent_execution_mode (columns)
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrossTab {
    pub rows: Vec<String>,
    pub columns: Vec<String>,
    pub counts: Vec<Vec<u64>>,
}

impl CrossTab {
    pub fn get(&self, row: &str, column: &str) -> u64 {
        let r = self.rows.iter().position(|x| x == row);
        let c = self.columns.iter().position(|x| x == column);
        match (r, c) {
            (Some(r), Some(c)) => self.counts[r][c],
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributionReport {
    pub metadata_csv: PathBuf,
    pub total_ids: usize,
    pub matched: usize,
    pub unmatched: Vec<String>,
    pub duplicate_ids_in_csv: usize,
    pub agent_type: Vec<CategoryCount>,
    pub agent_execution_mode: Vec<CategoryCount>,
    pub crosstab: CrossTab,
}

fn frequency(counts: BTreeMap<String, u64>) -> Vec<CategoryCount> {
    let mut out: Vec<CategoryCount> = counts
        .into_iter()
        .map(|(value, count)| CategoryCount { value, count })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    out
}

/// Left-join `ids` against `table`
pub fn analyze_distribution(ids: &BTreeSet<String>, table: &MetadataTable) -> DistributionReport {
    let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_mode: BTreeMap<String, u64> = BTreeMap::new();
    let mut joint: BTreeMap<(String, String), u64> = BTreeMap::new();
    let mut unmatched = Vec::new();
    let mut matched = 0;

    for id in ids {
        match table.rows.get(id) {
            Some(meta) => {
                matched += 1;
                *by_type.entry(meta.agent_type.clone()).or_default() += 1;
                *by_mode.entry(meta.agent_execution_mode.clone()).or_default() += 1;
                *joint
                    .entry((meta.agent_type.clone(), meta.agent_execution_mode.clone()))
                    .or_default() += 1;
            }
            None => unmatched.push(id.clone()),
        }
    }

    let rows: Vec<String> = by_type.keys().cloned().collect();
    let columns: Vec<String> = by_mode.keys().cloned().collect();
    let counts = rows
        .iter()
        .map(|r| {
            columns
                .iter()
                .map(|c| joint.get(&(r.clone(), c.clone())).copied().unwrap_or(0))
                .collect()
        })
        .collect();

    DistributionReport {
        metadata_csv: table.source.clone(),
        total_ids: ids.len(),
        matched,
        unmatched,
        duplicate_ids_in_csv: table.duplicate_ids,
        agent_type: frequency(by_type),
        agent_execution_mode: frequency(by_mode),
        crosstab: CrossTab { rows, columns, counts },
    }
}

impl DistributionReport {
    pub fn format_text(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "Metadata CSV:  {}", self.metadata_csv.display());
        let _ = writeln!(s, "Identifiers:   {}", self.total_ids);
        let _ = writeln!(s, "Matched:       {}", self.matched);
        let _ = writeln!(s, "Unmatched:     {}", self.unmatched.len());
        if self.duplicate_ids_in_csv > 0 {
            let _ = writeln!(s, "Duplicate ids in CSV (ignored): {}", self.duplicate_ids_in_csv);
        }

        for (title, table) in [
            ("agent_type", &self.agent_type),
            ("agent_execution_mode", &self.agent_execution_mode),
        ] {
            let _ = writeln!(s, "\n===== Distribution: {} =====", title);
            let width = table.iter().map(|c| c.value.len()).max().unwrap_or(0).max(title.len());
            for c in table {
                let _ = writeln!(s, "{:<width$}  {:>8}", c.value, c.count, width = width);
            }
        }

        let _ = writeln!(s, "\n===== Joint Distribution: agent_type x agent_execution_mode =====");
        let ct = &self.crosstab;
        let first = ct.rows.iter().map(String::len).max().unwrap_or(0).max(AGENT_TYPE_COL.len());
        let widths: Vec<usize> = ct.columns.iter().map(|c| c.len().max(6)).collect();
        let _ = write!(s, "{:<first$}", AGENT_TYPE_COL, first = first);
        for (c, w) in ct.columns.iter().zip(&widths) {
            let _ = write!(s, "  {:>w$}", c, w = *w);
        }
        let _ = writeln!(s);
        for (r, row) in ct.rows.iter().zip(&ct.counts) {
            let _ = write!(s, "{:<first$}", r, first = first);
            for (n, w) in row.iter().zip(&widths) {
                let _ = write!(s, "  {:>w$}", n, w = *w);
            }
            let _ = writeln!(s);
        }

        if !self.unmatched.is_empty() {
            let _ = writeln!(s, "\nUnmatched identifiers (first {}):", UNMATCHED_PRINT_LIMIT);
            for id in self.unmatched.iter().take(UNMATCHED_PRINT_LIMIT) {
                let _ = writeln!(s, "  {}", id);
            }
            if self.unmatched.len() > UNMATCHED_PRINT_LIMIT {
                let _ = writeln!(s, "  ... and {} more", self.unmatched.len() - UNMATCHED_PRINT_LIMIT);
            }
        }
        s
    }
}

pub fn run_distribution(opts: &DistributionOptions) -> Result<DistributionReport> {
    if !opts.data_root.is_dir() {
        return Err(PipelineError::config(format!("data root does not exist: {}", opts.data_root.display())).into());
    }
    let ids = opts.id_shape.collect_from_tree(&opts.data_root)?;
    info!("Found {} identifiers under {}", ids.len(), opts.data_root.display());

    let candidates = expand_csv_candidates(&opts.csv_paths)?;
    debug!("Metadata CSV candidates: {:?}", candidates);
    let table = MetadataTable::load(&select_metadata_csv(&candidates)?)?;
    info!("Loaded {} metadata rows from {}", table.rows_read, table.source.display());

    let report = analyze_distribution(&ids, &table);
    if let Some(path) = &opts.unmatched_out {
        let mut body = report.unmatched.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        std::fs::write(path, body).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {} unmatched identifiers to {}", report.unmatched.len(), path.display());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[(&str, &str, &str)]) -> MetadataTable {
        MetadataTable {
            source: PathBuf::from("meta.csv"),
            rows: rows
                .iter()
                .map(|(id, t, m)| {
                    (
                        id.to_string(),
                        AgentMetadata {
                            agent_type: category(Some(*t)),
                            agent_execution_mode: category(Some(*m)),
                        },
                    )
                })
                .collect(),
            rows_read: rows.len(),
            duplicate_ids: 0,
        }
    }

    #[test]
    fn test_join_counts_reconcile() {
        let ids: BTreeSet<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let t = table(&[("a", "coder", "auto"), ("b", "coder", "manual"), ("c", "", "auto"), ("z", "x", "y")]);
        let report = analyze_distribution(&ids, &t);

        assert_eq!(report.total_ids, 4);
        assert_eq!(report.matched, 3);
        assert_eq!(report.unmatched, vec!["d"]);
        assert_eq!(report.matched + report.unmatched.len(), report.total_ids);
        assert_eq!(report.agent_type[0], CategoryCount { value: "coder".into(), count: 2 });
        assert_eq!(report.crosstab.get(EMPTY_CATEGORY_LABEL, "auto"), 1);
        assert_eq!(report.crosstab.get("coder", "manual"), 1);
    }

    #[test]
    fn test_format_text_mentions_sections() {
        let ids: BTreeSet<String> = ["a"].iter().map(|s| s.to_string()).collect();
        let text = analyze_distribution(&ids, &table(&[("a", "coder", "auto")])).format_text();
        assert!(text.contains("Distribution: agent_type"));
        assert!(text.contains("Joint Distribution"));
    }
}
