// src/fetch.rs
//
// Stage 1: download the latest compressed trace for every identifier in a CSV.
//
// Layout on disk: `<download_root>/<identifier>/<basename-of-key>`.
// Identifiers without a matching object, or whose download failed after all
// retries, are written one per line to the missing-ids file.

use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::constants::{
    format_bytes_binary, DEFAULT_BUCKET_NAME, DEFAULT_COMPRESSED_SUFFIX, DEFAULT_FETCH_MAX_THREADS,
    DEFAULT_ID_COLUMN, DEFAULT_REGION_NAME, DOWNLOAD_PART_SUFFIX, MISSING_IDS_FILENAME,
};
use crate::error::PipelineError;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::store::{key_basename, select_latest, ObjectStore};
use crate::tracker::ItemTracker;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub csv_path: PathBuf,
    pub id_column: String,
    pub download_root: PathBuf,
    pub bucket_name: String,
    pub region_name: String,
    pub suffix: String,
    pub max_threads: usize,
    /// Defaults to `missing_ids.txt` next to the download root
    pub missing_out: Option<PathBuf>,
    pub retry: RetryConfig,
}

impl FetchOptions {
    pub fn new(csv_path: impl Into<PathBuf>, download_root: impl Into<PathBuf>) -> Self {
        Self {
            csv_path: csv_path.into(),
            id_column: DEFAULT_ID_COLUMN.to_string(),
            download_root: download_root.into(),
            bucket_name: DEFAULT_BUCKET_NAME.to_string(),
            region_name: DEFAULT_REGION_NAME.to_string(),
            suffix: DEFAULT_COMPRESSED_SUFFIX.to_string(),
            max_threads: DEFAULT_FETCH_MAX_THREADS,
            missing_out: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn missing_ids_path(&self) -> PathBuf {
        match &self.missing_out {
            Some(p) => p.clone(),
            None => self
                .download_root
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(MISSING_IDS_FILENAME),
        }
    }
}

/// Distinct, trimmed, non-empty values of `column`, in first-seen order
pub fn load_ids_from_csv(path: &Path, column: &str) -> Result<Vec<String>> {
    let file = File::open(path)
        .map_err(|e| PipelineError::config(format!("cannot open id CSV {}: {}", path.display(), e)))?;
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).flexible(true).from_reader(file);

    let headers: Vec<String> = rdr
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if let Some(err) = PipelineError::check_columns(path, &headers, &[column]) {
        return Err(err.into());
    }
    let col_idx = headers.iter().position(|h| h == column).unwrap_or_default();

    let mut seen = std::collections::HashSet::new();
    let mut ids = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("{}: bad record at line {}", path.display(), line + 2))?;
        let value = record.get(col_idx).unwrap_or("").trim();
        if !value.is_empty() && seen.insert(value.to_string()) {
            ids.push(value.to_string());
        }
    }
    Ok(ids)
}

/// What happened to one identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded { key: String, bytes: u64 },
    AlreadyPresent { path: PathBuf },
    NoMatchingObject,
}

fn part_path(target: &Path) -> PathBuf {
    let mut s = target.as_os_str().to_os_string();
    s.push(DOWNLOAD_PART_SUFFIX);
    PathBuf::from(s)
}

/// An id becomes one directory under the download root, so it must be a
/// single plain path component
fn ensure_safe_id(id: &str) -> Result<()> {
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == id => Ok(()),
        _ => anyhow::bail!("id {:?} is not a plain directory name", id),
    }
}

/// List, select and download the latest object for one identifier
pub async fn fetch_one(store: &dyn ObjectStore, id: &str, opts: &FetchOptions) -> Result<FetchOutcome> {
    ensure_safe_id(id)?;
    let objects = retry_with_backoff(&format!("LIST {}", id), &opts.retry, || store.list_prefix(id))
        .await
        .into_result()?;

    let Some(latest) = select_latest(&objects, &opts.suffix) else {
        debug!("{}: {} objects listed, none ending in {}", id, objects.len(), opts.suffix);
        return Ok(FetchOutcome::NoMatchingObject);
    };

    let id_dir = opts.download_root.join(id);
    let target = id_dir.join(key_basename(&latest.key));
    if target.exists() {
        debug!("{}: {} already present", id, target.display());
        return Ok(FetchOutcome::AlreadyPresent { path: target });
    }

    tokio::fs::create_dir_all(&id_dir)
        .await
        .with_context(|| format!("Failed to create {}", id_dir.display()))?;

    let part = part_path(&target);
    let key = latest.key.clone();
    let result = retry_with_backoff(&format!("GET {}", key), &opts.retry, || store.download_to(&key, &part))
        .await
        .into_result();

    match result {
        Ok(bytes) => {
            tokio::fs::rename(&part, &target)
                .await
                .with_context(|| format!("Failed to move {} into place", part.display()))?;
            Ok(FetchOutcome::Downloaded { key, bytes })
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            Err(e)
        }
    }
}

pub struct FetchReport {
    pub ids_loaded: usize,
    pub bytes_downloaded: u64,
    pub tracker: ItemTracker,
    /// Identifiers with no matching object or a failed download, input order
    pub missing_ids: Vec<String>,
    pub missing_ids_path: Option<PathBuf>,
    pub elapsed: Duration,
}

impl FetchReport {
    pub fn print_summary(&self) {
        let s = self.tracker.summary();
        println!("\n=== Fetch Summary ===");
        println!("Ids loaded:        {}", self.ids_loaded);
        println!("Downloaded:        {} ({})", s.succeeded, format_bytes_binary(self.bytes_downloaded));
        println!("Already present:   {}", s.already_present);
        println!("Missing:           {}", s.skipped);
        println!("Failed:            {}", s.failed);
        println!("Elapsed:           {:.2}s", self.elapsed.as_secs_f64());
        if let Some(p) = &self.missing_ids_path {
            println!("\nMissing ids saved to: {}", p.display());
        }
        print!("{}", self.tracker.format_problems());
    }
}

/// Fetch every identifier from `opts.csv_path` with bounded concurrency
pub async fn run_fetch(store: Arc<dyn ObjectStore>, opts: &FetchOptions) -> Result<FetchReport> {
    let start = Instant::now();
    let ids = load_ids_from_csv(&opts.csv_path, &opts.id_column)?;
    info!("Loaded {} ids from {}", ids.len(), opts.csv_path.display());

    std::fs::create_dir_all(&opts.download_root)
        .with_context(|| format!("Failed to create download root {}", opts.download_root.display()))?;

    let concurrency = opts.max_threads.max(1);
    info!("Fetching from {} with {} workers", store.describe(), concurrency);

    let pb = ProgressBar::new(ids.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ids ({per_sec}) {msg}",
        )?
        .progress_chars("#>-"),
    );
    pb.set_message("downloading");

    let shared = Arc::new(opts.clone());
    let sem = Arc::new(Semaphore::new(concurrency));
    let mut futs = FuturesUnordered::new();

    for (idx, id) in ids.iter().enumerate() {
        let sem2 = sem.clone();
        let store2 = store.clone();
        let opts2 = shared.clone();
        let id = id.clone();
        futs.push(tokio::spawn(async move {
            let outcome = match sem2.acquire_owned().await {
                Ok(_permit) => fetch_one(store2.as_ref(), &id, &opts2).await,
                Err(e) => Err(e.into()),
            };
            (idx, id, outcome)
        }));
    }

    let mut results: Vec<(usize, String, Result<FetchOutcome>)> = Vec::with_capacity(ids.len());
    let mut tracker = ItemTracker::new("fetch");
    while let Some(res) = futs.next().await {
        pb.inc(1);
        match res {
            Ok(r) => results.push(r),
            Err(e) => {
                error!("Fetch task panicked: {}", e);
                tracker.record_failure("<task>", e.to_string());
            }
        }
    }

    // Report in input order regardless of completion order
    results.sort_by_key(|(idx, _, _)| *idx);
    let mut bytes_downloaded = 0u64;
    let mut missing_ids = Vec::new();
    for (_, id, outcome) in results {
        match outcome {
            Ok(FetchOutcome::Downloaded { bytes, .. }) => {
                bytes_downloaded += bytes;
                tracker.record_success();
            }
            Ok(FetchOutcome::AlreadyPresent { .. }) => tracker.record_already_present(),
            Ok(FetchOutcome::NoMatchingObject) => {
                tracker.record_skipped(&id, format!("no object ending in {}", opts.suffix));
                missing_ids.push(id);
            }
            Err(e) => {
                tracker.record_failure(&id, format!("{:#}", e));
                missing_ids.push(id);
            }
        }
    }
    pb.finish_with_message("done");

    let missing_ids_path = if missing_ids.is_empty() {
        // Drop the list left by an earlier run
        let stale = opts.missing_ids_path();
        if stale.exists() {
            std::fs::remove_file(&stale).with_context(|| format!("Failed to remove {}", stale.display()))?;
            debug!("Removed stale {}", stale.display());
        }
        None
    } else {
        let path = opts.missing_ids_path();
        let mut body = missing_ids.join("\n");
        body.push('\n');
        std::fs::write(&path, body).with_context(|| format!("Failed to write {}", path.display()))?;
        Some(path)
    };

    Ok(FetchReport {
        ids_loaded: ids.len(),
        bytes_downloaded,
        tracker,
        missing_ids,
        missing_ids_path,
        elapsed: start.elapsed(),
    })
}
