// src/decompress.rs
//
// Stage 2: decompress every `<name><suffix>` under the download root into its
// sibling `<name>`, keeping the archive. Runs on a bounded rayon pool.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::constants::{format_bytes_binary, DEFAULT_COMPRESSED_SUFFIX, DEFAULT_DECOMPRESS_MAX_THREADS};
use crate::error::PipelineError;
use crate::tracker::ItemTracker;

#[derive(Debug, Clone)]
pub struct DecompressOptions {
    pub download_root: PathBuf,
    pub suffix: String,
    pub max_threads: usize,
}

impl DecompressOptions {
    pub fn new(download_root: impl Into<PathBuf>) -> Self {
        Self {
            download_root: download_root.into(),
            suffix: DEFAULT_COMPRESSED_SUFFIX.to_string(),
            max_threads: DEFAULT_DECOMPRESS_MAX_THREADS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecompressOutcome {
    Decompressed { bytes: u64 },
    AlreadyPresent,
}

/// Files under `root` whose name ends in `suffix`, sorted by path
pub fn find_compressed_files(root: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.file_type().is_file() && entry.file_name().to_string_lossy().ends_with(suffix) {
            out.push(entry.into_path());
        }
    }
    out.sort();
    Ok(out)
}

/// `a/b/trace.json.gz` -> `a/b/trace.json`
pub fn decompressed_path(archive: &Path, suffix: &str) -> Option<PathBuf> {
    let name = archive.file_name()?.to_str()?;
    let stripped = name.strip_suffix(suffix)?;
    if stripped.is_empty() {
        return None;
    }
    Some(archive.with_file_name(stripped))
}

/// Decompress one archive next to itself. The output only appears once the
/// whole stream decoded; a corrupt archive leaves nothing behind.
pub fn decompress_one(archive: &Path, suffix: &str) -> Result<DecompressOutcome> {
    let out = decompressed_path(archive, suffix)
        .with_context(|| format!("{} has no name left after stripping {}", archive.display(), suffix))?;
    if out.exists() {
        debug!("{} already decompressed", out.display());
        return Ok(DecompressOutcome::AlreadyPresent);
    }

    let dir = archive.parent().unwrap_or_else(|| Path::new("."));
    let input = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(input));
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;

    let bytes = io::copy(&mut decoder, tmp.as_file_mut())
        .with_context(|| format!("Failed to decompress {}", archive.display()))?;
    tmp.persist(&out)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to write {}", out.display()))?;

    Ok(DecompressOutcome::Decompressed { bytes })
}

pub struct DecompressReport {
    pub files_found: usize,
    pub bytes_written: u64,
    pub tracker: ItemTracker,
    pub elapsed: Duration,
}

impl DecompressReport {
    pub fn print_summary(&self) {
        let s = self.tracker.summary();
        println!("\n=== Decompress Summary ===");
        println!("Archives found:       {}", self.files_found);
        println!("Decompressed:         {} ({})", s.succeeded, format_bytes_binary(self.bytes_written));
        println!("Already decompressed: {}", s.already_present);
        println!("Failed:               {}", s.failed);
        println!("Elapsed:              {:.2}s", self.elapsed.as_secs_f64());
        print!("{}", self.tracker.format_problems());
    }
}

pub fn run_decompress(opts: &DecompressOptions) -> Result<DecompressReport> {
    let start = Instant::now();
    if !opts.download_root.is_dir() {
        return Err(PipelineError::config(format!(
            "download root does not exist: {}",
            opts.download_root.display()
        ))
        .into());
    }

    let files = find_compressed_files(&opts.download_root, &opts.suffix)?;
    info!("Found {} {} files under {}", files.len(), opts.suffix, opts.download_root.display());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.max_threads.max(1))
        .build()
        .context("Failed to build decompress thread pool")?;

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} files ({per_sec}) {msg}",
        )?
        .progress_chars("#>-"),
    );
    pb.set_message("decompressing");

    let outcomes: Vec<Result<DecompressOutcome>> = pool.install(|| {
        files
            .par_iter()
            .map(|f| {
                let r = decompress_one(f, &opts.suffix);
                pb.inc(1);
                r
            })
            .collect()
    });
    pb.finish_with_message("done");

    let mut tracker = ItemTracker::new("decompress");
    let mut bytes_written = 0u64;
    for (file, outcome) in files.iter().zip(outcomes) {
        match outcome {
            Ok(DecompressOutcome::Decompressed { bytes }) => {
                bytes_written += bytes;
                tracker.record_success();
            }
            Ok(DecompressOutcome::AlreadyPresent) => tracker.record_already_present(),
            Err(e) => tracker.record_failure(file.display().to_string(), format!("{:#}", e)),
        }
    }

    Ok(DecompressReport {
        files_found: files.len(),
        bytes_written,
        tracker,
        elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_decompressed_path() {
        assert_eq!(
            decompressed_path(Path::new("/r/id/t.json.gz"), ".gz"),
            Some(PathBuf::from("/r/id/t.json"))
        );
        assert_eq!(decompressed_path(Path::new("/r/.gz"), ".gz"), None);
        assert_eq!(decompressed_path(Path::new("/r/t.json"), ".gz"), None);
    }

    #[test]
    fn test_multi_member_stream() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("t.json.gz");
        let mut bytes = gzip(b"hello ");
        bytes.extend(gzip(b"world"));
        fs::write(&archive, bytes).unwrap();

        let outcome = decompress_one(&archive, ".gz").unwrap();
        assert_eq!(outcome, DecompressOutcome::Decompressed { bytes: 11 });
        assert_eq!(fs::read(dir.path().join("t.json")).unwrap(), b"hello world");
    }

    #[test]
    fn test_corrupt_archive_leaves_no_output() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("bad.json.gz");
        fs::write(&archive, b"definitely not gzip").unwrap();

        assert!(decompress_one(&archive, ".gz").is_err());
        let names: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names.len(), 1, "only the archive should remain: {:?}", names);
    }
}
