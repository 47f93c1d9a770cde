// Fetch Stage Integration Tests
// Drives run_fetch against an in-memory object store
//
// No credentials needed: the S3 client is replaced by MockStore.
//
// Run with: cargo test --test fetch_tests -- --nocapture

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use agent_trace_stats::fetch::{fetch_one, run_fetch, FetchOptions, FetchOutcome};
use agent_trace_stats::retry::RetryConfig;
use agent_trace_stats::store::{ObjectEntry, ObjectStore};

/// In-memory bucket: key -> (last_modified, body)
#[derive(Default)]
struct MockStore {
    objects: Mutex<BTreeMap<String, (DateTime<Utc>, Vec<u8>)>>,
    downloads: AtomicU32,
    /// Number of GET calls that fail before GETs start succeeding
    failing_gets: AtomicU32,
}

impl MockStore {
    fn put(&self, key: &str, secs: i64, body: &[u8]) {
        let ts = Utc.timestamp_opt(secs, 0).unwrap();
        self.objects.lock().unwrap().insert(key.to_string(), (ts, body.to_vec()));
    }
}

#[async_trait]
impl ObjectStore for MockStore {
    fn describe(&self) -> String {
        "mock://bucket".to_string()
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (ts, body))| ObjectEntry {
                key: k.clone(),
                last_modified: *ts,
                size: body.len() as u64,
            })
            .collect())
    }

    async fn download_to(&self, key: &str, dest: &Path) -> Result<u64> {
        if self.failing_gets.load(Ordering::SeqCst) > 0 {
            self.failing_gets.fetch_sub(1, Ordering::SeqCst);
            return Err(anyhow!("injected GET failure"));
        }
        let body = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| anyhow!("NoSuchKey: {}", key))?;
        tokio::fs::write(dest, &body).await?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(body.len() as u64)
    }
}

const ID_A: &str = "aaaaaaaa-1111-4000-8000-000000000001";
const ID_B: &str = "bbbbbbbb-2222-4000-8000-000000000002";
const ID_C: &str = "cccccccc-3333-4000-8000-000000000003";

fn setup(ids: &[&str]) -> Result<(TempDir, FetchOptions)> {
    let dir = TempDir::new()?;
    let csv = dir.path().join("ids.csv");
    let mut body = String::from("id,agent_type\n");
    for id in ids {
        body.push_str(&format!("{},coder\n", id));
    }
    std::fs::write(&csv, body)?;

    let mut opts = FetchOptions::new(&csv, dir.path().join("downloads"));
    opts.max_threads = 4;
    opts.retry = RetryConfig {
        initial_delay_ms: 1,
        max_delay_ms: 2,
        jitter_factor: 0.0,
        ..RetryConfig::default()
    };
    Ok((dir, opts))
}

#[tokio::test]
async fn test_two_of_three_ids_downloaded() -> Result<()> {
    let (dir, opts) = setup(&[ID_A, ID_B, ID_C])?;
    let store = Arc::new(MockStore::default());
    store.put(&format!("{ID_A}/old.json.gz"), 100, b"old");
    store.put(&format!("{ID_A}/new.json.gz"), 200, b"new");
    store.put(&format!("{ID_B}/trace.json.gz"), 100, b"b");
    store.put(&format!("{ID_C}/trace.json"), 100, b"not compressed");

    let report = run_fetch(store.clone(), &opts).await?;
    let s = report.tracker.summary();

    assert_eq!(report.ids_loaded, 3);
    assert_eq!(s.succeeded, 2);
    assert_eq!(s.skipped, 1);
    assert_eq!(s.failed, 0);
    assert_eq!(store.downloads.load(Ordering::SeqCst), 2);
    assert_eq!(report.missing_ids, vec![ID_C.to_string()]);

    let newest = opts.download_root.join(ID_A).join("new.json.gz");
    assert_eq!(std::fs::read(&newest)?, b"new");
    assert!(!opts.download_root.join(ID_A).join("old.json.gz").exists());
    assert!(!opts.download_root.join(ID_C).exists(), "no directory for a missing id");

    let missing = std::fs::read_to_string(dir.path().join("missing_ids.txt"))?;
    assert_eq!(missing, format!("{ID_C}\n"));
    Ok(())
}

#[tokio::test]
async fn test_rerun_skips_existing_files() -> Result<()> {
    let (_dir, opts) = setup(&[ID_A, ID_B])?;
    let store = Arc::new(MockStore::default());
    store.put(&format!("{ID_A}/t.json.gz"), 1, b"a");
    store.put(&format!("{ID_B}/t.json.gz"), 1, b"b");

    run_fetch(store.clone(), &opts).await?;
    let second = run_fetch(store.clone(), &opts).await?;

    let s = second.tracker.summary();
    assert_eq!(s.succeeded, 0);
    assert_eq!(s.already_present, 2);
    assert!(second.tracker.ensure_progress().is_ok());
    assert_eq!(store.downloads.load(Ordering::SeqCst), 2);
    assert!(second.missing_ids_path.is_none());
    Ok(())
}

#[tokio::test]
async fn test_equal_timestamps_pick_greatest_key() -> Result<()> {
    let (_dir, opts) = setup(&[ID_A])?;
    let store = MockStore::default();
    store.put(&format!("{ID_A}/a.json.gz"), 500, b"a");
    store.put(&format!("{ID_A}/z.json.gz"), 500, b"z");

    let outcome = fetch_one(&store, ID_A, &opts).await?;
    assert_eq!(
        outcome,
        FetchOutcome::Downloaded {
            key: format!("{ID_A}/z.json.gz"),
            bytes: 1
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_transient_get_failures_are_retried() -> Result<()> {
    let (_dir, opts) = setup(&[ID_A])?;
    let store = MockStore::default();
    store.put(&format!("{ID_A}/t.json.gz"), 1, b"data");
    store.failing_gets.store(2, Ordering::SeqCst);

    let outcome = fetch_one(&store, ID_A, &opts).await?;
    assert!(matches!(outcome, FetchOutcome::Downloaded { bytes: 4, .. }));
    let id_dir = opts.download_root.join(ID_A);
    let names: Vec<_> = std::fs::read_dir(&id_dir)?.map(|e| e.unwrap().file_name()).collect();
    assert_eq!(names, vec![std::ffi::OsString::from("t.json.gz")], "no .part file left behind");
    Ok(())
}

#[tokio::test]
async fn test_all_failures_fail_the_stage() -> Result<()> {
    let (_dir, mut opts) = setup(&[ID_A])?;
    opts.retry.max_retries = 1;
    let store = Arc::new(MockStore::default());
    store.put(&format!("{ID_A}/t.json.gz"), 1, b"data");
    store.failing_gets.store(10, Ordering::SeqCst);

    let report = run_fetch(store, &opts).await?;
    assert_eq!(report.tracker.summary().failed, 1);
    assert_eq!(report.missing_ids, vec![ID_A.to_string()]);
    assert!(report.tracker.ensure_progress().is_err());
    assert!(!opts.download_root.join(ID_A).join("t.json.gz.part").exists());
    Ok(())
}

#[tokio::test]
async fn test_clean_rerun_removes_stale_missing_list() -> Result<()> {
    let (dir, opts) = setup(&[ID_A, ID_B])?;
    let store = Arc::new(MockStore::default());
    store.put(&format!("{ID_A}/t.json.gz"), 1, b"a");

    let first = run_fetch(store.clone(), &opts).await?;
    assert_eq!(first.missing_ids, vec![ID_B.to_string()]);
    assert!(dir.path().join("missing_ids.txt").exists());

    store.put(&format!("{ID_B}/t.json.gz"), 1, b"b");
    let second = run_fetch(store.clone(), &opts).await?;
    assert!(second.missing_ids.is_empty());
    assert!(second.missing_ids_path.is_none());
    assert!(!dir.path().join("missing_ids.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_ids_outside_download_root_are_rejected() -> Result<()> {
    let (dir, opts) = setup(&["../escape", "/tmp/abs-id", ID_A])?;
    let store = Arc::new(MockStore::default());
    store.put("../escape/t.json.gz", 1, b"x");
    store.put(&format!("{ID_A}/t.json.gz"), 1, b"a");

    let report = run_fetch(store.clone(), &opts).await?;
    let s = report.tracker.summary();
    assert_eq!((s.succeeded, s.failed), (1, 2));
    assert_eq!(store.downloads.load(Ordering::SeqCst), 1);
    assert!(!dir.path().join("escape").exists());
    assert_eq!(report.missing_ids, vec!["../escape".to_string(), "/tmp/abs-id".to_string()]);
    Ok(())
}
