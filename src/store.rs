// src/store.rs
//
// Object-store seam used by the fetcher.
//
// `ObjectStore` is the narrow surface we need: list every object under a key
// prefix (with its last-modified time) and stream one object to a local file.
// `S3Store` talks to S3 (or any S3-compatible endpoint picked up from
// `AWS_ENDPOINT_URL`) through the AWS SDK.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short human-readable location, e.g. `s3://bucket (us-west-2)`
    fn describe(&self) -> String;

    /// All objects whose key starts with `prefix` (every page)
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectEntry>>;

    /// Stream `key` into `dest`, returning bytes written.
    /// `dest` is created or truncated.
    async fn download_to(&self, key: &str, dest: &Path) -> Result<u64>;
}

/// Latest object ending in `suffix`: maximum `last_modified`, ties resolved to
/// the lexicographically greatest key so repeated runs pick the same object.
pub fn select_latest<'a>(objects: &'a [ObjectEntry], suffix: &str) -> Option<&'a ObjectEntry> {
    objects
        .iter()
        .filter(|o| o.key.ends_with(suffix))
        .max_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.key.cmp(&b.key))
        })
}

/// Last `/`-separated component of an object key
pub fn key_basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

// =============================================================================
// S3
// =============================================================================

pub struct S3Store {
    client: s3::Client,
    bucket: String,
    region: String,
}

impl S3Store {
    /// Load credentials and endpoint from the standard AWS environment
    pub async fn connect(bucket: &str, region: &str) -> Result<Self> {
        let cfg = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        let client = s3::Client::new(&cfg);
        debug!("S3 client ready for bucket {} in {}", bucket, region);
        Ok(Self {
            client,
            bucket: bucket.to_string(),
            region: region.to_string(),
        })
    }
}

fn to_chrono(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    dt.and_then(|d| DateTime::from_timestamp(d.secs(), d.subsec_nanos()))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[async_trait]
impl ObjectStore for S3Store {
    fn describe(&self) -> String {
        format!("s3://{} ({})", self.bucket, self.region)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let mut out = Vec::new();
        let mut cont: Option<String> = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(c) = cont.as_deref() {
                req = req.continuation_token(c);
            }
            let resp = req
                .send()
                .await
                .with_context(|| format!("LIST s3://{}/{}", self.bucket, prefix))?;
            for obj in resp.contents() {
                if let Some(k) = obj.key() {
                    out.push(ObjectEntry {
                        key: k.to_string(),
                        last_modified: to_chrono(obj.last_modified()),
                        size: obj.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }
            match resp.next_continuation_token() {
                Some(tok) if !tok.is_empty() => cont = Some(tok.to_string()),
                _ => break,
            }
        }
        Ok(out)
    }

    async fn download_to(&self, key: &str, dest: &Path) -> Result<u64> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("GET s3://{}/{}", self.bucket, key))?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let mut body = resp.body;
        let mut written = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .with_context(|| format!("Reading body of s3://{}/{}", self.bucket, key))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(key: &str, secs: i64) -> ObjectEntry {
        ObjectEntry {
            key: key.to_string(),
            last_modified: Utc.timestamp_opt(secs, 0).unwrap(),
            size: 10,
        }
    }

    #[test]
    fn test_select_latest_by_timestamp() {
        let objs = vec![entry("id/a.gz", 100), entry("id/b.gz", 300), entry("id/c.gz", 200)];
        assert_eq!(select_latest(&objs, ".gz").unwrap().key, "id/b.gz");
    }

    #[test]
    fn test_select_latest_ignores_other_suffixes() {
        let objs = vec![entry("id/a.gz", 100), entry("id/newer.json", 900)];
        assert_eq!(select_latest(&objs, ".gz").unwrap().key, "id/a.gz");
        assert!(select_latest(&objs[1..], ".gz").is_none());
    }

    #[test]
    fn test_select_latest_tie_is_deterministic() {
        let forward = vec![entry("id/a.gz", 500), entry("id/b.gz", 500)];
        let reverse = vec![entry("id/b.gz", 500), entry("id/a.gz", 500)];
        assert_eq!(select_latest(&forward, ".gz").unwrap().key, "id/b.gz");
        assert_eq!(select_latest(&reverse, ".gz").unwrap().key, "id/b.gz");
    }

    #[test]
    fn test_key_basename() {
        assert_eq!(key_basename("abc/2024/trace.json.gz"), "trace.json.gz");
        assert_eq!(key_basename("trace.gz"), "trace.gz");
    }
}
