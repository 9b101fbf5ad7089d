//! Artifact lineage and diff orchestration.
//!
//! Artifacts are content-addressed by the UTC timestamp embedded in their
//! keys. Given a newly-arrived summary, the resolver locates its immediate
//! predecessor by listing the summary bucket, drives the diff engine over
//! the pair, and uploads the resulting artifact to the diff bucket. Every
//! step is deterministic given the bucket state, so interrupted runs are
//! safe to re-invoke.

use crate::config::Config;
use crate::diff::{DiffArtifact, DiffMetadata};
use crate::store::ObjectStore;
use crate::summary::{Summary, format_key_timestamp, parse_key_timestamp_token};
use crate::{Result, RpkilogError};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Grammar accepted for any artifact key: optional `rpki-` prefix, compact
/// UTC timestamp (4- or 6-digit time), artifact suffix, optional `.bz2`.
const ARTIFACT_KEY_RE: &str = r"^(?:rpki-)?(\d{8}T\d{4,6}Z)\.(json|vrpdiff\.json|tgz)(\.bz2)?$";

/// Summary keys only.
const SUMMARY_KEY_RE: &str = r"^(\d{8}T\d{4,6}Z)\.json(\.bz2)?$";

/// Diff keys only.
const DIFF_KEY_RE: &str = r"^(\d{8}T\d{4,6}Z)\.vrpdiff\.json(\.bz2)?$";

/// Parse the timestamp embedded in any artifact key.
pub fn parse_artifact_key(key: &str) -> Result<DateTime<Utc>> {
    let re = Regex::new(ARTIFACT_KEY_RE).expect("artifact key regex is valid");
    let captures = re.captures(key).ok_or_else(|| RpkilogError::UnparsableKey {
        key: key.to_string(),
    })?;
    parse_key_timestamp_token(&captures[1])
}

/// List keys in a bucket matching `pattern`, with parsed timestamps.
fn list_timestamped_keys(
    store: &dyn ObjectStore,
    bucket: &str,
    pattern: &str,
) -> Result<Vec<(DateTime<Utc>, String)>> {
    let re = Regex::new(pattern).expect("key regex is valid");
    let mut keys = vec![];
    for key in store.list(bucket)? {
        let Some(captures) = re.captures(&key) else {
            warn!("unmatched key in bucket {}: {}", bucket, key);
            continue;
        };
        keys.push((parse_key_timestamp_token(&captures[1])?, key));
    }
    keys.sort();
    Ok(keys)
}

/// All summary keys in the bucket, ascending by embedded timestamp.
pub fn list_summary_keys(
    store: &dyn ObjectStore,
    bucket: &str,
) -> Result<Vec<(DateTime<Utc>, String)>> {
    list_timestamped_keys(store, bucket, SUMMARY_KEY_RE)
}

/// All diff keys in the bucket, ascending by embedded timestamp.
pub fn list_diff_keys(
    store: &dyn ObjectStore,
    bucket: &str,
) -> Result<Vec<(DateTime<Utc>, String)>> {
    list_timestamped_keys(store, bucket, DIFF_KEY_RE)
}

/// Locate the summary with the greatest embedded timestamp strictly below
/// the timestamp of `new_key`. `None` means `new_key` is the earliest
/// summary in the bucket (first-ever invocation).
pub fn find_predecessor(
    store: &dyn ObjectStore,
    summary_bucket: &str,
    new_key: &str,
) -> Result<Option<String>> {
    let new_timestamp = parse_artifact_key(new_key)?;
    let predecessor = list_summary_keys(store, summary_bucket)?
        .into_iter()
        .filter(|(timestamp, _)| *timestamp < new_timestamp)
        .next_back()
        .map(|(_, key)| key);
    Ok(predecessor)
}

/// Fetch a summary from the bucket, going through the local cache directory
/// when one is configured. Cached copies are reused across runs; without a
/// cache the fetched file is scratch and removed after parsing.
pub fn fetch_summary(
    store: &dyn ObjectStore,
    summary_bucket: &str,
    key: &str,
    cache_dir: Option<&Path>,
    scratch_dir: &Path,
    keep_scratch: bool,
) -> Result<Summary> {
    let dir = cache_dir.unwrap_or(scratch_dir);
    std::fs::create_dir_all(dir)?;
    let path = dir.join(key);

    if !path.is_file() {
        let body = store.get(summary_bucket, key)?;
        std::fs::write(&path, &body)?;
        info!("fetched {} ({} bytes) into {}", key, body.len(), dir.display());
    } else {
        info!("using cached summary {}", path.display());
    }

    let summary = Summary::from_file(&path);
    if cache_dir.is_none() && !keep_scratch {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("cannot remove scratch file {}: {}", path.display(), e);
        }
    }
    summary
}

/// Bucket key for the diff artifact describing changes up to `new_timestamp`.
pub fn diff_key(new_timestamp: &DateTime<Utc>) -> String {
    format!("{}.vrpdiff.json.bz2", format_key_timestamp(new_timestamp))
}

/// Resolve the predecessor of `new_key`, diff the pair, and upload the diff
/// artifact. Returns the artifact metadata, or `None` when `new_key` has no
/// predecessor and no diff can be produced.
pub fn run_diff(
    store: &dyn ObjectStore,
    config: &Config,
    new_key: &str,
) -> Result<Option<DiffMetadata>> {
    let new_timestamp = parse_artifact_key(new_key)?;
    let Some(old_key) = find_predecessor(store, &config.summary_bucket, new_key)? else {
        warn!(
            "no predecessor for {} in bucket {}; skipping diff generation",
            new_key, config.summary_bucket
        );
        return Ok(None);
    };
    info!("diffing {} against predecessor {}", new_key, old_key);

    let cache_dir = config.summary_cache_dir.as_deref();
    let old_summary = fetch_summary(
        store,
        &config.summary_bucket,
        &old_key,
        cache_dir,
        &config.scratch_dir,
        config.keep_scratch,
    )?;
    let new_summary = fetch_summary(
        store,
        &config.summary_bucket,
        new_key,
        cache_dir,
        &config.scratch_dir,
        config.keep_scratch,
    )?;

    let artifact = DiffArtifact::build(&old_summary, &old_key, &new_summary, new_key)?;
    let key = diff_key(&new_timestamp);

    if store.exists(&config.diff_bucket, &key)? {
        info!("diff {} already in bucket {}, skipping upload", key, config.diff_bucket);
        return Ok(Some(artifact.metadata));
    }

    let scratch_path = config.scratch_dir.join(&key);
    std::fs::create_dir_all(&config.scratch_dir)?;
    {
        let mut writer = oneio::get_writer(&scratch_path.to_string_lossy())?;
        writer.write_all(artifact.to_json_string()?.as_bytes())?;
    }
    let body = std::fs::read(&scratch_path)?;
    store.put(&config.diff_bucket, &key, &body)?;
    info!(
        "uploaded diff {} ({} records, {} bytes) to {}",
        key,
        artifact.metadata.diff_count,
        body.len(),
        config.diff_bucket
    );

    if !config.keep_scratch {
        if let Err(e) = std::fs::remove_file(&scratch_path) {
            warn!("cannot remove scratch file {}: {}", scratch_path.display(), e);
        }
    }
    Ok(Some(artifact.metadata))
}

/// Object-store notification event, in the S3 event shape.
#[derive(Clone, Debug, Deserialize)]
pub struct NotificationEvent {
    #[serde(rename = "Records")]
    pub records: Vec<NotificationRecord>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NotificationRecord {
    pub s3: NotificationEntity,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NotificationEntity {
    pub bucket: NotificationBucket,
    pub object: NotificationObject,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NotificationBucket {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NotificationObject {
    pub key: String,
}

/// Entry point for summary-bucket notifications: each notified key is
/// diffed against its predecessor. Returns the metadata of every produced
/// artifact.
pub fn handle_summary_event(
    store: &dyn ObjectStore,
    config: &Config,
    event: &NotificationEvent,
) -> Result<Vec<DiffMetadata>> {
    let mut produced = vec![];
    for record in &event.records {
        if record.s3.bucket.name != config.summary_bucket {
            warn!(
                "notification for unexpected bucket {}, expected {}",
                record.s3.bucket.name, config.summary_bucket
            );
        }
        if let Some(metadata) = run_diff(store, config, &record.s3.object.key)? {
            produced.push(metadata);
        }
    }
    Ok(produced)
}

/// Entry point for snapshot-bucket notifications: each notified TAR is
/// summarized and the summary uploaded. Returns the summary keys.
pub fn handle_snapshot_event(
    store: &dyn ObjectStore,
    config: &Config,
    event: &NotificationEvent,
) -> Result<Vec<String>> {
    let mut produced = vec![];
    for record in &event.records {
        let key = crate::summary::ingest_snapshot(
            store,
            &record.s3.bucket.name,
            &config.summary_bucket,
            &config.scratch_dir,
            config.keep_scratch,
            &record.s3.object.key,
        )?;
        produced.push(key);
    }
    Ok(produced)
}
