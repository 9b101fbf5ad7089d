//! Snapshot summarization.
//!
//! A *summary* is the canonical compact projection of one point-in-time
//! snapshot of the global VRP set: the upstream metadata block carried
//! verbatim, plus the canonicalized ROA array. Summaries are immutable and
//! named by the snapshot's UTC timestamp in compact form
//! (`YYYYMMDDTHHMMSSZ.json.bz2`).
//!
//! Snapshots arrive either as gzipped TAR archives containing
//! `rpki-<timestamp>/output/rpki-client.json`, or as raw validator JSON in
//! either schema variant handled by [`crate::Roa`].

use crate::store::ObjectStore;
use crate::{Result, Roa, RpkilogError, errors::data_sources};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// TAR member holding the validator output, with the snapshot timestamp
/// embedded in the leading path component.
const SNAPSHOT_MEMBER_RE: &str = r"^rpki-(\d{8}T\d{6}Z)/output/rpki-client\.json$";

/// Compact UTC timestamp used in artifact keys.
pub const KEY_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Canonical projection of one snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    /// Upstream metadata block, carried verbatim
    pub metadata: serde_json::Value,
    /// Canonical ROA set; sortable but not required to be sorted on disk
    #[serde(default)]
    pub roas: Vec<Roa>,
}

impl Summary {
    /// Parse a raw validator JSON document (either schema variant). Any
    /// single ROA parse failure aborts the whole summary.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let summary: Summary = serde_json::from_slice(bytes)?;
        if summary.metadata.is_null() {
            return Err(RpkilogError::MissingRequired { field: "metadata" });
        }
        Ok(summary)
    }

    /// Extract and canonicalize the summary from a snapshot TAR. Returns the
    /// snapshot timestamp taken from the member path, not wall-clock time.
    pub fn from_snapshot_tar(tar_path: &Path) -> Result<(DateTime<Utc>, Self)> {
        let (timestamp, json) = extract_snapshot_json(tar_path)?;
        let summary = Self::from_json_slice(json.as_bytes())?;
        info!(
            "extracted summary with {} roas from {}",
            summary.roas.len(),
            tar_path.display()
        );
        Ok((timestamp, summary))
    }

    /// Read a summary back from a local file, decompressing by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut reader = oneio::get_reader(&path.to_string_lossy())?;
        let mut bytes = vec![];
        reader.read_to_end(&mut bytes)?;
        Self::from_json_slice(&bytes)
    }

    /// Write the summary to a local path, compressing by extension.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let mut writer = oneio::get_writer(&path.to_string_lossy())?;
        let bytes = serde_json::to_vec(self)?;
        writer.write_all(&bytes)?;
        Ok(())
    }
}

/// Scan a gzipped snapshot TAR for the validator output member and return
/// `(snapshot timestamp, raw JSON)`. Plain (uncompressed) TARs are accepted
/// too; the gzip magic decides.
pub fn extract_snapshot_json(tar_path: &Path) -> Result<(DateTime<Utc>, String)> {
    let member_re = Regex::new(SNAPSHOT_MEMBER_RE).expect("member regex is valid");
    let file = std::fs::File::open(tar_path)?;
    let mut buffered = std::io::BufReader::new(file);
    let head = buffered.fill_buf()?;
    let gzipped = head.starts_with(&[0x1f, 0x8b]);
    let reader: Box<dyn Read> = if gzipped {
        Box::new(flate2::read::GzDecoder::new(buffered))
    } else {
        Box::new(buffered)
    };
    let mut archive = tar::Archive::new(reader);

    for entry in archive.entries().map_err(|e| {
        RpkilogError::data_source_error(
            data_sources::SNAPSHOT,
            format!("cannot read tar entries from {}: {}", tar_path.display(), e),
        )
    })? {
        let mut entry = entry.map_err(|e| {
            RpkilogError::data_source_error(data_sources::SNAPSHOT, e.to_string())
        })?;
        let path = entry
            .path()
            .map_err(|e| RpkilogError::data_source_error(data_sources::SNAPSHOT, e.to_string()))?
            .to_string_lossy()
            .to_string();
        let Some(captures) = member_re.captures(&path) else {
            continue;
        };
        let timestamp = parse_key_timestamp_token(&captures[1])?;
        let mut json = String::new();
        entry.read_to_string(&mut json).map_err(|e| {
            RpkilogError::data_source_error(
                data_sources::SNAPSHOT,
                format!("cannot read {}: {}", path, e),
            )
        })?;
        return Ok((timestamp, json));
    }

    Err(RpkilogError::data_source_error(
        data_sources::SNAPSHOT,
        format!("rpki-client.json not found in {}", tar_path.display()),
    ))
}

/// Parse a compact timestamp token. Tokens of the older 4-digit time form
/// (`HHMM`) are read as if seconds were zero.
pub fn parse_key_timestamp_token(token: &str) -> Result<DateTime<Utc>> {
    let normalized = match token.len() {
        // YYYYMMDDTHHMMZ
        14 => format!("{}00Z", &token[..token.len() - 1]),
        _ => token.to_string(),
    };
    let naive = NaiveDateTime::parse_from_str(&normalized, KEY_TIMESTAMP_FORMAT)?;
    Ok(naive.and_utc())
}

/// Render a timestamp in the compact key form.
pub fn format_key_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(KEY_TIMESTAMP_FORMAT).to_string()
}

/// Bucket key for a summary: `<YYYYMMDDTHHMMSSZ>.json.bz2`.
pub fn summary_key(timestamp: &DateTime<Utc>) -> String {
    format!("{}.json.bz2", format_key_timestamp(timestamp))
}

/// Write the summary to scratch, bz2-compressed, and upload it under its
/// timestamp key. A no-op when a summary for the timestamp already exists
/// (compressed or not); re-invocation is safe.
pub fn store_summary(
    store: &dyn ObjectStore,
    summary_bucket: &str,
    scratch_dir: &Path,
    keep_scratch: bool,
    timestamp: &DateTime<Utc>,
    summary: &Summary,
) -> Result<String> {
    let key = summary_key(timestamp);
    let uncompressed_key = format!("{}.json", format_key_timestamp(timestamp));
    if store.exists(summary_bucket, &key)? || store.exists(summary_bucket, &uncompressed_key)? {
        info!("summary {} already in bucket {}, skipping", key, summary_bucket);
        return Ok(key);
    }

    std::fs::create_dir_all(scratch_dir)?;
    let scratch_path = scratch_dir.join(&key);
    summary.write_to_file(&scratch_path)?;
    let body = std::fs::read(&scratch_path)?;
    store.put(summary_bucket, &key, &body)?;
    info!("uploaded summary {} ({} bytes) to {}", key, body.len(), summary_bucket);

    if !keep_scratch {
        if let Err(e) = std::fs::remove_file(&scratch_path) {
            warn!("cannot remove scratch file {}: {}", scratch_path.display(), e);
        }
    }
    Ok(key)
}

/// Download a snapshot TAR from the snapshot bucket, build its summary, and
/// upload the summary. Returns the summary key.
pub fn ingest_snapshot(
    store: &dyn ObjectStore,
    snapshot_bucket: &str,
    summary_bucket: &str,
    scratch_dir: &Path,
    keep_scratch: bool,
    snapshot_key: &str,
) -> Result<String> {
    info!("ingesting snapshot {} from {}", snapshot_key, snapshot_bucket);
    let body = store.get(snapshot_bucket, snapshot_key)?;
    std::fs::create_dir_all(scratch_dir)?;
    let tar_path: PathBuf = scratch_dir.join(
        Path::new(snapshot_key)
            .file_name()
            .ok_or_else(|| RpkilogError::UnparsableKey {
                key: snapshot_key.to_string(),
            })?,
    );
    std::fs::write(&tar_path, &body)?;

    let result = Summary::from_snapshot_tar(&tar_path).and_then(|(timestamp, summary)| {
        store_summary(
            store,
            summary_bucket,
            scratch_dir,
            keep_scratch,
            &timestamp,
            &summary,
        )
    });

    if !keep_scratch {
        if let Err(e) = std::fs::remove_file(&tar_path) {
            warn!("cannot remove scratch file {}: {}", tar_path.display(), e);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsObjectStore;

    const VALIDATOR_JSON: &str = r#"{
        "metadata": {"buildmachine": "test", "elapsedtime": 5},
        "roas": [
            {"asn": 64496, "prefix": "192.0.2.0/24", "maxLength": 24, "ta": "test", "expires": 100},
            {"asn": "AS64497", "prefix": "2001:db8::/32", "maxLength": 48, "ta": "test", "expires": 200}
        ]
    }"#;

    fn write_test_tar(dir: &Path, timestamp: &str) -> PathBuf {
        let tar_path = dir.join(format!("rpki-{}.tgz", timestamp));
        let file = std::fs::File::create(&tar_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let member = format!("rpki-{}/output/rpki-client.json", timestamp);
        let mut header = tar::Header::new_gnu();
        header.set_size(VALIDATOR_JSON.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, &member, VALIDATOR_JSON.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        tar_path
    }

    #[test]
    fn test_from_json_slice_canonicalizes() {
        let summary = Summary::from_json_slice(VALIDATOR_JSON.as_bytes()).unwrap();
        assert_eq!(summary.roas.len(), 2);
        assert_eq!(summary.roas[1].asn, 64497);
        assert_eq!(summary.metadata["buildmachine"], "test");
    }

    #[test]
    fn test_bad_roa_aborts_summary() {
        let json = r#"{
            "metadata": {},
            "roas": [
                {"asn": 64496, "prefix": "192.0.2.0/24", "maxLength": 24, "ta": "test"},
                {"asn": 64496, "prefix": "not-a-prefix", "maxLength": 24, "ta": "test"}
            ]
        }"#;
        assert!(Summary::from_json_slice(json.as_bytes()).is_err());
    }

    #[test]
    fn test_missing_metadata_aborts_summary() {
        let json = r#"{"metadata": null, "roas": []}"#;
        assert!(Summary::from_json_slice(json.as_bytes()).is_err());
    }

    #[test]
    fn test_from_snapshot_tar() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = write_test_tar(dir.path(), "20221030T183500Z");
        let (timestamp, summary) = Summary::from_snapshot_tar(&tar_path).unwrap();
        assert_eq!(format_key_timestamp(&timestamp), "20221030T183500Z");
        assert_eq!(summary.roas.len(), 2);
    }

    #[test]
    fn test_tar_without_member_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("rpki-20221030T183500Z.tgz");
        let file = std::fs::File::create(&tar_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "rpki-20221030T183500Z/other.json", &b"{}"[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        assert!(Summary::from_snapshot_tar(&tar_path).is_err());
    }

    #[test]
    fn test_timestamp_token_forms() {
        let full = parse_key_timestamp_token("20221030T183500Z").unwrap();
        assert_eq!(full.timestamp(), 1667154900);
        // older archives used 4-digit times
        let short = parse_key_timestamp_token("20221030T1835Z").unwrap();
        assert_eq!(short, full);
        assert!(parse_key_timestamp_token("20221030").is_err());
    }

    #[test]
    fn test_store_summary_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("store"));
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        let summary = Summary::from_json_slice(VALIDATOR_JSON.as_bytes()).unwrap();
        let timestamp = parse_key_timestamp_token("20221030T183500Z").unwrap();

        let key = store_summary(&store, "summaries", &scratch, false, &timestamp, &summary).unwrap();
        assert_eq!(key, "20221030T183500Z.json.bz2");
        let first = store.get("summaries", &key).unwrap();

        // second run is a no-op
        store_summary(&store, "summaries", &scratch, false, &timestamp, &summary).unwrap();
        assert_eq!(store.get("summaries", &key).unwrap(), first);

        // scratch was cleaned up
        assert!(!scratch.join(&key).exists());

        // round-trip through the compressed artifact
        let fetched = store.get("summaries", &key).unwrap();
        let restored_path = scratch.join("restored.json.bz2");
        std::fs::write(&restored_path, &fetched).unwrap();
        let restored = Summary::from_file(&restored_path).unwrap();
        assert_eq!(restored.roas, summary.roas);
    }

    #[test]
    fn test_ingest_snapshot_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("store"));
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();

        let tar_path = write_test_tar(&scratch, "20221030T183500Z");
        let body = std::fs::read(&tar_path).unwrap();
        store
            .put("snapshots", "rpki-20221030T183500Z.tgz", &body)
            .unwrap();

        let key = ingest_snapshot(
            &store,
            "snapshots",
            "summaries",
            &scratch,
            false,
            "rpki-20221030T183500Z.tgz",
        )
        .unwrap();
        assert_eq!(key, "20221030T183500Z.json.bz2");
        assert!(store.exists("summaries", &key).unwrap());
    }
}
