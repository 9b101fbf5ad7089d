//! Diff-artifact flattening and bulk loading.

use super::client::EsClient;
use crate::config::Config;
use crate::diff::{DiffArtifact, VrpDiff};
use crate::lineage::{list_diff_keys, parse_artifact_key};
use crate::store::ObjectStore;
use crate::{Result, RpkilogError};
use chrono::{DateTime, NaiveDate, Utc};
use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Date rendering used for all date fields in index documents
/// (`strict_date_time_no_millis`).
const ES_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Backoff knobs for bulk submissions.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(20),
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based): exponential from the
    /// initial value, clamped to the maximum.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Monthly index holding all changes observed in that month.
pub fn index_name(observation: &DateTime<Utc>) -> String {
    format!("diff-{}", observation.format("%Y%m"))
}

/// Index settings and mappings for a `diff-YYYYMM` index.
pub fn index_mapping() -> serde_json::Value {
    serde_json::json!({
        "settings": {
            "number_of_replicas": 0,
            "number_of_shards": 3,
        },
        "mappings": {
            "properties": {
                "observation_timestamp": {"type": "date", "format": "strict_date_time_no_millis"},
                "verb": {"type": "keyword"},
                "prefix": {"type": "ip_range"},
                "maxLength": {"type": "integer"},
                "asn": {"type": "long"},
                "ta": {"type": "keyword"},
                "old_expires": {"type": "date", "format": "strict_date_time_no_millis"},
                "new_expires": {"type": "date", "format": "strict_date_time_no_millis"},
                "old_roa": {"type": "object", "enabled": false},
                "new_roa": {"type": "object", "enabled": false},
            }
        }
    })
}

fn es_date(epoch_seconds: u64) -> String {
    DateTime::from_timestamp(epoch_seconds as i64, 0)
        .unwrap_or_default()
        .format(ES_DATE_FORMAT)
        .to_string()
}

/// Deterministic document id: re-running the loader over the same artifact
/// produces the same ids, so the index operation overwrites safely.
pub fn doc_id(observation: &DateTime<Utc>, record: &VrpDiff) -> String {
    let roa = record.subject_roa();
    format!(
        "{}+{}+{}+{}+{}",
        observation.timestamp(),
        roa.prefix,
        roa.max_length,
        roa.asn,
        roa.ta
    )
}

/// Flatten one diff record into its index document.
pub fn build_document(observation: &DateTime<Utc>, record: &VrpDiff) -> serde_json::Value {
    let roa = record.subject_roa();
    let mut document = serde_json::json!({
        "observation_timestamp": observation.format(ES_DATE_FORMAT).to_string(),
        "verb": record.verb(),
        "prefix": roa.prefix.to_string(),
        "maxLength": roa.max_length,
        "asn": roa.asn,
        "ta": roa.ta,
    });
    if let Some(old) = record.old_roa() {
        document["old_expires"] = serde_json::Value::String(es_date(old.expires));
        document["old_roa"] = old.as_json_obj();
    }
    if let Some(new) = record.new_roa() {
        document["new_expires"] = serde_json::Value::String(es_date(new.expires));
        document["new_roa"] = new.as_json_obj();
    }
    document
}

/// Render one batch as a `_bulk` body: an action line then a document line
/// per record, newline-terminated.
fn bulk_body(index: &str, observation: &DateTime<Utc>, records: &[VrpDiff]) -> String {
    let mut body = String::new();
    for record in records {
        let action = serde_json::json!({
            "index": {"_index": index, "_id": doc_id(observation, record)}
        });
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&build_document(observation, record).to_string());
        body.push('\n');
    }
    body
}

fn submit_with_retry(
    client: &EsClient,
    body: &str,
    batch_len: usize,
    retry: &RetryPolicy,
) -> Result<usize> {
    let mut attempt = 0u32;
    loop {
        let outcome = client.bulk(body);
        match outcome {
            Ok(response) if !response.errors => return Ok(response.succeeded()),
            Ok(response) => {
                let failures = response.failures();
                warn!(
                    "bulk batch had {} failed actions of {} (attempt {}): {:?}",
                    failures.len(),
                    batch_len,
                    attempt + 1,
                    failures.first()
                );
                if attempt >= retry.max_retries {
                    return Err(RpkilogError::index_error(format!(
                        "{} of {} bulk actions still failing after {} retries",
                        failures.len(),
                        batch_len,
                        retry.max_retries
                    )));
                }
            }
            Err(e) => {
                warn!("bulk request failed (attempt {}): {}", attempt + 1, e);
                if attempt >= retry.max_retries {
                    return Err(e);
                }
            }
        }
        std::thread::sleep(retry.backoff_for(attempt));
        attempt += 1;
    }
}

/// Load every record of a diff artifact into the index for its observation
/// month. Returns the number of successfully indexed documents.
pub fn load_artifact(
    client: &EsClient,
    artifact: &DiffArtifact,
    observation: &DateTime<Utc>,
    batch_size: usize,
    retry: &RetryPolicy,
) -> Result<usize> {
    let index = index_name(observation);
    client.ensure_index(&index, &index_mapping())?;

    let mut indexed = 0usize;
    for batch in artifact.vrp_diffs.chunks(batch_size.max(1)) {
        let body = bulk_body(&index, observation, batch);
        indexed += submit_with_retry(client, &body, batch.len(), retry)?;
    }
    info!(
        "indexed {} of {} records into {}",
        indexed,
        artifact.vrp_diffs.len(),
        index
    );
    Ok(indexed)
}

/// Fetch a diff artifact from the bucket and load it. The observation
/// timestamp comes from the artifact key.
pub fn load_diff_from_store(
    store: &dyn ObjectStore,
    config: &Config,
    client: &EsClient,
    key: &str,
) -> Result<usize> {
    let observation = parse_artifact_key(key)?;
    let body = store.get(&config.diff_bucket, key)?;

    // round-trip through scratch so extension-driven decompression applies
    std::fs::create_dir_all(&config.scratch_dir)?;
    let scratch_path = config.scratch_dir.join(key);
    std::fs::write(&scratch_path, &body)?;
    let artifact = (|| {
        let mut reader = oneio::get_reader(&scratch_path.to_string_lossy())?;
        let mut bytes = vec![];
        reader.read_to_end(&mut bytes)?;
        DiffArtifact::from_json_slice(&bytes)
    })();
    if !config.keep_scratch {
        if let Err(e) = std::fs::remove_file(&scratch_path) {
            warn!("cannot remove scratch file {}: {}", scratch_path.display(), e);
        }
    }
    let artifact = artifact?;

    let retry = RetryPolicy::default();
    load_artifact(client, &artifact, &observation, config.bulk_batch_size, &retry)
}

/// Load all diff artifacts in the bucket, newest first so recent history
/// becomes queryable first. Optionally bounded by date and file count, and
/// throttled to roughly `limit_cpu_pct` percent of one core.
pub fn backfill(
    store: &dyn ObjectStore,
    config: &Config,
    client: &EsClient,
    date_min: Option<NaiveDate>,
    date_max: Option<NaiveDate>,
    max_files: Option<usize>,
) -> Result<usize> {
    let mut keys = list_diff_keys(store, &config.diff_bucket)?;
    keys.reverse();

    let mut loaded_files = 0usize;
    let mut indexed = 0usize;
    for (timestamp, key) in keys {
        let date = timestamp.date_naive();
        if let Some(min) = date_min {
            if date < min {
                continue;
            }
        }
        if let Some(max) = date_max {
            if date > max {
                continue;
            }
        }
        if let Some(limit) = max_files {
            if loaded_files >= limit {
                break;
            }
        }

        let started = Instant::now();
        indexed += load_diff_from_store(store, config, client, &key)?;
        loaded_files += 1;

        if let Some(pct) = config.limit_cpu_pct {
            let work = started.elapsed();
            let pause = work.mul_f64((100 - pct as u64) as f64 / pct as f64);
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }
    }
    info!("backfill loaded {} files, {} documents", loaded_files, indexed);
    Ok(indexed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Roa;

    fn roa(prefix: &str, max_length: i64, asn: u32, ta: &str, expires: u64) -> Roa {
        Roa::new(asn, prefix.parse().unwrap(), max_length, ta, expires).unwrap()
    }

    fn observation() -> DateTime<Utc> {
        crate::summary::parse_key_timestamp_token("20221030T183500Z").unwrap()
    }

    #[test]
    fn test_index_name_is_monthly() {
        assert_eq!(index_name(&observation()), "diff-202210");
    }

    #[test]
    fn test_doc_id_deterministic_and_verb_independent() {
        let old = roa("192.0.2.0/24", 24, 64496, "test", 100);
        let new = roa("192.0.2.0/24", 24, 64496, "test", 200);
        let replace = VrpDiff::Replace {
            old: old.clone(),
            new: new.clone(),
        };
        let delete = VrpDiff::Delete(old);
        let id = doc_id(&observation(), &replace);
        assert_eq!(id, "1667154900+192.0.2.0/24+24+64496+test");
        // same authorization yields the same id regardless of verb
        assert_eq!(doc_id(&observation(), &delete), id);
        // and repeated runs yield the same id
        assert_eq!(doc_id(&observation(), &replace), id);
    }

    #[test]
    fn test_build_document_replace() {
        let record = VrpDiff::Replace {
            old: roa("192.0.2.0/24", 24, 64496, "test", 1667100000),
            new: roa("192.0.2.0/24", 24, 64496, "test", 1667200000),
        };
        let document = build_document(&observation(), &record);
        assert_eq!(document["observation_timestamp"], "2022-10-30T18:35:00Z");
        assert_eq!(document["verb"], "REPLACE");
        assert_eq!(document["prefix"], "192.0.2.0/24");
        assert_eq!(document["maxLength"], 24);
        assert_eq!(document["asn"], 64496);
        assert_eq!(document["ta"], "test");
        assert_eq!(document["old_expires"], "2022-10-30T03:20:00Z");
        assert_eq!(document["new_expires"], "2022-10-31T07:06:40Z");
        assert_eq!(document["old_roa"]["expires"], 1667100000u64);
        assert_eq!(document["new_roa"]["expires"], 1667200000u64);
    }

    #[test]
    fn test_build_document_new_has_no_old_fields() {
        let record = VrpDiff::New(roa("2001:db8::/32", 48, 64497, "test", 0));
        let document = build_document(&observation(), &record);
        assert_eq!(document["verb"], "NEW");
        assert!(document.get("old_expires").is_none());
        assert!(document.get("old_roa").is_none());
        assert_eq!(document["new_expires"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_bulk_body_pairs_lines() {
        let records = vec![
            VrpDiff::New(roa("10.0.0.0/8", 8, 1, "test", 0)),
            VrpDiff::Delete(roa("192.0.2.0/24", 24, 2, "test", 0)),
        ];
        let body = bulk_body("diff-202210", &observation(), &records);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        let action: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_index"], "diff-202210");
        assert!(
            action["index"]["_id"]
                .as_str()
                .unwrap()
                .starts_with("1667154900+10.0.0.0/8")
        );
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn test_backoff_schedule() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff_for(0), Duration::from_secs(5));
        assert_eq!(retry.backoff_for(1), Duration::from_secs(10));
        assert_eq!(retry.backoff_for(2), Duration::from_secs(20));
        // clamped at the maximum thereafter
        assert_eq!(retry.backoff_for(3), Duration::from_secs(20));
        assert_eq!(retry.backoff_for(10), Duration::from_secs(20));
    }
}
