//! Pipeline configuration.
//!
//! All knobs are explicit values threaded through the call graph; nothing is
//! read from process-wide state at use sites. Values come from an optional
//! TOML file overlaid with `RPKILOG_`-prefixed environment variables
//! (e.g. `RPKILOG_SUMMARY_BUCKET=...`).

use crate::{Result, RpkilogError};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::path::PathBuf;

/// Default batch size for bulk index submissions.
pub const DEFAULT_BULK_BATCH_SIZE: usize = 200;

#[derive(Clone, Debug)]
pub struct Config {
    /// Bucket receiving harvested snapshot TARs
    pub snapshot_bucket: String,
    /// Bucket holding summary artifacts
    pub summary_bucket: String,
    /// Bucket holding diff artifacts
    pub diff_bucket: String,
    /// Search-index endpoint, e.g. `http://localhost:9200`
    pub es_endpoint: String,
    /// Records per bulk submission
    pub bulk_batch_size: usize,
    /// Backfill-only CPU throttle, percent of one core
    pub limit_cpu_pct: Option<u8>,
    /// Optional read-through cache for fetched summaries
    pub summary_cache_dir: Option<PathBuf>,
    /// Lower bound for harvest-driven work
    pub start_date: Option<NaiveDate>,
    /// Directory for per-invocation scratch files
    pub scratch_dir: PathBuf,
    /// Keep scratch files after successful upload
    pub keep_scratch: bool,
    /// AWS region of the buckets
    pub s3_region: String,
    /// Endpoint override for S3-compatible stores
    pub s3_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snapshot_bucket: "rpkilog-snapshot".to_string(),
            summary_bucket: "rpkilog-summary".to_string(),
            diff_bucket: "rpkilog-diff".to_string(),
            es_endpoint: "http://localhost:9200".to_string(),
            bulk_batch_size: DEFAULT_BULK_BATCH_SIZE,
            limit_cpu_pct: None,
            summary_cache_dir: None,
            start_date: None,
            scratch_dir: std::env::temp_dir(),
            keep_scratch: false,
            s3_region: "us-east-1".to_string(),
            s3_endpoint: None,
        }
    }
}

impl Config {
    /// Build the configuration from an optional TOML file plus the
    /// environment. Environment variables win over file values.
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("RPKILOG"));

        let settings = builder
            .build()
            .map_err(|e| RpkilogError::Internal(format!("failed to build configuration: {}", e)))?;
        let values = settings
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| RpkilogError::Internal(format!("failed to read configuration: {}", e)))?;

        Self::from_values(values)
    }

    fn from_values(values: HashMap<String, String>) -> Result<Self> {
        let mut cfg = Config::default();
        if let Some(v) = values.get("snapshot_bucket") {
            cfg.snapshot_bucket = v.clone();
        }
        if let Some(v) = values.get("summary_bucket") {
            cfg.summary_bucket = v.clone();
        }
        if let Some(v) = values.get("diff_bucket") {
            cfg.diff_bucket = v.clone();
        }
        if let Some(v) = values.get("es_endpoint") {
            cfg.es_endpoint = v.clone();
        }
        if let Some(v) = values.get("bulk_batch_size") {
            cfg.bulk_batch_size = v.parse()?;
        }
        if let Some(v) = values.get("limit_cpu_pct") {
            let pct: u8 = v.parse()?;
            if !(1..=100).contains(&pct) {
                return Err(RpkilogError::Internal(format!(
                    "limit_cpu_pct must be in 1..=100, got {}",
                    pct
                )));
            }
            cfg.limit_cpu_pct = Some(pct);
        }
        if let Some(v) = values.get("summary_cache_dir") {
            cfg.summary_cache_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = values.get("start_date") {
            cfg.start_date = Some(
                v.parse()
                    .map_err(|e| RpkilogError::Internal(format!("invalid start_date '{}': {}", v, e)))?,
            );
        }
        if let Some(v) = values.get("scratch_dir") {
            cfg.scratch_dir = PathBuf::from(v);
        }
        if let Some(v) = values.get("keep_scratch") {
            cfg.keep_scratch = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = values.get("s3_region") {
            cfg.s3_region = v.clone();
        }
        if let Some(v) = values.get("s3_endpoint") {
            cfg.s3_endpoint = Some(v.clone());
        }
        Ok(cfg)
    }
}
