//! The VRP diff engine.
//!
//! Given two summaries, [`diff_roas`] produces the minimal ordered change
//! set between them: a deterministic merge over the two sorted ROA streams
//! emitting `NEW`, `DELETE`, and `REPLACE` records. Unchanged pairs are
//! counted but never emitted.
//!
//! The change set plus a metadata block describing both inputs and the run
//! forms a [`DiffArtifact`], the immutable unit stored in the diff bucket
//! and consumed by the index loader.

use crate::{Result, Roa, RpkilogError, errors::data_sources};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Artifact type tag carried in every diff file.
pub const DIFF_OBJECT_TYPE: &str = "rpkilog_vrp_cache_diff_set";

/// One observed change between two consecutive summaries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VrpDiff {
    /// Authorization present only in the new summary
    New(Roa),
    /// Authorization present only in the old summary
    Delete(Roa),
    /// Same primary key in both summaries, differing in `expires`
    Replace { old: Roa, new: Roa },
}

impl VrpDiff {
    pub fn verb(&self) -> &'static str {
        match self {
            VrpDiff::New(_) => "NEW",
            VrpDiff::Delete(_) => "DELETE",
            VrpDiff::Replace { .. } => "REPLACE",
        }
    }

    pub fn old_roa(&self) -> Option<&Roa> {
        match self {
            VrpDiff::New(_) => None,
            VrpDiff::Delete(old) => Some(old),
            VrpDiff::Replace { old, .. } => Some(old),
        }
    }

    pub fn new_roa(&self) -> Option<&Roa> {
        match self {
            VrpDiff::New(new) => Some(new),
            VrpDiff::Delete(_) => None,
            VrpDiff::Replace { new, .. } => Some(new),
        }
    }

    /// The ROA carrying this record's identity: the new side when present,
    /// otherwise the old side.
    pub fn subject_roa(&self) -> &Roa {
        match self {
            VrpDiff::New(new) => new,
            VrpDiff::Delete(old) => old,
            VrpDiff::Replace { new, .. } => new,
        }
    }
}

impl Serialize for VrpDiff {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let fields = 1 + self.old_roa().is_some() as usize + self.new_roa().is_some() as usize;
        let mut s = serializer.serialize_struct("VrpDiff", fields)?;
        s.serialize_field("verb", self.verb())?;
        if let Some(old) = self.old_roa() {
            s.serialize_field("old_roa", old)?;
        }
        if let Some(new) = self.new_roa() {
            s.serialize_field("new_roa", new)?;
        }
        s.end()
    }
}

/// On-disk shape of a diff record; validated into the sum type on read.
#[derive(Deserialize)]
struct RawVrpDiff {
    verb: String,
    #[serde(default)]
    old_roa: Option<Roa>,
    #[serde(default)]
    new_roa: Option<Roa>,
}

impl<'de> Deserialize<'de> for VrpDiff {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let raw = RawVrpDiff::deserialize(deserializer)?;
        match (raw.verb.as_str(), raw.old_roa, raw.new_roa) {
            ("NEW", None, Some(new)) => Ok(VrpDiff::New(new)),
            ("DELETE", Some(old), None) => Ok(VrpDiff::Delete(old)),
            ("REPLACE", Some(old), Some(new)) => Ok(VrpDiff::Replace { old, new }),
            (verb, old, new) => Err(D::Error::custom(format!(
                "diff record with verb '{}' has old_roa={} new_roa={}",
                verb,
                old.is_some(),
                new.is_some()
            ))),
        }
    }
}

/// Per-verb record counts for one diff run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiffCounts {
    pub new: usize,
    pub delete: usize,
    pub replace: usize,
    pub unchanged: usize,
}

impl DiffCounts {
    /// Every input record must be accounted for exactly once:
    /// `|old| + |new| == 2*unchanged + 2*replace + delete + new`.
    pub fn accounts_for(&self, old_len: usize, new_len: usize) -> bool {
        old_len + new_len == 2 * self.unchanged + 2 * self.replace + self.delete + self.new
    }
}

/// Compute the ordered change set between two ROA lists.
///
/// Both inputs are sorted here; observed upstream files are not reliably
/// sorted across validator versions. Records are emitted in merge order.
pub fn diff_roas(mut old: Vec<Roa>, mut new: Vec<Roa>) -> Result<(Vec<VrpDiff>, DiffCounts)> {
    old.sort();
    new.sort();
    warn_duplicate_keys("old", &old);
    warn_duplicate_keys("new", &new);

    let (old_len, new_len) = (old.len(), new.len());
    let mut counts = DiffCounts::default();
    let mut records = vec![];
    let (mut oi, mut ni) = (0usize, 0usize);

    while oi < old.len() || ni < new.len() {
        let before = oi + ni;
        let o = old.get(oi);
        let n = new.get(ni);

        match (o, n) {
            (Some(o), Some(n)) if o.primary_key() == n.primary_key() => {
                if o == n {
                    counts.unchanged += 1;
                } else {
                    counts.replace += 1;
                    debug!("REPLACE found: {:?} -> {:?}", o, n);
                    records.push(VrpDiff::Replace {
                        old: o.clone(),
                        new: n.clone(),
                    });
                }
                oi += 1;
                ni += 1;
            }
            (Some(o), n) if n.is_none() || o < n.unwrap() => {
                counts.delete += 1;
                debug!("DELETE found: {:?}", o);
                records.push(VrpDiff::Delete(o.clone()));
                oi += 1;
            }
            _ => {
                let n = n.expect("new cursor in range when old stream is behind or exhausted");
                counts.new += 1;
                debug!("NEW found: {:?}", n);
                records.push(VrpDiff::New(n.clone()));
                ni += 1;
            }
        }

        // every iteration must consume at least one input record
        if oi + ni <= before {
            return Err(RpkilogError::ProgressStall {
                remaining_old: old.len() - oi,
                remaining_new: new.len() - ni,
            });
        }
    }

    if counts.accounts_for(old_len, new_len) {
        info!(
            "diffed {} old and {} new records: {} new, {} delete, {} replace, {} unchanged",
            old_len, new_len, counts.new, counts.delete, counts.replace, counts.unchanged
        );
    } else {
        warn!(
            "diff accounting mismatch: old={} new={} counts={:?}",
            old_len, new_len, counts
        );
    }

    Ok((records, counts))
}

fn warn_duplicate_keys(label: &str, roas: &[Roa]) {
    for pair in roas.windows(2) {
        if pair[0].primary_key() == pair[1].primary_key() {
            warn!(
                "duplicate primary key in {} summary: {:?}",
                label,
                pair[0].primary_key()
            );
        }
    }
}

/// Filename and upstream metadata of one diff input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub filename: String,
    pub metadata: serde_json::Value,
}

/// Run-time accounting mirroring the metadata block of older archives.
/// `user`/`system` are best-effort and 0.0 where unavailable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunTimes {
    pub realtime: f64,
    pub user: f64,
    pub system: f64,
}

/// Metadata block of a diff artifact. `timestamp` is the diff-run wall
/// clock; the observation time of the changes is the new-summary timestamp
/// embedded in the artifact's filename, not this field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffMetadata {
    pub diff_count: usize,
    pub diff_program: String,
    pub hostname: String,
    pub times: RunTimes,
    pub timestamp: u64,
    pub user: String,
    pub vrp_cache_old: InputDescriptor,
    pub vrp_cache_new: InputDescriptor,
}

impl DiffMetadata {
    /// Assemble the metadata block for a finished diff run.
    pub fn collect(
        diff_count: usize,
        realtime: f64,
        vrp_cache_old: InputDescriptor,
        vrp_cache_new: InputDescriptor,
    ) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        DiffMetadata {
            diff_count,
            diff_program: env!("CARGO_PKG_NAME").to_string(),
            hostname,
            times: RunTimes {
                realtime,
                ..Default::default()
            },
            timestamp,
            user,
            vrp_cache_old,
            vrp_cache_new,
        }
    }
}

/// A complete diff artifact: self-describing change set between two
/// consecutive summaries. Immutable once written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffArtifact {
    pub object_type: String,
    pub metadata: DiffMetadata,
    pub vrp_diffs: Vec<VrpDiff>,
}

impl DiffArtifact {
    /// Diff two summaries and wrap the result with its metadata block.
    pub fn build(
        old: &crate::Summary,
        old_filename: &str,
        new: &crate::Summary,
        new_filename: &str,
    ) -> Result<Self> {
        let started = Instant::now();
        let (records, _counts) = diff_roas(old.roas.clone(), new.roas.clone())?;
        let metadata = DiffMetadata::collect(
            records.len(),
            started.elapsed().as_secs_f64(),
            InputDescriptor {
                filename: old_filename.to_string(),
                metadata: old.metadata.clone(),
            },
            InputDescriptor {
                filename: new_filename.to_string(),
                metadata: new.metadata.clone(),
            },
        );
        Ok(DiffArtifact {
            object_type: DIFF_OBJECT_TYPE.to_string(),
            metadata,
            vrp_diffs: records,
        })
    }

    /// Parse an artifact, rejecting foreign object types.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let artifact: DiffArtifact = serde_json::from_slice(bytes)?;
        if artifact.object_type != DIFF_OBJECT_TYPE {
            return Err(RpkilogError::data_source_error(
                data_sources::DIFF,
                format!("unexpected object_type '{}'", artifact.object_type),
            ));
        }
        Ok(artifact)
    }

    /// Serialize with the metadata block pretty-printed and one diff record
    /// per line, so artifacts stay grep- and diff-friendly.
    pub fn to_json_string(&self) -> Result<String> {
        let mut out = String::from("{\n");
        out.push_str(&format!("\"object_type\": \"{}\",\n", self.object_type));
        out.push_str(&format!(
            "\"metadata\": {},\n",
            serde_json::to_string_pretty(&self.metadata)?
        ));
        out.push_str("\"vrp_diffs\": [\n");
        for (idx, record) in self.vrp_diffs.iter().enumerate() {
            let separator = if idx + 1 < self.vrp_diffs.len() { ",\n" } else { "\n" };
            out.push_str("    ");
            out.push_str(&serde_json::to_string(record)?);
            out.push_str(separator);
        }
        out.push_str("]\n}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roa(prefix: &str, max_length: i64, asn: u32, ta: &str, expires: u64) -> Roa {
        Roa::new(asn, prefix.parse().unwrap(), max_length, ta, expires).unwrap()
    }

    fn verbs(records: &[VrpDiff]) -> Vec<&'static str> {
        records.iter().map(|r| r.verb()).collect()
    }

    #[test]
    fn test_pure_replace() {
        let old = vec![roa("192.0.2.0/24", 24, 64496, "test", 100)];
        let new = vec![roa("192.0.2.0/24", 24, 64496, "test", 200)];
        let (records, counts) = diff_roas(old, new).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].verb(), "REPLACE");
        assert_eq!(records[0].old_roa().unwrap().expires, 100);
        assert_eq!(records[0].new_roa().unwrap().expires, 200);
        assert!(counts.accounts_for(1, 1));
    }

    #[test]
    fn test_identical_summaries_yield_nothing() {
        let roas = vec![
            roa("192.0.2.0/24", 24, 64496, "test", 100),
            roa("2001:db8::/32", 48, 64497, "test", 200),
        ];
        let (records, counts) = diff_roas(roas.clone(), roas).unwrap();
        assert!(records.is_empty());
        assert_eq!(counts.unchanged, 2);
    }

    #[test]
    fn test_delete_then_new_in_sort_order() {
        let a = roa("10.0.0.0/8", 8, 64496, "test", 100);
        let b = roa("192.0.2.0/24", 24, 64497, "test", 100);
        assert!(a < b);
        let (records, _) = diff_roas(vec![a.clone()], vec![b.clone()]).unwrap();
        assert_eq!(verbs(&records), vec!["DELETE", "NEW"]);
        assert_eq!(records[0].old_roa().unwrap(), &a);
        assert_eq!(records[1].new_roa().unwrap(), &b);
    }

    #[test]
    fn test_mixed_scenario() {
        // sort_key order a < b < c < d
        let a = roa("10.0.0.0/8", 8, 64496, "test", 100);
        let a_renewed = roa("10.0.0.0/8", 8, 64496, "test", 500);
        let b = roa("10.0.0.0/8", 8, 64497, "test", 100);
        let c = roa("172.16.0.0/12", 12, 64496, "test", 100);
        let d = roa("192.0.2.0/24", 24, 64496, "test", 100);

        let old = vec![a, c, d.clone()];
        let new = vec![a_renewed, b, d];
        let (records, counts) = diff_roas(old, new).unwrap();
        assert_eq!(verbs(&records), vec!["REPLACE", "NEW", "DELETE"]);
        assert_eq!(counts.unchanged, 1);
        assert!(counts.accounts_for(3, 3));
    }

    #[test]
    fn test_empty_old_all_new() {
        let new = vec![
            roa("10.0.0.0/8", 8, 1, "test", 0),
            roa("192.0.2.0/24", 24, 2, "test", 0),
        ];
        let (records, counts) = diff_roas(vec![], new).unwrap();
        assert_eq!(verbs(&records), vec!["NEW", "NEW"]);
        assert!(counts.accounts_for(0, 2));
    }

    #[test]
    fn test_empty_new_all_delete() {
        let old = vec![
            roa("10.0.0.0/8", 8, 1, "test", 0),
            roa("192.0.2.0/24", 24, 2, "test", 0),
        ];
        let (records, counts) = diff_roas(old, vec![]).unwrap();
        assert_eq!(verbs(&records), vec!["DELETE", "DELETE"]);
        assert!(counts.accounts_for(2, 0));
    }

    #[test]
    fn test_unsorted_inputs_are_sorted_first() {
        let old = vec![
            roa("192.0.2.0/24", 24, 2, "test", 0),
            roa("10.0.0.0/8", 8, 1, "test", 0),
        ];
        let new = vec![
            roa("10.0.0.0/8", 8, 1, "test", 0),
            roa("192.0.2.0/24", 24, 2, "test", 0),
        ];
        let (records, counts) = diff_roas(old, new).unwrap();
        assert!(records.is_empty());
        assert_eq!(counts.unchanged, 2);
    }

    #[test]
    fn test_duplicate_primary_keys_processed_in_order() {
        // duplicate key in old pairs against the single new entry twice:
        // first as REPLACE, then the leftover as DELETE
        let old = vec![
            roa("10.0.0.0/8", 8, 1, "test", 100),
            roa("10.0.0.0/8", 8, 1, "test", 300),
        ];
        let new = vec![roa("10.0.0.0/8", 8, 1, "test", 200)];
        let (records, _) = diff_roas(old, new).unwrap();
        assert_eq!(verbs(&records), vec!["REPLACE", "DELETE"]);
    }

    #[test]
    fn test_replace_shares_primary_key() {
        let old = vec![roa("192.0.2.0/24", 24, 64496, "test", 100)];
        let new = vec![roa("192.0.2.0/24", 24, 64496, "test", 200)];
        let (records, _) = diff_roas(old, new).unwrap();
        for record in &records {
            if let VrpDiff::Replace { old, new } = record {
                assert_eq!(old.primary_key(), new.primary_key());
                assert_ne!(old.expires, new.expires);
            }
        }
    }

    #[test]
    fn test_record_serialization_shape() {
        let record = VrpDiff::Replace {
            old: roa("192.0.2.0/24", 24, 64496, "test", 100),
            new: roa("192.0.2.0/24", 24, 64496, "test", 200),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["verb"], "REPLACE");
        assert_eq!(json["old_roa"]["expires"], 100);
        assert_eq!(json["new_roa"]["expires"], 200);

        let round: VrpDiff = serde_json::from_value(json).unwrap();
        assert_eq!(round, record);
    }

    #[test]
    fn test_record_deserialization_rejects_mismatched_shape() {
        let bad = serde_json::json!({
            "verb": "NEW",
            "old_roa": {"asn": 1, "expires": 0, "maxLength": 8, "prefix": "10.0.0.0/8", "ta": "t"},
        });
        assert!(serde_json::from_value::<VrpDiff>(bad).is_err());
    }

    #[test]
    fn test_artifact_round_trip() {
        let old_summary = crate::Summary {
            metadata: serde_json::json!({"elapsedtime": 1}),
            roas: vec![roa("192.0.2.0/24", 24, 64496, "test", 100)],
        };
        let new_summary = crate::Summary {
            metadata: serde_json::json!({"elapsedtime": 2}),
            roas: vec![roa("192.0.2.0/24", 24, 64496, "test", 200)],
        };
        let artifact = DiffArtifact::build(
            &old_summary,
            "20221030T000000Z.json.bz2",
            &new_summary,
            "20221030T060000Z.json.bz2",
        )
        .unwrap();
        assert_eq!(artifact.object_type, DIFF_OBJECT_TYPE);
        assert_eq!(artifact.metadata.diff_count, 1);
        assert_eq!(
            artifact.metadata.vrp_cache_new.filename,
            "20221030T060000Z.json.bz2"
        );

        let rendered = artifact.to_json_string().unwrap();
        let reparsed = DiffArtifact::from_json_slice(rendered.as_bytes()).unwrap();
        assert_eq!(reparsed.vrp_diffs, artifact.vrp_diffs);
        assert_eq!(reparsed.metadata.diff_count, 1);
    }

    #[test]
    fn test_artifact_rejects_foreign_object_type() {
        let json = r#"{"object_type": "something_else", "metadata": {
            "diff_count": 0, "diff_program": "x", "hostname": "h",
            "times": {"realtime": 0.0, "user": 0.0, "system": 0.0},
            "timestamp": 0, "user": "u",
            "vrp_cache_old": {"filename": "a", "metadata": {}},
            "vrp_cache_new": {"filename": "b", "metadata": {}}
        }, "vrp_diffs": []}"#;
        assert!(DiffArtifact::from_json_slice(json.as_bytes()).is_err());
    }
}
