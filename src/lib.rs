//!
//! # Overview
//!
//! `rpkilog` maintains a time-indexed, searchable history of RPKI VRP data.
//! Periodically harvested snapshots of the global RPKI state are reduced to
//! canonical summaries, consecutive summaries are compared to derive a
//! change log of prefix authorizations, and the change records are loaded
//! into a search index keyed by time, prefix, origin AS, and trust anchor.
//!
//! # Pipeline
//!
//! A snapshot arrival drives four stages, each independently restartable
//! from its inputs in the object store:
//!
//! 1. **Summarize** ([`summary`]): extract `rpki-client.json` from the
//!    snapshot TAR (or take raw validator JSON), canonicalize the ROA set,
//!    and upload the summary under its `YYYYMMDDTHHMMSSZ` key.
//! 2. **Resolve lineage** ([`lineage`]): locate the summary's immediate
//!    predecessor by embedded timestamp.
//! 3. **Diff** ([`diff`]): a deterministic merge over the two sorted ROA
//!    streams, emitting `NEW`/`DELETE`/`REPLACE` records.
//! 4. **Load** ([`index`]): flatten the diff artifact into per-change
//!    documents with deterministic ids and bulk-load them into the monthly
//!    `diff-YYYYMM` index.
//!
//! # Example: diffing two summaries
//!
//! ```rust
//! use rpkilog::{Roa, diff::diff_roas};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let old = vec![Roa::new(64496, "192.0.2.0/24".parse()?, 24, "apnic", 100)?];
//!     let new = vec![Roa::new(64496, "192.0.2.0/24".parse()?, 24, "apnic", 200)?];
//!     let (records, counts) = diff_roas(old, new)?;
//!     assert_eq!(records.len(), 1);
//!     assert_eq!(records[0].verb(), "REPLACE");
//!     assert_eq!(counts.replace, 1);
//!     Ok(())
//! }
//! ```
//!
//! # Example: running the pipeline against local buckets
//!
//! ```rust,no_run
//! use rpkilog::config::Config;
//! use rpkilog::lineage::run_diff;
//! use rpkilog::store::FsObjectStore;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let store = FsObjectStore::new("/var/lib/rpkilog");
//!     if let Some(metadata) = run_diff(&store, &config, "20221030T183500Z.json.bz2")? {
//!         println!("{}", serde_json::to_string_pretty(&metadata)?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod diff;
pub mod errors;
pub mod index;
pub mod lineage;
pub mod roa;
pub mod store;
pub mod summary;

pub use errors::{Result, RpkilogError};

pub use diff::{DiffArtifact, VrpDiff};
pub use roa::Roa;
pub use summary::Summary;
