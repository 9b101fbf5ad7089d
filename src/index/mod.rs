//! Search-index loading.
//!
//! Diff artifacts are flattened into per-change documents and bulk-loaded
//! into monthly `diff-YYYYMM` indices. Document ids are a pure function of
//! the observation timestamp and the record's primary key, so re-loading an
//! artifact overwrites the same documents instead of duplicating them:
//! at-least-once submission becomes exactly-once index state.

mod client;
mod loader;

pub use client::{BulkResponse, EsClient};
pub use loader::{
    RetryPolicy, backfill, build_document, doc_id, index_mapping, index_name, load_artifact,
    load_diff_from_store,
};
