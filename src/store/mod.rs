//! Bucket-and-key blob storage behind one trait.
//!
//! The pipeline treats the object store as opaque: artifacts are written
//! once under timestamp-derived keys and synchronization between stages
//! happens entirely through bucket listings. [`FsObjectStore`] backs local
//! runs and tests; [`S3ObjectStore`] is the production backend.

mod fs;
mod s3;

pub use fs::FsObjectStore;
pub use s3::S3ObjectStore;

use crate::Result;

/// Minimal object-store interface used by the pipeline: list a bucket,
/// fetch and store whole objects, and probe for key existence.
pub trait ObjectStore {
    /// All keys in the bucket.
    fn list(&self, bucket: &str) -> Result<Vec<String>>;

    /// Fetch an object in full.
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Store an object, overwriting any existing content under the key.
    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()>;

    /// Whether the key exists in the bucket.
    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.list(bucket)?.iter().any(|k| k == key))
    }
}
