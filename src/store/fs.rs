//! Filesystem-backed object store. Buckets are directories under a root,
//! keys are file names within them.

use super::ObjectStore;
use crate::{Result, RpkilogError, errors::data_sources};
use std::fs;
use std::path::PathBuf;

/// Object store rooted at a local directory. Used for tests and for running
/// the pipeline against a local mirror of the buckets.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_dir(bucket).join(key)
    }
}

impl ObjectStore for FsObjectStore {
    fn list(&self, bucket: &str) -> Result<Vec<String>> {
        let dir = self.bucket_dir(bucket);
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut keys = vec![];
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                keys.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key);
        fs::read(&path).map_err(|e| {
            RpkilogError::data_source_error(
                data_sources::OBJECT_STORE,
                format!("cannot read {}: {}", path.display(), e),
            )
        })
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()> {
        let dir = self.bucket_dir(bucket);
        fs::create_dir_all(&dir)?;
        // write to a temp name then rename, so a listing never sees a
        // partially-written artifact
        let tmp = dir.join(format!("{}.tmp", key));
        fs::write(&tmp, body)?;
        fs::rename(&tmp, self.object_path(bucket, key))?;
        Ok(())
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.object_path(bucket, key).is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_list_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        assert!(store.list("summaries").unwrap().is_empty());
        assert!(!store.exists("summaries", "a.json").unwrap());

        store.put("summaries", "b.json", b"{}").unwrap();
        store.put("summaries", "a.json", b"{}").unwrap();

        assert_eq!(store.list("summaries").unwrap(), vec!["a.json", "b.json"]);
        assert!(store.exists("summaries", "a.json").unwrap());
        assert_eq!(store.get("summaries", "a.json").unwrap(), b"{}");
    }

    #[test]
    fn test_put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("b", "k", b"one").unwrap();
        store.put("b", "k", b"two").unwrap();
        assert_eq!(store.get("b", "k").unwrap(), b"two");
    }

    #[test]
    fn test_get_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.get("b", "missing").is_err());
    }
}
