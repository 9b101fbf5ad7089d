//! S3-compatible object store backend using the blocking rust-s3 API.

use super::ObjectStore;
use crate::{Result, RpkilogError, errors::data_sources};
use s3::Region;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use std::time::Duration;
use tracing::{debug, warn};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Run a store operation, retrying transient failures with doubling
/// backoff. Exhausted retries surface the last error.
fn with_retry<T>(
    operation: &str,
    mut f: impl FnMut() -> std::result::Result<T, S3Error>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < RETRY_ATTEMPTS => {
                let backoff = RETRY_INITIAL_BACKOFF * 2u32.pow(attempt);
                warn!(
                    "{} failed (attempt {}), retrying in {:?}: {}",
                    operation,
                    attempt + 1,
                    backoff,
                    e
                );
                std::thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Object store talking to S3 or an S3-compatible endpoint. Credentials come
/// from the usual environment/profile chain.
#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    region: String,
    endpoint: Option<String>,
    credentials: Credentials,
}

impl S3ObjectStore {
    /// `endpoint` overrides the AWS endpoint for S3-compatible stores.
    pub fn new(region: &str, endpoint: Option<String>) -> Result<Self> {
        let credentials = Credentials::default().map_err(|e| {
            RpkilogError::data_source_error(
                data_sources::OBJECT_STORE,
                format!("cannot resolve credentials: {}", e),
            )
        })?;
        Ok(Self {
            region: region.to_string(),
            endpoint,
            credentials,
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>> {
        let endpoint = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://s3.{}.amazonaws.com", self.region),
        };
        let region = Region::Custom {
            region: self.region.clone(),
            endpoint,
        };
        let bucket = Bucket::new(name, region, self.credentials.clone())?;
        Ok(bucket)
    }
}

impl ObjectStore for S3ObjectStore {
    fn list(&self, bucket: &str) -> Result<Vec<String>> {
        let handle = self.bucket(bucket)?;
        let pages = with_retry("list", || handle.list(String::new(), None))?;
        let mut keys = vec![];
        for page in pages {
            for object in page.contents {
                keys.push(object.key);
            }
        }
        debug!("listed {} keys in bucket {}", keys.len(), bucket);
        Ok(keys)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let handle = self.bucket(bucket)?;
        let response = with_retry("get", || handle.get_object(key))?;
        if response.status_code() != 200 {
            return Err(RpkilogError::data_source_error(
                data_sources::OBJECT_STORE,
                format!(
                    "GET s3://{}/{} returned status {}",
                    bucket,
                    key,
                    response.status_code()
                ),
            ));
        }
        Ok(response.bytes().to_vec())
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()> {
        let handle = self.bucket(bucket)?;
        let response = with_retry("put", || handle.put_object(key, body))?;
        if !(200..300).contains(&response.status_code()) {
            return Err(RpkilogError::data_source_error(
                data_sources::OBJECT_STORE,
                format!(
                    "PUT s3://{}/{} returned status {}",
                    bucket,
                    key,
                    response.status_code()
                ),
            ));
        }
        debug!("uploaded s3://{}/{}", bucket, key);
        Ok(())
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        // a prefix listing is the cheapest probe that behaves the same on
        // S3-compatible stores without HEAD support
        let handle = self.bucket(bucket)?;
        let pages = with_retry("list", || handle.list(key.to_string(), None))?;
        Ok(pages
            .iter()
            .flat_map(|page| page.contents.iter())
            .any(|object| object.key == key))
    }
}
