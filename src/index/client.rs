//! Thin HTTP client for the search index.
//!
//! Speaks the small slice of the Elasticsearch/OpenSearch REST API the
//! loader needs: create-index-if-absent and `_bulk`. All calls share one
//! agent with a per-operation timeout.

use crate::{Result, RpkilogError};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Response of one `_bulk` submission.
#[derive(Clone, Debug, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub took: Option<u64>,
    pub errors: bool,
    pub items: Vec<serde_json::Value>,
}

impl BulkResponse {
    /// Count of individual actions that succeeded (created or overwrote).
    pub fn succeeded(&self) -> usize {
        self.items
            .iter()
            .filter_map(|item| item.get("index"))
            .filter(|action| {
                matches!(
                    action.get("status").and_then(|s| s.as_u64()),
                    Some(200) | Some(201)
                )
            })
            .count()
    }

    /// Error bodies of failed actions, for diagnostics.
    pub fn failures(&self) -> Vec<&serde_json::Value> {
        self.items
            .iter()
            .filter_map(|item| item.get("index"))
            .filter(|action| action.get("error").is_some())
            .collect()
    }
}

/// Search-index client bound to one endpoint.
pub struct EsClient {
    endpoint: String,
    agent: ureq::Agent,
}

impl EsClient {
    pub fn new(endpoint: &str) -> Self {
        Self::with_timeout(endpoint, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(endpoint: &str, timeout: Duration) -> Self {
        // status errors are handled from the response body, not the transport
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            agent: config.into(),
        }
    }

    /// Create the index with the given settings/mappings body. An index
    /// that already exists is not an error.
    pub fn ensure_index(&self, index: &str, body: &serde_json::Value) -> Result<()> {
        let url = format!("{}/{}", self.endpoint, index);
        let payload = body.to_string();
        let mut response = self
            .agent
            .put(&url)
            .header("Content-Type", "application/json")
            .send(payload.as_str())?;
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            info!("created index {}", index);
            return Ok(());
        }

        let text = response.body_mut().read_to_string()?;
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
        let error_type = parsed["error"]["type"].as_str().unwrap_or_default();
        if error_type == "resource_already_exists_exception" {
            debug!("index {} already exists", index);
            return Ok(());
        }
        Err(RpkilogError::index_error(format!(
            "cannot create index {}: status {} body {}",
            index, status, text
        )))
    }

    /// Submit one `_bulk` body (newline-delimited action/document pairs).
    pub fn bulk(&self, body: &str) -> Result<BulkResponse> {
        let url = format!("{}/_bulk", self.endpoint);
        let mut response = self
            .agent
            .post(&url)
            .header("Content-Type", "application/x-ndjson")
            .send(body)?;
        let status = response.status().as_u16();
        let text = response.body_mut().read_to_string()?;
        if !(200..300).contains(&status) {
            return Err(RpkilogError::index_error(format!(
                "bulk request returned status {}: {}",
                status, text
            )));
        }
        let parsed: BulkResponse = serde_json::from_str(&text)?;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_response_accounting() {
        let json = r#"{
            "took": 7,
            "errors": true,
            "items": [
                {"index": {"_id": "a", "status": 201}},
                {"index": {"_id": "b", "status": 200}},
                {"index": {"_id": "c", "status": 429, "error": {"type": "es_rejected_execution_exception"}}}
            ]
        }"#;
        let response: BulkResponse = serde_json::from_str(json).unwrap();
        assert!(response.errors);
        assert_eq!(response.succeeded(), 2);
        assert_eq!(response.failures().len(), 1);
    }

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        let client = EsClient::new("http://localhost:9200/");
        assert_eq!(client.endpoint, "http://localhost:9200");
    }
}
