//! Bulk loading over the `_bulk` NDJSON endpoint.

use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, instrument, warn};

use tedsync_shared::{Document, Result, TedSyncError};

use crate::SearchClient;

/// Failing items kept for diagnostics.
const SAMPLE_FAILURES: usize = 3;

/// Outcome of one bulk request.
#[derive(Debug, Clone, Default)]
pub struct BulkResult {
    /// Top-level `errors` flag (forced on for transport/HTTP failures).
    pub errors: bool,
    /// Per-item results as returned by the engine.
    pub items: Vec<Value>,
    /// First few failing items, for logs.
    pub sample_failures: Vec<Value>,
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

impl BulkResult {
    /// A batch whose fate is unknown: nothing about it can be confirmed.
    pub fn unconfirmed() -> Self {
        Self {
            errors: true,
            items: Vec::new(),
            sample_failures: Vec::new(),
        }
    }

    /// Documents of a `batch_len` batch confirmed as indexed.
    pub fn indexed_count(&self, batch_len: usize) -> usize {
        if !self.errors {
            return batch_len;
        }
        self.items
            .iter()
            .filter(|item| item_succeeded(item))
            .count()
            .min(batch_len)
    }

    /// Documents of a `batch_len` batch not confirmed as indexed.
    pub fn failed_count(&self, batch_len: usize) -> usize {
        batch_len - self.indexed_count(batch_len)
    }

    /// Convert a batch with unconfirmed documents into an error.
    pub fn into_result(self, batch_len: usize) -> Result<Self> {
        let failed = self.failed_count(batch_len);
        if failed == 0 {
            Ok(self)
        } else {
            Err(TedSyncError::PartialIndex {
                attempted: batch_len,
                failed,
            })
        }
    }
}

/// An item is `{"<action>": {"status": ..., "error": ...}}`.
fn item_succeeded(item: &Value) -> bool {
    let Some(result) = item.as_object().and_then(|o| o.values().next()) else {
        return false;
    };
    let status_ok = result
        .get("status")
        .and_then(Value::as_u64)
        .is_none_or(|status| status < 300);
    status_ok && result.get("error").is_none()
}

/// Serialize a batch as alternating action and document lines.
pub fn build_bulk_body(index: &str, batch: &[Document]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for doc in batch {
        let action = json!({ "index": { "_index": index, "_id": doc.id } });
        serde_json::to_writer(&mut body, &action)
            .map_err(|e| TedSyncError::format(format!("serializing action for {}: {e}", doc.id)))?;
        body.push(b'\n');
        serde_json::to_writer(&mut body, &doc.body)
            .map_err(|e| TedSyncError::format(format!("serializing document {}: {e}", doc.id)))?;
        body.push(b'\n');
    }
    Ok(body)
}

impl SearchClient {
    /// Submit `batch` to `POST /_bulk`.
    ///
    /// Never fails: transport errors and non-2xx responses come back as
    /// [`BulkResult::unconfirmed`]. Some documents of such a batch may still
    /// have been indexed.
    #[instrument(skip_all, fields(index = %index, docs = batch.len()))]
    pub async fn bulk(&self, index: &str, batch: &[Document]) -> BulkResult {
        if batch.is_empty() {
            return BulkResult::default();
        }

        let body = match build_bulk_body(index, batch) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to build bulk body");
                return BulkResult::unconfirmed();
            }
        };

        let response = match self
            .request(Method::POST, "_bulk")
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "error during bulk indexing");
                return BulkResult::unconfirmed();
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(%status, body = %text, "failed to bulk index documents");
            return BulkResult::unconfirmed();
        }

        let parsed: BulkResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(error = %e, "unreadable bulk response");
                return BulkResult::unconfirmed();
            }
        };

        let sample_failures: Vec<Value> = if parsed.errors {
            parsed
                .items
                .iter()
                .filter(|item| !item_succeeded(item))
                .take(SAMPLE_FAILURES)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        if parsed.errors {
            warn!(failures = ?sample_failures, "bulk indexing had errors");
        } else {
            debug!("bulk request accepted");
        }

        BulkResult {
            errors: parsed.errors,
            items: parsed.items,
            sample_failures,
        }
    }
}
