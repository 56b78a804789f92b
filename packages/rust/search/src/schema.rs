//! Destination index provisioning.
//!
//! A missing index is created with dynamic mapping and generous field
//! limits. An existing index whose `total_fields.limit` is unset or too low is
//! widened with a close → update-settings → reopen sequence; the reopen is
//! always attempted once the close succeeded.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use tedsync_shared::{Result, TedSyncError};

use crate::SearchClient;

/// Primary shards for newly created indexes.
const NUMBER_OF_SHARDS: u32 = 5;

/// Replicas for newly created indexes.
const NUMBER_OF_REPLICAS: u32 = 1;

/// `index.mapping.nested_fields.limit` applied on create and widen.
const NESTED_FIELDS_LIMIT: u64 = 2_000;

/// `index.mapping.nested_objects.limit` applied on create and widen.
const NESTED_OBJECTS_LIMIT: u64 = 20_000;

/// Attempts made to reopen an index after a settings update.
const REOPEN_ATTEMPTS: u32 = 3;

/// Pause between reopen attempts.
const REOPEN_BACKOFF: Duration = Duration::from_millis(500);

/// What [`SearchClient::ensure_index`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    /// The index did not exist and was created.
    Created,
    /// The index existed with a lower field limit and was widened.
    Widened,
    /// The index already allowed at least the requested number of fields.
    AlreadySufficient,
}

impl SearchClient {
    /// Make sure `index` exists with a total-field limit of at least `field_limit`.
    ///
    /// Safe to call redundantly from concurrent tasks; creation is not
    /// guaranteed to happen exactly once.
    #[instrument(skip(self), fields(url = %self.base_url))]
    pub async fn ensure_index(&self, index: &str, field_limit: u64) -> Result<IndexStatus> {
        let response = self
            .request(Method::HEAD, index)
            .send()
            .await
            .map_err(|e| TedSyncError::Transport(format!("HEAD {index}: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                self.create_index(index, field_limit).await?;
                Ok(IndexStatus::Created)
            }
            status if status.is_success() => {
                let current = self.current_field_limit(index).await?;
                if current.is_some_and(|limit| limit >= field_limit) {
                    info!(index, ?current, "index already exists");
                    return Ok(IndexStatus::AlreadySufficient);
                }
                self.widen_field_limit(index, field_limit).await?;
                Ok(IndexStatus::Widened)
            }
            status => Err(TedSyncError::Schema(format!(
                "checking index {index}: HTTP {status}"
            ))),
        }
    }

    async fn create_index(&self, index: &str, field_limit: u64) -> Result<()> {
        let response = self
            .request(Method::PUT, index)
            .json(&create_index_body(field_limit))
            .send()
            .await
            .map_err(|e| TedSyncError::Transport(format!("PUT {index}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TedSyncError::Schema(format!(
                "failed to create index {index}: HTTP {status}: {body}"
            )));
        }

        info!(index, field_limit, "created index");
        Ok(())
    }

    async fn current_field_limit(&self, index: &str) -> Result<Option<u64>> {
        let response = self
            .request(Method::GET, &format!("{index}/_settings"))
            .send()
            .await
            .map_err(|e| TedSyncError::Transport(format!("GET {index}/_settings: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TedSyncError::Schema(format!(
                "reading settings of {index}: HTTP {status}"
            )));
        }

        let settings: Value = response.json().await.map_err(|e| {
            TedSyncError::Schema(format!("invalid settings response for {index}: {e}"))
        })?;
        Ok(field_limit_from_settings(&settings, index))
    }

    async fn widen_field_limit(&self, index: &str, field_limit: u64) -> Result<()> {
        self.post_expecting_success(&format!("{index}/_close"))
            .await
            .map_err(|e| TedSyncError::Schema(format!("failed to close {index} for update: {e}")))?;
        info!(index, "closed index to update settings");

        let update = self.put_settings(index, field_limit).await;
        if let Err(e) = &update {
            warn!(index, error = %e, "could not update field limit");
        }

        // Reopen regardless of the update outcome
        self.reopen_with_retry(index).await?;
        update?;

        info!(index, field_limit, "increased field limit");
        Ok(())
    }

    async fn put_settings(&self, index: &str, field_limit: u64) -> Result<()> {
        let response = self
            .request(Method::PUT, &format!("{index}/_settings"))
            .json(&widen_settings_body(field_limit))
            .send()
            .await
            .map_err(|e| TedSyncError::Transport(format!("PUT {index}/_settings: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TedSyncError::Schema(format!(
                "updating settings of {index}: HTTP {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn reopen_with_retry(&self, index: &str) -> Result<()> {
        let path = format!("{index}/_open");
        let mut last_error = String::new();

        for attempt in 1..=REOPEN_ATTEMPTS {
            match self.post_expecting_success(&path).await {
                Ok(()) => {
                    info!(index, attempt, "reopened index");
                    return Ok(());
                }
                Err(e) => {
                    warn!(index, attempt, error = %e, "failed to reopen index");
                    last_error = e;
                }
            }
            if attempt < REOPEN_ATTEMPTS {
                tokio::time::sleep(REOPEN_BACKOFF).await;
            }
        }

        Err(TedSyncError::Schema(format!(
            "index {index} left closed after {REOPEN_ATTEMPTS} reopen attempts: {last_error}"
        )))
    }

    async fn post_expecting_success(&self, path: &str) -> std::result::Result<(), String> {
        let response = self
            .request(Method::POST, path)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(format!("HTTP {status}: {body}"))
        }
    }
}

/// Body for `PUT /{index}`.
fn create_index_body(field_limit: u64) -> Value {
    json!({
        "settings": {
            "number_of_shards": NUMBER_OF_SHARDS,
            "number_of_replicas": NUMBER_OF_REPLICAS,
            "index.mapping.total_fields.limit": field_limit,
            "index.mapping.nested_fields.limit": NESTED_FIELDS_LIMIT,
            "index.mapping.nested_objects.limit": NESTED_OBJECTS_LIMIT,
        },
        "mappings": {
            "dynamic": true,
        },
    })
}

/// Body for `PUT /{index}/_settings`.
fn widen_settings_body(field_limit: u64) -> Value {
    json!({
        "index.mapping.total_fields.limit": field_limit,
        "index.mapping.nested_fields.limit": NESTED_FIELDS_LIMIT,
        "index.mapping.nested_objects.limit": NESTED_OBJECTS_LIMIT,
    })
}

/// Extract `settings.index.mapping.total_fields.limit` from a `_settings`
/// response. Falls back to the first entry when `index` is an alias.
fn field_limit_from_settings(settings: &Value, index: &str) -> Option<u64> {
    let entry = settings
        .get(index)
        .or_else(|| settings.as_object()?.values().next())?;
    match entry.pointer("/settings/index/mapping/total_fields/limit")? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}
