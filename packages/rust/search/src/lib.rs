//! Search engine client: index provisioning and bulk loading.
//!
//! This crate provides:
//! - [`SearchClient`]: authenticated HTTP client bound to one engine URL
//! - [`schema`]: [`SearchClient::ensure_index`], index creation and field-limit widening
//! - [`bulk`]: [`SearchClient::bulk`], NDJSON bulk submission and response tallying

pub mod bulk;
pub mod schema;

use reqwest::{Client, Method, RequestBuilder};

use tedsync_shared::{Credentials, Result, SearchConfig, TedSyncError};

pub use bulk::BulkResult;
pub use schema::IndexStatus;

/// User-Agent string for search engine requests.
const USER_AGENT: &str = concat!("tedsync/", env!("CARGO_PKG_VERSION"));

/// HTTP client for one search engine endpoint.
#[derive(Debug, Clone)]
pub struct SearchClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl SearchClient {
    /// Build a client with the configured timeout and credentials.
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(std::time::Duration::from_secs(10)))
            .build()
            .map_err(|e| TedSyncError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            credentials: config.credentials.clone(),
        })
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a request to `{base_url}/{path}` with basic auth applied when configured.
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let builder = self.client.request(method, url);
        match self.credentials.basic_auth() {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }
}
