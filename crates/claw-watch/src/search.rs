//! Search backend access.
//!
//! The [`SearchBackend`] trait is the seam between cycles and the store they
//! query; [`ElasticsearchClient`] implements it over HTTP.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, WatchError};
use crate::value::Value;

/// The query an alert runs each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Index (or index pattern) to search.
    pub index: String,
    /// Query body, sent as-is.
    #[serde(default = "Value::map")]
    pub body: Value,
}

impl QuerySpec {
    /// Creates a query against `index` with an empty body.
    #[must_use]
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            body: Value::map(),
        }
    }

    /// Sets the query body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// Something that can run an alert's query.
#[async_trait]
pub trait SearchBackend: Send + Sync + fmt::Debug {
    /// Runs `query` and returns the backend's response.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Query` if the backend is unreachable or rejects
    /// the query.
    async fn run_query(&self, query: &QuerySpec) -> Result<Value>;
}

/// Elasticsearch `_search` client.
#[derive(Debug, Clone)]
pub struct ElasticsearchClient {
    client: reqwest::Client,
    base_url: String,
}

impl ElasticsearchClient {
    /// Creates a client for `addr`. A bare `host:port` gets `http://`.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Config` if the address is empty or the HTTP
    /// client cannot be built.
    pub fn new(addr: &str, timeout: Duration) -> Result<Self> {
        let addr = addr.trim().trim_end_matches('/');
        if addr.is_empty() {
            return Err(WatchError::config("search address cannot be empty"));
        }

        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WatchError::config(format!("failed to build http client: {e}")))?;

        Ok(Self { client, base_url })
    }

    /// Returns the base URL queries are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn search_url(&self, index: &str) -> String {
        format!("{}/{}/_search", self.base_url, index.trim_matches('/'))
    }
}

#[async_trait]
impl SearchBackend for ElasticsearchClient {
    async fn run_query(&self, query: &QuerySpec) -> Result<Value> {
        let url = self.search_url(&query.index);
        debug!(url = %url, "running search query");

        let response = self
            .client
            .post(&url)
            .json(&query.body)
            .send()
            .await
            .map_err(|e| WatchError::query(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WatchError::query(format!(
                "{url}: status {}: {}",
                status.as_u16(),
                body.chars().take(512).collect::<String>()
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| WatchError::query(format!("{url}: invalid response body: {e}")))
    }
}
