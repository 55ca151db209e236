//! Search engine connector (Elasticsearch-compatible HTTP API).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::debug;

use super::{Connector, ConnectorError, ConnectorResult};
use crate::artifact::InitArtifact;

/// Thin HTTP client for a search engine instance.
#[derive(Debug, Clone)]
pub struct SearchClient {
    http: reqwest::Client,
    base: String,
}

/// Hits of one search plus the engine's total count, which may exceed the
/// number of hits returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResult {
    pub total_hits: u64,
    /// `_source` of every returned hit.
    pub hits: Vec<Value>,
}

impl SearchResult {
    /// Reads a `_search` response body. Accepts both the object form of
    /// `hits.total` and the bare number older engines return.
    pub fn from_response(body: &Value) -> Self {
        let hits = &body["hits"];
        let total_hits = hits["total"]["value"]
            .as_u64()
            .or_else(|| hits["total"].as_u64())
            .unwrap_or_default();
        let sources = hits["hits"]
            .as_array()
            .map(|hits| hits.iter().map(|h| h["_source"].clone()).collect())
            .unwrap_or_default();
        Self {
            total_hits,
            hits: sources,
        }
    }
}

impl SearchClient {
    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// The underlying HTTP client, for requests this type has no helper for.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// Sends a request and returns the status and raw body.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ConnectorResult<(StatusCode, String)> {
        let mut request = self.http.request(method, self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ConnectorError::Connect(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ConnectorError::Query(e.to_string()))?;
        Ok((status, text))
    }

    /// Sends a request and returns the JSON body of a successful response.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ConnectorResult<Value> {
        let (status, text) = self.send(method.clone(), path, body).await?;
        if !status.is_success() {
            return Err(ConnectorError::Query(format!(
                "{} {} returned {}: {}",
                method, path, status, text
            )));
        }
        parse_body(&text)
    }

    /// Creates an index with the given settings and mappings body.
    ///
    /// Returns `false` if the index already existed.
    pub async fn create_index(&self, index: &str, body: &Value) -> ConnectorResult<bool> {
        let (status, text) = self.send(Method::PUT, index, Some(body)).await?;
        if status.is_success() {
            debug!("Created index {}", index);
            return Ok(true);
        }
        if status == StatusCode::BAD_REQUEST && text.contains("resource_already_exists_exception") {
            debug!("Index {} already exists", index);
            return Ok(false);
        }
        Err(ConnectorError::Query(format!(
            "create index {} returned {}: {}",
            index, status, text
        )))
    }

    pub async fn index_exists(&self, index: &str) -> ConnectorResult<bool> {
        let (status, text) = self.send(Method::HEAD, index, None).await?;
        match status {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(ConnectorError::Query(format!(
                "HEAD {} returned {}: {}",
                index, status, text
            ))),
        }
    }

    /// Indexes one document under `id`.
    pub async fn index_document(&self, index: &str, id: &str, doc: &Value) -> ConnectorResult<()> {
        self.request(Method::PUT, &format!("{}/_doc/{}", index, id), Some(doc))
            .await
            .map(|_| ())
    }

    /// The `_source` of a document, or `None` if it does not exist.
    pub async fn get_document(&self, index: &str, id: &str) -> ConnectorResult<Option<Value>> {
        let path = format!("{}/_doc/{}", index, id);
        let (status, text) = self.send(Method::GET, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ConnectorError::Query(format!(
                "GET {} returned {}: {}",
                path, status, text
            )));
        }
        Ok(Some(parse_body(&text)?["_source"].clone()))
    }

    /// Deletes one document. Returns `false` if it did not exist.
    pub async fn delete_document(&self, index: &str, id: &str) -> ConnectorResult<bool> {
        let path = format!("{}/_doc/{}", index, id);
        let (status, text) = self.send(Method::DELETE, &path, None).await?;
        match status {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(ConnectorError::Query(format!(
                "DELETE {} returned {}: {}",
                path, status, text
            ))),
        }
    }

    /// Runs a search.
    pub async fn search(&self, index: &str, query: &Value) -> ConnectorResult<SearchResult> {
        let body = self
            .request(Method::POST, &format!("{}/_search", index), Some(query))
            .await?;
        Ok(SearchResult::from_response(&body))
    }

    /// Names of all indices, system indices included.
    pub async fn list_indices(&self) -> ConnectorResult<Vec<String>> {
        let body = self
            .request(Method::GET, "_cat/indices?format=json&h=index", None)
            .await?;
        Ok(body
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row["index"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn parse_body(text: &str) -> ConnectorResult<Value> {
    if text.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| ConnectorError::Query(e.to_string()))
}

/// Connector for the search engine kind.
pub struct SearchConnector {
    timeout: Duration,
}

impl SearchConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for SearchConnector {
    type Handle = SearchClient;

    async fn connect(&self, address: &str) -> ConnectorResult<SearchClient> {
        let http = reqwest::Client::builder()
            .connect_timeout(self.timeout)
            .build()
            .map_err(|e| ConnectorError::Connect(e.to_string()))?;
        Ok(SearchClient {
            http,
            base: address.trim_end_matches('/').to_string(),
        })
    }

    async fn probe(&self, handle: &SearchClient) -> ConnectorResult<()> {
        let response = handle
            .http
            .get(handle.url("_cluster/health"))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ConnectorError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ConnectorError::Query(format!(
                "cluster health returned {}",
                response.status()
            )));
        }
        let health: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::Query(e.to_string()))?;
        if health["status"] == "red" {
            return Err(ConnectorError::Query("cluster status is red".to_string()));
        }
        Ok(())
    }

    async fn initialize(
        &self,
        handle: &SearchClient,
        artifact: &InitArtifact,
    ) -> ConnectorResult<()> {
        let index = artifact.stem();
        if index.is_empty() {
            return Err(ConnectorError::Artifact(format!(
                "{}: cannot derive an index name",
                artifact
            )));
        }
        let body: Value = serde_json::from_str(&artifact.read().await?)
            .map_err(|e| ConnectorError::Artifact(format!("{}: {}", artifact, e)))?;

        handle.create_index(&index, &body).await.map(|_| ())
    }

    async fn clean(&self, handle: &SearchClient) -> ConnectorResult<()> {
        let indices: Vec<String> = handle
            .list_indices()
            .await?
            .into_iter()
            .filter(|name| !name.starts_with('.'))
            .collect();
        if indices.is_empty() {
            return Ok(());
        }
        debug!("Deleting {} indices", indices.len());
        handle
            .request(Method::DELETE, &indices.join(","), None)
            .await
            .map(|_| ())
    }

    async fn refresh(&self, handle: &SearchClient) -> ConnectorResult<()> {
        handle
            .request(Method::POST, "_refresh", None)
            .await
            .map(|_| ())
    }

    fn name(&self) -> &'static str {
        "search"
    }
}
