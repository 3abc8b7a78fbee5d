/*!
HTTP implementation of [`BlobStore`] against a Gist-shaped API.

- `POST {endpoint}` creates a blob: `{"description", "public": false, "files": {name: {"content"}}}`
- `GET {endpoint}/{id}` returns `{"id", "files": {name: {"content", "truncated", "raw_url"}}}`
- `PATCH {endpoint}/{id}` with `{"files": {name: {"content"}}}` replaces the listed files
*/

use super::{BlobFiles, BlobStore, RemoteError};
use crate::config::ServiceConfig;
use crate::{RekindleError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("rekindle/", env!("CARGO_PKG_VERSION"));
const ACCEPT_JSON: &str = "application/vnd.github+json";
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Deserialize)]
struct BlobResponse {
    id: String,
    #[serde(default)]
    files: BTreeMap<String, Option<FileEntry>>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    raw_url: Option<String>,
}

/// Remote blob client over HTTPS with bearer authentication
#[derive(Clone)]
pub struct HttpBlobClient {
    client: Client,
    endpoint: String,
    credential: String,
}

impl std::fmt::Debug for HttpBlobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBlobClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpBlobClient {
    /// # Arguments
    /// * `endpoint` - Collection URL, e.g. `https://api.github.com/gists`
    /// * `credential` - Bearer token
    /// * `timeout` - Per-request timeout
    pub fn new<E, C>(endpoint: E, credential: C, timeout: Duration) -> std::result::Result<Self, RemoteError>
    where
        E: Into<String>,
        C: Into<String>,
    {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            credential: credential.into(),
        })
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let credential = config
            .remote_credential
            .clone()
            .ok_or_else(|| RekindleError::config("remote credential is not set"))?;
        Ok(Self::new(
            config.remote_endpoint.clone(),
            credential,
            config.request_timeout,
        )?)
    }

    fn blob_url(&self, blob_id: &str) -> String {
        format!("{}/{}", self.endpoint, blob_id)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.credential)
            .header(ACCEPT, ACCEPT_JSON)
    }

    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
        subject: &str,
    ) -> std::result::Result<Response, RemoteError> {
        #[cfg(feature = "metrics")]
        let timer = crate::observability::MetricsTimer::start_remote(operation);

        let result = match request.send().await {
            Ok(response) if response.status().is_success() => Ok(response),
            Ok(response) => {
                let status = response.status();
                let headers = response.headers().clone();
                let body = response.text().await.unwrap_or_default();
                Err(error_for_status(status, &headers, &body, subject))
            }
            Err(err) => Err(transport_error(err)),
        };

        #[cfg(feature = "metrics")]
        match &result {
            Ok(_) => timer.finish(),
            Err(_) => timer.finish_with_error(),
        }

        if let Err(err) = &result {
            warn!(operation, subject, error = %err, "Remote request failed");
        }
        result
    }

    async fn read_blob(response: Response) -> std::result::Result<BlobResponse, RemoteError> {
        response.json::<BlobResponse>().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout
            } else {
                RemoteError::UnexpectedResponse(format!("malformed blob response: {e}"))
            }
        })
    }

    async fn get_blob(&self, blob_id: &str) -> std::result::Result<BlobResponse, RemoteError> {
        let url = self.blob_url(blob_id);
        let response = self
            .send("fetch", self.request(Method::GET, &url), &format!("blob {blob_id}"))
            .await?;
        Self::read_blob(response).await
    }

    /// Inline content, or the `raw_url` download when the listing truncated it
    async fn resolve_content(
        &self,
        name: &str,
        entry: FileEntry,
    ) -> std::result::Result<String, RemoteError> {
        match (entry.truncated, entry.raw_url, entry.content) {
            (true, Some(raw_url), _) => self.fetch_raw(&raw_url).await,
            (_, _, Some(content)) => Ok(content),
            (_, Some(raw_url), None) => self.fetch_raw(&raw_url).await,
            (_, None, None) => Err(RemoteError::UnexpectedResponse(format!(
                "file '{name}' has neither content nor raw_url"
            ))),
        }
    }

    async fn fetch_raw(&self, url: &str) -> std::result::Result<String, RemoteError> {
        let response = self.send("fetch_raw", self.request(Method::GET, url), url).await?;
        response.text().await.map_err(transport_error)
    }
}

#[async_trait]
impl BlobStore for HttpBlobClient {
    async fn create(&self, description: &str, files: &BlobFiles) -> std::result::Result<String, RemoteError> {
        let files: serde_json::Map<String, serde_json::Value> = files
            .iter()
            .map(|(name, content)| (name.clone(), json!({ "content": content })))
            .collect();
        let body = json!({
            "description": description,
            "public": false,
            "files": files,
        });

        let request = self.request(Method::POST, &self.endpoint).json(&body);
        let response = self.send("create", request, &self.endpoint).await?;
        let blob = Self::read_blob(response).await?;
        debug!(blob_id = %blob.id, "Created remote blob");
        Ok(blob.id)
    }

    async fn fetch(&self, blob_id: &str) -> std::result::Result<BlobFiles, RemoteError> {
        let blob = self.get_blob(blob_id).await?;

        let mut files = BlobFiles::new();
        for (name, entry) in blob.files {
            let Some(entry) = entry else { continue };
            let content = self.resolve_content(&name, entry).await?;
            files.insert(name, content);
        }
        debug!(blob_id, files = files.len(), "Fetched remote blob");
        Ok(files)
    }

    /// Only the requested file's `raw_url` is followed
    async fn fetch_file(
        &self,
        blob_id: &str,
        filename: &str,
    ) -> std::result::Result<Option<String>, RemoteError> {
        let mut blob = self.get_blob(blob_id).await?;
        let Some(entry) = blob.files.remove(filename).flatten() else {
            return Ok(None);
        };
        let content = self.resolve_content(filename, entry).await?;
        debug!(blob_id, filename, bytes = content.len(), "Fetched remote file");
        Ok(Some(content))
    }

    async fn replace_file(
        &self,
        blob_id: &str,
        filename: &str,
        content: &str,
    ) -> std::result::Result<(), RemoteError> {
        let url = self.blob_url(blob_id);
        let body = json!({ "files": { filename: { "content": content } } });
        self.send(
            "replace_file",
            self.request(Method::PATCH, &url).json(&body),
            &format!("blob {blob_id}"),
        )
        .await?;
        debug!(blob_id, filename, bytes = content.len(), "Replaced remote file");
        Ok(())
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else if err.is_decode() {
        RemoteError::UnexpectedResponse(err.to_string())
    } else {
        RemoteError::Transport(err.to_string())
    }
}

/// Map a non-2xx response onto the error taxonomy
pub(crate) fn error_for_status(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    subject: &str,
) -> RemoteError {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);
    let retry_after = header(RETRY_AFTER.as_str())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let rate_limit_exhausted = header("x-ratelimit-remaining") == Some("0");
    let message: String = body.chars().take(MAX_ERROR_BODY).collect();

    match status.as_u16() {
        401 => RemoteError::Unauthorized { status: 401 },
        403 if rate_limit_exhausted || retry_after.is_some() => {
            RemoteError::RateLimited { retry_after }
        }
        403 => RemoteError::Unauthorized { status: 403 },
        404 => RemoteError::NotFound(subject.to_string()),
        429 => RemoteError::RateLimited { retry_after },
        code if status.is_server_error() => RemoteError::ServerError {
            status: code,
            message,
        },
        code => RemoteError::UnexpectedResponse(format!("HTTP {code}: {message}")),
    }
}
