//! Content store backed by the GitHub repository contents API.
//!
//! Each language maps to a repository (the container); each story is one
//! markdown file in it. The blob `sha` GitHub returns is the version token.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};

use crate::content::{ContentError, ContentStore, VersionToken, VersionedContent};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_url: String,
    pub owner: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

pub struct GitHubContentStore {
    client: reqwest::Client,
    api_url: String,
    owner: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct FileResponse {
    content: String,
    sha: String,
}

#[derive(Serialize)]
struct PutFileRequest<'a> {
    message: &'a str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Deserialize)]
struct PutFileResponse {
    content: PutFileContent,
}

#[derive(Deserialize)]
struct PutFileContent {
    sha: String,
}

fn upstream(context: &str, e: reqwest::Error) -> ContentError {
    if e.is_timeout() {
        ContentError::Upstream(format!("{}: request timed out", context))
    } else {
        ContentError::Upstream(format!("{}: {}", context, e))
    }
}

impl GitHubContentStore {
    pub fn new(config: GitHubConfig) -> Result<Self, ContentError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("oola/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| upstream("building HTTP client", e))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            owner: config.owner,
            token: config.token,
        })
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn contents_url(&self, container: &str, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_url, self.owner, container, path
        )
    }

    async fn put_file(
        &self,
        container: &str,
        path: &str,
        content: &str,
        message: &str,
        sha: Option<&str>,
    ) -> Result<VersionToken, ContentError> {
        let body = PutFileRequest {
            message,
            content: STANDARD.encode(content.as_bytes()),
            sha,
        };
        let response = self
            .request(Method::PUT, self.contents_url(container, path))
            .json(&body)
            .send()
            .await
            .map_err(|e| upstream("writing file", e))?;

        let status = response.status();
        if status.is_success() {
            let parsed: PutFileResponse = response
                .json()
                .await
                .map_err(|e| upstream("decoding write response", e))?;
            tracing::debug!(container, path, sha = %parsed.content.sha, "Wrote content file");
            return Ok(VersionToken::from_opaque(parsed.content.sha));
        }

        let detail = response.text().await.unwrap_or_default();
        match status {
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY if sha.is_some() => {
                tracing::warn!(container, path, %status, "Content version conflict");
                Err(ContentError::Conflict {
                    container: container.to_string(),
                    path: path.to_string(),
                })
            }
            _ => Err(ContentError::Upstream(format!(
                "writing {}/{} returned {}: {}",
                container, path, status, detail
            ))),
        }
    }
}

#[async_trait]
impl ContentStore for GitHubContentStore {
    async fn create(
        &self,
        container: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<VersionToken, ContentError> {
        self.put_file(container, path, content, message, None).await
    }

    async fn read(&self, container: &str, path: &str) -> Result<VersionedContent, ContentError> {
        let response = self
            .request(Method::GET, self.contents_url(container, path))
            .send()
            .await
            .map_err(|e| upstream("reading file", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ContentError::NotFound {
                container: container.to_string(),
                path: path.to_string(),
            }),
            status if status.is_success() => {
                let file: FileResponse = response
                    .json()
                    .await
                    .map_err(|e| upstream("decoding file", e))?;
                // GitHub wraps the base64 payload at 60 columns.
                let packed: String = file.content.split_whitespace().collect();
                let bytes = STANDARD
                    .decode(packed)
                    .map_err(|e| ContentError::Upstream(format!("invalid base64 content: {}", e)))?;
                let content = String::from_utf8(bytes)
                    .map_err(|e| ContentError::Upstream(format!("content is not UTF-8: {}", e)))?;
                Ok(VersionedContent {
                    content,
                    token: VersionToken::from_opaque(file.sha),
                })
            }
            status => Err(ContentError::Upstream(format!(
                "reading {}/{} returned {}",
                container, path, status
            ))),
        }
    }

    async fn update(
        &self,
        container: &str,
        path: &str,
        content: &str,
        message: &str,
        expected: VersionToken,
    ) -> Result<VersionToken, ContentError> {
        self.put_file(container, path, content, message, Some(expected.as_str()))
            .await
    }

    async fn container_exists(&self, container: &str) -> bool {
        let url = format!("{}/repos/{}/{}", self.api_url, self.owner, container);
        match self.request(Method::GET, url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(container, error = %e, "Container lookup failed");
                false
            }
        }
    }
}
