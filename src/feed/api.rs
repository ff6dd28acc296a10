use crate::feed::model::{FeedItem, InteractionKind, ItemStats, ListingCategory};
use crate::util::validate_media_url;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

const MAX_BODY_SIZE: usize = 2 * 1024 * 1024; // 2MB
const MAX_PAGE_RETRIES: u32 = 3;

/// Errors returned by the listing backend.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request timed out")]
    Timeout,
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    #[error("Invalid response body: {0}")]
    Decode(String),
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("Insecure base URL: HTTPS required (except localhost for testing)")]
    InsecureBaseUrl,
    /// The background task running the request panicked.
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl ApiError {
    /// Returns true if this error is transient and the request may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Timeout | ApiError::Network(_) => true,
            ApiError::HttpStatus(status) => *status >= 500,
            ApiError::ResponseTooLarge(_)
            | ApiError::Decode(_)
            | ApiError::InvalidBaseUrl(_)
            | ApiError::InsecureBaseUrl
            | ApiError::TaskFailed(_) => false,
        }
    }
}

/// One page of the listing feed.
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    pub next_cursor: Option<String>,
}

/// Authoritative post-toggle state returned by the toggle endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ToggleOutcome {
    pub count: u64,
    pub state: bool,
}

/// Listing backend consumed by the feed core.
///
/// Implemented over HTTP by [`HttpBackend`]; tests substitute in-memory fakes.
#[async_trait]
pub trait FeedBackend: Send + Sync {
    /// Fetch a page of listings. `cursor = None` fetches the first page.
    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<FeedPage, ApiError>;

    /// Count one view of a listing.
    async fn increment_view(&self, item_id: &str) -> Result<(), ApiError>;

    /// Set the like/save state of a listing, returning the authoritative count.
    async fn set_interaction(
        &self,
        item_id: &str,
        kind: InteractionKind,
        desired: bool,
    ) -> Result<ToggleOutcome, ApiError>;
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PageDto {
    items: Vec<ListingDto>,
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListingDto {
    id: String,
    #[serde(default)]
    media_url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    category: ListingCategory,
    #[serde(default)]
    stats: ItemStats,
    #[serde(default)]
    liked: bool,
    #[serde(default)]
    saved: bool,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl ListingDto {
    fn into_item(self) -> FeedItem {
        // Unusable media URLs render as a placeholder rather than dropping the listing
        let media_ref = match self.media_url {
            Some(raw) => match validate_media_url(&raw) {
                Ok(url) => Some(url.to_string()),
                Err(e) => {
                    tracing::warn!(item_id = %self.id, error = %e, "Ignoring invalid media URL");
                    None
                }
            },
            None => None,
        };

        let mut item = FeedItem::new(self.id, media_ref, self.stats).with_flags(self.liked, self.saved);
        item.title = self.title;
        item.category = self.category;
        item.created_at = self.created_at;
        item
    }
}

#[derive(Debug, Serialize)]
struct ToggleBody {
    state: bool,
}

// ============================================================================
// HTTP Backend
// ============================================================================

/// [`FeedBackend`] over the marketplace REST API.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    token: Option<SecretString>,
    timeout: Duration,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpBackend {
    /// Create a backend rooted at `base_url`.
    ///
    /// HTTPS is required; plain HTTP is accepted only for localhost so tests
    /// can run against a mock server. The bearer token is never sent over HTTP.
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let url = Url::parse(base_url).map_err(|e| ApiError::InvalidBaseUrl(e.to_string()))?;
        if url.cannot_be_a_base() {
            return Err(ApiError::InvalidBaseUrl(base_url.to_string()));
        }

        match url.scheme() {
            "https" => {}
            "http" => {
                let is_localhost = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
                if !is_localhost {
                    tracing::error!(base_url = %url, "Rejecting non-HTTPS base URL (HTTPS required except for localhost)");
                    return Err(ApiError::InsecureBaseUrl);
                }
                tracing::warn!(base_url = %url, "Using non-HTTPS API base URL (localhost only)");
            }
            other => return Err(ApiError::InvalidBaseUrl(format!("unsupported scheme {other}"))),
        }

        Ok(Self {
            client,
            base_url: url,
            token,
            timeout,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // cannot_be_a_base was rejected in new(), so this always succeeds
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) if self.base_url.scheme() == "https" => {
                request.header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()))
            }
            Some(_) => {
                tracing::debug!("Skipping bearer token for non-HTTPS base URL");
                request
            }
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = tokio::time::timeout(self.timeout, self.authorize(request).send())
            .await
            .map_err(|_| ApiError::Timeout)?
            .map_err(ApiError::Network)?;

        if !response.status().is_success() {
            return Err(ApiError::HttpStatus(response.status().as_u16()));
        }
        Ok(response)
    }

    async fn fetch_page_once(&self, cursor: Option<&str>, limit: usize) -> Result<FeedPage, ApiError> {
        let mut url = self.endpoint(&["listings"]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }

        let response = self.send(self.client.get(url)).await?;
        let bytes = read_limited_bytes(response, MAX_BODY_SIZE).await?;
        let page: PageDto =
            serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))?;

        Ok(FeedPage {
            items: page.items.into_iter().map(ListingDto::into_item).collect(),
            next_cursor: page.next_cursor,
        })
    }
}

#[async_trait]
impl FeedBackend for HttpBackend {
    /// Retries transient failures with exponential backoff: 1s, 2s, 4s.
    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<FeedPage, ApiError> {
        let mut retry_count = 0;
        loop {
            match self.fetch_page_once(cursor, limit).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && retry_count < MAX_PAGE_RETRIES => {
                    let delay = 1u64 << retry_count;
                    tracing::debug!(
                        error = %e,
                        retry = retry_count + 1,
                        delay_secs = delay,
                        "Retrying page fetch after transient error"
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn increment_view(&self, item_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["listings", item_id, "views"]);
        self.send(self.client.post(url)).await?;
        Ok(())
    }

    async fn set_interaction(
        &self,
        item_id: &str,
        kind: InteractionKind,
        desired: bool,
    ) -> Result<ToggleOutcome, ApiError> {
        let url = self.endpoint(&["listings", item_id, kind.as_str()]);
        let body = serde_json::to_vec(&ToggleBody { state: desired })
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        let response = self
            .send(
                self.client
                    .put(url)
                    .header(CONTENT_TYPE, "application/json")
                    .body(body),
            )
            .await?;
        let bytes = read_limited_bytes(response, MAX_BODY_SIZE).await?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

async fn read_limited_bytes(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, ApiError> {
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(ApiError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ApiError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(ApiError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}
