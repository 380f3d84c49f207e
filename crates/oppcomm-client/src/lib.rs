//! CRM remote store access: the `RemoteStore` seam and its HTTP implementation.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use oppcomm_core::{Opportunity, UpdatePayload};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, warn};

#[cfg(any(test, feature = "memory"))]
mod memory;

#[cfg(any(test, feature = "memory"))]
pub use memory::MemoryStore;

pub const CRATE_NAME: &str = "oppcomm-client";

pub const DEFAULT_BASE_URL: &str = "https://rest.gohighlevel.com/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Position after the last record of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub start_after_id: String,
    pub start_after: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: u32,
    pub cursor: Option<PageCursor>,
}

impl PageRequest {
    pub fn first(limit: u32) -> Self {
        Self {
            limit,
            cursor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpportunityPage {
    pub opportunities: Vec<Opportunity>,
    pub next: Option<PageCursor>,
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot build endpoint url from {0}")]
    Url(String),
}

impl CrmError {
    pub fn status(&self) -> Option<u16> {
        match self {
            CrmError::HttpStatus { status, .. } => Some(*status),
            CrmError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Operations the reconciler needs from the CRM.
///
/// `get_opportunity` reports a missing record as `Ok(None)`, distinct from a
/// transport failure.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, CrmError>;

    async fn list_opportunities(
        &self,
        pipeline_id: &str,
        status: &str,
        page: &PageRequest,
    ) -> Result<OpportunityPage, CrmError>;

    async fn get_opportunity(
        &self,
        pipeline_id: &str,
        opportunity_id: &str,
    ) -> Result<Option<Opportunity>, CrmError>;

    async fn update_opportunity(&self, payload: &UpdatePayload) -> Result<(), CrmError>;
}

/// Throttling and server-side failures are worth another attempt; any other
/// status is the CRM's final answer.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

/// Retry budget for one CRM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry + 1`, or `None` once the budget is spent.
    pub fn retry_delay(&self, retry: usize) -> Option<Duration> {
        if retry >= self.max_retries {
            return None;
        }
        let doubled = u32::try_from(retry)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .map_or(self.max_delay, |factor| self.base_delay.saturating_mul(factor));
        Some(doubled.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct CrmClientConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl CrmClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Read `location_id` from a JWT payload without verifying the signature.
///
/// Only used to scope pipeline listing; any decode problem means no scoping.
pub fn location_id_from_token(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = match URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "could not base64-decode token payload");
            return None;
        }
    };
    let claims: JsonValue = match serde_json::from_slice(&bytes) {
        Ok(claims) => claims,
        Err(err) => {
            warn!(error = %err, "token payload is not json");
            return None;
        }
    };
    match claims.get("location_id").or_else(|| claims.get("locationId"))? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct PipelinesResponse {
    #[serde(default)]
    pipelines: Vec<Pipeline>,
}

#[derive(Debug, Deserialize)]
struct OpportunitiesResponse {
    #[serde(default)]
    opportunities: Vec<JsonValue>,
    #[serde(default)]
    meta: Option<PageMeta>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageMeta {
    #[serde(default)]
    next_page_url: Option<String>,
    #[serde(default)]
    start_after_id: Option<String>,
    #[serde(default)]
    start_after: Option<i64>,
}

impl PageMeta {
    fn next_cursor(self) -> Option<PageCursor> {
        let has_next = self.next_page_url.is_some_and(|u| !u.is_empty());
        match (has_next, self.start_after_id) {
            (true, Some(start_after_id)) if !start_after_id.is_empty() => Some(PageCursor {
                start_after_id,
                start_after: self.start_after,
            }),
            _ => None,
        }
    }
}

/// Records that fail to deserialize are dropped with a warning rather than
/// failing the whole page.
fn decode_opportunities(raw: Vec<JsonValue>, pipeline_id: &str) -> Vec<Opportunity> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value::<Opportunity>(value) {
            Ok(opportunity) => Some(opportunity),
            Err(err) => {
                warn!(pipeline_id, error = %err, "skipping malformed opportunity record");
                None
            }
        })
        .collect()
}

/// HTTP client for the CRM REST API.
///
/// Credentials and location scoping are fixed at construction; the value is
/// shared read-only between the poll loop and event handlers.
#[derive(Debug, Clone)]
pub struct CrmClient {
    client: reqwest::Client,
    base_url: Url,
    location_id: Option<String>,
    backoff: BackoffPolicy,
}

impl CrmClient {
    pub fn new(config: CrmClientConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .with_context(|| format!("parsing CRM base url {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("CRM base url {} cannot carry a path", config.base_url);
        }

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token.trim()))
            .context("access token is not a valid header value")?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url,
            location_id: location_id_from_token(&config.token),
            backoff: config.backoff,
        })
    }

    pub fn location_id(&self) -> Option<&str> {
        self.location_id.as_deref()
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, CrmError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CrmError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn record_url(&self, pipeline_id: &str, opportunity_id: &str) -> Result<Url, CrmError> {
        self.endpoint(&["pipelines", pipeline_id, "opportunities", opportunity_id])
    }

    /// Send with retries on throttling, server errors and connect/timeout
    /// failures. The final response is returned whatever its status.
    async fn send(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, CrmError> {
        let mut retry = 0;
        loop {
            let delay = match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    match self.backoff.retry_delay(retry) {
                        Some(delay) if is_transient_status(status) => {
                            warn!(%status, url = %resp.url(), retry, "CRM answered with a transient status");
                            delay
                        }
                        _ => return Ok(resp),
                    }
                }
                Err(err) => match self.backoff.retry_delay(retry) {
                    Some(delay) if is_transient_error(&err) => {
                        warn!(error = %err, retry, "CRM request failed in transit");
                        delay
                    }
                    _ => return Err(CrmError::Request(err)),
                },
            };
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    /// Non-2xx responses become `HttpStatus` with the body attached; the body
    /// is what explains validation rejections.
    async fn read_success(resp: reqwest::Response) -> Result<String, CrmError> {
        let status = resp.status();
        let url = resp.url().to_string();
        let body = resp.text().await?;
        if status.is_success() {
            return Ok(body);
        }
        error!(status = status.as_u16(), %url, %body, "CRM API error");
        Err(CrmError::HttpStatus {
            status: status.as_u16(),
            url,
            body,
        })
    }

    fn decode<T: serde::de::DeserializeOwned>(url: &Url, body: &str) -> Result<T, CrmError> {
        serde_json::from_str(body).map_err(|source| CrmError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl RemoteStore for CrmClient {
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, CrmError> {
        let url = self.endpoint(&["pipelines", ""])?;
        let resp = self
            .send(|| {
                let req = self.client.get(url.clone());
                match &self.location_id {
                    Some(location_id) => req.query(&[("locationId", location_id)]),
                    None => req,
                }
            })
            .await?;
        let body = Self::read_success(resp).await?;
        let parsed: PipelinesResponse = Self::decode(&url, &body)?;
        debug!(count = parsed.pipelines.len(), "listed pipelines");
        Ok(parsed.pipelines)
    }

    async fn list_opportunities(
        &self,
        pipeline_id: &str,
        status: &str,
        page: &PageRequest,
    ) -> Result<OpportunityPage, CrmError> {
        let url = self.endpoint(&["pipelines", pipeline_id, "opportunities"])?;
        let mut query = vec![
            ("limit", page.limit.to_string()),
            ("status", status.to_string()),
        ];
        if let Some(cursor) = &page.cursor {
            query.push(("startAfterId", cursor.start_after_id.clone()));
            if let Some(start_after) = cursor.start_after {
                query.push(("startAfter", start_after.to_string()));
            }
        }

        let resp = self
            .send(|| self.client.get(url.clone()).query(&query))
            .await?;
        let body = Self::read_success(resp).await?;
        let parsed: OpportunitiesResponse = Self::decode(&url, &body)?;
        Ok(OpportunityPage {
            opportunities: decode_opportunities(parsed.opportunities, pipeline_id),
            next: parsed.meta.unwrap_or_default().next_cursor(),
        })
    }

    async fn get_opportunity(
        &self,
        pipeline_id: &str,
        opportunity_id: &str,
    ) -> Result<Option<Opportunity>, CrmError> {
        let url = self.record_url(pipeline_id, opportunity_id)?;
        let resp = self.send(|| self.client.get(url.clone())).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            warn!(opportunity_id, pipeline_id, "opportunity not found in pipeline");
            return Ok(None);
        }
        let body = Self::read_success(resp).await?;
        let mut value: JsonValue = Self::decode(&url, &body)?;
        // some API versions wrap the record
        if let Some(inner) = value.get_mut("opportunity").map(JsonValue::take) {
            value = inner;
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| CrmError::Decode {
                url: url.to_string(),
                source,
            })
    }

    async fn update_opportunity(&self, payload: &UpdatePayload) -> Result<(), CrmError> {
        let url = self.record_url(&payload.pipeline_id, &payload.opportunity_id)?;
        let resp = self
            .send(|| self.client.put(url.clone()).json(payload))
            .await?;
        Self::read_success(resp).await?;
        Ok(())
    }
}
