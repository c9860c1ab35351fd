//! HTTP client for the stats API.
//!
//! Implements [`StatsSource`] over `reqwest`. Handles the cursor envelope,
//! the API key header, and retries with exponential backoff on rate
//! limits, server errors and transport failures.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::StatsSource;
use crate::config::ApiConfig;
use crate::retry::BackoffPolicy;
use crate::types::{PageRequest, RawPage, RawPayload, SyncError};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Vec<serde_json::Value>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    #[serde(default)]
    next_cursor: serde_json::Value,
}

/// Why a single attempt failed.
#[derive(Debug)]
enum AttemptError {
    Retryable {
        message: String,
        retry_after: Option<Duration>,
    },
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(config: &ApiConfig, api_key: Option<SecretString>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("hoopsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build stats API HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            backoff: config.backoff(),
        })
    }

    fn url(&self, request: &PageRequest) -> String {
        format!("{}/{}", self.base_url, request.entity.endpoint())
    }

    /// One HTTP round trip, classified.
    async fn fetch_once(&self, request: &PageRequest) -> Result<RawPage, AttemptError> {
        let mut builder = self
            .http
            .get(self.url(request))
            .query(&query_params(request));
        if let Some(key) = &self.api_key {
            builder = builder.header(AUTHORIZATION, key.expose_secret().as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                AttemptError::Rejected(format!("Invalid request: {e}"))
            } else {
                AttemptError::Retryable {
                    message: format!("Request error: {e}"),
                    retry_after: None,
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, response).await);
        }

        let body = response.text().await.map_err(|e| AttemptError::Retryable {
            message: format!("Failed to read response body: {e}"),
            retry_after: None,
        })?;

        parse_envelope(request, &body).map_err(AttemptError::Rejected)
    }
}

#[async_trait]
impl StatsSource for ApiClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RawPage, SyncError> {
        let mut last_error = String::new();
        let mut retry_after = None;

        for attempt in 0..=self.backoff.max_retries {
            if attempt > 0 {
                let delay = self.backoff.delay_with_hint(attempt, retry_after.take());
                debug!(
                    entity = %request.entity,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying stats API request"
                );
                tokio::time::sleep(delay).await;
            }

            match self.fetch_once(request).await {
                Ok(page) => return Ok(page),
                Err(AttemptError::Retryable {
                    message,
                    retry_after: hint,
                }) => {
                    warn!(
                        entity = %request.entity,
                        cursor = request.cursor.as_deref().unwrap_or("<first page>"),
                        attempt,
                        error = %message,
                        "Retryable stats API error"
                    );
                    last_error = message;
                    retry_after = hint;
                }
                Err(AttemptError::Rejected(reason)) => {
                    return Err(SyncError::FetchRejected {
                        entity: request.entity,
                        cursor: request.cursor.clone(),
                        reason,
                    });
                }
            }
        }

        Err(SyncError::FetchExhausted {
            entity: request.entity,
            cursor: request.cursor.clone(),
            attempts: self.backoff.attempts(),
            last_error,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_params(request: &PageRequest) -> Vec<(&'static str, String)> {
    let mut params = vec![("per_page", request.per_page.to_string())];
    if let Some(cursor) = &request.cursor {
        params.push(("cursor", cursor.clone()));
    }
    params.extend(request.filters.query_params(request.entity));
    params
}

async fn classify_status(status: StatusCode, response: Response) -> AttemptError {
    let retry_after = if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::SERVICE_UNAVAILABLE
    {
        parse_retry_after(response.headers().get(RETRY_AFTER))
    } else {
        None
    };
    let text = response.text().await.unwrap_or_default();
    let message = format!("HTTP {status}: {}", truncate(&text, 200));

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AttemptError::Retryable {
            message,
            retry_after,
        }
    } else {
        AttemptError::Rejected(message)
    }
}

/// `Retry-After` in delta-seconds. HTTP-date values are ignored and the
/// computed backoff applies.
fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn parse_envelope(request: &PageRequest, body: &str) -> Result<RawPage, String> {
    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|e| format!("Malformed response envelope: {e}"))?;

    let next_cursor = match envelope.meta.map(|m| m.next_cursor) {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::String(s)) if s.is_empty() => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => return Err(format!("Malformed next_cursor: {other}")),
    };

    Ok(RawPage {
        entity: request.entity,
        cursor: request.cursor.clone(),
        next_cursor,
        payloads: envelope.data.into_iter().map(RawPayload::new).collect(),
    })
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
