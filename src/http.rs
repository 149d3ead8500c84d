//! HTTP client for the Discord REST API.
//!
//! All outbound chat-platform calls go through [`DiscordHttpClient`] so that
//! auth headers, rate-limit back-off, and error handling live in one place.

use async_lock::Mutex;
use reqwest::header::{HeaderMap, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::types::*;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const BOT_USER_AGENT: &str = concat!(
    "DiscordBot (",
    env!("CARGO_PKG_NAME"),
    ", ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

const MAX_RETRIES: u32 = 5;

// ---------------------------------------------------------------------------
// Rate-limit tracker (per-bucket)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct BucketState {
    remaining: u32,
    resets_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct RateLimiter {
    /// Route-key → bucket id mapping.
    route_buckets: HashMap<String, String>,
    /// Bucket id → state.
    buckets: HashMap<String, BucketState>,
    /// Global rate-limit: if set, no requests may be sent until this instant.
    global_until: Option<Instant>,
}

impl RateLimiter {
    /// How long we should wait before sending a request on `route_key`,
    /// or `None` if we can send immediately.
    fn delay_for(&self, route_key: &str) -> Option<Duration> {
        let now = Instant::now();
        if let Some(until) = self.global_until {
            if until > now {
                return Some(until - now);
            }
        }

        let bucket_id = self.route_buckets.get(route_key)?;
        let state = self.buckets.get(bucket_id)?;

        (state.remaining == 0 && state.resets_at > now).then(|| state.resets_at - now)
    }

    /// Update internal state from response headers.
    fn update(&mut self, route_key: &str, info: &RateLimitInfo) {
        let reset_instant = Instant::now()
            + info
                .reset_after
                .map(Duration::from_secs_f64)
                .unwrap_or(Duration::from_secs(1));

        if info.is_global {
            self.global_until = Some(reset_instant);
        }

        if let Some(ref bucket) = info.bucket {
            self.route_buckets
                .insert(route_key.to_string(), bucket.clone());
            self.buckets.insert(
                bucket.clone(),
                BucketState {
                    remaining: info.remaining.unwrap_or(1),
                    resets_at: reset_instant,
                },
            );
        }
    }
}

fn parse_rate_limit_headers(headers: &HeaderMap) -> RateLimitInfo {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    RateLimitInfo {
        remaining: header("x-ratelimit-remaining").and_then(|s| s.parse().ok()),
        reset_after: header("x-ratelimit-reset-after").and_then(|s| s.parse().ok()),
        bucket: header("x-ratelimit-bucket").map(str::to_string),
        is_global: header("x-ratelimit-global") == Some("true"),
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// Non-success status from Discord.
    #[error("Discord API error {status} on {route}: {body}")]
    Api {
        status: u16,
        body: String,
        route: String,
    },
    /// Transport / network error.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Serialisation error.
    #[error("Serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// An outgoing request body.
enum Body<'a> {
    Json(&'a serde_json::Value),
    File {
        payload: &'a serde_json::Value,
        filename: &'a str,
        bytes: &'a [u8],
    },
}

// ---------------------------------------------------------------------------
// DiscordHttpClient
// ---------------------------------------------------------------------------

/// A thin, rate-limit–aware HTTP client for the Discord REST API.
///
/// Cheap to clone (internals are behind `Arc`).
#[derive(Clone)]
pub struct DiscordHttpClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl DiscordHttpClient {
    /// Create a new client with the given bot token against `base_url`
    /// (e.g. `https://discord.com/api/v10`).
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            limiter: Arc::new(Mutex::new(RateLimiter::default())),
        }
    }

    // ------------------------------------------------------------------
    // Low-level: the single request method everything funnels through
    // ------------------------------------------------------------------

    /// Send a request to `{base_url}/{path}`.
    ///
    /// `route_key` is used for per-route rate-limit bucketing. It should be a
    /// template like `POST /channels/{channel_id}/messages`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        route_key: &str,
        body: Body<'_>,
    ) -> Result<Vec<u8>, HttpError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));

        for attempt in 0..=MAX_RETRIES {
            let delay = self.limiter.lock().await.delay_for(route_key);
            if let Some(delay) = delay {
                let delay = delay.min(Duration::from_secs(60));
                debug!(
                    route = route_key,
                    delay_ms = delay.as_millis() as u64,
                    "rate-limit pre-emptive backoff"
                );
                tokio::time::sleep(delay).await;
            }

            let req = self
                .client
                .request(method.clone(), &url)
                .header(AUTHORIZATION, format!("Bot {}", self.token))
                .header(USER_AGENT, BOT_USER_AGENT);

            let req = match &body {
                Body::Json(json) => req.json(json),
                Body::File {
                    payload,
                    filename,
                    bytes,
                } => {
                    let file = reqwest::multipart::Part::bytes(bytes.to_vec())
                        .file_name(filename.to_string())
                        .mime_str("application/json")?;
                    let form = reqwest::multipart::Form::new()
                        .text("payload_json", serde_json::to_string(payload)?)
                        .part("files[0]", file);
                    req.multipart(form)
                }
            };

            let resp = req.send().await?;
            let status = resp.status();
            let rl_info = parse_rate_limit_headers(resp.headers());

            self.limiter.lock().await.update(route_key, &rl_info);

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RETRIES {
                let retry_after = rl_info.reset_after.unwrap_or(1.0).min(60.0);
                warn!(
                    route = route_key,
                    attempt,
                    retry_after_s = retry_after,
                    global = rl_info.is_global,
                    "rate-limited by Discord, backing off"
                );
                tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
                continue;
            }

            let bytes = resp.bytes().await?;
            if status.is_success() {
                return Ok(bytes.to_vec());
            }

            return Err(HttpError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).to_string(),
                route: route_key.to_string(),
            });
        }

        Err(HttpError::Api {
            status: 429,
            body: "rate-limited after max retries".to_string(),
            route: route_key.to_string(),
        })
    }

    /// Like [`request`](Self::request) but deserialises the response body as JSON.
    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        route_key: &str,
        body: Body<'_>,
    ) -> Result<T, HttpError> {
        let bytes = self.request(method, path, route_key, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Send a rich message (embeds, reply, etc.) to a channel.
    pub async fn create_message(
        &self,
        channel_id: &str,
        msg: &CreateMessage,
    ) -> Result<Message, HttpError> {
        let path = format!("channels/{}/messages", channel_id);
        let route_key = format!("POST /channels/{}/messages", channel_id);
        let body = serde_json::to_value(msg)?;
        self.request_json(Method::POST, &path, &route_key, Body::Json(&body))
            .await
    }

    /// Send a message with a single file attachment to a channel.
    pub async fn create_message_with_file(
        &self,
        channel_id: &str,
        msg: &CreateMessage,
        filename: &str,
        file_content: &[u8],
    ) -> Result<Message, HttpError> {
        let path = format!("channels/{}/messages", channel_id);
        let route_key = format!("POST /channels/{}/messages", channel_id);

        let mut msg = msg.clone();
        msg.attachments = Some(vec![AttachmentRef {
            id: 0,
            filename: filename.to_string(),
        }]);
        let payload = serde_json::to_value(&msg)?;

        self.request_json(
            Method::POST,
            &path,
            &route_key,
            Body::File {
                payload: &payload,
                filename,
                bytes: file_content,
            },
        )
        .await
    }
}

impl std::fmt::Debug for DiscordHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordHttpClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
