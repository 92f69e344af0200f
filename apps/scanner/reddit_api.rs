use crate::{
    config::ScannerConfig,
    error::ApiError,
    models::{
        about::About,
        comments::CommentTree,
        listing::{Listing, PostData},
    },
    rate_limiter::RateLimiter,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{
    Client, Response, StatusCode,
    header::{HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT},
    redirect,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use utils::errors::HTTP_CLIENT_BUILD_FAILED;

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Unauthenticated read-only client for Reddit's public JSON endpoints.
///
/// Every attempt, retries included, first takes a slot from the shared
/// [`RateLimiter`].
#[derive(Clone)]
pub struct RedditApi {
    client: Client,
    base_url: String,
    limiter: RateLimiter,
    max_transient_retries: u32,
    default_retry_after: Duration,
    initial_backoff: Duration,
}

impl RedditApi {
    pub fn new(config: &ScannerConfig, limiter: RateLimiter) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("Invalid REDDIT_USER_AGENT")?,
        );
        headers.insert("Accept", HeaderValue::from_static("application/json"));

        // Reddit answers unknown subreddits with a redirect to a search page.
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .redirect(redirect::Policy::none())
            .build()
            .context(HTTP_CLIENT_BUILD_FAILED)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limiter,
            max_transient_retries: config.max_transient_retries,
            default_retry_after: config.default_retry_after,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        })
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One page of a subreddit's newest posts, continuing after the `after` cursor when given.
    #[instrument(skip(self))]
    pub async fn subreddit_new(
        &self,
        subreddit: &str,
        limit: u32,
        after: Option<&str>,
    ) -> Result<Listing<PostData>, ApiError> {
        self.get_json(&page_endpoint(&format!("/r/{subreddit}/new.json"), limit, after))
            .await
    }

    #[instrument(skip(self))]
    pub async fn user_submitted(
        &self,
        user: &str,
        limit: u32,
        after: Option<&str>,
    ) -> Result<Listing<PostData>, ApiError> {
        self.get_json(&page_endpoint(&format!("/user/{user}/submitted.json"), limit, after))
            .await
    }

    #[instrument(skip(self))]
    pub async fn comment_tree(&self, post_id: &str, limit: u32) -> Result<CommentTree, ApiError> {
        let value: serde_json::Value = self
            .get_json(&format!("/comments/{post_id}.json?limit={limit}&raw_json=1"))
            .await?;
        CommentTree::from_value(value)
    }

    #[instrument(skip(self))]
    pub async fn subreddit_about(&self, subreddit: &str) -> Result<About, ApiError> {
        self.get_json(&format!("/r/{subreddit}/about.json?raw_json=1"))
            .await
    }

    #[instrument(skip(self), fields(endpoint = %endpoint))]
    pub async fn get_json<T>(&self, endpoint: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let body = self.execute_request(endpoint).await?;
        serde_json::from_str(&body).map_err(|e| ApiError::Malformed(e.to_string()))
    }

    async fn execute_request(&self, endpoint: &str) -> Result<String, ApiError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut attempt = 0;
        let mut delay = self.initial_backoff;

        loop {
            self.limiter.acquire().await?;

            let failure = match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    match status {
                        status if status.is_success() => {
                            debug!(url, "Request successful");
                            return response
                                .text()
                                .await
                                .map_err(|e| ApiError::Transient(format!("failed to read body: {e}")));
                        }
                        StatusCode::TOO_MANY_REQUESTS => {
                            let retry_after = self.retry_after(&response);
                            warn!(url, retry_after = ?retry_after, "Rate limited");
                            return Err(ApiError::RateLimited { retry_after });
                        }
                        status if status.is_redirection() => {
                            info!(url, status = %status, "Redirected, treating as not found");
                            return Err(ApiError::NotFound);
                        }
                        StatusCode::NOT_FOUND => {
                            let body = response.text().await.unwrap_or_default();
                            return Err(match ban_reason(&body) {
                                Some(reason) => ApiError::Forbidden { reason },
                                None => ApiError::NotFound,
                            });
                        }
                        StatusCode::FORBIDDEN => {
                            let body = response.text().await.unwrap_or_default();
                            let reason = ban_reason(&body).unwrap_or_else(|| "forbidden".to_string());
                            warn!(url, reason, "Forbidden");
                            return Err(ApiError::Forbidden { reason });
                        }
                        status if status.is_server_error() => format!("HTTP {status}"),
                        status => {
                            let body = response.text().await.unwrap_or_default();
                            error!(url, status = %status, body, "Client error, skipping retries");
                            return Err(ApiError::Malformed(format!("unexpected status {status}")));
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            attempt += 1;
            if attempt > self.max_transient_retries {
                error!(url, attempt, error = %failure, "Max retries reached");
                return Err(ApiError::Transient(failure));
            }
            warn!(url, attempt, delay = ?delay, error = %failure, "Transient failure, retrying");
            sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }

    fn retry_after(&self, response: &Response) -> Duration {
        let headers = response.headers();
        headers
            .get(RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|raw| parse_retry_after(raw, Utc::now()))
            .or_else(|| {
                headers
                    .get(RATELIMIT_RESET)
                    .and_then(|h| h.to_str().ok())
                    .and_then(|raw| raw.trim().parse::<f64>().ok())
                    .filter(|secs| secs.is_finite() && *secs >= 0.0)
                    .map(|secs| Duration::from_secs(secs.ceil() as u64))
            })
            .unwrap_or(self.default_retry_after)
    }
}

fn page_endpoint(path: &str, limit: u32, after: Option<&str>) -> String {
    match after {
        Some(after) => format!("{path}?limit={limit}&after={after}&raw_json=1"),
        None => format!("{path}?limit={limit}&raw_json=1"),
    }
}

/// Delta-seconds or an HTTP-date; dates in the past yield zero.
pub fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// The `reason` Reddit attaches to banned, private and quarantined communities.
fn ban_reason(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("reason")?
        .as_str()
        .map(str::to_string)
        .filter(|r| !r.is_empty())
}
