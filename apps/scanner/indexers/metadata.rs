use crate::{
    config::ScannerConfig,
    db_handler::{DbHandler, RefreshTier, RefreshWindows, now},
    error::ApiError,
    reddit_api::RedditApi,
};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use subindex_db::models::subreddit;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated,
    NotFound,
    Banned,
    RateLimited,
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub selected: usize,
    pub updated: usize,
    pub not_found: usize,
    pub banned: usize,
    pub rate_limited: usize,
    pub failed: usize,
}

impl RefreshReport {
    fn record(&mut self, outcome: RefreshOutcome) {
        match outcome {
            RefreshOutcome::Updated => self.updated += 1,
            RefreshOutcome::NotFound => self.not_found += 1,
            RefreshOutcome::Banned => self.banned += 1,
            RefreshOutcome::RateLimited => self.rate_limited += 1,
            RefreshOutcome::Failed => self.failed += 1,
        }
    }
}

/// Profiles mentioned subreddits in tier order, a bounded number at a time.
pub struct MetadataRefresher {
    api: Arc<RedditApi>,
    db: Arc<DbHandler>,
    config: Arc<ScannerConfig>,
}

impl MetadataRefresher {
    pub fn new(api: Arc<RedditApi>, db: Arc<DbHandler>, config: Arc<ScannerConfig>) -> Self {
        Self { api, db, config }
    }

    fn windows(&self) -> RefreshWindows {
        RefreshWindows {
            missing_field_retry: self.config.missing_field_retry,
            staleness: self.config.metadata_staleness,
            not_found_recheck: self.config.not_found_recheck,
        }
    }

    #[instrument(skip(self))]
    pub async fn run_pass(&self) -> Result<RefreshReport> {
        let batch = self
            .db
            .select_refresh_batch(now(), &self.windows(), self.config.refresh_batch_size)
            .await?;

        let mut report = RefreshReport {
            selected: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<RefreshOutcome> = stream::iter(batch)
            .map(|(tier, subreddit)| self.refresh_one(tier, subreddit))
            .buffer_unordered(self.config.refresh_concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            report.record(outcome);
        }

        info!(
            selected = report.selected,
            updated = report.updated,
            not_found = report.not_found,
            banned = report.banned,
            rate_limited = report.rate_limited,
            failed = report.failed,
            "Metadata refresh pass complete"
        );
        Ok(report)
    }

    #[instrument(skip(self, subreddit), fields(subreddit = %subreddit.name, tier = ?tier))]
    async fn refresh_one(&self, tier: RefreshTier, subreddit: subreddit::Model) -> RefreshOutcome {
        let fetched_at = now();
        let (outcome, stored) = match self.api.subreddit_about(&subreddit.name).await {
            Ok(about) if about.is_subreddit() => match about.data {
                Some(data) => (
                    RefreshOutcome::Updated,
                    self.db.apply_profile(subreddit.id, &data, fetched_at).await,
                ),
                None => (
                    RefreshOutcome::NotFound,
                    self.db.mark_not_found(subreddit.id, fetched_at).await,
                ),
            },
            Ok(about) if about.reason.is_some() => (
                RefreshOutcome::Banned,
                self.db.mark_banned(subreddit.id, fetched_at).await,
            ),
            Ok(_) | Err(ApiError::NotFound) => (
                RefreshOutcome::NotFound,
                self.db.mark_not_found(subreddit.id, fetched_at).await,
            ),
            Err(ApiError::Forbidden { reason }) => {
                info!(reason, "Subreddit banned or private");
                (
                    RefreshOutcome::Banned,
                    self.db.mark_banned(subreddit.id, fetched_at).await,
                )
            }
            Err(ApiError::RateLimited { retry_after }) => (
                RefreshOutcome::RateLimited,
                self.db
                    .defer_after_rate_limit(&subreddit, retry_after, fetched_at)
                    .await,
            ),
            Err(e) => {
                warn!(error = %e, "Profile fetch failed, will retry next pass");
                return RefreshOutcome::Failed;
            }
        };

        match stored {
            Ok(()) => outcome,
            Err(e) => {
                error!(error = ?e, "Failed to store profile result");
                RefreshOutcome::Failed
            }
        }
    }
}
