use crate::{
    config::ScannerConfig,
    db_handler::{DbHandler, body_hash, now, to_delta},
    error::ApiError,
    extractor::{Candidate, MentionExtractor},
    models::{
        listing::{Listing, PostData},
        naive_from_epoch,
    },
    reddit_api::RedditApi,
    shutdown::Shutdown,
    snapshot::{ConfigSnapshot, ScanTarget, TargetSource},
};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::sync::Arc;
use subindex_db::models::post;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkOutcome {
    pub comments: usize,
    pub unchanged: usize,
    pub new_mentions: u64,
    pub duplicates: u64,
    pub failed_comments: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub listed: usize,
    pub admitted: usize,
    pub walked: usize,
    pub new_mentions: u64,
    pub failed_posts: usize,
}

impl ScanReport {
    pub fn absorb(&mut self, other: ScanReport) {
        self.listed += other.listed;
        self.admitted += other.admitted;
        self.walked += other.walked;
        self.new_mentions += other.new_mentions;
        self.failed_posts += other.failed_posts;
    }
}

/// Whether a listed post should have its comment tree walked now.
///
/// Unscanned posts always qualify. Scanned posts wait out the cooldown, then
/// qualify while still young or once their last walk is older than the
/// rescan window.
pub fn is_eligible(
    last_scanned: Option<NaiveDateTime>,
    created_at: NaiveDateTime,
    now: NaiveDateTime,
    config: &ScannerConfig,
) -> bool {
    let Some(last_scanned) = last_scanned else {
        return true;
    };

    let since_scan = now - last_scanned;
    if since_scan < to_delta(config.scan_cooldown) {
        return false;
    }

    now - created_at <= to_delta(config.initial_scan_window)
        || since_scan >= to_delta(config.rescan_window)
}

pub struct PostIndexer {
    api: Arc<RedditApi>,
    db: Arc<DbHandler>,
    config: Arc<ScannerConfig>,
}

impl PostIndexer {
    pub fn new(api: Arc<RedditApi>, db: Arc<DbHandler>, config: Arc<ScannerConfig>) -> Self {
        Self { api, db, config }
    }

    /// Walks a target's listing newest first, following the `after` cursor for
    /// up to `max_listing_pages` pages.
    #[instrument(skip(self, target, snapshot, shutdown), fields(target = %target.name))]
    pub async fn scan_target(
        &self,
        target: &ScanTarget,
        snapshot: &ConfigSnapshot,
        shutdown: &Shutdown,
    ) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let mut after: Option<String> = None;

        'pages: for page in 0..self.config.max_listing_pages {
            let listing = match self.fetch_page(target, after.as_deref()).await {
                Ok(listing) => listing,
                Err(e) if page == 0 => {
                    return Err(e).with_context(|| format!("Failed to fetch listing for {}", target.name));
                }
                Err(e) => {
                    warn!(page, error = %e, "Failed to fetch listing page, keeping earlier pages");
                    break;
                }
            };
            after = listing.data.after.clone();
            let mut seen = 0;

            for data in listing.into_items() {
                if shutdown.is_triggered() {
                    info!("Shutdown requested, stopping target scan");
                    break 'pages;
                }
                seen += 1;
                self.scan_listed_post(target, data, snapshot, &mut report).await;
            }

            if seen == 0 || after.is_none() || shutdown.is_triggered() {
                break;
            }
            debug!(page, after = ?after, "Following listing cursor");
        }

        info!(
            listed = report.listed,
            admitted = report.admitted,
            walked = report.walked,
            new_mentions = report.new_mentions,
            failed_posts = report.failed_posts,
            "Target scanned"
        );
        Ok(report)
    }

    async fn fetch_page(&self, target: &ScanTarget, after: Option<&str>) -> Result<Listing<PostData>, ApiError> {
        let limit = self.config.listing_limit;
        match &target.source {
            TargetSource::Subreddit(name) => self.api.subreddit_new(name, limit, after).await,
            TargetSource::User(name) => self.api.user_submitted(name, limit, after).await,
        }
    }

    async fn scan_listed_post(
        &self,
        target: &ScanTarget,
        data: PostData,
        snapshot: &ConfigSnapshot,
        report: &mut ScanReport,
    ) {
        report.listed += 1;
        if !target.admits(&data) {
            return;
        }
        report.admitted += 1;

        let checked_at = now();
        let existing = match self.db.find_post(&data.id).await {
            Ok(existing) => existing,
            Err(e) => {
                error!(post_id = %data.id, error = ?e, "Failed to look up post");
                report.failed_posts += 1;
                return;
            }
        };
        let created_at = naive_from_epoch(data.created_utc).unwrap_or(checked_at);
        let last_scanned = existing.as_ref().and_then(|p| p.last_scanned);
        if !is_eligible(last_scanned, created_at, checked_at, &self.config) {
            debug!(post_id = %data.id, "Recently scanned, skipping");
            return;
        }

        let post = match existing {
            Some(post) => post,
            None => match self.db.get_or_create_post(&data, self.api.base_url()).await {
                Ok(post) => post,
                Err(e) => {
                    error!(post_id = %data.id, error = ?e, "Failed to store post");
                    report.failed_posts += 1;
                    return;
                }
            },
        };

        match self.walk_post(&post, snapshot).await {
            Ok(outcome) => {
                report.walked += 1;
                report.new_mentions += outcome.new_mentions;
            }
            Err(e) => {
                error!(post_id = %post.source_post_id, error = ?e, "Failed to walk post");
                report.failed_posts += 1;
            }
        }
    }

    /// Fetches the post's comment tree, records mentions and marks the post scanned.
    ///
    /// A post that no longer resolves upstream, or whose tree stays malformed
    /// or unreachable, is marked scanned so it stops holding a place at the
    /// head of the rescan queue. Rate limiting leaves it where it is.
    #[instrument(skip(self, post, snapshot), fields(post_id = %post.source_post_id))]
    pub async fn walk_post(&self, post: &post::Model, snapshot: &ConfigSnapshot) -> Result<WalkOutcome> {
        let tree = match self
            .api
            .comment_tree(&post.source_post_id, self.config.comment_limit)
            .await
        {
            Ok(tree) => tree,
            Err(e @ (ApiError::NotFound | ApiError::Forbidden { .. })) => {
                warn!(error = %e, "Post unavailable, marking scanned");
                self.db.mark_post_scanned(post.id, now()).await?;
                return Ok(WalkOutcome::default());
            }
            Err(e @ (ApiError::Malformed(_) | ApiError::Transient(_))) => {
                warn!(error = %e, "Comment tree unusable, moving post to the back of the queue");
                self.db.mark_post_scanned(post.id, now()).await?;
                return Err(e).context("Failed to fetch comment tree");
            }
            Err(e) => return Err(e).context("Failed to fetch comment tree"),
        };

        let hashes = self.db.comment_hashes(post.id).await?;
        let extractor = MentionExtractor::new(snapshot, &post.hosting_subreddit);
        let mut outcome = WalkOutcome {
            comments: tree.comments.len(),
            ..Default::default()
        };

        for node in &tree.comments {
            let hash = body_hash(&node.body);
            let stored = hashes.get(&node.id);
            if stored == Some(&hash) {
                outcome.unchanged += 1;
                continue;
            }

            let candidates: Vec<Candidate<'_>> = extractor.candidates(node).collect();
            if candidates.is_empty() && stored.is_none() {
                continue;
            }

            match self
                .db
                .record_comment_mentions(post, node, &hash, &candidates)
                .await
            {
                Ok(recorded) => {
                    outcome.new_mentions += recorded.new_mentions;
                    outcome.duplicates += recorded.duplicates;
                }
                Err(e) => {
                    error!(comment_id = %node.id, error = ?e, "Failed to record comment");
                    outcome.failed_comments += 1;
                }
            }
        }

        self.db.mark_post_scanned(post.id, now()).await?;

        debug!(
            comments = outcome.comments,
            unchanged = outcome.unchanged,
            unexpanded = tree.unexpanded,
            malformed = tree.malformed,
            new_mentions = outcome.new_mentions,
            duplicates = outcome.duplicates,
            "Post walked"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta};

    fn at(hours: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            + TimeDelta::hours(hours)
    }

    #[test]
    fn eligibility_windows() {
        let config = ScannerConfig::default();
        let now = at(100);

        // Never scanned.
        assert!(is_eligible(None, at(0), now, &config));
        // Inside the cooldown, even when young.
        assert!(!is_eligible(Some(now - TimeDelta::minutes(5)), at(99), now, &config));
        // Young post past the cooldown.
        assert!(is_eligible(Some(now - TimeDelta::hours(1)), at(90), now, &config));
        // Old post scanned recently enough.
        assert!(!is_eligible(Some(now - TimeDelta::hours(2)), at(0), now, &config));
        // Old post past the rescan window.
        assert!(is_eligible(Some(now - TimeDelta::hours(25)), at(0), now, &config));
    }
}
