use crate::{
    config::ScannerConfig,
    db_handler::{DbHandler, now},
    indexers::posts::PostIndexer,
    shutdown::Shutdown,
    snapshot::ConfigSnapshot,
};
use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{error, info, instrument};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RescanReport {
    pub selected: usize,
    pub walked: usize,
    pub failed: usize,
    pub new_mentions: u64,
    pub out_of_time: bool,
}

/// Re-walks stored posts, never-scanned first and then oldest-scanned first.
pub struct RescanScheduler {
    posts: Arc<PostIndexer>,
    db: Arc<DbHandler>,
    config: Arc<ScannerConfig>,
}

impl RescanScheduler {
    pub fn new(posts: Arc<PostIndexer>, db: Arc<DbHandler>, config: Arc<ScannerConfig>) -> Self {
        Self { posts, db, config }
    }

    #[instrument(skip(self, snapshot, shutdown))]
    pub async fn run_pass(&self, snapshot: &ConfigSnapshot, shutdown: &Shutdown) -> Result<RescanReport> {
        let started = Instant::now();
        let deadline = started
            .checked_add(self.config.rescan_phase_budget)
            .unwrap_or(started + Duration::from_secs(365 * 24 * 60 * 60));
        let batch = self
            .db
            .select_rescan_batch(now(), self.config.scan_cooldown, self.config.rescan_batch_size)
            .await?;

        let mut report = RescanReport {
            selected: batch.len(),
            ..Default::default()
        };

        for post in &batch {
            if Instant::now() >= deadline {
                report.out_of_time = true;
                break;
            }
            if shutdown.is_triggered() {
                break;
            }

            match self.posts.walk_post(post, snapshot).await {
                Ok(outcome) => {
                    report.walked += 1;
                    report.new_mentions += outcome.new_mentions;
                }
                Err(e) => {
                    error!(post_id = %post.source_post_id, error = ?e, "Rescan failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            selected = report.selected,
            walked = report.walked,
            failed = report.failed,
            new_mentions = report.new_mentions,
            out_of_time = report.out_of_time,
            "Rescan pass complete"
        );
        Ok(report)
    }
}
