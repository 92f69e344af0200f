//! The scan cycle state machine.
//!
//! `LoadConfig -> ScanTargets -> RefreshMetadata -> RescanPosts -> Sleep`,
//! repeated until shutdown. A snapshot without active targets diverts the
//! cycle into `Idle`, which only refreshes metadata and reloads config.

use crate::{
    config::ScannerConfig,
    db_handler::{DbHandler, now},
    indexers::{
        metadata::{MetadataRefresher, RefreshReport},
        posts::{PostIndexer, ScanReport},
        rescan::{RescanReport, RescanScheduler},
    },
    reddit_api::RedditApi,
    shutdown::Shutdown,
    snapshot::ConfigSnapshot,
};
use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    LoadConfig,
    ScanTargets,
    RefreshMetadata,
    RescanPosts,
    Idle,
    Sleep,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::LoadConfig => "load_config",
            Phase::ScanTargets => "scan_targets",
            Phase::RefreshMetadata => "refresh_metadata",
            Phase::RescanPosts => "rescan_posts",
            Phase::Idle => "idle",
            Phase::Sleep => "sleep",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub idle: bool,
    pub config_loaded: bool,
    pub targets: usize,
    pub scan: ScanReport,
    pub failed_targets: usize,
    pub refresh: RefreshReport,
    pub rescan: RescanReport,
}

impl CycleReport {
    pub fn new_mentions(&self) -> u64 {
        self.scan.new_mentions + self.rescan.new_mentions
    }
}

pub struct Orchestrator {
    db: Arc<DbHandler>,
    posts: Arc<PostIndexer>,
    refresher: MetadataRefresher,
    rescan: RescanScheduler,
    config: Arc<ScannerConfig>,
}

impl Orchestrator {
    pub fn new(db: Arc<DbHandler>, api: Arc<RedditApi>, config: Arc<ScannerConfig>) -> Self {
        let posts = Arc::new(PostIndexer::new(api.clone(), db.clone(), config.clone()));
        Self {
            refresher: MetadataRefresher::new(api, db.clone(), config.clone()),
            rescan: RescanScheduler::new(posts.clone(), db.clone(), config.clone()),
            posts,
            db,
            config,
        }
    }

    /// Runs cycles until `shutdown` fires.
    pub async fn run(&self, shutdown: Shutdown) {
        loop {
            let report = self.run_cycle(&shutdown).await;
            if shutdown.is_triggered() {
                break;
            }

            let pause = self.pause_after(&report);
            let stopped = async {
                info!(pause = ?pause, "Sleeping");
                shutdown.sleep(pause).await
            }
            .instrument(info_span!("phase", name = Phase::Sleep.name()))
            .await;
            if stopped {
                break;
            }
        }
        info!("Scanner stopped");
    }

    /// Idle mode keeps refreshing without pause while there is refresh work.
    fn pause_after(&self, report: &CycleReport) -> Duration {
        if !report.config_loaded {
            self.config.idle_sleep
        } else if report.idle {
            if report.refresh.selected > 0 {
                Duration::ZERO
            } else {
                self.config.idle_sleep
            }
        } else {
            self.config.cycle_sleep
        }
    }

    /// Drives one cycle from `LoadConfig` until it reaches `Sleep`.
    pub async fn run_cycle(&self, shutdown: &Shutdown) -> CycleReport {
        let started_at = now();
        let clock = Instant::now();
        let mut report = CycleReport::default();
        let mut snapshot = ConfigSnapshot::default();
        let mut phase = Phase::LoadConfig;

        while phase != Phase::Sleep {
            if shutdown.is_triggered() {
                info!(phase = phase.name(), "Shutdown requested, ending cycle");
                break;
            }
            let span = info_span!("phase", name = phase.name());
            let next = self
                .step(phase, &mut snapshot, &mut report, shutdown)
                .instrument(span)
                .await;
            phase = next;
        }

        if report.config_loaded && !report.idle {
            let duration = clock.elapsed().as_secs() as i64;
            if let Err(e) = self
                .db
                .record_analytics(started_at, duration, report.new_mentions() as i64)
                .await
            {
                error!(error = ?e, "Failed to record analytics");
            }
        }

        report
    }

    async fn step(
        &self,
        phase: Phase,
        snapshot: &mut ConfigSnapshot,
        report: &mut CycleReport,
        shutdown: &Shutdown,
    ) -> Phase {
        match phase {
            Phase::LoadConfig => match ConfigSnapshot::load(&self.db.conn).await {
                Ok(loaded) => {
                    report.config_loaded = true;
                    report.targets = loaded.targets.len();
                    report.idle = loaded.is_idle();
                    *snapshot = loaded;
                    if report.idle {
                        info!("No active scan targets, entering idle mode");
                        Phase::Idle
                    } else {
                        Phase::ScanTargets
                    }
                }
                Err(e) => {
                    error!(error = ?e, "Failed to load config snapshot");
                    Phase::Sleep
                }
            },
            Phase::ScanTargets => {
                for target in &snapshot.targets {
                    if shutdown.is_triggered() {
                        break;
                    }
                    match self.posts.scan_target(target, snapshot, shutdown).await {
                        Ok(scanned) => report.scan.absorb(scanned),
                        Err(e) => {
                            error!(target = %target.name, error = ?e, "Target scan failed");
                            report.failed_targets += 1;
                        }
                    }
                }
                Phase::RefreshMetadata
            }
            Phase::RefreshMetadata => {
                report.refresh = self.refresh().await;
                Phase::RescanPosts
            }
            Phase::RescanPosts => {
                match self.rescan.run_pass(snapshot, shutdown).await {
                    Ok(rescanned) => report.rescan = rescanned,
                    Err(e) => error!(error = ?e, "Rescan pass failed"),
                }
                Phase::Sleep
            }
            Phase::Idle => {
                report.refresh = self.refresh().await;
                Phase::Sleep
            }
            Phase::Sleep => Phase::Sleep,
        }
    }

    async fn refresh(&self) -> RefreshReport {
        match self.refresher.run_pass().await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                error!(error = ?e, "Metadata refresh pass failed");
                RefreshReport::default()
            }
        }
    }
}

pub async fn run_until_ctrl_c(orchestrator: Orchestrator) -> Result<()> {
    let (tx, shutdown) = Shutdown::channel();
    let mut runner = tokio::spawn(async move { orchestrator.run(shutdown).await });

    tokio::select! {
        result = &mut runner => {
            error!("Scanner loop exited unexpectedly: {:?}", result);
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, finishing in-flight work");
        }
    }

    let _ = tx.send(true);
    runner.await?;
    Ok(())
}
