use anyhow::{Context, Result};
use dotenv::dotenv;
use scanner::{
    config::ScannerConfig,
    db_handler::DbHandler,
    orchestrator::{Orchestrator, run_until_ctrl_c},
    rate_limiter::RateLimiter,
    reddit_api::RedditApi,
};
use std::sync::Arc;
use tracing::info;
use utils::{errors::SCHEMA_BOOTSTRAP_FAILED, tracing::setup_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    setup_tracing();

    let config = Arc::new(ScannerConfig::from_env()?);
    let db = Arc::new(DbHandler::connect(&config.database_url).await?);

    if config.bootstrap_schema {
        subindex_db::schema::create_all(&db.conn)
            .await
            .context(SCHEMA_BOOTSTRAP_FAILED)?;
        info!("Database schema ensured");
    }

    let limiter = RateLimiter::for_backend(
        config.rate_limit_backend,
        &db.conn,
        config.rate_limit_interval,
        config.acquire_timeout,
    );
    let api = Arc::new(RedditApi::new(&config, limiter)?);

    info!("Starting scanner");
    run_until_ctrl_c(Orchestrator::new(db, api, config)).await
}
