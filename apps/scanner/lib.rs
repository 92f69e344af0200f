pub mod config;
pub mod db_handler;
pub mod error;
pub mod extractor;
pub mod indexers;
pub mod models;
pub mod orchestrator;
pub mod rate_limiter;
pub mod reddit_api;
pub mod shutdown;
pub mod snapshot;
