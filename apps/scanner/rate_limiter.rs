//! One outbound request budget for every phase, task and worker process.
//!
//! A caller reserves the earliest slot that is at least `interval` after the
//! previous grant, records it in the store, then sleeps until the slot. With
//! the database store the "previous grant" is a shared row, so concurrent
//! workers reserve distinct slots instead of bursting.

use crate::{config::RateLimitBackend, error::RateLimitError};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, sea_query::OnConflict,
};
use std::{sync::Arc, time::Duration};
use subindex_db::models::rate_limit_state;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

pub const DEFAULT_LIMITER_KEY: &str = "reddit";

/// Persistence for the last granted slot.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically reserves `max(now_ms, last + interval_ms)` and returns it.
    async fn reserve(&self, now_ms: i64, interval_ms: i64) -> Result<i64, RateLimitError>;
}

#[derive(Default)]
pub struct MemoryStore {
    last_granted: Mutex<Option<i64>>,
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn reserve(&self, now_ms: i64, interval_ms: i64) -> Result<i64, RateLimitError> {
        let mut last = self.last_granted.lock().await;
        let slot = next_slot(*last, now_ms, interval_ms);
        *last = Some(slot);
        Ok(slot)
    }
}

/// Keeps the last grant in `rate_limit_state`, updated by compare-and-swap.
pub struct DatabaseStore {
    conn: DatabaseConnection,
    key: String,
}

impl DatabaseStore {
    pub fn new(conn: DatabaseConnection, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }
}

#[async_trait]
impl RateLimitStore for DatabaseStore {
    async fn reserve(&self, now_ms: i64, interval_ms: i64) -> Result<i64, RateLimitError> {
        loop {
            let current = rate_limit_state::Entity::find_by_id(self.key.clone())
                .one(&self.conn)
                .await?;

            match current {
                None => {
                    let inserted = rate_limit_state::Entity::insert(rate_limit_state::ActiveModel {
                        key: Set(self.key.clone()),
                        last_granted_at: Set(now_ms),
                    })
                    .on_conflict(
                        OnConflict::column(rate_limit_state::Column::Key)
                            .do_nothing()
                            .to_owned(),
                    )
                    .exec_without_returning(&self.conn)
                    .await?;

                    if inserted == 1 {
                        return Ok(now_ms);
                    }
                }
                Some(row) => {
                    let slot = next_slot(Some(row.last_granted_at), now_ms, interval_ms);
                    let swapped = rate_limit_state::Entity::update_many()
                        .col_expr(
                            rate_limit_state::Column::LastGrantedAt,
                            sea_orm::sea_query::Expr::value(slot),
                        )
                        .filter(rate_limit_state::Column::Key.eq(self.key.clone()))
                        .filter(rate_limit_state::Column::LastGrantedAt.eq(row.last_granted_at))
                        .exec(&self.conn)
                        .await?;

                    if swapped.rows_affected == 1 {
                        return Ok(slot);
                    }
                }
            }

            debug!(key = %self.key, "Lost rate limit slot race, retrying");
            tokio::task::yield_now().await;
        }
    }
}

fn next_slot(last: Option<i64>, now_ms: i64, interval_ms: i64) -> i64 {
    match last {
        Some(last) => now_ms.max(last.saturating_add(interval_ms)),
        None => now_ms,
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    interval: Duration,
    acquire_timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, interval: Duration, acquire_timeout: Duration) -> Self {
        Self {
            store,
            interval,
            acquire_timeout,
        }
    }

    pub fn in_memory(interval: Duration, acquire_timeout: Duration) -> Self {
        Self::new(Arc::new(MemoryStore::default()), interval, acquire_timeout)
    }

    pub fn for_backend(
        backend: RateLimitBackend,
        conn: &DatabaseConnection,
        interval: Duration,
        acquire_timeout: Duration,
    ) -> Self {
        match backend {
            RateLimitBackend::Database => Self::new(
                Arc::new(DatabaseStore::new(conn.clone(), DEFAULT_LIMITER_KEY)),
                interval,
                acquire_timeout,
            ),
            RateLimitBackend::Memory => Self::in_memory(interval, acquire_timeout),
        }
    }

    /// Blocks until this caller's slot arrives.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<(), RateLimitError> {
        tokio::time::timeout(self.acquire_timeout, self.wait_for_slot())
            .await
            .map_err(|_| RateLimitError::AcquireTimeout(self.acquire_timeout))?
    }

    async fn wait_for_slot(&self) -> Result<(), RateLimitError> {
        let now_ms = Utc::now().timestamp_millis();
        let interval_ms = i64::try_from(self.interval.as_millis()).unwrap_or(i64::MAX);
        let slot = self.store.reserve(now_ms, interval_ms).await?;

        let wait_ms = slot - now_ms;
        if wait_ms > 0 {
            debug!(wait_ms, "Waiting for rate limit slot");
            tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;
        }
        Ok(())
    }
}
