use crate::{
    extractor::Candidate,
    models::{about::AboutData, comments::CommentNode, listing::PostData, naive_from_epoch},
};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use sea_orm::{
    ActiveValue::NotSet, ColumnTrait, Condition, ConnectOptions, ConnectionTrait, Database,
    DatabaseConnection, DatabaseTransaction, EntityTrait, JoinType, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, RelationTrait, Set, SqlErr, TransactionTrait,
    sea_query::{Expr, Func, OnConflict, SimpleExpr},
};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use subindex_db::models::{analytics, comment, mention, post, subreddit};
use tracing::{debug, info, instrument, warn};
use utils::errors::{
    DATABASE_CONNECTION_FAILED, DATABASE_ERROR, DB_TRANSACTION_BEGIN_FAILED,
    DB_TRANSACTION_COMMIT_FAILED,
};

pub const MAX_RETRY_PRIORITY: i32 = 10;
const ANALYTICS_ROW_ID: i32 = 1;

/// Which refresh tier selected a subreddit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshTier {
    NeverChecked,
    MissingFields,
    Stale,
    NotFoundRecheck,
}

#[derive(Debug, Clone)]
pub struct RefreshWindows {
    pub missing_field_retry: Duration,
    pub staleness: Duration,
    pub not_found_recheck: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommentOutcome {
    pub new_mentions: u64,
    pub duplicates: u64,
}

pub struct DbHandler {
    pub conn: DatabaseConnection,
}

impl DbHandler {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let mut opt = ConnectOptions::new(database_url.to_string());
        opt.max_connections(10)
            .min_connections(1)
            .connect_timeout(Duration::from_secs(15))
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(5 * 60))
            .max_lifetime(Duration::from_secs(30 * 60))
            .sqlx_logging(false);

        let conn = Database::connect(opt)
            .await
            .context(DATABASE_CONNECTION_FAILED)?;
        Ok(Self { conn })
    }

    #[instrument(skip(self, data), fields(post_id = %data.id))]
    pub async fn get_or_create_post(&self, data: &PostData, base_url: &str) -> Result<post::Model> {
        if let Some(existing) = self.find_post(&data.id).await? {
            return Ok(existing);
        }

        let url = if data.permalink.is_empty() {
            data.url.clone().unwrap_or_default()
        } else {
            format!("{}{}", base_url, data.permalink)
        };

        let model = post::ActiveModel {
            id: NotSet,
            source_post_id: Set(data.id.clone()),
            title: Set(data.title.clone()),
            url: Set(url),
            created_at: Set(naive_from_epoch(data.created_utc).unwrap_or_else(now)),
            author: Set(crate::models::normalize_author(data.author.clone())),
            hosting_subreddit: Set(data.subreddit.to_lowercase()),
            last_scanned: Set(None),
            unique_subreddit_count: Set(0),
        };

        post::Entity::insert(model)
            .on_conflict(
                OnConflict::column(post::Column::SourcePostId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.conn)
            .await
            .with_context(|| format!("Failed to insert post {}", data.id))?;

        debug!("Post created");
        self.find_post(&data.id)
            .await?
            .with_context(|| format!("Post {} missing after insert", data.id))
    }

    pub async fn find_post(&self, source_post_id: &str) -> Result<Option<post::Model>> {
        post::Entity::find()
            .filter(post::Column::SourcePostId.eq(source_post_id))
            .one(&self.conn)
            .await
            .context(DATABASE_ERROR)
    }

    /// Stored body hashes for a post's comments, keyed by source comment id.
    pub async fn comment_hashes(&self, post_id: i32) -> Result<HashMap<String, String>> {
        let rows = comment::Entity::find()
            .filter(comment::Column::PostId.eq(post_id))
            .all(&self.conn)
            .await
            .context(DATABASE_ERROR)?;
        Ok(rows
            .into_iter()
            .map(|c| (c.source_comment_id, c.body_hash))
            .collect())
    }

    /// Stores one comment and its surviving mention candidates in a single transaction.
    #[instrument(skip_all, fields(post_id = post.id, comment_id = %node.id, candidates = candidates.len()))]
    pub async fn record_comment_mentions(
        &self,
        post: &post::Model,
        node: &CommentNode,
        body_hash: &str,
        candidates: &[Candidate<'_>],
    ) -> Result<CommentOutcome> {
        let txn = self
            .conn
            .begin()
            .await
            .context(DB_TRANSACTION_BEGIN_FAILED)?;

        let comment_id = upsert_comment(&txn, post.id, node, body_hash).await?;

        let mut outcome = CommentOutcome::default();
        for candidate in candidates {
            if insert_mention(&txn, post.id, comment_id, candidate).await? {
                outcome.new_mentions += 1;
            } else {
                outcome.duplicates += 1;
            }
        }

        txn.commit().await.context(DB_TRANSACTION_COMMIT_FAILED)?;
        Ok(outcome)
    }

    pub async fn mark_post_scanned(&self, post_id: i32, at: NaiveDateTime) -> Result<()> {
        post::Entity::update_many()
            .col_expr(post::Column::LastScanned, Expr::value(at))
            .filter(post::Column::Id.eq(post_id))
            .exec(&self.conn)
            .await
            .with_context(|| format!("Failed to mark post {post_id} scanned"))?;
        Ok(())
    }

    /// Never-scanned posts first, then oldest `last_scanned`, skipping posts
    /// scanned within `cooldown`.
    #[instrument(skip(self))]
    pub async fn select_rescan_batch(
        &self,
        now: NaiveDateTime,
        cooldown: Duration,
        limit: u64,
    ) -> Result<Vec<post::Model>> {
        let mut batch = post::Entity::find()
            .filter(post::Column::LastScanned.is_null())
            .order_by_asc(post::Column::Id)
            .limit(limit)
            .all(&self.conn)
            .await
            .context(DATABASE_ERROR)?;

        let remaining = limit.saturating_sub(batch.len() as u64);
        if remaining > 0 {
            let threshold = before(now, cooldown);
            let scanned = post::Entity::find()
                .filter(post::Column::LastScanned.is_not_null())
                .filter(post::Column::LastScanned.lte(threshold))
                .order_by_asc(post::Column::LastScanned)
                .order_by_asc(post::Column::Id)
                .limit(remaining)
                .all(&self.conn)
                .await
                .context(DATABASE_ERROR)?;
            batch.extend(scanned);
        }

        Ok(batch)
    }

    /// Fills one refresh batch in tier order. Subreddits still inside a
    /// rate-limit backoff are never returned.
    #[instrument(skip(self, windows))]
    pub async fn select_refresh_batch(
        &self,
        now: NaiveDateTime,
        windows: &RefreshWindows,
        limit: u64,
    ) -> Result<Vec<(RefreshTier, subreddit::Model)>> {
        let mut selected: Vec<(RefreshTier, subreddit::Model)> = Vec::new();
        let mut seen: HashSet<i32> = HashSet::new();

        for tier in [
            RefreshTier::NeverChecked,
            RefreshTier::MissingFields,
            RefreshTier::Stale,
            RefreshTier::NotFoundRecheck,
        ] {
            let remaining = limit.saturating_sub(selected.len() as u64);
            if remaining == 0 {
                break;
            }
            // Over-fetch by what is already selected so dedup cannot starve the tier.
            let rows = self
                .refresh_tier(tier, now, windows, remaining + seen.len() as u64)
                .await?;
            for row in rows {
                if selected.len() as u64 >= limit {
                    break;
                }
                if seen.insert(row.id) {
                    selected.push((tier, row));
                }
            }
        }

        Ok(selected)
    }

    async fn refresh_tier(
        &self,
        tier: RefreshTier,
        now: NaiveDateTime,
        windows: &RefreshWindows,
        limit: u64,
    ) -> Result<Vec<subreddit::Model>> {
        let eligible = Condition::any()
            .add(subreddit::Column::NextRetryAt.is_null())
            .add(subreddit::Column::NextRetryAt.lte(now));
        let query = subreddit::Entity::find().filter(eligible);

        let query = match tier {
            RefreshTier::NeverChecked => query
                .filter(subreddit::Column::LastChecked.is_null())
                .order_by_desc(subreddit::Column::RetryPriority)
                .order_by_asc(subreddit::Column::Id),
            RefreshTier::MissingFields => query
                .filter(subreddit::Column::LastChecked.lte(before(now, windows.missing_field_retry)))
                .filter(subreddit::Column::Found.eq(true))
                .filter(subreddit::Column::IsBanned.eq(false))
                .filter(
                    Condition::any()
                        .add(subreddit::Column::Title.is_null())
                        .add(subreddit::Column::SubscriberCount.is_null())
                        .add(subreddit::Column::CreatedAt.is_null()),
                )
                .order_by_desc(subreddit::Column::RetryPriority)
                .order_by_asc(subreddit::Column::LastChecked),
            RefreshTier::Stale => query
                .filter(subreddit::Column::LastChecked.lte(before(now, windows.staleness)))
                .filter(subreddit::Column::Found.eq(true))
                .join(JoinType::LeftJoin, subreddit::Relation::Mention.def())
                .group_by(subreddit::Column::Id)
                .order_by_desc(subreddit::Column::RetryPriority)
                .order_by_desc(SimpleExpr::from(Func::count(Expr::col((
                    mention::Entity,
                    mention::Column::Id,
                )))))
                .order_by_asc(subreddit::Column::Id),
            RefreshTier::NotFoundRecheck => query
                .filter(subreddit::Column::Found.eq(false))
                .filter(subreddit::Column::LastChecked.lte(before(now, windows.not_found_recheck)))
                .order_by_desc(subreddit::Column::RetryPriority)
                .order_by_asc(subreddit::Column::LastChecked),
        };

        query
            .limit(limit)
            .all(&self.conn)
            .await
            .with_context(|| format!("Failed to select {tier:?} subreddits"))
    }

    #[instrument(skip(self, data), fields(subreddit_id = id))]
    pub async fn apply_profile(&self, id: i32, data: &AboutData, at: NaiveDateTime) -> Result<()> {
        let model = subreddit::ActiveModel {
            title: Set(data.title.clone().filter(|t| !t.trim().is_empty())),
            description: Set(data.description()),
            subscriber_count: Set(data.subscribers),
            active_user_count: Set(data.active_users()),
            created_at: Set(data.created_utc.and_then(naive_from_epoch)),
            is_over18: Set(data.nsfw()),
            is_banned: Set(false),
            found: Set(true),
            last_checked: Set(Some(at)),
            next_retry_at: Set(None),
            retry_priority: Set(0),
            ..Default::default()
        };
        self.update_subreddit(id, model).await
    }

    pub async fn mark_not_found(&self, id: i32, at: NaiveDateTime) -> Result<()> {
        let model = subreddit::ActiveModel {
            found: Set(false),
            last_checked: Set(Some(at)),
            next_retry_at: Set(None),
            retry_priority: Set(0),
            ..Default::default()
        };
        self.update_subreddit(id, model).await
    }

    pub async fn mark_banned(&self, id: i32, at: NaiveDateTime) -> Result<()> {
        let model = subreddit::ActiveModel {
            is_banned: Set(true),
            found: Set(true),
            last_checked: Set(Some(at)),
            next_retry_at: Set(None),
            retry_priority: Set(0),
            ..Default::default()
        };
        self.update_subreddit(id, model).await
    }

    /// Pushes one subreddit past a 429 without touching `last_checked`.
    pub async fn defer_after_rate_limit(
        &self,
        current: &subreddit::Model,
        retry_after: Duration,
        at: NaiveDateTime,
    ) -> Result<()> {
        let model = subreddit::ActiveModel {
            next_retry_at: Set(Some(
                at.checked_add_signed(to_delta(retry_after))
                    .unwrap_or(NaiveDateTime::MAX),
            )),
            retry_priority: Set((current.retry_priority + 1).min(MAX_RETRY_PRIORITY)),
            ..Default::default()
        };
        self.update_subreddit(current.id, model).await
    }

    async fn update_subreddit(&self, id: i32, model: subreddit::ActiveModel) -> Result<()> {
        subreddit::Entity::update_many()
            .set(model)
            .filter(subreddit::Column::Id.eq(id))
            .exec(&self.conn)
            .await
            .with_context(|| format!("Failed to update subreddit {id}"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn record_analytics(
        &self,
        started: NaiveDateTime,
        duration_secs: i64,
        new_mentions: i64,
    ) -> Result<()> {
        let total_subreddits = subreddit::Entity::find().count(&self.conn).await? as i64;
        let total_posts = post::Entity::find().count(&self.conn).await? as i64;
        let total_comments = comment::Entity::find().count(&self.conn).await? as i64;
        let total_mentions = mention::Entity::find().count(&self.conn).await? as i64;

        let model = analytics::ActiveModel {
            id: Set(ANALYTICS_ROW_ID),
            total_subreddits: Set(total_subreddits),
            total_posts: Set(total_posts),
            total_comments: Set(total_comments),
            total_mentions: Set(total_mentions),
            last_scan_started: Set(Some(started)),
            last_scan_duration_secs: Set(Some(duration_secs)),
            last_scan_new_mentions: Set(Some(new_mentions)),
            updated_at: Set(now()),
        };

        analytics::Entity::insert(model)
            .on_conflict(
                OnConflict::column(analytics::Column::Id)
                    .update_columns([
                        analytics::Column::TotalSubreddits,
                        analytics::Column::TotalPosts,
                        analytics::Column::TotalComments,
                        analytics::Column::TotalMentions,
                        analytics::Column::LastScanStarted,
                        analytics::Column::LastScanDurationSecs,
                        analytics::Column::LastScanNewMentions,
                        analytics::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.conn)
            .await
            .context("Failed to record analytics")?;

        info!(
            total_subreddits,
            total_posts, total_comments, total_mentions, new_mentions, "Analytics updated"
        );
        Ok(())
    }
}

async fn upsert_comment(
    txn: &DatabaseTransaction,
    post_id: i32,
    node: &CommentNode,
    body_hash: &str,
) -> Result<i32> {
    let existing = comment::Entity::find()
        .filter(comment::Column::SourceCommentId.eq(node.id.as_str()))
        .one(txn)
        .await
        .context(DATABASE_ERROR)?;

    if let Some(existing) = existing {
        if existing.body_hash != body_hash {
            debug!(comment_id = %node.id, "Comment edited, updating body");
            comment::Entity::update_many()
                .col_expr(comment::Column::Body, Expr::value(node.body.clone()))
                .col_expr(comment::Column::BodyHash, Expr::value(body_hash))
                .filter(comment::Column::Id.eq(existing.id))
                .exec(txn)
                .await
                .context("Failed to update edited comment")?;
        }
        return Ok(existing.id);
    }

    let inserted = comment::Entity::insert(comment::ActiveModel {
        id: NotSet,
        source_comment_id: Set(node.id.clone()),
        post_id: Set(post_id),
        body: Set(node.body.clone()),
        body_hash: Set(body_hash.to_string()),
        created_at: Set(node.created_at),
        author: Set(node.author.clone()),
    })
    .exec(txn)
    .await
    .with_context(|| format!("Failed to insert comment {}", node.id))?;

    Ok(inserted.last_insert_id)
}

/// Returns whether a new Mention row was written.
async fn insert_mention(
    txn: &DatabaseTransaction,
    post_id: i32,
    comment_id: i32,
    candidate: &Candidate<'_>,
) -> Result<bool> {
    let subreddit = get_or_create_subreddit(txn, &candidate.subreddit).await?;

    let same_comment = mention::Entity::find()
        .filter(mention::Column::SubredditId.eq(subreddit.id))
        .filter(mention::Column::CommentId.eq(comment_id))
        .count(txn)
        .await
        .context(DATABASE_ERROR)?;
    if same_comment > 0 {
        return Ok(false);
    }

    if let Some(user) = candidate.user {
        let same_user = mention::Entity::find()
            .filter(mention::Column::SubredditId.eq(subreddit.id))
            .filter(mention::Column::MentioningUser.eq(user))
            .count(txn)
            .await
            .context(DATABASE_ERROR)?;
        if same_user > 0 {
            return Ok(false);
        }
    }

    let first_in_post = mention::Entity::find()
        .filter(mention::Column::SubredditId.eq(subreddit.id))
        .filter(mention::Column::PostId.eq(post_id))
        .count(txn)
        .await
        .context(DATABASE_ERROR)?
        == 0;

    let timestamp = candidate.comment.created_at;
    let row = mention::ActiveModel {
        id: NotSet,
        subreddit_id: Set(subreddit.id),
        comment_id: Set(comment_id),
        post_id: Set(post_id),
        timestamp: Set(timestamp),
        mentioning_user: Set(candidate.user.map(str::to_string)),
    };

    // A concurrent writer may have won the race since the checks above.
    let savepoint = txn.begin().await.context(DB_TRANSACTION_BEGIN_FAILED)?;
    match mention::Entity::insert(row).exec_without_returning(&savepoint).await {
        Ok(_) => savepoint.commit().await.context(DB_TRANSACTION_COMMIT_FAILED)?,
        Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
            warn!(subreddit = %candidate.subreddit, "Mention already recorded by another writer");
            savepoint.rollback().await.context(DATABASE_ERROR)?;
            return Ok(false);
        }
        Err(err) => return Err(err).context("Failed to insert mention"),
    }

    subreddit::Entity::update_many()
        .col_expr(subreddit::Column::FirstMentioned, Expr::value(timestamp))
        .filter(subreddit::Column::Id.eq(subreddit.id))
        .filter(
            Condition::any()
                .add(subreddit::Column::FirstMentioned.is_null())
                .add(subreddit::Column::FirstMentioned.gt(timestamp)),
        )
        .exec(txn)
        .await
        .context("Failed to update first_mentioned")?;

    if first_in_post {
        post::Entity::update_many()
            .col_expr(
                post::Column::UniqueSubredditCount,
                Expr::col(post::Column::UniqueSubredditCount).add(1),
            )
            .filter(post::Column::Id.eq(post_id))
            .exec(txn)
            .await
            .context("Failed to bump unique_subreddit_count")?;
    }

    Ok(true)
}

async fn get_or_create_subreddit<C>(conn: &C, name: &str) -> Result<subreddit::Model>
where
    C: ConnectionTrait,
{
    subreddit::Entity::insert(subreddit::ActiveModel {
        name: Set(name.to_string()),
        is_banned: Set(false),
        found: Set(true),
        retry_priority: Set(0),
        ..Default::default()
    })
    .on_conflict(
        OnConflict::column(subreddit::Column::Name)
            .do_nothing()
            .to_owned(),
    )
    .exec_without_returning(conn)
    .await
    .with_context(|| format!("Failed to insert subreddit {name}"))?;

    subreddit::Entity::find()
        .filter(subreddit::Column::Name.eq(name))
        .one(conn)
        .await
        .context(DATABASE_ERROR)?
        .with_context(|| format!("Subreddit {name} missing after insert"))
}

pub fn now() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

pub fn to_delta(duration: Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(duration).unwrap_or(chrono::TimeDelta::MAX)
}

/// `now - window`, saturating at the earliest representable instant.
pub fn before(now: NaiveDateTime, window: Duration) -> NaiveDateTime {
    now.checked_sub_signed(to_delta(window))
        .unwrap_or(NaiveDateTime::MIN)
}

pub fn body_hash(body: &str) -> String {
    blake3::hash(body.as_bytes()).to_hex().to_string()
}
