use crate::models::listing::PostData;
use anyhow::{Context, Result};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder};
use std::collections::HashSet;
use subindex_db::models::{ignored_subreddit, ignored_user, scan_target};
use tracing::{info, instrument, warn};
use utils::errors::CONFIG_SNAPSHOT_LOAD_FAILED;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSource {
    Subreddit(String),
    /// An account's submission history, configured as `u/<name>` or `user/<name>`.
    User(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedUsers {
    All,
    Only(HashSet<String>),
}

#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub name: String,
    pub source: TargetSource,
    pub allowed_users: AllowedUsers,
    pub nsfw_only: bool,
    pub priority: i32,
    /// Lowercase title keywords; empty admits every title.
    pub keywords: Vec<String>,
}

/// Scan configuration frozen for the duration of one cycle.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    /// Priority ascending.
    pub targets: Vec<ScanTarget>,
    pub ignored_subreddits: HashSet<String>,
    pub ignored_users: HashSet<String>,
}

impl ConfigSnapshot {
    #[instrument(skip(conn))]
    pub async fn load<C>(conn: &C) -> Result<Self>
    where
        C: ConnectionTrait,
    {
        let rows = scan_target::Entity::find()
            .filter(scan_target::Column::Active.eq(true))
            .order_by_asc(scan_target::Column::Priority)
            .order_by_asc(scan_target::Column::SubredditName)
            .all(conn)
            .await
            .context(CONFIG_SNAPSHOT_LOAD_FAILED)?;

        let targets: Vec<ScanTarget> = rows
            .into_iter()
            .filter_map(|row| {
                let target = ScanTarget::from_model(&row);
                if target.is_none() {
                    warn!(id = row.id, name = %row.subreddit_name, "Skipping unusable scan target");
                }
                target
            })
            .collect();

        let ignored_subreddits = ignored_subreddit::Entity::find()
            .filter(ignored_subreddit::Column::Active.eq(true))
            .all(conn)
            .await
            .context(CONFIG_SNAPSHOT_LOAD_FAILED)?
            .into_iter()
            .map(|row| normalize_name(&row.subreddit_name))
            .filter(|name| !name.is_empty())
            .collect();

        let ignored_users = ignored_user::Entity::find()
            .filter(ignored_user::Column::Active.eq(true))
            .all(conn)
            .await
            .context(CONFIG_SNAPSHOT_LOAD_FAILED)?
            .into_iter()
            .map(|row| normalize_name(&row.username))
            .filter(|name| !name.is_empty())
            .collect();

        let snapshot = Self {
            targets,
            ignored_subreddits,
            ignored_users,
        };

        info!(
            targets = snapshot.targets.len(),
            ignored_subreddits = snapshot.ignored_subreddits.len(),
            ignored_users = snapshot.ignored_users.len(),
            "Loaded config snapshot"
        );

        Ok(snapshot)
    }

    pub fn is_idle(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn is_ignored_subreddit(&self, name: &str) -> bool {
        self.ignored_subreddits.contains(name)
    }

    pub fn is_ignored_user(&self, user: &str) -> bool {
        self.ignored_users.contains(&user.to_lowercase())
    }
}

impl ScanTarget {
    pub fn from_model(row: &scan_target::Model) -> Option<Self> {
        let source = parse_source(&row.subreddit_name)?;

        let allowed_users = match row.allowed_users.as_deref().map(str::trim) {
            None | Some("") => AllowedUsers::All,
            Some(raw) if raw.eq_ignore_ascii_case("all") => AllowedUsers::All,
            Some(raw) => {
                let users: HashSet<String> = split_list(raw).map(|u| normalize_name(&u)).collect();
                if users.is_empty() {
                    AllowedUsers::All
                } else {
                    AllowedUsers::Only(users)
                }
            }
        };

        let keywords = row
            .keywords
            .as_deref()
            .map(|raw| split_list(raw).collect())
            .unwrap_or_default();

        Some(Self {
            name: row.subreddit_name.clone(),
            source,
            allowed_users,
            nsfw_only: row.nsfw_only,
            priority: row.priority,
            keywords,
        })
    }

    /// Applies the target's post filters.
    pub fn admits(&self, post: &PostData) -> bool {
        if self.nsfw_only && !post.over_18 {
            return false;
        }

        if let AllowedUsers::Only(users) = &self.allowed_users {
            let author = post.author.as_deref().map(str::to_lowercase);
            if !author.is_some_and(|a| users.contains(&a)) {
                return false;
            }
        }

        if !self.keywords.is_empty() {
            let title = post.title.to_lowercase();
            if !self.keywords.iter().any(|k| title.contains(k.as_str())) {
                return false;
            }
        }

        true
    }
}

fn parse_source(raw: &str) -> Option<TargetSource> {
    let name = raw.trim().trim_start_matches('/').to_lowercase();
    let source = if let Some(user) = name.strip_prefix("u/").or_else(|| name.strip_prefix("user/")) {
        TargetSource::User(user.trim_matches('/').to_string())
    } else {
        TargetSource::Subreddit(name.strip_prefix("r/").unwrap_or(&name).trim_matches('/').to_string())
    };

    let valid = match &source {
        TargetSource::Subreddit(n) | TargetSource::User(n) => is_valid_name(n),
    };
    valid.then_some(source)
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn normalize_name(raw: &str) -> String {
    let name = raw.trim().trim_start_matches('/').to_lowercase();
    ["r/", "u/", "user/"]
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .unwrap_or(&name)
        .to_string()
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(|part| part.trim().to_lowercase())
        .filter(|part| !part.is_empty())
}
