use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Operator-managed list of sources to poll.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "subreddit_scan_config")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// Subreddit name, or `u/<account>` for an account's submissions.
    #[sea_orm(unique, indexed)]
    pub subreddit_name: String,
    /// Comma-separated usernames; null or empty admits every author.
    #[sea_orm(column_type = "Text", nullable)]
    pub allowed_users: Option<String>,
    #[sea_orm(default_value = false)]
    pub nsfw_only: bool,
    #[sea_orm(default_value = true)]
    pub active: bool,
    /// Ascending: 1 is scanned first.
    #[sea_orm(default_value = 3)]
    pub priority: i32,
    /// Comma-separated title keywords; null or empty admits every title.
    #[sea_orm(column_type = "Text", nullable)]
    pub keywords: Option<String>,
    pub created_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
