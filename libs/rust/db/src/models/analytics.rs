use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "analytics")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i32,
    pub total_subreddits: i64,
    pub total_posts: i64,
    pub total_comments: i64,
    pub total_mentions: i64,
    pub last_scan_started: Option<DateTime>,
    pub last_scan_duration_secs: Option<i64>,
    pub last_scan_new_mentions: Option<i64>,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
