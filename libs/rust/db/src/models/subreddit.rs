use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A mentioned subreddit and its public profile.
///
/// Profile fields are `None` until a successful profile fetch supplies them.
/// `last_checked` tells "never profiled" (`None`) apart from "profiled but the
/// field came back absent" (`Some(_)` with the field still `None`).
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "subreddit")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// Lowercase canonical name.
    #[sea_orm(unique, indexed)]
    pub name: String,
    pub title: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,
    pub subscriber_count: Option<i64>,
    pub active_user_count: Option<i64>,
    pub created_at: Option<DateTime>,
    pub first_mentioned: Option<DateTime>,
    #[sea_orm(indexed)]
    pub last_checked: Option<DateTime>,
    #[sea_orm(default_value = false)]
    pub is_banned: bool,
    /// Flipped to false once the profile endpoint reports the subreddit missing.
    #[sea_orm(default_value = true)]
    pub found: bool,
    pub is_over18: Option<bool>,
    pub next_retry_at: Option<DateTime>,
    #[sea_orm(default_value = 0)]
    pub retry_priority: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::mention::Entity")]
    Mention,
}

impl Related<super::mention::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Mention.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
