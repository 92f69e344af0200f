use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A submission seen on a scan target. Never deleted.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "post")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique, indexed)]
    pub source_post_id: String,
    #[sea_orm(column_type = "Text")]
    pub title: String,
    #[sea_orm(column_type = "Text")]
    pub url: String,
    #[sea_orm(indexed)]
    pub created_at: DateTime,
    pub author: Option<String>,
    /// Subreddit the post was submitted to, lowercase.
    pub hosting_subreddit: String,
    /// Null until the comment tree has been walked once.
    #[sea_orm(indexed)]
    pub last_scanned: Option<DateTime>,
    #[sea_orm(default_value = 0)]
    pub unique_subreddit_count: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::comment::Entity")]
    Comment,
    #[sea_orm(has_many = "super::mention::Entity")]
    Mention,
}

impl Related<super::comment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Comment.def()
    }
}

impl Related<super::mention::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Mention.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
