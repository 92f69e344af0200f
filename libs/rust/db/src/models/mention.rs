use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One credited reference to a subreddit.
///
/// Unique on `(subreddit_id, comment_id)` and on `(subreddit_id, mentioning_user)`;
/// both indexes are created by [`crate::schema::create_all`].
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "mention")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(indexed)]
    pub subreddit_id: i32,
    pub comment_id: i32,
    #[sea_orm(indexed)]
    pub post_id: i32,
    #[sea_orm(indexed)]
    pub timestamp: DateTime,
    /// `None` for deleted or anonymous authors.
    pub mentioning_user: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::subreddit::Entity",
        from = "Column::SubredditId",
        to = "super::subreddit::Column::Id"
    )]
    Subreddit,
    #[sea_orm(
        belongs_to = "super::comment::Entity",
        from = "Column::CommentId",
        to = "super::comment::Column::Id",
        on_delete = "Cascade"
    )]
    Comment,
    #[sea_orm(
        belongs_to = "super::post::Entity",
        from = "Column::PostId",
        to = "super::post::Column::Id",
        on_delete = "Cascade"
    )]
    Post,
}

impl Related<super::subreddit::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subreddit.def()
    }
}

impl Related<super::comment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Comment.def()
    }
}

impl Related<super::post::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Post.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
