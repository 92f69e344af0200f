//! Table bootstrap for tests and fresh deployments.
//!
//! Production schema changes go through the migration tooling; this only
//! creates what is missing so a blank database can be scanned into.

use crate::models::{
    analytics, comment, ignored_subreddit, ignored_user, mention, post, rate_limit_state,
    scan_target, subreddit,
};
use sea_orm::{
    ConnectionTrait, DbErr, EntityTrait, Schema,
    sea_query::{Index, IndexCreateStatement},
};

pub const UQ_MENTION_SUBREDDIT_COMMENT: &str = "uq_mention_sub_comment";
pub const UQ_MENTION_SUBREDDIT_USER: &str = "uq_mention_sub_user";

pub async fn create_all<C>(db: &C) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    create_table(db, subreddit::Entity).await?;
    create_table(db, post::Entity).await?;
    create_table(db, comment::Entity).await?;
    create_table(db, mention::Entity).await?;
    create_table(db, scan_target::Entity).await?;
    create_table(db, ignored_subreddit::Entity).await?;
    create_table(db, ignored_user::Entity).await?;
    create_table(db, rate_limit_state::Entity).await?;
    create_table(db, analytics::Entity).await?;

    for index in mention_indexes() {
        db.execute(db.get_database_backend().build(&index)).await?;
    }

    Ok(())
}

async fn create_table<C, E>(db: &C, entity: E) -> Result<(), DbErr>
where
    C: ConnectionTrait,
    E: EntityTrait,
{
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let mut statement = schema.create_table_from_entity(entity);
    statement.if_not_exists();
    db.execute(backend.build(&statement)).await?;
    Ok(())
}

/// The two dedup invariants on mentions, enforced by the store as well as by the scanner.
fn mention_indexes() -> Vec<IndexCreateStatement> {
    vec![
        Index::create()
            .name(UQ_MENTION_SUBREDDIT_COMMENT)
            .table(mention::Entity)
            .col(mention::Column::SubredditId)
            .col(mention::Column::CommentId)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name(UQ_MENTION_SUBREDDIT_USER)
            .table(mention::Entity)
            .col(mention::Column::SubredditId)
            .col(mention::Column::MentioningUser)
            .unique()
            .if_not_exists()
            .to_owned(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{ActiveValue::Set, ConnectOptions, Database, EntityTrait};

    #[tokio::test]
    async fn create_all_is_idempotent_and_enforces_mention_uniqueness() {
        let mut opt = ConnectOptions::new("sqlite::memory:");
        opt.max_connections(1).sqlx_logging(false);
        let db = Database::connect(opt).await.unwrap();
        create_all(&db).await.unwrap();
        create_all(&db).await.unwrap();

        let now = chrono_now();
        subreddit::Entity::insert(subreddit::ActiveModel {
            name: Set("catpics".to_string()),
            is_banned: Set(false),
            found: Set(true),
            retry_priority: Set(0),
            ..Default::default()
        })
        .exec(&db)
        .await
        .unwrap();
        post::Entity::insert(post::ActiveModel {
            source_post_id: Set("p1".to_string()),
            title: Set("t".to_string()),
            url: Set("/r/x/comments/p1".to_string()),
            created_at: Set(now),
            hosting_subreddit: Set("x".to_string()),
            unique_subreddit_count: Set(0),
            ..Default::default()
        })
        .exec(&db)
        .await
        .unwrap();
        for source_id in ["c1", "c2"] {
            comment::Entity::insert(comment::ActiveModel {
                source_comment_id: Set(source_id.to_string()),
                post_id: Set(1),
                body: Set("r/catpics".to_string()),
                body_hash: Set(String::new()),
                created_at: Set(now),
                author: Set(Some("alice".to_string())),
                ..Default::default()
            })
            .exec(&db)
            .await
            .unwrap();
        }

        let new_mention = |comment_id: i32| mention::ActiveModel {
            subreddit_id: Set(1),
            comment_id: Set(comment_id),
            post_id: Set(1),
            timestamp: Set(now),
            mentioning_user: Set(Some("alice".to_string())),
            ..Default::default()
        };
        mention::Entity::insert(new_mention(1)).exec(&db).await.unwrap();

        let same_comment = mention::Entity::insert(new_mention(1)).exec(&db).await;
        assert!(same_comment.is_err());
        let same_user = mention::Entity::insert(new_mention(2)).exec(&db).await;
        assert!(same_user.is_err());
    }

    fn chrono_now() -> sea_orm::prelude::DateTime {
        sea_orm::prelude::DateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S")
            .unwrap()
    }
}
