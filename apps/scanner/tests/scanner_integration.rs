use chrono::{NaiveDateTime, TimeDelta, Utc};
use mockito::{Matcher, Mock, Server, ServerGuard};
use scanner::{
    config::{RateLimitBackend, ScannerConfig},
    db_handler::{DbHandler, RefreshTier, RefreshWindows},
    indexers::{metadata::MetadataRefresher, posts::PostIndexer, rescan::RescanScheduler},
    orchestrator::Orchestrator,
    rate_limiter::RateLimiter,
    reddit_api::RedditApi,
    shutdown::Shutdown,
    snapshot::ConfigSnapshot,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, Database, EntityTrait, PaginatorTrait,
    QueryFilter, Set,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use subindex_db::models::{analytics, ignored_user, mention, post, scan_target, subreddit};

struct Harness {
    server: ServerGuard,
    db: Arc<DbHandler>,
    api: Arc<RedditApi>,
    config: Arc<ScannerConfig>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    async fn with_config(tweak: impl FnOnce(&mut ScannerConfig)) -> Self {
        let server = Server::new_async().await;

        let mut opt = ConnectOptions::new("sqlite::memory:");
        opt.max_connections(1).sqlx_logging(false);
        let conn = Database::connect(opt).await.unwrap();
        subindex_db::schema::create_all(&conn).await.unwrap();

        let mut config = ScannerConfig {
            base_url: server.url(),
            rate_limit_interval: Duration::ZERO,
            rate_limit_backend: RateLimitBackend::Memory,
            max_transient_retries: 0,
            ..ScannerConfig::default()
        };
        tweak(&mut config);
        let config = Arc::new(config);

        let limiter = RateLimiter::in_memory(config.rate_limit_interval, config.acquire_timeout);
        let api = Arc::new(RedditApi::new(&config, limiter).unwrap());

        Self {
            server,
            db: Arc::new(DbHandler::new(conn)),
            api,
            config,
        }
    }

    fn posts(&self) -> PostIndexer {
        PostIndexer::new(self.api.clone(), self.db.clone(), self.config.clone())
    }

    fn refresher(&self) -> MetadataRefresher {
        MetadataRefresher::new(self.api.clone(), self.db.clone(), self.config.clone())
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.db.clone(), self.api.clone(), self.config.clone())
    }

    async fn add_target(&self, name: &str) {
        scan_target::ActiveModel {
            subreddit_name: Set(name.to_string()),
            allowed_users: Set(None),
            nsfw_only: Set(false),
            active: Set(true),
            priority: Set(3),
            keywords: Set(None),
            created_at: Set(now()),
            ..Default::default()
        }
        .insert(&self.db.conn)
        .await
        .unwrap();
    }

    async fn mock_json(&mut self, path: &str, body: serde_json::Value, hits: usize) -> Mock {
        self.server
            .mock("GET", path)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .expect(hits)
            .create_async()
            .await
    }

    async fn add_post(&self, id: &str, scanned_hours_ago: i64) {
        post::ActiveModel {
            source_post_id: Set(id.into()),
            title: Set(id.into()),
            url: Set(format!("/comments/{id}")),
            created_at: Set(now() - TimeDelta::days(3)),
            author: Set(None),
            hosting_subreddit: Set("exampletest".into()),
            last_scanned: Set(Some(now() - TimeDelta::hours(scanned_hours_ago))),
            unique_subreddit_count: Set(0),
            ..Default::default()
        }
        .insert(&self.db.conn)
        .await
        .unwrap();
    }

    async fn mention_count(&self) -> u64 {
        mention::Entity::find().count(&self.db.conn).await.unwrap()
    }

    async fn subreddit(&self, name: &str) -> Option<subreddit::Model> {
        subreddit::Entity::find()
            .filter(subreddit::Column::Name.eq(name))
            .one(&self.db.conn)
            .await
            .unwrap()
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn listing(subreddit: &str, post_ids: &[&str]) -> serde_json::Value {
    listing_page(subreddit, post_ids, None)
}

fn listing_page(subreddit: &str, post_ids: &[&str], after: Option<&str>) -> serde_json::Value {
    let created = Utc::now().timestamp() as f64 - 3600.0;
    let children: Vec<_> = post_ids
        .iter()
        .map(|id| {
            json!({"kind": "t3", "data": {
                "id": id,
                "title": format!("post {id}"),
                "permalink": format!("/r/{subreddit}/comments/{id}/post/"),
                "created_utc": created,
                "author": "op",
                "subreddit": subreddit,
                "over_18": false
            }})
        })
        .collect();
    json!({"kind": "Listing", "data": {"after": after, "children": children}})
}

fn comment_tree(comments: &[(&str, &str, &str)]) -> serde_json::Value {
    let created = Utc::now().timestamp() as f64 - 600.0;
    let children: Vec<_> = comments
        .iter()
        .map(|(id, author, body)| {
            json!({"kind": "t1", "data": {
                "id": id, "author": author, "body": body,
                "created_utc": created, "replies": ""
            }})
        })
        .collect();
    json!([
        {"kind": "Listing", "data": {"children": []}},
        {"kind": "Listing", "data": {"children": children}}
    ])
}

fn about(name: &str) -> serde_json::Value {
    json!({"kind": "t5", "data": {
        "display_name": name,
        "title": format!("{name} title"),
        "public_description": "pictures",
        "subscribers": 4200,
        "accounts_active": 12,
        "created_utc": 1_300_000_000.0,
        "over18": false
    }})
}

fn windows(config: &ScannerConfig) -> RefreshWindows {
    RefreshWindows {
        missing_field_retry: config.missing_field_retry,
        staleness: config.metadata_staleness,
        not_found_recheck: config.not_found_recheck,
    }
}

#[tokio::test]
async fn scan_records_mention_and_queues_new_subreddit_for_profiling() {
    let mut h = Harness::new().await;
    h.add_target("exampletest").await;
    ignored_user::ActiveModel {
        username: Set("AutoModerator".into()),
        active: Set(true),
        created_at: Set(now()),
        ..Default::default()
    }
    .insert(&h.db.conn)
    .await
    .unwrap();

    let _listing = h
        .mock_json("/r/exampletest/new.json", listing("exampletest", &["abc123"]), 1)
        .await;
    let _comments = h
        .mock_json(
            "/comments/abc123.json",
            comment_tree(&[
                ("c1", "alice", "try /r/catpics"),
                ("c2", "AutoModerator", "see r/dogpics"),
            ]),
            1,
        )
        .await;

    let snapshot = ConfigSnapshot::load(&h.db.conn).await.unwrap();
    let (_tx, shutdown) = Shutdown::channel();
    let report = h
        .posts()
        .scan_target(&snapshot.targets[0], &snapshot, &shutdown)
        .await
        .unwrap();
    assert_eq!(report.walked, 1);
    assert_eq!(report.new_mentions, 1);

    let catpics = h.subreddit("catpics").await.unwrap();
    assert_eq!(catpics.last_checked, None);
    assert!(h.subreddit("dogpics").await.is_none());

    let mentions = mention::Entity::find().all(&h.db.conn).await.unwrap();
    assert_eq!(mentions.len(), 1);
    assert_eq!(mentions[0].subreddit_id, catpics.id);
    assert_eq!(mentions[0].mentioning_user.as_deref(), Some("alice"));
    assert_eq!(catpics.first_mentioned, Some(mentions[0].timestamp));

    let post = h.db.find_post("abc123").await.unwrap().unwrap();
    assert_eq!(mentions[0].post_id, post.id);
    assert!(post.last_scanned.is_some());
    assert_eq!(post.unique_subreddit_count, 1);

    let queue = h
        .db
        .select_refresh_batch(now(), &windows(&h.config), 10)
        .await
        .unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].0, RefreshTier::NeverChecked);
    assert_eq!(queue[0].1.name, "catpics");
}

#[tokio::test]
async fn repeated_cycles_against_unchanged_upstream_add_nothing() {
    let mut h = Harness::new().await;
    h.add_target("exampletest").await;
    let _listing = h
        .mock_json("/r/exampletest/new.json", listing("exampletest", &["abc123"]), 2)
        .await;
    let comments = h
        .mock_json(
            "/comments/abc123.json",
            comment_tree(&[
                ("c1", "alice", "try /r/catpics and r/dogpics"),
                ("c2", "alice", "r/catpics again"),
                ("c3", "bob", "/r/CatPics"),
            ]),
            1,
        )
        .await;
    let catpics_about = h.mock_json("/r/catpics/about.json", about("catpics"), 1).await;
    let _dogpics_about = h.mock_json("/r/dogpics/about.json", about("dogpics"), 1).await;

    let orchestrator = h.orchestrator();
    let (_tx, shutdown) = Shutdown::channel();

    let first = orchestrator.run_cycle(&shutdown).await;
    assert!(!first.idle);
    assert_eq!(first.new_mentions(), 3);
    assert_eq!(first.refresh.updated, 2);
    assert_eq!(h.mention_count().await, 3);

    let catpics = h.subreddit("catpics").await.unwrap();
    assert_eq!(catpics.title.as_deref(), Some("catpics title"));
    assert_eq!(catpics.subscriber_count, Some(4200));
    assert_eq!(catpics.active_user_count, Some(12));
    assert!(catpics.last_checked.is_some());

    // The post was just scanned, so the listing re-walk is skipped by the cooldown.
    let second = orchestrator.run_cycle(&shutdown).await;
    assert_eq!(second.new_mentions(), 0);
    assert_eq!(second.refresh.selected, 0);
    assert_eq!(h.mention_count().await, 3);
    comments.assert_async().await;
    catpics_about.assert_async().await;

    // Forcing a re-walk still finds nothing new.
    let post = h.db.find_post("abc123").await.unwrap().unwrap();
    let snapshot = ConfigSnapshot::load(&h.db.conn).await.unwrap();
    let outcome = h.posts().walk_post(&post, &snapshot).await.unwrap();
    assert_eq!(outcome.new_mentions, 0);
    assert_eq!(h.mention_count().await, 3);

    let stats = analytics::Entity::find_by_id(1).one(&h.db.conn).await.unwrap().unwrap();
    assert_eq!(stats.total_mentions, 3);
    assert_eq!(stats.last_scan_new_mentions, Some(0));
}

#[tokio::test]
async fn rate_limited_profile_is_deferred_and_not_refetched_early() {
    let mut h = Harness::new().await;
    subreddit::ActiveModel {
        name: Set("catpics".into()),
        is_banned: Set(false),
        found: Set(true),
        retry_priority: Set(0),
        ..Default::default()
    }
    .insert(&h.db.conn)
    .await
    .unwrap();

    let limited = h
        .server
        .mock("GET", "/r/catpics/about.json")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_header("retry-after", "3600")
        .expect(1)
        .create_async()
        .await;

    let report = h.refresher().run_pass().await.unwrap();
    assert_eq!(report.rate_limited, 1);

    let catpics = h.subreddit("catpics").await.unwrap();
    assert_eq!(catpics.retry_priority, 1);
    assert_eq!(catpics.last_checked, None);
    let retry_at = catpics.next_retry_at.unwrap();
    assert!(retry_at > now() + TimeDelta::minutes(55));

    // Still inside the backoff window: not selected, no request issued.
    let report = h.refresher().run_pass().await.unwrap();
    assert_eq!(report.selected, 0);
    limited.assert_async().await;
}

#[tokio::test]
async fn missing_and_banned_subreddits_are_flagged() {
    let mut h = Harness::new().await;
    for name in ["gone", "banned"] {
        subreddit::ActiveModel {
            name: Set(name.into()),
            is_banned: Set(false),
            found: Set(true),
            retry_priority: Set(0),
            ..Default::default()
        }
        .insert(&h.db.conn)
        .await
        .unwrap();
    }
    let _gone = h
        .server
        .mock("GET", "/r/gone/about.json")
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body(r#"{"message":"Not Found","error":404}"#)
        .create_async()
        .await;
    let _banned = h
        .server
        .mock("GET", "/r/banned/about.json")
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body(r#"{"reason":"banned","message":"Not Found","error":404}"#)
        .create_async()
        .await;

    let report = h.refresher().run_pass().await.unwrap();
    assert_eq!((report.not_found, report.banned), (1, 1));

    let gone = h.subreddit("gone").await.unwrap();
    assert!(!gone.found);
    assert!(gone.last_checked.is_some());
    let banned = h.subreddit("banned").await.unwrap();
    assert!(banned.is_banned);
}

#[tokio::test]
async fn rescan_visits_oldest_posts_first() {
    let mut h = Harness::with_config(|c| c.rescan_batch_size = 1).await;
    for (id, scanned_hours_ago) in [("newer", 5), ("oldest", 40), ("middle", 20)] {
        h.add_post(id, scanned_hours_ago).await;
    }

    let oldest = h.mock_json("/comments/oldest.json", comment_tree(&[]), 1).await;
    let middle = h.mock_json("/comments/middle.json", comment_tree(&[]), 1).await;
    let newer = h.mock_json("/comments/newer.json", comment_tree(&[]), 0).await;

    let scheduler = RescanScheduler::new(Arc::new(h.posts()), h.db.clone(), h.config.clone());
    let snapshot = ConfigSnapshot::default();
    let (_tx, shutdown) = Shutdown::channel();

    scheduler.run_pass(&snapshot, &shutdown).await.unwrap();
    oldest.assert_async().await;

    scheduler.run_pass(&snapshot, &shutdown).await.unwrap();
    middle.assert_async().await;
    newer.assert_async().await;
}

#[tokio::test]
async fn account_targets_poll_submissions() {
    let mut h = Harness::new().await;
    h.add_target("u/poster").await;
    let submitted = h
        .mock_json("/user/poster/submitted.json", listing("somewhere", &["p9"]), 1)
        .await;
    let _comments = h
        .mock_json(
            "/comments/p9.json",
            comment_tree(&[("c1", "carol", "r/somewhere and r/elsewhere")]),
            1,
        )
        .await;

    let snapshot = ConfigSnapshot::load(&h.db.conn).await.unwrap();
    let (_tx, shutdown) = Shutdown::channel();
    h.posts()
        .scan_target(&snapshot.targets[0], &snapshot, &shutdown)
        .await
        .unwrap();

    submitted.assert_async().await;
    // The post's own subreddit is a self-reference.
    assert!(h.subreddit("somewhere").await.is_none());
    assert!(h.subreddit("elsewhere").await.is_some());
}

#[tokio::test]
async fn no_targets_runs_idle_refresh_only() {
    let mut h = Harness::new().await;
    subreddit::ActiveModel {
        name: Set("catpics".into()),
        is_banned: Set(false),
        found: Set(true),
        retry_priority: Set(0),
        ..Default::default()
    }
    .insert(&h.db.conn)
    .await
    .unwrap();
    let about_mock = h.mock_json("/r/catpics/about.json", about("catpics"), 1).await;

    let (_tx, shutdown) = Shutdown::channel();
    let report = h.orchestrator().run_cycle(&shutdown).await;

    assert!(report.idle);
    assert_eq!(report.refresh.updated, 1);
    about_mock.assert_async().await;
    assert!(h.subreddit("catpics").await.unwrap().last_checked.is_some());
    assert!(analytics::Entity::find().all(&h.db.conn).await.unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_before_cycle_does_no_work() {
    let h = Harness::new().await;
    h.add_target("exampletest").await;

    let (tx, shutdown) = Shutdown::channel();
    tx.send(true).unwrap();
    let report = h.orchestrator().run_cycle(&shutdown).await;

    assert!(!report.config_loaded);
    assert_eq!(report.scan.walked, 0);
}

#[tokio::test]
async fn unreadable_posts_give_up_the_head_of_the_rescan_queue() {
    let mut h = Harness::with_config(|c| c.rescan_batch_size = 1).await;
    for (id, scanned_hours_ago) in [("broken", 40), ("flaky", 30), ("healthy", 20)] {
        h.add_post(id, scanned_hours_ago).await;
    }

    let broken = h
        .server
        .mock("GET", "/comments/broken.json")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("<html>oops</html>")
        .expect(1)
        .create_async()
        .await;
    let flaky = h
        .server
        .mock("GET", "/comments/flaky.json")
        .match_query(Matcher::Any)
        .with_status(503)
        .expect(1)
        .create_async()
        .await;
    let healthy = h
        .mock_json("/comments/healthy.json", comment_tree(&[("c1", "alice", "r/catpics")]), 1)
        .await;

    let scheduler = RescanScheduler::new(Arc::new(h.posts()), h.db.clone(), h.config.clone());
    let snapshot = ConfigSnapshot::default();
    let (_tx, shutdown) = Shutdown::channel();

    let first = scheduler.run_pass(&snapshot, &shutdown).await.unwrap();
    assert_eq!((first.walked, first.failed), (0, 1));
    let second = scheduler.run_pass(&snapshot, &shutdown).await.unwrap();
    assert_eq!((second.walked, second.failed), (0, 1));
    let third = scheduler.run_pass(&snapshot, &shutdown).await.unwrap();
    assert_eq!(third.walked, 1);
    assert_eq!(third.new_mentions, 1);

    broken.assert_async().await;
    flaky.assert_async().await;
    healthy.assert_async().await;
    for id in ["broken", "flaky"] {
        let post = h.db.find_post(id).await.unwrap().unwrap();
        assert!(post.last_scanned.unwrap() > now() - TimeDelta::minutes(5));
    }
}

#[tokio::test]
async fn scan_follows_listing_pages_until_cursor_runs_out() {
    let mut h = Harness::new().await;
    h.add_target("exampletest").await;

    let first_page = h
        .server
        .mock("GET", "/r/exampletest/new.json")
        .match_query(Matcher::Regex("^limit=100&raw_json=1$".into()))
        .with_status(200)
        .with_body(listing_page("exampletest", &["p1"], Some("t3_p1")).to_string())
        .expect(1)
        .create_async()
        .await;
    let second_page = h
        .server
        .mock("GET", "/r/exampletest/new.json")
        .match_query(Matcher::UrlEncoded("after".into(), "t3_p1".into()))
        .with_status(200)
        .with_body(listing_page("exampletest", &["p2"], None).to_string())
        .expect(1)
        .create_async()
        .await;
    let _p1 = h
        .mock_json("/comments/p1.json", comment_tree(&[("c1", "alice", "r/catpics")]), 1)
        .await;
    let _p2 = h
        .mock_json("/comments/p2.json", comment_tree(&[("c2", "bob", "r/dogpics")]), 1)
        .await;

    let snapshot = ConfigSnapshot::load(&h.db.conn).await.unwrap();
    let (_tx, shutdown) = Shutdown::channel();
    let report = h
        .posts()
        .scan_target(&snapshot.targets[0], &snapshot, &shutdown)
        .await
        .unwrap();

    first_page.assert_async().await;
    second_page.assert_async().await;
    assert_eq!((report.listed, report.walked, report.new_mentions), (2, 2, 2));
    assert!(h.subreddit("catpics").await.is_some());
    assert!(h.subreddit("dogpics").await.is_some());
}

#[tokio::test]
async fn listing_pagination_stops_at_page_cap() {
    let mut h = Harness::with_config(|c| c.max_listing_pages = 1).await;
    h.add_target("exampletest").await;

    let _first_page = h
        .server
        .mock("GET", "/r/exampletest/new.json")
        .match_query(Matcher::Regex("^limit=100&raw_json=1$".into()))
        .with_status(200)
        .with_body(listing_page("exampletest", &["p1"], Some("t3_p1")).to_string())
        .create_async()
        .await;
    let second_page = h
        .server
        .mock("GET", "/r/exampletest/new.json")
        .match_query(Matcher::UrlEncoded("after".into(), "t3_p1".into()))
        .with_status(200)
        .with_body(listing_page("exampletest", &[], None).to_string())
        .expect(0)
        .create_async()
        .await;
    let _p1 = h.mock_json("/comments/p1.json", comment_tree(&[]), 1).await;

    let snapshot = ConfigSnapshot::load(&h.db.conn).await.unwrap();
    let (_tx, shutdown) = Shutdown::channel();
    let report = h
        .posts()
        .scan_target(&snapshot.targets[0], &snapshot, &shutdown)
        .await
        .unwrap();

    assert_eq!(report.listed, 1);
    second_page.assert_async().await;
}

#[tokio::test]
async fn shutdown_mid_walk_finishes_the_post_in_flight() {
    let mut h = Harness::new().await;
    h.add_target("exampletest").await;
    let (tx, shutdown) = Shutdown::channel();

    let _listing = h
        .mock_json("/r/exampletest/new.json", listing("exampletest", &["first", "second"]), 1)
        .await;
    let tree = comment_tree(&[("c1", "alice", "r/catpics"), ("c2", "bob", "r/dogpics")]).to_string();
    let first = h
        .server
        .mock("GET", "/comments/first.json")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body_from_request(move |_| {
            // Ctrl-C lands while the first post's comments are being fetched.
            let _ = tx.send(true);
            tree.clone().into_bytes()
        })
        .expect(1)
        .create_async()
        .await;
    let second = h.mock_json("/comments/second.json", comment_tree(&[]), 0).await;

    let snapshot = ConfigSnapshot::load(&h.db.conn).await.unwrap();
    let report = h
        .posts()
        .scan_target(&snapshot.targets[0], &snapshot, &shutdown)
        .await
        .unwrap();

    assert!(shutdown.is_triggered());
    assert_eq!((report.walked, report.new_mentions), (1, 2));
    first.assert_async().await;
    second.assert_async().await;

    assert_eq!(h.mention_count().await, 2);
    let post = h.db.find_post("first").await.unwrap().unwrap();
    assert!(post.last_scanned.is_some());
    assert!(h.db.find_post("second").await.unwrap().is_none());
}
