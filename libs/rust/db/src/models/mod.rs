pub mod analytics;
pub mod comment;
pub mod ignored_subreddit;
pub mod ignored_user;
pub mod mention;
pub mod post;
pub mod rate_limit_state;
pub mod scan_target;
pub mod subreddit;
