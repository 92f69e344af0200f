//! Flattening of `/comments/{id}.json` responses.
//!
//! The endpoint returns `[post_listing, comment_listing]`. Replies nest as
//! full listings inside each comment's `replies` field (or `""` when there
//! are none), so the tree is walked with an explicit stack.

use super::{naive_from_epoch, normalize_author};
use crate::error::ApiError;
use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentNode {
    pub id: String,
    pub body: String,
    pub author: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct CommentTree {
    /// Depth-first, in the order the thread displays them.
    pub comments: Vec<CommentNode>,
    /// "load more" stubs that were not expanded.
    pub unexpanded: usize,
    pub malformed: usize,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    id: String,
    #[serde(default)]
    body: String,
    author: Option<String>,
    created_utc: f64,
}

impl CommentTree {
    pub fn from_value(value: Value) -> Result<Self, ApiError> {
        let Value::Array(mut parts) = value else {
            return Err(ApiError::Malformed("comment response is not an array".into()));
        };
        if parts.len() < 2 {
            return Err(ApiError::Malformed(format!(
                "comment response has {} parts, expected 2",
                parts.len()
            )));
        }

        // parts[0] holds the post itself, which the listing already provided.
        let comment_listing = parts.swap_remove(1);

        let mut tree = CommentTree {
            comments: Vec::new(),
            unexpanded: 0,
            malformed: 0,
        };

        let mut stack: Vec<Value> = listing_children(comment_listing);
        stack.reverse();

        while let Some(mut thing) = stack.pop() {
            match thing.get("kind").and_then(Value::as_str) {
                Some("t1") => {}
                Some("more") => {
                    tree.unexpanded += 1;
                    continue;
                }
                _ => continue,
            }

            let Some(mut data) = thing.get_mut("data").map(Value::take) else {
                tree.malformed += 1;
                continue;
            };

            if let Some(replies) = data.get_mut("replies").map(Value::take) {
                let mut children = listing_children(replies);
                children.reverse();
                stack.extend(children);
            }

            match serde_json::from_value::<RawComment>(data) {
                Ok(raw) => match naive_from_epoch(raw.created_utc) {
                    Some(created_at) => tree.comments.push(CommentNode {
                        id: raw.id,
                        body: raw.body,
                        author: normalize_author(raw.author),
                        created_at,
                    }),
                    None => tree.malformed += 1,
                },
                Err(e) => {
                    warn!(error = %e, "Skipping malformed comment");
                    tree.malformed += 1;
                }
            }
        }

        Ok(tree)
    }
}

/// `children` of a listing, or nothing when the value is not a listing.
fn listing_children(listing: Value) -> Vec<Value> {
    match listing {
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Object(mut data)) => match data.remove("children") {
                Some(Value::Array(children)) => children,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}
