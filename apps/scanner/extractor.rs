//! Subreddit reference extraction from comment bodies.

use crate::{models::comments::CommentNode, snapshot::ConfigSnapshot};
use once_cell::sync::Lazy;
use regex::{CaptureMatches, Regex};
use std::collections::HashSet;

pub const MIN_NAME_LEN: usize = 3;
pub const MAX_NAME_LEN: usize = 21;

/// Listing aliases that look like subreddits but are not communities.
pub const RESERVED_NAMES: &[&str] = &["all", "random", "randnsfw", "popular", "friends", "mod"];

// The capture takes the whole token, Unicode letters and hyphens included,
// so that over-long or non-ASCII tokens are rejected whole instead of
// matching on a valid-looking prefix.
static MENTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:reddit\.com/r/|(?:^|[^\w/])/?r/)([\w-]+)")
        .unwrap_or_else(|e| panic!("invalid mention pattern: {e}"))
});

/// Lowercase subreddit names referenced in `body`, in order of appearance,
/// before any per-post or ignore-list filtering.
pub fn referenced_names(body: &str) -> Vec<String> {
    MENTION_RE
        .captures_iter(body)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|name| is_valid_name(name))
        .map(str::to_lowercase)
        .collect()
}

pub fn is_valid_name(name: &str) -> bool {
    (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&name.len())
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        && !RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate<'c> {
    pub subreddit: String,
    pub comment: &'c CommentNode,
    pub user: Option<&'c str>,
}

/// Extraction rules for comments under one post.
pub struct MentionExtractor<'s> {
    snapshot: &'s ConfigSnapshot,
    hosting_subreddit: String,
}

impl<'s> MentionExtractor<'s> {
    pub fn new(snapshot: &'s ConfigSnapshot, hosting_subreddit: &str) -> Self {
        Self {
            snapshot,
            hosting_subreddit: hosting_subreddit.to_lowercase(),
        }
    }

    /// A fresh, lazy pass over one comment. Calling it again restarts from the top.
    pub fn candidates<'c>(&self, comment: &'c CommentNode) -> Candidates<'c, '_> {
        let user = comment.author.as_deref();
        let muted = user.is_some_and(|u| self.snapshot.is_ignored_user(u));
        Candidates {
            captures: MENTION_RE.captures_iter(&comment.body),
            comment,
            user,
            muted,
            extractor: self,
            seen: HashSet::new(),
        }
    }

    fn accepts(&self, name: &str) -> bool {
        name != self.hosting_subreddit && !self.snapshot.is_ignored_subreddit(name)
    }
}

pub struct Candidates<'c, 's> {
    captures: CaptureMatches<'static, 'c>,
    comment: &'c CommentNode,
    user: Option<&'c str>,
    muted: bool,
    extractor: &'s MentionExtractor<'s>,
    seen: HashSet<String>,
}

impl<'c> Iterator for Candidates<'c, '_> {
    type Item = Candidate<'c>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.muted {
            return None;
        }
        for caps in self.captures.by_ref() {
            let Some(raw) = caps.get(1).map(|m| m.as_str()) else {
                continue;
            };
            if !is_valid_name(raw) {
                continue;
            }
            let name = raw.to_lowercase();
            if !self.extractor.accepts(&name) || !self.seen.insert(name.clone()) {
                continue;
            }
            return Some(Candidate {
                subreddit: name,
                comment: self.comment,
                user: self.user,
            });
        }
        None
    }
}
