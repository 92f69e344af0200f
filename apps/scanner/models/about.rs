use serde::Deserialize;

/// Response of `/r/{name}/about.json`.
///
/// A live subreddit comes back as `kind = "t5"`. Anything else (a search
/// listing, a bare error object) means the name does not resolve.
#[derive(Debug, Clone, Deserialize)]
pub struct About {
    pub kind: Option<String>,
    pub data: Option<AboutData>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AboutData {
    pub display_name: Option<String>,
    pub title: Option<String>,
    pub public_description: Option<String>,
    pub subscribers: Option<i64>,
    pub accounts_active: Option<i64>,
    pub active_user_count: Option<i64>,
    pub created_utc: Option<f64>,
    pub over18: Option<bool>,
    pub over_18: Option<bool>,
}

impl About {
    pub fn is_subreddit(&self) -> bool {
        self.kind.as_deref() == Some("t5") && self.data.is_some()
    }
}

impl AboutData {
    pub fn active_users(&self) -> Option<i64> {
        self.accounts_active.or(self.active_user_count)
    }

    pub fn nsfw(&self) -> Option<bool> {
        self.over18.or(self.over_18)
    }

    /// Empty strings count as absent.
    pub fn description(&self) -> Option<String> {
        self.public_description
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
    }
}
