use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Listing<T> {
    pub data: ListingData<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingData<T> {
    #[serde(default = "Vec::new")]
    pub children: Vec<Thing<T>>,
    pub after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thing<T> {
    pub kind: String,
    pub data: T,
}

/// A `t3` submission as it appears in listings and at the head of a comment tree.
#[derive(Debug, Clone, Deserialize)]
pub struct PostData {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub permalink: String,
    pub url: Option<String>,
    pub created_utc: f64,
    pub author: Option<String>,
    pub subreddit: String,
    #[serde(default)]
    pub over_18: bool,
}

impl<T> Listing<T> {
    pub fn into_items(self) -> impl Iterator<Item = T> {
        self.data.children.into_iter().map(|thing| thing.data)
    }
}
