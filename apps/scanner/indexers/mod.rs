pub mod metadata;
pub mod posts;
pub mod rescan;
