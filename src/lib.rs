//! Keeps a local SQLite cache of microblog timelines in step with the remote
//! service, one page at a time.

pub mod cache;
pub mod config;
pub mod error;
pub mod paging;
pub mod sources;

pub use cache::{AccountKey, CachedPost, TimelineCache, TimelineKey, TimelineKind, TimelineLock};
pub use error::{CacheError, ConfigError, FetchError, LoadError};
