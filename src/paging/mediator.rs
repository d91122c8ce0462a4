//! Bridges one timeline partition of the local cache to a paged remote API.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::cache::{CacheTransaction, CachedPost, TimelineCache, TimelineKey};
use crate::error::{CacheError, FetchError, LoadError};
use crate::sources::Post;

/// Remote fetch: `(page_size, cursor)` to one page of posts, newest first.
/// The cursor is the id of the oldest post already loaded.
pub type FetchFn =
    Arc<dyn Fn(u32, Option<String>) -> BoxFuture<'static, Result<Vec<Post>, FetchError>> + Send + Sync>;
pub type TransformFn = Arc<dyn Fn(Vec<CachedPost>) -> Vec<CachedPost> + Send + Sync>;
pub type EndOfPaginationFn = Arc<dyn Fn(&[CachedPost], u32) -> bool + Send + Sync>;
pub type ClearFn =
    Arc<dyn Fn(&CacheTransaction<'_>, &TimelineKey) -> Result<(), CacheError> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadDirection {
    /// Reload from the newest post
    Refresh,
    /// Fetch older posts
    Append,
    /// Fetch newer posts. Never performed here.
    Prepend,
}

impl fmt::Display for LoadDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Refresh => "refresh",
            Self::Append => "append",
            Self::Prepend => "prepend",
        })
    }
}

/// What the paging controller knows when it asks for a page.
#[derive(Clone, Debug)]
pub struct PagingState {
    /// Last item of the loaded window, if anything was loaded
    pub last_item: Option<CachedPost>,
    pub page_size: u32,
}

impl PagingState {
    pub fn new(last_item: Option<CachedPost>, page_size: u32) -> Self {
        Self { last_item, page_size }
    }

    /// State whose window is everything currently cached for `key`.
    pub async fn from_cache(
        cache: &TimelineCache,
        key: &TimelineKey,
        page_size: u32,
    ) -> Result<Self, CacheError> {
        Ok(Self::new(cache.last(key).await?, page_size))
    }
}

#[derive(Debug)]
pub enum MediatorResult {
    Success { end_of_pagination_reached: bool },
    /// Recoverable. The caller decides whether to retry.
    Error(LoadError),
}

impl MediatorResult {
    fn end_of_pagination() -> Self {
        Self::Success { end_of_pagination_reached: true }
    }
}

/// Default end-of-data policy: a short page is the last one.
pub fn short_page(records: &[CachedPost], page_size: u32) -> bool {
    records.len() < page_size as usize
}

/// Default refresh cleanup: drop the whole partition.
pub fn clear_partition(tx: &CacheTransaction<'_>, key: &TimelineKey) -> Result<(), CacheError> {
    tx.clear(key).map(|_| ())
}

pub struct TimelineMediator {
    key: TimelineKey,
    cache: TimelineCache,
    fetch: FetchFn,
    transform: TransformFn,
    end_of_pagination: EndOfPaginationFn,
    clear: ClearFn,
}

impl TimelineMediator {
    pub fn new(key: TimelineKey, cache: TimelineCache, fetch: FetchFn) -> Self {
        Self {
            key,
            cache,
            fetch,
            transform: Arc::new(|records: Vec<CachedPost>| records),
            end_of_pagination: Arc::new(short_page),
            clear: Arc::new(clear_partition),
        }
    }

    /// Reorder, filter or merge a mapped page before it is written.
    pub fn with_transform(
        mut self,
        transform: impl Fn(Vec<CachedPost>) -> Vec<CachedPost> + Send + Sync + 'static,
    ) -> Self {
        self.transform = Arc::new(transform);
        self
    }

    pub fn with_end_of_pagination(
        mut self,
        end_of_pagination: impl Fn(&[CachedPost], u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.end_of_pagination = Arc::new(end_of_pagination);
        self
    }

    /// Replace what a refresh wipes before writing the new page.
    pub fn with_clear(
        mut self,
        clear: impl Fn(&CacheTransaction<'_>, &TimelineKey) -> Result<(), CacheError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.clear = Arc::new(clear);
        self
    }

    pub fn key(&self) -> &TimelineKey {
        &self.key
    }

    pub fn cache(&self) -> &TimelineCache {
        &self.cache
    }

    /// Load one page in `direction` and merge it into the cache.
    ///
    /// Fetch failures come back as `Ok(MediatorResult::Error(_))` with the
    /// cache untouched. Cache failures are returned as `Err`.
    pub async fn load(
        &self,
        direction: LoadDirection,
        state: &PagingState,
    ) -> Result<MediatorResult, CacheError> {
        let _slot = self.cache.lock(&self.key).await;
        self.load_locked(direction, state).await
    }

    /// Like [`load`](Self::load), with the paging state read from the cache
    /// under the same timeline lock as the write.
    pub async fn load_from_cache(
        &self,
        direction: LoadDirection,
        page_size: u32,
    ) -> Result<MediatorResult, CacheError> {
        let _slot = self.cache.lock(&self.key).await;
        let state = PagingState::from_cache(&self.cache, &self.key, page_size).await?;
        self.load_locked(direction, &state).await
    }

    async fn load_locked(
        &self,
        direction: LoadDirection,
        state: &PagingState,
    ) -> Result<MediatorResult, CacheError> {
        let cursor = match direction {
            LoadDirection::Prepend => return Ok(MediatorResult::end_of_pagination()),
            LoadDirection::Append => match &state.last_item {
                Some(item) => Some(item.status_id.clone()),
                None => return Ok(MediatorResult::end_of_pagination()),
            },
            LoadDirection::Refresh => None,
        };

        let page_size = state.page_size;
        debug!(timeline = %self.key, %direction, page_size, cursor = ?cursor, "Loading page");

        let posts = match (self.fetch)(page_size, cursor).await {
            Ok(posts) => posts,
            Err(e) => {
                warn!(timeline = %self.key, %direction, error = %e, "Page load failed");
                return Ok(MediatorResult::Error(e));
            }
        };
        let fetched = posts.len();

        let records = (self.transform)(
            posts
                .into_iter()
                .map(|post| CachedPost::new(self.key.clone(), post))
                .collect(),
        );
        let end_of_pagination_reached = (self.end_of_pagination)(&records, page_size);
        let written = records.len();

        let key = self.key.clone();
        let clear = self.clear.clone();
        let refresh = direction == LoadDirection::Refresh;
        self.cache
            .transaction(move |tx| {
                if refresh {
                    clear(tx, &key)?;
                }
                tx.upsert(&records)
            })
            .await?;

        info!(
            timeline = %self.key,
            %direction,
            fetched,
            written,
            end_of_pagination_reached,
            "Page loaded"
        );
        Ok(MediatorResult::Success { end_of_pagination_reached })
    }
}
