use tracing::debug;

use super::mediator::{LoadDirection, MediatorResult, TimelineMediator};
use crate::error::CacheError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadState {
    NotLoading { end_of_pagination_reached: bool },
    Loading,
    /// Last load in this direction failed; message of the cause
    Error(String),
}

impl LoadState {
    fn idle() -> Self {
        Self::NotLoading { end_of_pagination_reached: false }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadStates {
    pub refresh: LoadState,
    pub append: LoadState,
    pub prepend: LoadState,
}

impl Default for LoadStates {
    fn default() -> Self {
        Self {
            refresh: LoadState::idle(),
            append: LoadState::idle(),
            prepend: LoadState::idle(),
        }
    }
}

impl LoadStates {
    fn get_mut(&mut self, direction: LoadDirection) -> &mut LoadState {
        match direction {
            LoadDirection::Refresh => &mut self.refresh,
            LoadDirection::Append => &mut self.append,
            LoadDirection::Prepend => &mut self.prepend,
        }
    }

    fn get(&self, direction: LoadDirection) -> &LoadState {
        match direction {
            LoadDirection::Refresh => &self.refresh,
            LoadDirection::Append => &self.append,
            LoadDirection::Prepend => &self.prepend,
        }
    }
}

/// What a pull-to-refresh gesture should do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagerAction {
    /// Nothing is loaded: reload from the start
    Refresh,
    /// Something is loaded: only re-issue the failed loads
    Retry,
}

pub fn refresh_or_retry_action(item_count: usize) -> PagerAction {
    if item_count == 0 {
        PagerAction::Refresh
    } else {
        PagerAction::Retry
    }
}

/// Drives one mediator, one load at a time, and tracks per-direction state.
/// Never retries on its own.
pub struct Pager {
    mediator: TimelineMediator,
    page_size: u32,
    states: LoadStates,
}

impl Pager {
    pub fn new(mediator: TimelineMediator, page_size: u32) -> Self {
        Self { mediator, page_size, states: LoadStates::default() }
    }

    pub fn load_states(&self) -> &LoadStates {
        &self.states
    }

    pub fn mediator(&self) -> &TimelineMediator {
        &self.mediator
    }

    /// Number of posts in the loaded window.
    pub async fn item_count(&self) -> Result<usize, CacheError> {
        self.mediator.cache().count(self.mediator.key()).await
    }

    pub async fn refresh(&mut self) -> Result<&LoadStates, CacheError> {
        self.run(LoadDirection::Refresh).await?;
        Ok(&self.states)
    }

    /// Load the next older page, unless the timeline is already exhausted.
    pub async fn append(&mut self) -> Result<&LoadStates, CacheError> {
        if self.states.append != (LoadState::NotLoading { end_of_pagination_reached: true }) {
            self.run(LoadDirection::Append).await?;
        }
        Ok(&self.states)
    }

    /// Re-issue every load whose last attempt failed. Returns how many were re-issued.
    pub async fn retry(&mut self) -> Result<usize, CacheError> {
        let mut retried = 0;
        for direction in [LoadDirection::Refresh, LoadDirection::Prepend, LoadDirection::Append] {
            if self.states.get(direction).is_error() {
                self.run(direction).await?;
                retried += 1;
            }
        }
        Ok(retried)
    }

    pub async fn refresh_or_retry(&mut self) -> Result<PagerAction, CacheError> {
        let action = refresh_or_retry_action(self.item_count().await?);
        debug!(timeline = %self.mediator.key(), ?action, "Refresh or retry");
        match action {
            PagerAction::Refresh => {
                self.refresh().await?;
            }
            PagerAction::Retry => {
                self.retry().await?;
            }
        }
        Ok(action)
    }

    async fn run(&mut self, direction: LoadDirection) -> Result<(), CacheError> {
        *self.states.get_mut(direction) = LoadState::Loading;

        let result = match self.mediator.load_from_cache(direction, self.page_size).await {
            Ok(result) => result,
            Err(e) => {
                *self.states.get_mut(direction) = LoadState::Error(e.to_string());
                return Err(e);
            }
        };

        match result {
            MediatorResult::Success { end_of_pagination_reached } => {
                *self.states.get_mut(direction) = LoadState::NotLoading { end_of_pagination_reached };
                if direction == LoadDirection::Refresh {
                    self.states.append = LoadState::NotLoading { end_of_pagination_reached };
                    self.states.prepend = LoadState::NotLoading { end_of_pagination_reached: true };
                }
            }
            MediatorResult::Error(e) => {
                *self.states.get_mut(direction) = LoadState::Error(e.to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{TimelineCache, TimelineKey, TimelineKind};
    use crate::error::FetchError;
    use crate::paging::mediator::testing::{transport_error, ScriptedFetch};
    use crate::sources::fixtures::post;
    use crate::sources::Post;

    fn posts(ids: &[&str]) -> Vec<Post> {
        ids.iter().map(|id| post(id, None)).collect()
    }

    fn pager(fetch: &ScriptedFetch, page_size: u32) -> Pager {
        let cache = TimelineCache::open_in_memory().unwrap();
        let key = TimelineKey::new("me".into(), TimelineKind::Mentions);
        Pager::new(TimelineMediator::new(key, cache, fetch.fetch_fn()), page_size)
    }

    #[test]
    fn empty_window_refreshes() {
        assert_eq!(refresh_or_retry_action(0), PagerAction::Refresh);
        assert_eq!(refresh_or_retry_action(1), PagerAction::Retry);
    }

    #[tokio::test]
    async fn refresh_or_retry_on_empty_cache_refreshes() {
        let fetch = ScriptedFetch::default();
        fetch.push(Ok(posts(&["2", "1"])));
        let mut pager = pager(&fetch, 2);

        assert_eq!(pager.refresh_or_retry().await.unwrap(), PagerAction::Refresh);
        assert_eq!(fetch.calls(), vec![None]);
        assert_eq!(pager.item_count().await.unwrap(), 2);
        assert_eq!(pager.load_states().refresh, LoadState::NotLoading { end_of_pagination_reached: false });
    }

    #[tokio::test]
    async fn refresh_or_retry_with_data_only_retries_failed_append() {
        let fetch = ScriptedFetch::default();
        fetch
            .push(Ok(posts(&["4", "3"])))
            .push(Err(transport_error().await))
            .push(Ok(posts(&["2"])));
        let mut pager = pager(&fetch, 2);

        pager.refresh().await.unwrap();
        pager.append().await.unwrap();
        assert!(pager.load_states().append.is_error());

        assert_eq!(pager.refresh_or_retry().await.unwrap(), PagerAction::Retry);
        assert_eq!(fetch.calls(), vec![None, Some("3".into()), Some("3".into())]);
        assert_eq!(pager.load_states().append, LoadState::NotLoading { end_of_pagination_reached: true });
        assert_eq!(pager.item_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn retry_without_failures_does_nothing() {
        let fetch = ScriptedFetch::default();
        fetch.push(Ok(posts(&["1"])));
        let mut pager = pager(&fetch, 20);

        pager.refresh().await.unwrap();
        assert_eq!(pager.retry().await.unwrap(), 0);
        assert_eq!(fetch.calls().len(), 1);
    }

    #[tokio::test]
    async fn append_stops_at_end_of_pagination() {
        let fetch = ScriptedFetch::default();
        fetch.push(Ok(posts(&["1"])));
        let mut pager = pager(&fetch, 20);

        pager.refresh().await.unwrap();
        pager.append().await.unwrap();
        assert_eq!(fetch.calls().len(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_is_reported_as_error_state() {
        let fetch = ScriptedFetch::default();
        fetch.push(Err(FetchError::Service { status: 503, message: "Service Unavailable".into() }));
        let mut pager = pager(&fetch, 20);

        let states = pager.refresh().await.unwrap();
        assert_eq!(
            states.refresh,
            LoadState::Error("service error 503: Service Unavailable".into())
        );
    }
}
