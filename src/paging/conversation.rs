use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::{AccountKey, CachedPost, TimelineCache, TimelineKey, TimelineKind};
use crate::error::{CacheError, FetchError, LoadError};
use crate::sources::Post;

/// Number of candidate replies requested per conversation search.
pub const CONVERSATION_PAGE_SIZE: u32 = 20;

/// One page of a conversation search.
#[derive(Clone, Debug, Default)]
pub struct SearchPage {
    pub posts: Vec<Post>,
    pub next_page: Option<String>,
}

/// Reconstructed thread, flattened, plus the token of the next search page.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchResult {
    pub posts: Vec<Post>,
    pub next_page: Option<String>,
}

#[derive(Debug)]
pub enum ConversationResult {
    Loaded(SearchResult),
    /// Recoverable. Nothing was cached.
    Error(LoadError),
}

/// Remote side of conversation loading.
#[async_trait]
pub trait ConversationService: Send + Sync {
    /// Search posts of conversation `conversation_id`.
    async fn search_conversation(
        &self,
        conversation_id: &str,
        count: u32,
        next_page: Option<&str>,
    ) -> Result<SearchPage, FetchError>;

    /// Fetch a single post by id.
    async fn lookup(&self, id: &str) -> Result<Post, FetchError>;
}

/// Rebuild reply chains under `root` from a flat candidate list.
///
/// One branch per direct reply to `root`, in candidate order; each branch is
/// the reply followed by its own descendants, depth first. Every post appears
/// at most once, so a cyclic reply graph still terminates.
pub fn build_conversation(root: &Post, candidates: &[Post]) -> Vec<Vec<Post>> {
    let mut visited = HashSet::from([root.id.as_str()]);
    replies_of(&root.id, candidates, &mut visited)
}

fn replies_of<'a>(parent: &str, candidates: &'a [Post], visited: &mut HashSet<&'a str>) -> Vec<Vec<Post>> {
    let mut branches = vec![];
    for reply in candidates.iter().filter(|c| c.replied_to() == Some(parent)) {
        if !visited.insert(reply.id.as_str()) {
            continue;
        }
        let mut branch = vec![reply.clone()];
        branch.extend(replies_of(&reply.id, candidates, visited).into_iter().flatten());
        branches.push(branch);
    }
    branches
}

pub struct ConversationLoader<S> {
    service: S,
    cache: TimelineCache,
    key: TimelineKey,
}

impl<S: ConversationService> ConversationLoader<S> {
    pub fn new(service: S, cache: TimelineCache, account: AccountKey) -> Self {
        Self {
            service,
            cache,
            key: TimelineKey::new(account, TimelineKind::Conversation),
        }
    }

    /// Replies under `root`, one search page at a time.
    pub async fn load_conversation(
        &self,
        root: &Post,
        next_page: Option<&str>,
    ) -> Result<ConversationResult, CacheError> {
        let Some(conversation_id) = root.conversation_id.as_deref() else {
            return Ok(ConversationResult::Loaded(SearchResult::default()));
        };

        let page = match self
            .service
            .search_conversation(conversation_id, CONVERSATION_PAGE_SIZE, next_page)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!(conversation = conversation_id, error = %e, "Conversation search failed");
                return Ok(ConversationResult::Error(e));
            }
        };

        let posts: Vec<Post> = build_conversation(root, &page.posts).into_iter().flatten().collect();
        debug!(
            conversation = conversation_id,
            candidates = page.posts.len(),
            threaded = posts.len(),
            "Rebuilt conversation"
        );
        self.save(&posts).await?;

        Ok(ConversationResult::Loaded(SearchResult { posts, next_page: page.next_page }))
    }

    /// Ancestors of `post`, oldest first. Stops at the first post that cannot
    /// be fetched or that was already seen.
    pub async fn load_previous(&self, post: &Post) -> Result<Vec<Post>, CacheError> {
        let mut seen = HashSet::from([post.id.clone()]);
        let mut ancestors = vec![];
        let mut parent = post.replied_to().map(str::to_string);

        while let Some(id) = parent.take() {
            if !seen.insert(id.clone()) {
                warn!(post = %id, "Reply chain loops back, stopping");
                break;
            }
            let found = match self.service.lookup(&id).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(post = %id, error = %e, "Failed to load parent post");
                    break;
                }
            };
            self.save(std::slice::from_ref(&found)).await?;
            parent = found.replied_to().map(str::to_string);
            ancestors.push(found);
        }

        ancestors.reverse();
        Ok(ancestors)
    }

    async fn save(&self, posts: &[Post]) -> Result<(), CacheError> {
        let records: Vec<CachedPost> = posts
            .iter()
            .map(|p| CachedPost::new(self.key.clone(), p.clone()))
            .collect();
        self.cache.transaction(move |tx| tx.upsert(&records)).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::sources::fixtures::post;

    fn ids(posts: &[Post]) -> Vec<&str> {
        posts.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn builds_linear_chain() {
        let root = post("p", None);
        let candidates = vec![post("b", Some("a")), post("a", Some("p"))];

        let threads = build_conversation(&root, &candidates);
        assert_eq!(threads.len(), 1);
        assert_eq!(ids(&threads[0]), vec!["a", "b"]);
    }

    #[test]
    fn branches_follow_candidate_order_depth_first() {
        let root = post("p", None);
        let candidates = vec![
            post("x", Some("p")),
            post("a", Some("p")),
            post("a2", Some("a")),
            post("x1", Some("x")),
            post("a1", Some("a")),
            post("stray", Some("nowhere")),
        ];

        let threads = build_conversation(&root, &candidates);
        let threads: Vec<Vec<&str>> = threads.iter().map(|t| ids(t)).collect();
        assert_eq!(threads, vec![vec!["x", "x1"], vec!["a", "a2", "a1"]]);
    }

    #[test]
    fn cyclic_replies_terminate() {
        let root = post("p", None);
        let candidates = vec![post("a", Some("p")), post("b", Some("a")), post("a", Some("b"))];

        let flat: Vec<Post> = build_conversation(&root, &candidates).into_iter().flatten().collect();
        assert_eq!(ids(&flat), vec!["a", "b"]);
    }

    #[derive(Default)]
    struct FakeService {
        posts: HashMap<String, Post>,
        searches: Mutex<Vec<String>>,
        search_result: Vec<Post>,
        search_down: bool,
    }

    #[async_trait]
    impl ConversationService for FakeService {
        async fn search_conversation(
            &self,
            conversation_id: &str,
            _count: u32,
            _next_page: Option<&str>,
        ) -> Result<SearchPage, FetchError> {
            self.searches.lock().unwrap().push(conversation_id.to_string());
            if self.search_down {
                return Err(FetchError::Service { status: 503, message: "Service Unavailable".into() });
            }
            Ok(SearchPage { posts: self.search_result.clone(), next_page: Some("next".into()) })
        }

        async fn lookup(&self, id: &str) -> Result<Post, FetchError> {
            self.posts.get(id).cloned().ok_or_else(|| FetchError::Service {
                status: 404,
                message: format!("Could not find tweet with id: [{id}]"),
            })
        }
    }

    fn loaded(result: ConversationResult) -> SearchResult {
        match result {
            ConversationResult::Loaded(result) => result,
            ConversationResult::Error(e) => panic!("unexpected load error: {e}"),
        }
    }

    fn conversation_key() -> TimelineKey {
        TimelineKey::new("me".into(), TimelineKind::Conversation)
    }

    #[tokio::test]
    async fn load_conversation_without_id_is_empty() {
        let cache = TimelineCache::open_in_memory().unwrap();
        let loader = ConversationLoader::new(FakeService::default(), cache.clone(), "me".into());

        let result = loaded(loader.load_conversation(&post("p", None), None).await.unwrap());
        assert_eq!(result, SearchResult::default());
        assert!(loader.service.searches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_conversation_caches_thread() {
        let cache = TimelineCache::open_in_memory().unwrap();
        let service = FakeService {
            search_result: vec![post("a", Some("p")), post("b", Some("a"))],
            ..Default::default()
        };
        let loader = ConversationLoader::new(service, cache.clone(), "me".into());

        let mut root = post("p", None);
        root.conversation_id = Some("c1".into());
        let result = loaded(loader.load_conversation(&root, None).await.unwrap());

        assert_eq!(ids(&result.posts), vec!["a", "b"]);
        assert_eq!(result.next_page.as_deref(), Some("next"));
        assert_eq!(*loader.service.searches.lock().unwrap(), vec!["c1".to_string()]);
        let cached: Vec<String> =
            cache.list(&conversation_key()).await.unwrap().into_iter().map(|c| c.status_id).collect();
        assert_eq!(cached, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failed_search_is_reported_and_not_cached() {
        let cache = TimelineCache::open_in_memory().unwrap();
        let service = FakeService {
            search_result: vec![post("a", Some("p"))],
            search_down: true,
            ..Default::default()
        };
        let loader = ConversationLoader::new(service, cache.clone(), "me".into());

        let mut root = post("p", None);
        root.conversation_id = Some("c1".into());
        let result = loader.load_conversation(&root, None).await.unwrap();

        assert!(matches!(result, ConversationResult::Error(FetchError::Service { status: 503, .. })));
        assert_eq!(cache.count(&conversation_key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn load_previous_walks_up_until_lookup_fails() {
        let cache = TimelineCache::open_in_memory().unwrap();
        let service = FakeService {
            posts: HashMap::from([
                ("b".to_string(), post("b", Some("a"))),
                ("a".to_string(), post("a", Some("gone"))),
            ]),
            ..Default::default()
        };
        let loader = ConversationLoader::new(service, cache.clone(), "me".into());

        let ancestors = loader.load_previous(&post("c", Some("b"))).await.unwrap();
        assert_eq!(ids(&ancestors), vec!["a", "b"]);
        assert_eq!(cache.count(&conversation_key()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn load_previous_stops_on_loop() {
        let cache = TimelineCache::open_in_memory().unwrap();
        let service = FakeService {
            posts: HashMap::from([
                ("b".to_string(), post("b", Some("a"))),
                ("a".to_string(), post("a", Some("b"))),
            ]),
            ..Default::default()
        };
        let loader = ConversationLoader::new(service, cache, "me".into());

        let ancestors = loader.load_previous(&post("c", Some("b"))).await.unwrap();
        assert_eq!(ids(&ancestors), vec!["a", "b"]);
    }
}
