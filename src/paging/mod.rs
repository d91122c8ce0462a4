pub mod conversation;
pub mod mediator;
pub mod pager;

pub use conversation::{
    build_conversation, ConversationLoader, ConversationResult, ConversationService, SearchPage, SearchResult,
};
pub use mediator::{FetchFn, LoadDirection, MediatorResult, PagingState, TimelineMediator};
pub use pager::{refresh_or_retry_action, LoadState, LoadStates, Pager, PagerAction};
