use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{Author, Post, PostMedia, PostMetrics, ReferenceKind, ReferencedPost};
use crate::cache::TimelineKind;
use crate::error::FetchError;
use crate::paging::mediator::FetchFn;
use crate::paging::{ConversationService, SearchPage};

pub const DEFAULT_API_BASE: &str = "https://api.twitter.com";

const TWEET_FIELDS: &str = "created_at,author_id,conversation_id,referenced_tweets,public_metrics,attachments";
/// Largest page any v2 timeline endpoint returns.
pub const MAX_PAGE: u32 = 100;

#[derive(Clone)]
pub struct TwitterClient {
    /// Twitter bearer token
    pub token: String,
    /// Scheme and host, without trailing slash
    pub api_base: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TwitterResponse<T> {
    data: Option<T>,
    #[serde(default)]
    includes: TwitterTimelineIncludes,
    meta: Option<TwitterMeta>,
    errors: Option<Vec<TwitterRawError>>,
}
#[derive(Deserialize)]
struct TwitterRawTweet {
    id: String,
    text: String,
    author_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    conversation_id: Option<String>,
    attachments: Option<TwitterRawTweetAttachments>,
    referenced_tweets: Option<Vec<TwitterRawReference>>,
    public_metrics: Option<TwitterRawMetrics>,
}
#[derive(Deserialize)]
struct TwitterRawTweetAttachments {
    #[serde(default)]
    media_keys: Vec<String>,
}
#[derive(Deserialize)]
struct TwitterRawReference {
    r#type: String,
    id: String,
}
#[derive(Deserialize, Default)]
#[serde(default)]
struct TwitterRawMetrics {
    retweet_count: u64,
    reply_count: u64,
    like_count: u64,
    quote_count: u64,
}
#[derive(Deserialize, Default)]
struct TwitterTimelineIncludes {
    #[serde(default)]
    media: Vec<TwitterTimelineMedia>,
    #[serde(default)]
    users: Vec<TwitterRawUser>,
}
#[derive(Deserialize)]
struct TwitterTimelineMedia {
    media_key: String,
    r#type: String,
    url: Option<String>,
    variants: Option<Vec<TwitterTimelineMediaVariants>>,
}
#[derive(Deserialize)]
struct TwitterTimelineMediaVariants {
    bitrate: Option<u32>,
    url: String,
}
#[derive(Deserialize)]
struct TwitterRawUser {
    id: String,
    name: String,
    username: String,
}
#[derive(Deserialize)]
struct TwitterMeta {
    next_token: Option<String>,
}
#[derive(Deserialize)]
struct TwitterRawError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}
#[derive(Deserialize)]
struct TwitterErrorResponse {
    title: Option<String>,
    detail: Option<String>,
    errors: Option<Vec<TwitterRawError>>,
}

impl TwitterRawError {
    fn text(&self) -> Option<&str> {
        self.detail.as_deref().or(self.message.as_deref())
    }
}

impl TwitterClient {
    pub fn new(token: String) -> Self {
        Self::with_api_base(token, DEFAULT_API_BASE.into())
    }

    pub fn with_api_base(token: String, api_base: String) -> Self {
        Self {
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Page size actually requested for `kind` when `requested` is asked for.
    /// End-of-data checks must compare against this value.
    pub fn effective_page_size(kind: &TimelineKind, requested: u32) -> u32 {
        requested.clamp(min_page(kind), MAX_PAGE)
    }

    /// Fetch function for a timeline owned by `account_id`.
    /// `None` for kinds without a paged endpoint (conversations, custom timelines).
    pub fn fetcher(&self, kind: &TimelineKind, account_id: &str) -> Option<FetchFn> {
        let (path, query) = match kind {
            TimelineKind::Home => (format!("/2/users/{account_id}/timelines/reverse_chronological"), vec![]),
            TimelineKind::Mentions => (format!("/2/users/{account_id}/mentions"), vec![]),
            TimelineKind::User(id) => (format!("/2/users/{id}/tweets"), vec![]),
            TimelineKind::Search(q) => ("/2/tweets/search/recent".to_string(), vec![("query", q.clone())]),
            TimelineKind::Conversation | TimelineKind::Custom(_) => return None,
        };

        let client = self.clone();
        let kind = kind.clone();
        Some(Arc::new(move |page_size: u32, cursor: Option<String>| {
            let (client, path, query) = (client.clone(), path.clone(), query.clone());
            let max_results = Self::effective_page_size(&kind, page_size);
            async move { client.fetch_timeline(&path, query, max_results, cursor).await }.boxed()
        }))
    }

    /// One page of a v2 timeline endpoint, newest first, strictly older than `until_id`.
    pub async fn fetch_timeline(
        &self,
        path: &str,
        mut query: Vec<(&'static str, String)>,
        max_results: u32,
        until_id: Option<String>,
    ) -> Result<Vec<Post>, FetchError> {
        query.push(("max_results", max_results.to_string()));
        if let Some(id) = until_id {
            query.push(("until_id", id));
        }
        let res: TwitterResponse<Vec<TwitterRawTweet>> = self.get(path, query).await?;
        Ok(into_posts(res.data.unwrap_or_default(), &res.includes))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        mut query: Vec<(&'static str, String)>,
    ) -> Result<TwitterResponse<T>, FetchError> {
        query.extend([
            ("tweet.fields", TWEET_FIELDS.to_string()),
            ("expansions", "author_id,attachments.media_keys".to_string()),
            ("media.fields", "type,url,variants".to_string()),
            ("user.fields", "name,username".to_string()),
        ]);

        debug!(path, "GET twitter");
        let res = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .query(&query)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await?;

        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(service_error(status.as_u16(), &text));
        }

        let body: TwitterResponse<T> = serde_json::from_str(&text)?;
        if body.data.is_none() {
            if let Some(message) = body.errors.iter().flatten().find_map(TwitterRawError::text) {
                return Err(FetchError::Service { status: status.as_u16(), message: message.to_string() });
            }
        }
        Ok(body)
    }
}

#[async_trait]
impl ConversationService for TwitterClient {
    async fn search_conversation(
        &self,
        conversation_id: &str,
        count: u32,
        next_page: Option<&str>,
    ) -> Result<SearchPage, FetchError> {
        let mut query = vec![
            ("query", format!("conversation_id:{conversation_id}")),
            ("max_results", count.clamp(10, MAX_PAGE).to_string()),
        ];
        if let Some(token) = next_page {
            query.push(("next_token", token.to_string()));
        }
        let res: TwitterResponse<Vec<TwitterRawTweet>> = self.get("/2/tweets/search/recent", query).await?;
        Ok(SearchPage {
            posts: into_posts(res.data.unwrap_or_default(), &res.includes),
            next_page: res.meta.and_then(|m| m.next_token),
        })
    }

    async fn lookup(&self, id: &str) -> Result<Post, FetchError> {
        let res: TwitterResponse<TwitterRawTweet> = self.get(&format!("/2/tweets/{id}"), vec![]).await?;
        let tweet = res.data.ok_or_else(|| FetchError::Service {
            status: 404,
            message: format!("tweet {id} not found"),
        })?;
        Ok(into_posts(vec![tweet], &res.includes).remove(0))
    }
}

/// Smallest `max_results` the endpoint for `kind` accepts.
fn min_page(kind: &TimelineKind) -> u32 {
    match kind {
        TimelineKind::Home => 1,
        TimelineKind::Search(_) => 10,
        _ => 5,
    }
}

fn service_error(status: u16, body: &str) -> FetchError {
    let message = serde_json::from_str::<TwitterErrorResponse>(body)
        .ok()
        .and_then(|e| {
            e.detail
                .or(e.title)
                .or_else(|| e.errors.iter().flatten().find_map(|r| r.text().map(str::to_string)))
        })
        .unwrap_or_else(|| "(foxline) unreadable error response".into());
    FetchError::Service { status, message }
}

fn into_posts(data: Vec<TwitterRawTweet>, includes: &TwitterTimelineIncludes) -> Vec<Post> {
    let media_by_key: HashMap<&str, &TwitterTimelineMedia> =
        includes.media.iter().map(|m| (m.media_key.as_str(), m)).collect();
    let users: HashMap<&str, &TwitterRawUser> = includes.users.iter().map(|u| (u.id.as_str(), u)).collect();

    data.into_iter()
        .map(|tweet| {
            let author = tweet
                .author_id
                .as_deref()
                .map(|id| match users.get(id) {
                    Some(u) => Author { id: u.id.clone(), handle: u.username.clone(), name: u.name.clone() },
                    None => Author { id: id.to_string(), ..Default::default() },
                })
                .unwrap_or_default();

            let media = tweet
                .attachments
                .map(|a| a.media_keys)
                .unwrap_or_default()
                .iter()
                .filter_map(|key| media_by_key.get(key.as_str()))
                .filter_map(|m| {
                    if m.r#type == "photo" {
                        m.url.clone().map(PostMedia::Photo)
                    } else {
                        m.variants
                            .as_ref()?
                            .iter()
                            .max_by_key(|v| v.bitrate)
                            .map(|v| PostMedia::Video(v.url.clone()))
                    }
                })
                .collect();

            let referenced = tweet
                .referenced_tweets
                .unwrap_or_default()
                .into_iter()
                .filter_map(|r| {
                    let kind = match r.r#type.as_str() {
                        "replied_to" => ReferenceKind::RepliedTo,
                        "quoted" => ReferenceKind::Quoted,
                        "retweeted" => ReferenceKind::Retweeted,
                        _ => return None,
                    };
                    Some(ReferencedPost { kind, id: r.id })
                })
                .collect();

            let m = tweet.public_metrics.unwrap_or_default();
            Post {
                id: tweet.id,
                author,
                text: tweet.text,
                created_at: tweet.created_at,
                media,
                referenced,
                metrics: PostMetrics {
                    replies: m.reply_count,
                    reposts: m.retweet_count,
                    likes: m.like_count,
                    quotes: m.quote_count,
                },
                conversation_id: tweet.conversation_id,
            }
        })
        .collect()
}
