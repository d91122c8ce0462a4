use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generic microblog post, as fetched from a remote source.
/// Owned by the remote service, never edited locally.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Post id as given by the service. Also used as paging cursor.
    pub id: String,
    pub author: Author,
    /// Post text. May be empty string if not exists.
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Post media (photo, video, etc).
    /// May be empty
    #[serde(default)]
    pub media: Vec<PostMedia>,
    /// Replies, quotes and reposts this post points at.
    #[serde(default)]
    pub referenced: Vec<ReferencedPost>,
    #[serde(default)]
    pub metrics: PostMetrics,
    /// Id of the first post of the thread this post belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    /// Handle without `@`
    pub handle: String,
    pub name: String,
}

/// Generic media in a post.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "url", rename_all = "snake_case")]
pub enum PostMedia {
    /// Photo. .png, .jpeg or etc... (NOT GIF)
    Photo(String),
    /// Video or GIF. Highest bitrate variant.
    Video(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    RepliedTo,
    Quoted,
    Retweeted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencedPost {
    pub kind: ReferenceKind,
    pub id: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMetrics {
    pub replies: u64,
    pub reposts: u64,
    pub likes: u64,
    pub quotes: u64,
}

impl Post {
    /// Id of the post this one replies to, if any.
    pub fn replied_to(&self) -> Option<&str> {
        self.referenced
            .iter()
            .find(|r| r.kind == ReferenceKind::RepliedTo)
            .map(|r| r.id.as_str())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replied_to_skips_quotes() {
        let mut p = fixtures::post("2", None);
        p.referenced = vec![
            ReferencedPost { kind: ReferenceKind::Quoted, id: "7".into() },
            ReferencedPost { kind: ReferenceKind::RepliedTo, id: "1".into() },
        ];
        assert_eq!(p.replied_to(), Some("1"));
        assert_eq!(fixtures::post("3", None).replied_to(), None);
    }

    #[test]
    fn media_serializes_tagged() {
        let json = serde_json::to_value(PostMedia::Photo("https://x/p.png".into())).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "photo", "url": "https://x/p.png" }));
    }
}
