//! The shared, append-only feed snapshots are published to.
//!
//! A feed is a sequence of immutable posts. Each post carries zero or more
//! named payloads. Posts are never edited; newer posts supersede older ones
//! by timestamp.

pub mod discord;
pub mod memory;
pub mod retry;

use crate::core::{FeedReference, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use discord::DiscordFeed;
pub use memory::InMemoryFeed;
pub use retry::call_with_retry;

/// A named payload to attach to a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPayload {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl FeedPayload {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// A payload as listed in history; its bytes are fetched on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedObject {
    pub name: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPost {
    pub reference: FeedReference,
    pub timestamp: DateTime<Utc>,
    pub objects: Vec<FeedObject>,
}

impl FeedPost {
    pub fn carries(&self, name: &str) -> bool {
        self.objects.iter().any(|object| object.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub reference: FeedReference,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPayload {
    pub reference: FeedReference,
    pub timestamp: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

/// Backend-agnostic storage protocol over a shared feed.
#[async_trait]
pub trait SnapshotFeed: Send + Sync {
    /// Most payloads one post may carry.
    fn max_payloads(&self) -> usize;

    /// Appends one post carrying `payloads`.
    ///
    /// Fails with `Capacity` when `payloads` exceeds [`max_payloads`](Self::max_payloads).
    async fn publish(&self, payloads: Vec<FeedPayload>) -> Result<PublishReceipt>;

    /// The `limit` most recent posts, newest first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<FeedPost>>;

    /// Downloads the payload called `name` from the post at `reference`.
    async fn fetch(&self, reference: &FeedReference, name: &str) -> Result<FetchedPayload>;
}

/// Newest post carrying `name`, if any. `posts` may be in any order.
pub fn latest_for<'a>(posts: &'a [FeedPost], name: &str) -> Option<&'a FeedPost> {
    posts
        .iter()
        .filter(|post| post.carries(name))
        .max_by_key(|post| post.timestamp)
}
