use super::{FeedObject, FeedPayload, FeedPost, FetchedPayload, PublishReceipt, SnapshotFeed};
use crate::core::{FeedReference, LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredPost {
    reference: FeedReference,
    timestamp: DateTime<Utc>,
    payloads: Vec<FeedPayload>,
}

#[derive(Debug, Default)]
struct FeedState {
    posts: Vec<StoredPost>,
    last_timestamp: Option<DateTime<Utc>>,
    failing_publishes: u32,
    failing_lists: u32,
    failing_fetches: u32,
    publish_calls: u64,
}

impl FeedState {
    /// Server clock: wall time, but strictly increasing across posts.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let timestamp = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(timestamp);
        timestamp
    }
}

/// A feed held in process memory.
///
/// Clones share the same posts, so several service instances built on clones
/// of one feed behave like processes sharing one chat channel.
#[derive(Clone)]
pub struct InMemoryFeed {
    state: Arc<Mutex<FeedState>>,
    max_payloads: usize,
}

impl Default for InMemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFeed {
    /// Creates an empty feed with the usual ten-attachment post limit.
    pub fn new() -> Self {
        Self::with_max_payloads(10)
    }

    pub fn with_max_payloads(max_payloads: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(FeedState::default())),
            max_payloads,
        }
    }

    /// Makes the next `count` publish calls fail with a transient error.
    pub async fn fail_next_publishes(&self, count: u32) {
        self.state.lock().await.failing_publishes = count;
    }

    /// Makes the next `count` history scans fail with a transient error.
    pub async fn fail_next_lists(&self, count: u32) {
        self.state.lock().await.failing_lists = count;
    }

    /// Makes the next `count` payload downloads fail with a transient error.
    pub async fn fail_next_fetches(&self, count: u32) {
        self.state.lock().await.failing_fetches = count;
    }

    /// Publish calls that reached the feed, failed ones included.
    pub async fn publish_calls(&self) -> u64 {
        self.state.lock().await.publish_calls
    }

    pub async fn post_count(&self) -> usize {
        self.state.lock().await.posts.len()
    }

    /// Appends a post bypassing capacity checks and fault injection.
    pub async fn append_raw(&self, payloads: Vec<FeedPayload>) -> PublishReceipt {
        let mut state = self.state.lock().await;
        Self::append(&mut state, payloads)
    }

    fn append(state: &mut FeedState, payloads: Vec<FeedPayload>) -> PublishReceipt {
        let timestamp = state.next_timestamp();
        let reference = FeedReference::new(Uuid::new_v4().to_string());
        state.posts.push(StoredPost {
            reference: reference.clone(),
            timestamp,
            payloads,
        });
        PublishReceipt {
            reference,
            timestamp,
        }
    }
}

#[async_trait]
impl SnapshotFeed for InMemoryFeed {
    fn max_payloads(&self) -> usize {
        self.max_payloads
    }

    async fn publish(&self, payloads: Vec<FeedPayload>) -> Result<PublishReceipt> {
        let mut state = self.state.lock().await;
        state.publish_calls += 1;

        if payloads.len() > self.max_payloads {
            return Err(LedgerError::Capacity {
                limit: self.max_payloads,
                requested: payloads.len(),
            });
        }
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(LedgerError::Transient("injected publish failure".to_string()));
        }

        Ok(Self::append(&mut state, payloads))
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<FeedPost>> {
        let mut state = self.state.lock().await;
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(LedgerError::Transient("injected history failure".to_string()));
        }

        Ok(state
            .posts
            .iter()
            .rev()
            .take(limit)
            .map(|post| FeedPost {
                reference: post.reference.clone(),
                timestamp: post.timestamp,
                objects: post
                    .payloads
                    .iter()
                    .map(|payload| FeedObject {
                        name: payload.name.clone(),
                        size: payload.bytes.len(),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn fetch(&self, reference: &FeedReference, name: &str) -> Result<FetchedPayload> {
        let mut state = self.state.lock().await;
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(LedgerError::Transient("injected download failure".to_string()));
        }
        let post = state
            .posts
            .iter()
            .find(|post| &post.reference == reference)
            .ok_or_else(|| LedgerError::SnapshotNotFound {
                dataset: name.to_string(),
                reference: Some(reference.to_string()),
            })?;
        let payload = post
            .payloads
            .iter()
            .find(|payload| payload.name == name)
            .ok_or_else(|| LedgerError::SnapshotNotFound {
                dataset: name.to_string(),
                reference: Some(reference.to_string()),
            })?;

        Ok(FetchedPayload {
            reference: post.reference.clone(),
            timestamp: post.timestamp,
            bytes: payload.bytes.clone(),
        })
    }
}
