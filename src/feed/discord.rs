//! Feed backed by a Discord text channel.
//!
//! Each snapshot post is a bot message with one `<dataset>.json` attachment
//! per payload.

use super::{FeedObject, FeedPayload, FeedPost, FetchedPayload, PublishReceipt, SnapshotFeed};
use crate::core::{FeedReference, LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

const API_BASE: &str = "https://discord.com/api/v10";
const PAYLOAD_SUFFIX: &str = ".json";
/// Discord caps attachments per message and messages per history page.
const MAX_ATTACHMENTS: usize = 10;
const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    timestamp: String,
    #[serde(default)]
    attachments: Vec<DiscordAttachment>,
}

#[derive(Debug, Deserialize)]
struct DiscordAttachment {
    filename: String,
    size: usize,
    url: String,
}

impl DiscordMessage {
    fn timestamp(&self) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| LedgerError::Feed(format!("message {} has bad timestamp: {}", self.id, e)))
    }

    fn into_post(self) -> Result<FeedPost> {
        let timestamp = self.timestamp()?;
        let objects = self
            .attachments
            .iter()
            .filter_map(|attachment| {
                payload_name(&attachment.filename).map(|name| FeedObject {
                    name: name.to_string(),
                    size: attachment.size,
                })
            })
            .collect();
        Ok(FeedPost {
            reference: FeedReference::new(self.id),
            timestamp,
            objects,
        })
    }
}

fn file_name(payload: &str) -> String {
    format!("{}{}", payload, PAYLOAD_SUFFIX)
}

fn payload_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(PAYLOAD_SUFFIX)
        .filter(|name| !name.is_empty())
}

fn status_error(context: &str, status: StatusCode) -> LedgerError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        LedgerError::Transient(format!("{}: status {}", context, status))
    } else {
        LedgerError::Feed(format!("{}: status {}", context, status))
    }
}

fn request_error(context: &str, err: reqwest::Error) -> LedgerError {
    if err.is_builder() {
        LedgerError::Feed(format!("{}: {}", context, err))
    } else {
        LedgerError::Transient(format!("{}: {}", context, err))
    }
}

pub struct DiscordFeed {
    client: Client,
    token: String,
    channel_id: String,
}

impl DiscordFeed {
    pub fn new(token: &str, channel_id: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LedgerError::Config(e.to_string()))?;

        Ok(Self {
            client,
            token: token.to_string(),
            channel_id: channel_id.to_string(),
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}{}", API_BASE, endpoint)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("Authorization", format!("Bot {}", self.token))
    }

    async fn send_json<T: DeserializeOwned>(&self, context: &str, request: RequestBuilder) -> Result<T> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| request_error(context, e))?;

        if !response.status().is_success() {
            return Err(status_error(context, response.status()));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| LedgerError::Feed(format!("{}: unreadable response: {}", context, e)))
    }

    async fn history_page(&self, limit: usize, before: Option<&str>) -> Result<Vec<DiscordMessage>> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }
        let request = self
            .client
            .get(self.api_url(&format!("/channels/{}/messages", self.channel_id)))
            .query(&query);
        self.send_json("list channel messages", request).await
    }
}

#[async_trait]
impl SnapshotFeed for DiscordFeed {
    fn max_payloads(&self) -> usize {
        MAX_ATTACHMENTS
    }

    async fn publish(&self, payloads: Vec<FeedPayload>) -> Result<PublishReceipt> {
        if payloads.len() > MAX_ATTACHMENTS {
            return Err(LedgerError::Capacity {
                limit: MAX_ATTACHMENTS,
                requested: payloads.len(),
            });
        }

        let names: Vec<&str> = payloads.iter().map(|p| p.name.as_str()).collect();
        let attachments: Vec<serde_json::Value> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| serde_json::json!({ "id": i, "filename": file_name(&p.name) }))
            .collect();
        let body = serde_json::json!({
            "content": format!("snapshot: {}", names.join(", ")),
            "attachments": attachments,
        });

        let mut form = Form::new().text("payload_json", body.to_string());
        for (i, payload) in payloads.into_iter().enumerate() {
            let part = Part::bytes(payload.bytes)
                .file_name(file_name(&payload.name))
                .mime_str("application/json")
                .map_err(|e| LedgerError::Feed(e.to_string()))?;
            form = form.part(format!("files[{}]", i), part);
        }

        let request = self
            .client
            .post(self.api_url(&format!("/channels/{}/messages", self.channel_id)))
            .multipart(form);
        let message: DiscordMessage = self.send_json("post snapshot", request).await?;
        let timestamp = message.timestamp()?;
        debug!(reference = %message.id, "published snapshot message");

        Ok(PublishReceipt {
            reference: FeedReference::new(message.id),
            timestamp,
        })
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<FeedPost>> {
        let mut posts = Vec::new();
        let mut before: Option<String> = None;

        while posts.len() < limit {
            let page_size = (limit - posts.len()).min(PAGE_SIZE);
            let page = self.history_page(page_size, before.as_deref()).await?;
            let exhausted = page.len() < page_size;
            before = page.last().map(|message| message.id.clone());

            for message in page {
                posts.push(message.into_post()?);
            }
            if exhausted || before.is_none() {
                break;
            }
        }

        Ok(posts)
    }

    async fn fetch(&self, reference: &FeedReference, name: &str) -> Result<FetchedPayload> {
        let request = self.client.get(self.api_url(&format!(
            "/channels/{}/messages/{}",
            self.channel_id, reference
        )));
        let message: DiscordMessage = self.send_json("get snapshot message", request).await?;
        let timestamp = message.timestamp()?;

        let wanted = file_name(name);
        let attachment = message
            .attachments
            .iter()
            .find(|attachment| attachment.filename == wanted)
            .ok_or_else(|| LedgerError::SnapshotNotFound {
                dataset: name.to_string(),
                reference: Some(reference.to_string()),
            })?;

        // Attachment URLs are signed CDN links and take no bot token.
        let response = self
            .client
            .get(&attachment.url)
            .send()
            .await
            .map_err(|e| request_error("download attachment", e))?;
        if !response.status().is_success() {
            return Err(status_error("download attachment", response.status()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| request_error("read attachment", e))?;

        Ok(FetchedPayload {
            reference: reference.clone(),
            timestamp,
            bytes: bytes.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url() {
        let feed = DiscordFeed::new("TEST_TOKEN", "123", Duration::from_secs(5)).unwrap();
        let url = feed.api_url("/channels/123/messages");
        assert!(url.starts_with("https://discord.com/api/v10"));
        assert!(url.ends_with("channels/123/messages"));
    }

    #[test]
    fn test_payload_file_names() {
        assert_eq!(file_name("bank"), "bank.json");
        assert_eq!(payload_name("bank.json"), Some("bank"));
        assert_eq!(payload_name("avatar.png"), None);
        assert_eq!(payload_name(".json"), None);
    }

    #[test]
    fn test_message_into_post_keeps_json_attachments() {
        let message: DiscordMessage = serde_json::from_value(serde_json::json!({
            "id": "1100",
            "timestamp": "2024-03-01T12:00:00.000000+00:00",
            "attachments": [
                { "filename": "balances.json", "size": 12, "url": "https://cdn/a" },
                { "filename": "chart.png", "size": 99, "url": "https://cdn/b" }
            ]
        }))
        .unwrap();

        let post = message.into_post().unwrap();
        assert_eq!(post.reference.as_str(), "1100");
        assert_eq!(post.objects.len(), 1);
        assert!(post.carries("balances"));
        assert_eq!(post.timestamp.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_status_classification() {
        assert!(status_error("x", StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(status_error("x", StatusCode::BAD_GATEWAY).is_transient());
        assert!(!status_error("x", StatusCode::FORBIDDEN).is_transient());
    }
}
