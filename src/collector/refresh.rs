//! Re-signing expired attachment URLs by re-fetching the owning message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::message::{Attachment, ChatMessage};
use super::urls::is_http;
use super::work_item::{MediaSource, MediaWorkItem};
use crate::download_manager::UrlRefresher;
use crate::services::MessageSource;

/// Fetches the message an attachment belongs to and returns the
/// attachment's current URLs.
pub struct AttachmentRefresher {
    source: Arc<dyn MessageSource>,
    channel_id: String,
    message_id: String,
    attachment_id: String,
    timeout: Duration,
}

impl AttachmentRefresher {
    /// `None` unless the item is an attachment carrying all three ids.
    pub fn for_item(
        source: Arc<dyn MessageSource>,
        item: &MediaWorkItem,
        timeout: Duration,
    ) -> Option<Self> {
        if item.source != MediaSource::Attachment {
            return None;
        }
        let meta = &item.metadata;
        Some(Self {
            source,
            channel_id: meta.channel_id.clone()?,
            message_id: meta.message_id.clone()?,
            attachment_id: meta.attachment_id.clone()?,
            timeout,
        })
    }

    fn find_attachment<'a>(&self, message: &'a ChatMessage) -> Option<&'a Attachment> {
        message
            .attachments
            .iter()
            .chain(message.snapshots.iter().flat_map(|s| s.attachments.iter()))
            .find(|a| a.id == self.attachment_id)
    }
}

#[async_trait]
impl UrlRefresher for AttachmentRefresher {
    async fn refreshed_urls(&self) -> Vec<String> {
        let fetched = tokio::time::timeout(
            self.timeout,
            self.source.fetch_message(&self.channel_id, &self.message_id),
        )
        .await;

        let message = match fetched {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => {
                debug!(message_id = %self.message_id, "Message gone, cannot refresh URL");
                return Vec::new();
            }
            Ok(Err(e)) => {
                debug!(message_id = %self.message_id, "Message fetch failed: {}", e);
                return Vec::new();
            }
            Err(_) => {
                debug!(message_id = %self.message_id, "Message fetch timed out");
                return Vec::new();
            }
        };

        let Some(attachment) = self.find_attachment(&message) else {
            return Vec::new();
        };

        let mut urls: Vec<String> = Vec::new();
        for candidate in [&attachment.proxy_url, &attachment.url].into_iter().flatten() {
            if is_http(candidate) && !urls.contains(candidate) {
                urls.push(candidate.clone());
            }
        }
        urls
    }
}
