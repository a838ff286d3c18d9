//! Turns a chat message into a deduplicated list of work items.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::message::{Attachment, ChatMessage, Embed, StickerFormat, Sticker};
use super::refresh::AttachmentRefresher;
use super::toggles::{ToggleCache, ToggleCacheConfig};
use super::urls::{
    extension_of, extract_custom_emoji, extract_text_urls, host_matches, is_http,
    is_media_extension, is_motion_extension, normalise_candidate_url,
};
use super::work_item::{ItemMetadata, MediaSource, MediaWorkItem};
use crate::services::{MessageSource, TenantSettings};

/// Configuration for media collection.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Base for relative attachment paths and custom emoji URLs.
    pub cdn_base: String,
    pub max_text_urls: usize,
    /// Host serving GIFs that also has MP4 renditions.
    pub motion_gif_host: String,
    /// Tenant toggle gating the motion-GIF host.
    pub motion_gif_toggle: String,
    /// Hosts whose embeds repeat the same asset across fields; at most one
    /// item per embed is taken from them.
    pub rich_hosts: Vec<String>,
    pub hydration_timeout: Duration,
    pub refresh_timeout: Duration,
    pub toggles: ToggleCacheConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            cdn_base: "https://cdn.discordapp.com".to_string(),
            max_text_urls: 20,
            motion_gif_host: "tenor.com".to_string(),
            motion_gif_toggle: "check-tenor-gifs".to_string(),
            rich_hosts: vec!["tenor.com".to_string(), "giphy.com".to_string()],
            hydration_timeout: Duration::from_secs(4),
            refresh_timeout: Duration::from_secs(5),
            toggles: ToggleCacheConfig::default(),
        }
    }
}

/// Parts of a message media is collected from: the message's own, or its
/// first forwarded snapshot's when the message has none.
struct Sources<'a> {
    attachments: &'a [Attachment],
    embeds: &'a [Embed],
    stickers: &'a [Sticker],
    texts: Vec<&'a str>,
    base: ItemMetadata,
}

impl<'a> Sources<'a> {
    fn of(message: &'a ChatMessage) -> Self {
        let snapshot = message.snapshots.first();

        let attachments = match snapshot {
            Some(s) if message.attachments.is_empty() => s.attachments.as_slice(),
            _ => message.attachments.as_slice(),
        };
        let embeds = match snapshot {
            Some(s) if message.embeds.is_empty() => s.embeds.as_slice(),
            _ => message.embeds.as_slice(),
        };
        let stickers = match snapshot {
            Some(s) if message.stickers.is_empty() => s.stickers.as_slice(),
            _ => message.stickers.as_slice(),
        };

        let mut texts = vec![message.content.as_str()];
        if let Some(s) = snapshot {
            texts.push(s.content.as_str());
        }

        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        let message_id = Some(message.id.clone()).filter(|s| !s.is_empty());
        let base = ItemMetadata {
            message_id: message_id.or_else(|| snapshot.and_then(|s| non_empty(&s.message_id))),
            channel_id: non_empty(&message.channel_id)
                .or_else(|| snapshot.and_then(|s| non_empty(&s.channel_id))),
            guild_id: non_empty(&message.guild_id)
                .or_else(|| snapshot.and_then(|s| non_empty(&s.guild_id))),
            ..Default::default()
        };

        Self {
            attachments,
            embeds,
            stickers,
            texts,
            base,
        }
    }

    fn is_empty(&self) -> bool {
        self.attachments.is_empty() && self.embeds.is_empty() && self.stickers.is_empty()
    }
}

/// Extracts work items from messages.
pub struct MediaCollector {
    config: CollectorConfig,
    toggles: ToggleCache,
    settings: Arc<dyn TenantSettings>,
    message_source: Option<Arc<dyn MessageSource>>,
}

impl MediaCollector {
    pub fn new(
        config: CollectorConfig,
        settings: Arc<dyn TenantSettings>,
        message_source: Option<Arc<dyn MessageSource>>,
    ) -> Self {
        let toggles = ToggleCache::new(config.toggles.clone());
        Self {
            config,
            toggles,
            settings,
            message_source,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Work items for `message`, or `None` when it references no media.
    /// A returned list is never empty and never repeats a cache key.
    pub async fn collect(&self, message: &ChatMessage, tenant_id: &str) -> Option<Vec<MediaWorkItem>> {
        let hydrated = self.hydrate(message).await;
        let message = hydrated.as_ref().unwrap_or(message);

        let sources = Sources::of(message);
        let mut builder = ItemsBuilder::new(self, tenant_id);

        for attachment in sources.attachments {
            builder.add_attachment(attachment, &sources.base);
        }
        for embed in sources.embeds {
            builder.add_embed(embed, &sources.base).await;
        }
        for sticker in sources.stickers {
            builder.add_sticker(sticker, &sources.base);
        }
        for text in &sources.texts {
            builder.add_text_urls(text, &sources.base).await;
        }
        for text in &sources.texts {
            builder.add_custom_emoji(text, &sources.base);
        }

        let items = builder.finish();
        debug!(
            message_id = %message.id,
            count = items.len(),
            "Collected media work items"
        );
        if items.is_empty() {
            None
        } else {
            Some(items)
        }
    }

    /// Single work item for a bare URL.
    pub fn build_url_item(&self, url: &str) -> Option<MediaWorkItem> {
        let url = normalise_candidate_url(None, url, &self.config.cdn_base)?;
        let ext = extension_of(&url);
        let motion_host = host_matches(&url, &self.config.motion_gif_host);
        let prefer_video = motion_host || ext.as_deref().is_some_and(is_motion_extension);
        Some(
            MediaWorkItem::new(
                MediaSource::DirectUrl,
                url.clone(),
                url,
                ItemMetadata {
                    motion_host,
                    ..Default::default()
                },
            )
            .with_extension_hint(ext)
            .with_prefer_video(prefer_video),
        )
    }

    /// URL refresher for `item`, when it is an attachment we can re-fetch.
    pub fn refresher_for(&self, item: &MediaWorkItem) -> Option<AttachmentRefresher> {
        let source = self.message_source.clone()?;
        AttachmentRefresher::for_item(source, item, self.config.refresh_timeout)
    }

    /// Re-fetches a message once when it has no media of its own but its
    /// text looks like it links to some; previews are often attached late.
    async fn hydrate(&self, message: &ChatMessage) -> Option<ChatMessage> {
        if !Sources::of(message).is_empty() || !message.looks_like_it_has_link() {
            return None;
        }
        let source = self.message_source.as_ref()?;
        let channel_id = message.channel_id.as_deref()?;

        match tokio::time::timeout(
            self.config.hydration_timeout,
            source.fetch_message(channel_id, &message.id),
        )
        .await
        {
            Ok(Ok(Some(fresh))) => Some(fresh),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                debug!(message_id = %message.id, "Hydration fetch failed: {}", e);
                None
            }
            Err(_) => {
                debug!(message_id = %message.id, "Hydration timed out");
                None
            }
        }
    }
}

/// Accumulates items for one message.
struct ItemsBuilder<'a> {
    collector: &'a MediaCollector,
    tenant_id: &'a str,
    items: Vec<MediaWorkItem>,
    seen_urls: HashSet<String>,
    motion_allowed: Option<bool>,
}

impl<'a> ItemsBuilder<'a> {
    fn new(collector: &'a MediaCollector, tenant_id: &'a str) -> Self {
        Self {
            collector,
            tenant_id,
            items: Vec::new(),
            seen_urls: HashSet::new(),
            motion_allowed: None,
        }
    }

    fn config(&self) -> &CollectorConfig {
        &self.collector.config
    }

    /// Toggle for the motion-GIF host, looked up at most once per message.
    async fn motion_allowed(&mut self) -> bool {
        if let Some(allowed) = self.motion_allowed {
            return allowed;
        }
        let allowed = self
            .collector
            .toggles
            .get(
                self.collector.settings.as_ref(),
                self.tenant_id,
                &self.collector.config.motion_gif_toggle,
                true,
            )
            .await;
        self.motion_allowed = Some(allowed);
        allowed
    }

    fn add_attachment(&mut self, attachment: &Attachment, base: &ItemMetadata) {
        let metadata = ItemMetadata {
            cache_key: attachment
                .content_hash
                .as_deref()
                .filter(|h| !h.is_empty())
                .map(|h| format!("hash::{}", h)),
            attachment_id: Some(attachment.id.clone()).filter(|s| !s.is_empty()),
            filename: Some(attachment.filename.clone()).filter(|s| !s.is_empty()),
            size_hint: attachment.size,
            ..base.clone()
        };
        let ext = extension_of(&attachment.filename);

        // Resolve with a provisional item so bare filenames can use the ids
        let probe = MediaWorkItem::new(
            MediaSource::Attachment,
            attachment.filename.clone(),
            String::new(),
            metadata.clone(),
        );
        let cdn = &self.config().cdn_base;
        let mut resolved: Vec<String> = Vec::new();
        for candidate in [&attachment.proxy_url, &attachment.url].into_iter().flatten() {
            if let Some(url) = normalise_candidate_url(Some(&probe), candidate, cdn) {
                if !resolved.contains(&url) {
                    resolved.push(url);
                }
            }
        }
        if resolved.is_empty() {
            if let Some(url) = normalise_candidate_url(Some(&probe), &attachment.filename, cdn) {
                resolved.push(url);
            }
        }
        let mut urls = resolved.into_iter();
        let Some(primary) = urls.next() else {
            debug!(attachment_id = %attachment.id, "Dropping attachment without a usable URL");
            return;
        };

        let label = if attachment.filename.is_empty() {
            primary.clone()
        } else {
            attachment.filename.clone()
        };
        let mut item = MediaWorkItem::new(MediaSource::Attachment, label, primary, metadata)
            .with_extension_hint(ext);
        for url in urls {
            item = item.with_fallback(url);
        }
        for url in item.candidate_urls() {
            self.seen_urls.insert(url);
        }
        self.items.push(item);
    }

    async fn add_embed(&mut self, embed: &Embed, base: &ItemMetadata) {
        let mut rich_added = false;
        for media in embed.media() {
            let Some(candidate) = media.preferred_url() else {
                continue;
            };
            let Some(primary) = self.resolve_embed_url(candidate) else {
                continue;
            };
            if !is_http(&primary) || self.seen_urls.contains(&primary) {
                continue;
            }

            let motion_host = host_matches(&primary, &self.config().motion_gif_host);
            let rich = motion_host
                || self
                    .config()
                    .rich_hosts
                    .iter()
                    .any(|host| host_matches(&primary, host));
            if rich {
                if rich_added {
                    continue;
                }
                if motion_host && !self.motion_allowed().await {
                    continue;
                }
                rich_added = true;
            }

            self.seen_urls.insert(primary.clone());
            let ext = extension_of(&primary);
            let mut item = MediaWorkItem::new(
                MediaSource::Embed,
                primary.clone(),
                primary,
                ItemMetadata {
                    motion_host,
                    ..base.clone()
                },
            )
            .with_extension_hint(ext)
            .with_prefer_video(motion_host);

            // Origin URL as fallback when the proxy was preferred
            if let Some(origin) = media.url.as_deref() {
                if let Some(origin) = self.resolve_embed_url(origin).filter(|u| is_http(u)) {
                    item = item.with_fallback(origin);
                }
            }
            self.items.push(item);
        }
    }

    /// Resolves `attachment://name` against the message's attachments.
    fn resolve_embed_url(&self, candidate: &str) -> Option<String> {
        if let Some(name) = candidate.strip_prefix("attachment://") {
            let name = name.trim_start_matches('/');
            if name.is_empty() {
                return None;
            }
            return self
                .items
                .iter()
                .find(|i| {
                    i.source == MediaSource::Attachment
                        && i.metadata.filename.as_deref() == Some(name)
                })
                .map(|i| i.primary_url.clone());
        }
        normalise_candidate_url(None, candidate, &self.config().cdn_base)
    }

    fn add_sticker(&mut self, sticker: &Sticker, base: &ItemMetadata) {
        let Some(url) = sticker.url.as_deref().filter(|u| is_http(u)) else {
            return;
        };
        if sticker.format == StickerFormat::Lottie {
            debug!(sticker_id = %sticker.id, "Skipping Lottie sticker");
            return;
        }
        let label = if sticker.name.is_empty() {
            url.to_string()
        } else {
            sticker.name.clone()
        };
        self.seen_urls.insert(url.to_string());
        self.items.push(
            MediaWorkItem::new(
                MediaSource::Sticker,
                label,
                url,
                ItemMetadata {
                    sticker_format: Some(sticker.format),
                    ..base.clone()
                },
            )
            .with_extension_hint(Some(sticker.format.extension().to_string())),
        );
    }

    async fn add_text_urls(&mut self, text: &str, base: &ItemMetadata) {
        if text.is_empty() {
            return;
        }
        for url in extract_text_urls(text, self.config().max_text_urls) {
            if self.seen_urls.contains(&url) {
                continue;
            }
            let motion_host = host_matches(&url, &self.config().motion_gif_host);
            if motion_host && !self.motion_allowed().await {
                continue;
            }
            let ext = extension_of(&url);
            let is_media = ext.as_deref().is_some_and(is_media_extension);
            if !motion_host && !is_media {
                continue;
            }
            let prefer_video = motion_host || ext.as_deref().is_some_and(is_motion_extension);
            self.seen_urls.insert(url.clone());
            self.items.push(
                MediaWorkItem::new(
                    MediaSource::DirectUrl,
                    url.clone(),
                    url,
                    ItemMetadata {
                        motion_host,
                        ..base.clone()
                    },
                )
                .with_extension_hint(ext)
                .with_prefer_video(prefer_video),
            );
        }
    }

    fn add_custom_emoji(&mut self, text: &str, base: &ItemMetadata) {
        for emoji in extract_custom_emoji(text) {
            let url = emoji.url(&self.config().cdn_base);
            if !self.seen_urls.insert(url.clone()) {
                continue;
            }
            let ext = if emoji.animated { ".gif" } else { ".png" };
            self.items.push(
                MediaWorkItem::new(
                    MediaSource::Emoji,
                    format!(":{}:", emoji.name),
                    url,
                    base.clone(),
                )
                .with_extension_hint(Some(ext.to_string())),
            );
        }
    }

    /// Items in collection order, first occurrence of each cache key kept.
    fn finish(self) -> Vec<MediaWorkItem> {
        let mut keys: HashSet<String> = HashSet::new();
        self.items
            .into_iter()
            .filter(|item| keys.insert(item.cache_key().to_string()))
            .collect()
    }
}
