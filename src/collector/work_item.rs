//! Normalized media references.

use std::collections::BTreeMap;

use serde::Serialize;

use super::message::StickerFormat;

/// Where in the message a work item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSource {
    Attachment,
    Embed,
    Sticker,
    Emoji,
    DirectUrl,
}

impl MediaSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaSource::Attachment => "attachment",
            MediaSource::Embed => "embed",
            MediaSource::Sticker => "sticker",
            MediaSource::Emoji => "emoji",
            MediaSource::DirectUrl => "direct_url",
        }
    }
}

/// Ids and hints carried alongside a work item.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ItemMetadata {
    /// Platform-native identity, overrides the URL-derived cache key.
    pub cache_key: Option<String>,
    pub message_id: Option<String>,
    pub channel_id: Option<String>,
    pub guild_id: Option<String>,
    pub attachment_id: Option<String>,
    pub filename: Option<String>,
    pub size_hint: Option<u64>,
    pub sticker_format: Option<StickerFormat>,
    /// Item points at the motion-GIF host.
    pub motion_host: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// One candidate piece of media extracted from a message.
///
/// Built by the collector and never mutated afterwards; the cache key is
/// fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaWorkItem {
    pub source: MediaSource,
    /// Filename or URL, for diagnostics only.
    pub label: String,
    pub primary_url: String,
    pub fallback_urls: Vec<String>,
    pub extension_hint: Option<String>,
    pub prefer_video: bool,
    pub metadata: ItemMetadata,
    cache_key: String,
}

impl MediaWorkItem {
    pub fn new(
        source: MediaSource,
        label: impl Into<String>,
        primary_url: impl Into<String>,
        metadata: ItemMetadata,
    ) -> Self {
        let primary_url = primary_url.into();
        let cache_key = match metadata.cache_key.as_deref() {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => format!("url::{}", primary_url),
        };
        Self {
            source,
            label: label.into(),
            primary_url,
            fallback_urls: Vec::new(),
            extension_hint: None,
            prefer_video: false,
            metadata,
            cache_key,
        }
    }

    pub fn with_fallback(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        if !url.is_empty() && url != self.primary_url && !self.fallback_urls.contains(&url) {
            self.fallback_urls.push(url);
        }
        self
    }

    pub fn with_extension_hint(mut self, ext: Option<String>) -> Self {
        self.extension_hint = ext.filter(|e| !e.is_empty());
        self
    }

    pub fn with_prefer_video(mut self, prefer_video: bool) -> Self {
        self.prefer_video = prefer_video;
        self
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Primary URL followed by the fallbacks, in preference order.
    pub fn candidate_urls(&self) -> Vec<String> {
        std::iter::once(self.primary_url.clone())
            .chain(self.fallback_urls.iter().cloned())
            .collect()
    }

    /// Filename to present evidence under.
    pub fn evidence_filename(&self) -> String {
        if let Some(name) = self.metadata.filename.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        url::Url::parse(&self.label)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("{}.bin", self.source.as_str()))
    }
}
