//! Chat message model as seen by the scanner.
//!
//! Only the fields media collection needs. Deserializable so the binary can
//! read a message dump from disk.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub embeds: Vec<Embed>,
    #[serde(default)]
    pub stickers: Vec<Sticker>,
    /// Forwarded message contents, first one wins.
    #[serde(default)]
    pub snapshots: Vec<MessageSnapshot>,
}

impl ChatMessage {
    pub fn has_media(&self) -> bool {
        !self.attachments.is_empty() || !self.embeds.is_empty() || !self.stickers.is_empty()
    }

    pub fn looks_like_it_has_link(&self) -> bool {
        self.content.contains("http")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub embeds: Vec<Embed>,
    #[serde(default)]
    pub stickers: Vec<Sticker>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    /// Origin URL, signed and expiring.
    #[serde(default)]
    pub url: Option<String>,
    /// CDN mirror, preferred for downloads.
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    /// Platform-native content hash, when the platform provides one.
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedMedia {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl EmbedMedia {
    /// Proxy first, origin second.
    pub fn preferred_url(&self) -> Option<&str> {
        self.proxy_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or_else(|| self.url.as_deref().filter(|u| !u.is_empty()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub video: Option<EmbedMedia>,
    #[serde(default)]
    pub image: Option<EmbedMedia>,
    #[serde(default)]
    pub thumbnail: Option<EmbedMedia>,
}

impl Embed {
    /// Media fields in scan order: video, image, thumbnail.
    pub fn media(&self) -> impl Iterator<Item = &EmbedMedia> {
        [&self.video, &self.image, &self.thumbnail]
            .into_iter()
            .flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StickerFormat {
    Png,
    Apng,
    Lottie,
    Gif,
}

impl StickerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            StickerFormat::Png | StickerFormat::Apng => ".png",
            StickerFormat::Lottie => ".json",
            StickerFormat::Gif => ".gif",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StickerFormat::Png => "png",
            StickerFormat::Apng => "apng",
            StickerFormat::Lottie => "lottie",
            StickerFormat::Gif => "gif",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sticker {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub format: StickerFormat,
    #[serde(default)]
    pub url: Option<String>,
}
