//! Media collection: turning chat messages into work items.

mod collect;
mod message;
mod refresh;
mod toggles;
pub mod urls;
mod work_item;

pub use collect::{CollectorConfig, MediaCollector};
pub use message::{
    Attachment, ChatMessage, Embed, EmbedMedia, MessageSnapshot, Sticker, StickerFormat,
};
pub use refresh::AttachmentRefresher;
pub use toggles::{ToggleCache, ToggleCacheConfig};
pub use work_item::{ItemMetadata, MediaSource, MediaWorkItem};
