//! Media bytes and chat messages used by the integration tests

use super::constants::*;
use image::codecs::gif::GifEncoder;
use image::{Delay, Frame, ImageFormat, Rgba, RgbaImage};
use media_scanner::collector::{Attachment, ChatMessage, Embed, EmbedMedia};
use std::io::Cursor;

/// Pixel color the fake classifier flags.
pub const FLAGGED_COLOR: [u8; 4] = [255, 0, 0, 255];
pub const CLEAN_COLOR: [u8; 4] = [0, 128, 255, 255];

/// Solid-color PNG.
pub fn png_bytes(color: [u8; 4]) -> Vec<u8> {
    let image = RgbaImage::from_pixel(32, 32, Rgba(color));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("Failed to encode PNG");
    out.into_inner()
}

/// PNG of `color` with one pixel in the bottom row darkened, so each
/// `pixel_x` yields a distinct content hash.
pub fn png_bytes_variant(color: [u8; 4], pixel_x: u32) -> Vec<u8> {
    let mut image = RgbaImage::from_pixel(32, 32, Rgba(color));
    image.put_pixel(pixel_x % 32, 31, Rgba([color[0], color[1], color[2] / 2, 255]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("Failed to encode PNG");
    out.into_inner()
}

/// Animated GIF with one solid-color 16x16 frame per entry.
pub fn gif_bytes(colors: &[[u8; 4]]) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut out);
        encoder
            .set_repeat(image::codecs::gif::Repeat::Infinite)
            .expect("Failed to set GIF repeat");
        for color in colors {
            let frame = Frame::from_parts(
                RgbaImage::from_pixel(16, 16, Rgba(*color)),
                0,
                0,
                Delay::from_numer_denom_ms(100, 1),
            );
            encoder.encode_frame(frame).expect("Failed to encode GIF frame");
        }
    }
    out
}

pub fn attachment(id: &str, filename: &str, url: &str) -> Attachment {
    Attachment {
        id: id.to_string(),
        filename: filename.to_string(),
        url: Some(url.to_string()),
        ..Default::default()
    }
}

/// Message carrying `attachments` in [`CHANNEL_ID`].
pub fn message_with_attachments(id: &str, attachments: Vec<Attachment>) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        channel_id: Some(CHANNEL_ID.to_string()),
        guild_id: Some(TENANT_ID.to_string()),
        author_id: Some("author-1".to_string()),
        attachments,
        ..Default::default()
    }
}

/// Message with one image embed per URL.
pub fn message_with_embeds(id: &str, urls: &[String]) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        channel_id: Some(CHANNEL_ID.to_string()),
        guild_id: Some(TENANT_ID.to_string()),
        author_id: Some("author-1".to_string()),
        embeds: urls
            .iter()
            .map(|url| Embed {
                url: Some(url.clone()),
                image: Some(EmbedMedia {
                    url: Some(url.clone()),
                    proxy_url: None,
                }),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}
