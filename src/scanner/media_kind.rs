//! Media type detection by content sniffing.
//!
//! Magic bytes decide; the URL extension and the server's content type are
//! only consulted when sniffing finds nothing.

use std::io::Cursor;

use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::webp::WebPDecoder;
use image::AnimationDecoder;

use crate::collector::urls::{ANIMATED_EXTS, IMAGE_EXTS, VIDEO_EXTS};

/// Bytes read from the start of a payload for sniffing.
pub const SNIFF_LEN: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimatedFormat {
    Gif,
    WebP,
    Apng,
}

/// First-pass result from the payload head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniffed {
    Image(String),
    Video(String),
    Unsupported(Option<String>),
}

/// Sniffs `head`, falling back to the extension hint, then the declared
/// content type.
pub fn sniff(head: &[u8], ext_hint: Option<&str>, content_type: Option<&str>) -> Sniffed {
    if let Some(kind) = infer::get(head) {
        return from_mime(kind.mime_type());
    }
    if let Some(mime) = ext_hint.and_then(mime_for_extension) {
        return from_mime(mime);
    }
    if let Some(declared) = content_type {
        let mime = declared
            .split(';')
            .next()
            .unwrap_or(declared)
            .trim()
            .to_ascii_lowercase();
        if mime.starts_with("image/") || mime.starts_with("video/") {
            return from_mime(&mime);
        }
        return Sniffed::Unsupported(Some(mime));
    }
    Sniffed::Unsupported(None)
}

fn from_mime(mime: &str) -> Sniffed {
    if mime.starts_with("image/") {
        Sniffed::Image(mime.to_string())
    } else if mime.starts_with("video/") {
        Sniffed::Video(mime.to_string())
    } else {
        Sniffed::Unsupported(Some(mime.to_string()))
    }
}

fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let ext = ext.to_ascii_lowercase();
    let ext = ext.as_str();
    if !(IMAGE_EXTS.contains(&ext) || ANIMATED_EXTS.contains(&ext) || VIDEO_EXTS.contains(&ext)) {
        return None;
    }
    Some(match ext {
        ".png" => "image/png",
        ".apng" => "image/apng",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".gif" => "image/gif",
        ".webp" => "image/webp",
        ".avif" => "image/avif",
        ".bmp" => "image/bmp",
        ".tiff" => "image/tiff",
        ".heic" => "image/heic",
        ".mov" => "video/quicktime",
        ".avi" => "video/x-msvideo",
        ".mkv" => "video/x-matroska",
        ".webm" => "video/webm",
        _ => "video/mp4",
    })
}

/// Animation format of a fully loaded image, `None` for still images.
/// Decodes at most two GIF frames.
pub fn animation_format(bytes: &[u8], mime: &str) -> Option<AnimatedFormat> {
    match mime {
        "image/gif" => {
            let decoder = GifDecoder::new(Cursor::new(bytes)).ok()?;
            let frames = decoder
                .into_frames()
                .take(2)
                .take_while(|f| f.is_ok())
                .count();
            (frames > 1).then_some(AnimatedFormat::Gif)
        }
        "image/webp" => {
            let decoder = WebPDecoder::new(Cursor::new(bytes)).ok()?;
            decoder.has_animation().then_some(AnimatedFormat::WebP)
        }
        "image/png" | "image/apng" => {
            let decoder = PngDecoder::new(Cursor::new(bytes)).ok()?;
            decoder
                .is_apng()
                .ok()?
                .then_some(AnimatedFormat::Apng)
        }
        _ => None,
    }
}
