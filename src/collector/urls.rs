//! URL normalization helpers for media collection.

use lazy_static::lazy_static;
use regex::Regex;

use super::work_item::MediaWorkItem;

pub const ANIMATED_EXTS: &[&str] = &[".gif", ".webp", ".apng", ".avif"];
pub const IMAGE_EXTS: &[&str] = &[".png", ".jpg", ".jpeg", ".bmp", ".tiff", ".heic"];
pub const VIDEO_EXTS: &[&str] = &[".mp4", ".mov", ".m4v", ".avi", ".mkv", ".webm"];

lazy_static! {
    static ref TEXT_URL_RE: Regex =
        Regex::new(r"https?://[^\s<>]+").expect("Invalid text URL regex");
    static ref CUSTOM_EMOJI_RE: Regex =
        Regex::new(r"<(a?):(\w+):(\d+)>").expect("Invalid custom emoji regex");
}

pub fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// True when `url`'s host is `domain` or one of its subdomains.
pub fn host_matches(url: &str, domain: &str) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{}", domain))
}

/// Lowercase extension of the URL path, with the leading dot.
pub fn extension_of(url: &str) -> Option<String> {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
    };
    let name = path.rsplit('/').next()?;
    let dot = name.rfind('.')?;
    let ext = &name[dot..];
    if ext.len() < 2 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn is_media_extension(ext: &str) -> bool {
    ANIMATED_EXTS.contains(&ext) || IMAGE_EXTS.contains(&ext) || VIDEO_EXTS.contains(&ext)
}

pub fn is_motion_extension(ext: &str) -> bool {
    ANIMATED_EXTS.contains(&ext) || VIDEO_EXTS.contains(&ext)
}

/// The first `limit` http(s) URLs in `text`.
pub fn extract_text_urls(text: &str, limit: usize) -> Vec<String> {
    TEXT_URL_RE
        .find_iter(text)
        .take(limit)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// A custom emoji tag found in message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomEmoji {
    pub tag: String,
    pub name: String,
    pub id: String,
    pub animated: bool,
}

impl CustomEmoji {
    pub fn url(&self, cdn_base: &str) -> String {
        let ext = if self.animated { "gif" } else { "png" };
        format!("{}/emojis/{}.{}", cdn_base.trim_end_matches('/'), self.id, ext)
    }
}

/// Custom emoji tags (`<:name:id>`, `<a:name:id>`) in order, without repeats.
pub fn extract_custom_emoji(text: &str) -> Vec<CustomEmoji> {
    let mut out: Vec<CustomEmoji> = Vec::new();
    for caps in CUSTOM_EMOJI_RE.captures_iter(text) {
        let tag = caps[0].to_string();
        if out.iter().any(|e| e.tag == tag) {
            continue;
        }
        out.push(CustomEmoji {
            tag,
            animated: !caps[1].is_empty(),
            name: caps[2].to_string(),
            id: caps[3].to_string(),
        });
    }
    out
}

/// Turns a possibly relative attachment reference into an absolute URL.
///
/// Handles absolute URLs, scheme-less `//host/path`, `/attachments/...` and
/// `attachments/...` paths, and bare filenames when the item carries its
/// channel and attachment ids. Returns `None` when nothing can be built.
pub fn normalise_candidate_url(
    item: Option<&MediaWorkItem>,
    candidate: &str,
    cdn_base: &str,
) -> Option<String> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return None;
    }
    let cdn_base = cdn_base.trim_end_matches('/');

    if let Ok(parsed) = url::Url::parse(candidate) {
        return match parsed.scheme() {
            "http" | "https" if parsed.host_str().is_some() => Some(candidate.to_string()),
            _ => None,
        };
    }

    if let Some(rest) = candidate.strip_prefix("//") {
        if !rest.is_empty() {
            return Some(format!("https://{}", rest));
        }
        return None;
    }

    if candidate.starts_with("/attachments/") {
        return Some(format!("{}{}", cdn_base, candidate));
    }
    if candidate.starts_with("attachments/") {
        return Some(format!("{}/{}", cdn_base, candidate));
    }

    let metadata = &item?.metadata;
    let attachment_id = metadata.attachment_id.as_deref()?;
    let channel_id = metadata.channel_id.as_deref()?;
    if !is_numeric(attachment_id) || !is_numeric(channel_id) {
        return None;
    }
    let filename = candidate.trim_start_matches('/');
    if filename.is_empty() {
        return None;
    }
    Some(format!(
        "{}/attachments/{}/{}/{}",
        cdn_base,
        channel_id,
        attachment_id,
        urlencoding::encode(filename)
    ))
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::work_item::{ItemMetadata, MediaSource};

    const CDN: &str = "https://cdn.discordapp.com";

    #[test]
    fn test_host_matches_subdomains() {
        assert!(host_matches("https://media.tenor.com/x.gif", "tenor.com"));
        assert!(host_matches("https://tenor.com/view/cat", "tenor.com"));
        assert!(!host_matches("https://nottenor.com/x.gif", "tenor.com"));
        assert!(!host_matches("not a url", "tenor.com"));
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("https://x/a/b.PNG?size=1").as_deref(), Some(".png"));
        assert_eq!(extension_of("https://x/a/b").as_deref(), None);
        assert_eq!(extension_of("https://x/a.b/c").as_deref(), None);
    }

    #[test]
    fn test_extract_text_urls_respects_limit() {
        let text = (0..30)
            .map(|i| format!("https://x.example/{}.png", i))
            .collect::<Vec<_>>()
            .join(" ");
        let urls = extract_text_urls(&text, 20);
        assert_eq!(urls.len(), 20);
        assert_eq!(urls[0], "https://x.example/0.png");

        let urls = extract_text_urls("see <https://x.example/a.gif> now", 20);
        assert_eq!(urls, vec!["https://x.example/a.gif"]);
    }

    #[test]
    fn test_extract_custom_emoji() {
        let emoji = extract_custom_emoji("hi <:wave:123> <a:dance:456> <:wave:123>");
        assert_eq!(emoji.len(), 2);
        assert!(!emoji[0].animated);
        assert_eq!(emoji[0].url(CDN), "https://cdn.discordapp.com/emojis/123.png");
        assert!(emoji[1].animated);
        assert_eq!(emoji[1].url(CDN), "https://cdn.discordapp.com/emojis/456.gif");
    }

    #[test]
    fn test_normalise_relative_attachment_paths() {
        assert_eq!(
            normalise_candidate_url(None, "/attachments/1/2/a.png", CDN).as_deref(),
            Some("https://cdn.discordapp.com/attachments/1/2/a.png")
        );
        assert_eq!(
            normalise_candidate_url(None, "attachments/1/2/a.png", CDN).as_deref(),
            Some("https://cdn.discordapp.com/attachments/1/2/a.png")
        );
        assert_eq!(
            normalise_candidate_url(None, "//media.example/a.png", CDN).as_deref(),
            Some("https://media.example/a.png")
        );
        assert_eq!(normalise_candidate_url(None, "ftp://x/a.png", CDN), None);
        assert_eq!(normalise_candidate_url(None, "a.png", CDN), None);
    }

    #[test]
    fn test_normalise_bare_filename_with_ids() {
        let item = MediaWorkItem::new(
            MediaSource::Attachment,
            "my cat.png",
            "my cat.png",
            ItemMetadata {
                attachment_id: Some("22".into()),
                channel_id: Some("11".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            normalise_candidate_url(Some(&item), "my cat.png", CDN).as_deref(),
            Some("https://cdn.discordapp.com/attachments/11/22/my%20cat.png")
        );
    }
}
