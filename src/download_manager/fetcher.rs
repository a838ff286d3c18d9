//! Streaming media fetcher.
//!
//! Probes, size-checks and streams one URL into a temp file under a byte cap,
//! hashing the payload while it streams.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Response};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio_util::io::StreamReader;
use tracing::debug;

use super::models::{DownloadError, DownloadErrorKind, DownloadTelemetry, LocalPayload};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Configuration for the media fetcher.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Timeout for HEAD probes (motion variant and size).
    pub probe_timeout: Duration,
    /// Connect timeout for every request.
    pub connect_timeout: Duration,
    /// Timeout for the whole GET, body included.
    pub request_timeout: Duration,
    /// Byte limit for responses that declare no size.
    pub probe_window_bytes: u64,
    /// Directory for temp payloads. `None` uses the system temp dir.
    pub tmp_dir: Option<PathBuf>,
    pub min_chunk_size: usize,
    pub default_chunk_size: usize,
    pub max_chunk_size: usize,
    /// Target number of reads for a payload of declared size.
    pub target_chunk_split: u64,
    pub default_buffer_size: usize,
    pub max_buffer_size: usize,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            probe_window_bytes: 32 * MIB as u64,
            tmp_dir: None,
            min_chunk_size: 32 * KIB,
            default_chunk_size: 128 * KIB,
            max_chunk_size: MIB,
            target_chunk_split: 12,
            default_buffer_size: MIB,
            max_buffer_size: 4 * MIB,
            user_agent: concat!("media-scanner/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DownloadConfig {
    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("media-scanner"))
    }

    /// Read size and write-buffer size for a payload of `declared` bytes.
    ///
    /// Small payloads are read in small chunks, large ones in larger chunks
    /// (about `target_chunk_split` reads), clamped to the configured bounds.
    /// The write buffer is at least two chunks.
    pub fn stream_sizing(&self, declared: Option<u64>) -> (usize, usize) {
        let declared = match declared {
            Some(size) if size > 0 => size,
            _ => return (self.default_chunk_size, self.default_buffer_size),
        };

        let approx = (declared / self.target_chunk_split.max(1)) as usize;
        let chunk = approx.clamp(self.min_chunk_size, self.max_chunk_size);
        let buffer = chunk.max(
            self.max_buffer_size
                .min(self.default_buffer_size.max(chunk * 2)),
        );
        (chunk, buffer)
    }
}

/// Streams URLs into local temp files.
#[derive(Clone)]
pub struct MediaFetcher {
    client: Client,
    config: DownloadConfig,
}

impl MediaFetcher {
    pub fn new(config: DownloadConfig) -> reqwest::Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Fetches `url` into a temp file.
    ///
    /// `cap` of `None` means unlimited. When `prefer_video` is set and the URL
    /// points at a static GIF, a motion variant is probed first and used if
    /// it exists.
    pub async fn fetch(
        &self,
        url: &str,
        cap: Option<u64>,
        ext_hint: Option<&str>,
        prefer_video: bool,
    ) -> Result<LocalPayload, DownloadError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| DownloadError::new(DownloadErrorKind::InvalidUrl, url, e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::new(
                DownloadErrorKind::InvalidUrl,
                url,
                format!("unsupported scheme {}", parsed.scheme()),
            ));
        }

        let probe_started = Instant::now();

        let mut target = url.to_string();
        let mut used_motion_variant = false;
        if prefer_video {
            if let Some(variant) = motion_variant(&parsed) {
                if self.probe(&variant).await.is_some() {
                    debug!(url = %url, variant = %variant, "Using motion variant");
                    target = variant;
                    used_motion_variant = true;
                }
            }
        }

        let mut declared = self.probe(&target).await.flatten();
        if let (Some(size), Some(cap)) = (declared, cap) {
            if size > cap {
                return Err(DownloadError::too_large(&target, size, cap));
            }
        }
        let probe_ms = probe_started.elapsed().as_millis() as u64;

        let stream_started = Instant::now();
        let response = self
            .client
            .get(&target)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(&e, &target))?;

        if !response.status().is_success() {
            return Err(DownloadError::from_status(
                response.status().as_u16(),
                &target,
            ));
        }

        // The GET may disagree with the HEAD probe (or the probe may have
        // been refused), so check again before streaming.
        if let Some(size) = header_content_length(&response) {
            declared = Some(size);
        }
        if let (Some(size), Some(cap)) = (declared, cap) {
            if size > cap {
                return Err(DownloadError::too_large(&target, size, cap));
            }
        }

        let limit = match (declared, cap) {
            (Some(_), cap) => cap,
            (None, Some(cap)) => Some(cap.min(self.config.probe_window_bytes)),
            (None, None) => Some(self.config.probe_window_bytes),
        };

        let resolved_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let suffix = file_suffix(ext_hint, &parsed);
        let (chunk_size, buffer_size) = self.config.stream_sizing(declared);
        let streamed = self
            .stream_to_file(response, &target, &suffix, limit, chunk_size, buffer_size)
            .await?;

        let telemetry = DownloadTelemetry {
            probe_ms,
            stream_ms: stream_started.elapsed().as_millis() as u64,
            bytes: streamed.bytes,
            declared_size: declared,
            chunk_size,
            attempts: 1,
            used_motion_variant,
            refreshed: false,
        };

        debug!(
            url = %target,
            bytes = streamed.bytes,
            chunk_size,
            probe_ms = telemetry.probe_ms,
            stream_ms = telemetry.stream_ms,
            "Download complete"
        );

        Ok(LocalPayload {
            file: streamed.file,
            resolved_url,
            sha256: streamed.sha256,
            content_type,
            telemetry,
        })
    }

    /// HEAD probe with a short timeout. Returns `None` when the URL is not
    /// reachable, `Some(declared_size)` otherwise.
    async fn probe(&self, url: &str) -> Option<Option<u64>> {
        let response = self
            .client
            .head(url)
            .timeout(self.config.probe_timeout)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        Some(header_content_length(&response))
    }

    async fn stream_to_file(
        &self,
        response: Response,
        url: &str,
        suffix: &str,
        limit: Option<u64>,
        chunk_size: usize,
        buffer_size: usize,
    ) -> Result<StreamedFile, DownloadError> {
        let dir = self.config.tmp_dir();
        let storage_err = |e: std::io::Error| {
            DownloadError::new(DownloadErrorKind::Storage, url, e.to_string())
        };

        tokio::fs::create_dir_all(&dir).await.map_err(storage_err)?;
        let temp = new_temp_file(&dir, suffix).map_err(storage_err)?;
        let handle = temp.as_file().try_clone().map_err(storage_err)?;
        let mut writer = BufWriter::with_capacity(buffer_size, tokio::fs::File::from_std(handle));

        let body = response.bytes_stream().map_err(|e| {
            let kind = if e.is_timeout() {
                std::io::ErrorKind::TimedOut
            } else {
                std::io::ErrorKind::Other
            };
            std::io::Error::new(kind, e)
        });
        let mut reader = StreamReader::new(body);

        let mut hasher = Sha256::new();
        let mut total: u64 = 0;
        let mut chunk = vec![0u8; chunk_size];
        loop {
            let read = reader.read(&mut chunk).await.map_err(|e| {
                let kind = if e.kind() == std::io::ErrorKind::TimedOut {
                    DownloadErrorKind::Timeout
                } else {
                    DownloadErrorKind::Connection
                };
                DownloadError::new(kind, url, e.to_string())
            })?;
            if read == 0 {
                break;
            }

            total += read as u64;
            if let Some(limit) = limit {
                if total > limit {
                    // `temp` is dropped on return, deleting the partial file
                    return Err(DownloadError::too_large(url, total, limit));
                }
            }

            hasher.update(&chunk[..read]);
            writer.write_all(&chunk[..read]).await.map_err(storage_err)?;
        }
        writer.flush().await.map_err(storage_err)?;

        Ok(StreamedFile {
            file: temp,
            bytes: total,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

struct StreamedFile {
    file: tempfile::NamedTempFile,
    bytes: u64,
    sha256: String,
}

fn new_temp_file(dir: &Path, suffix: &str) -> std::io::Result<tempfile::NamedTempFile> {
    tempfile::Builder::new()
        .prefix("media-")
        .suffix(suffix)
        .tempfile_in(dir)
}

fn header_content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Motion equivalent of a static GIF URL: same path with `.mp4`.
pub fn motion_variant(url: &url::Url) -> Option<String> {
    let path = url.path();
    let stem = path
        .strip_suffix(".gif")
        .or_else(|| path.strip_suffix(".GIF"))?;
    let mut variant = url.clone();
    variant.set_path(&format!("{}.mp4", stem));
    Some(variant.to_string())
}

/// Temp file suffix: the extension hint, else the URL's extension, else `.bin`.
fn file_suffix(ext_hint: Option<&str>, url: &url::Url) -> String {
    if let Some(hint) = ext_hint.filter(|h| !h.is_empty()) {
        return if hint.starts_with('.') {
            hint.to_ascii_lowercase()
        } else {
            format!(".{}", hint.to_ascii_lowercase())
        };
    }
    Path::new(url.path())
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_else(|| ".bin".to_string())
}
