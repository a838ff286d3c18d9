//! Frame sampling for animated images and videos.
//!
//! A bounded number of frames is picked per item: an evenly spaced base
//! sample, topped up with the frames that change most from their
//! predecessor. Decoding and scoring run on a dedicated rayon pool; async
//! callers wait on a oneshot channel.

use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;

use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::webp::WebPDecoder;
use image::{AnimationDecoder, DynamicImage, Frames, ImageFormat};
use thiserror::Error;
use tokio::sync::oneshot;

use super::media_kind::AnimatedFormat;
use crate::services::MediaPayload;

const MIB: f64 = 1024.0 * 1024.0;
const HISTOGRAM_BINS: usize = 16;
const BASE_SAMPLES: usize = 5;
const MIN_CAP: f64 = 5.0;
const MAX_CAP: f64 = 60.0;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("no frames could be extracted")]
    NoFrames,

    #[error("ffprobe failed: {0}")]
    Probe(String),

    #[error("ffmpeg failed: {0}")]
    Ffmpeg(String),

    #[error("frame extraction timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame worker pool: {0}")]
    Pool(String),

    #[error("video frame extraction is disabled in this build")]
    VideoDisabled,
}

/// Frame extraction settings.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Longest edge of the grayscale previews used for motion scoring.
    pub preview_size: u32,
    /// Longest edge of frames sent for classification.
    pub max_edge: u32,
    /// Worker threads for decoding; 0 uses one per core.
    pub worker_threads: usize,
    pub ffmpeg_timeout: Duration,
    /// Video frames extracted and scored before selection.
    pub candidate_pool: usize,
    /// Frames decoded from an animated image before the rest is ignored.
    pub max_animation_frames: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            preview_size: 64,
            max_edge: 512,
            worker_threads: 0,
            ffmpeg_timeout: Duration::from_secs(30),
            candidate_pool: 120,
            max_animation_frames: 500,
        }
    }
}

/// One frame picked for classification.
#[derive(Debug, Clone)]
pub struct SampledFrame {
    /// Position in the source.
    pub index: usize,
    pub payload: MediaPayload,
}

#[derive(Debug, Clone)]
pub struct FrameSample {
    pub frames: Vec<SampledFrame>,
    /// Frames in the source, when known.
    pub total_frames: Option<usize>,
}

/// Frame budget from payload size and duration, bounded by the source's
/// frame count and the plan's limit (`None` or 0 means no plan bound).
pub fn adaptive_cap(
    size_bytes: u64,
    plan_limit: Option<usize>,
    total_frames: usize,
    duration_secs: Option<f64>,
) -> usize {
    let size_mib = size_bytes as f64 / MIB;
    let mut cap = (MIN_CAP + size_mib * 6.0).clamp(MIN_CAP, MAX_CAP) as usize;
    if let Some(duration) = duration_secs.filter(|d| *d > 0.0) {
        cap = cap.max((duration * 6.0).clamp(MIN_CAP, MAX_CAP) as usize);
    }
    if total_frames > 0 {
        cap = cap.min(total_frames);
    }
    match plan_limit {
        Some(limit) if limit > 0 => limit.min(cap).max(1),
        _ => cap.max(1),
    }
}

/// Grayscale thumbnail of a frame plus its normalized histogram.
#[derive(Debug, Clone)]
pub struct Preview {
    pixels: Vec<f32>,
    histogram: [f32; HISTOGRAM_BINS],
}

impl Preview {
    pub fn from_image(image: &DynamicImage, max_dim: u32) -> Self {
        let luma = if image.width().max(image.height()) > max_dim {
            image.thumbnail(max_dim, max_dim).to_luma8()
        } else {
            image.to_luma8()
        };
        let pixels: Vec<f32> = luma.pixels().map(|p| p.0[0] as f32 / 255.0).collect();

        let mut histogram = [0f32; HISTOGRAM_BINS];
        for v in &pixels {
            let bin = ((v * HISTOGRAM_BINS as f32) as usize).min(HISTOGRAM_BINS - 1);
            histogram[bin] += 1.0;
        }
        let norm = histogram.iter().map(|h| h * h).sum::<f32>().sqrt();
        if norm > 0.0 {
            for h in histogram.iter_mut() {
                *h /= norm;
            }
        }
        Self { pixels, histogram }
    }
}

/// Change of each frame from the previous one; the first frame scores 0.
/// `0.7 * mean absolute pixel difference + 0.3 * L1 histogram delta`.
pub fn motion_scores(previews: &[Preview]) -> Vec<f32> {
    let Some(first) = previews.first() else {
        return Vec::new();
    };
    let mut scores = Vec::with_capacity(previews.len());
    scores.push(0.0);
    let mut previous = first;
    for preview in &previews[1..] {
        let n = preview.pixels.len().min(previous.pixels.len());
        let diff = if n == 0 {
            0.0
        } else {
            preview.pixels[..n]
                .iter()
                .zip(&previous.pixels[..n])
                .map(|(a, b)| (a - b).abs())
                .sum::<f32>()
                / n as f32
        };
        let hist_delta: f32 = preview
            .histogram
            .iter()
            .zip(previous.histogram.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        scores.push(diff * 0.7 + hist_delta * 0.3);
        previous = preview;
    }
    scores
}

fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Sorted frame indices to classify, at most `cap` of them.
pub fn select_motion_keyframes(total_frames: usize, cap: usize, scores: &[f32]) -> Vec<usize> {
    if total_frames == 0 || cap == 0 {
        return Vec::new();
    }
    if cap >= total_frames {
        return (0..total_frames).collect();
    }

    let mut selected = std::collections::BTreeSet::new();
    let base = cap.min(BASE_SAMPLES).min(total_frames).max(1);
    if base == 1 {
        selected.insert(total_frames / 2);
    } else {
        let step = (total_frames - 1) as f64 / (base - 1) as f64;
        for i in 0..base {
            let idx = (i as f64 * step).round() as usize;
            selected.insert(idx.min(total_frames - 1));
        }
    }

    let scores = &scores[..scores.len().min(total_frames)];
    if !scores.is_empty() {
        let threshold = (median(scores) * 1.4).max(0.02);
        let mut candidates: Vec<usize> = (0..scores.len()).collect();
        candidates.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]));

        'outer: for idx in candidates {
            if selected.len() >= cap {
                break;
            }
            if scores[idx] < threshold {
                continue;
            }
            selected.insert(idx);
            for neighbour in [idx.checked_sub(1), Some(idx + 1)].into_iter().flatten() {
                if selected.len() >= cap {
                    break 'outer;
                }
                if neighbour < total_frames {
                    selected.insert(neighbour);
                }
            }
        }
    }

    selected.into_iter().take(cap).collect()
}

/// Shrinks `image` to `max_edge` and encodes it as PNG.
pub(crate) fn encode_png(image: DynamicImage, max_edge: u32) -> Result<Vec<u8>, FrameError> {
    let image = if image.width().max(image.height()) > max_edge {
        image.thumbnail(max_edge, max_edge)
    } else {
        image
    };
    let mut out = Vec::new();
    image.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}

fn animation_frames(bytes: &[u8], format: AnimatedFormat) -> Result<Frames<'_>, FrameError> {
    let cursor = Cursor::new(bytes);
    Ok(match format {
        AnimatedFormat::Gif => GifDecoder::new(cursor)?.into_frames(),
        AnimatedFormat::WebP => WebPDecoder::new(cursor)?.into_frames(),
        AnimatedFormat::Apng => PngDecoder::new(cursor)?.apng()?.into_frames(),
    })
}

/// Picks and encodes frames of an animated image. Decodes twice so only
/// the previews of unselected frames are held in memory.
pub fn sample_animation(
    bytes: &[u8],
    format: AnimatedFormat,
    plan_limit: Option<usize>,
    config: &FrameConfig,
) -> Result<FrameSample, FrameError> {
    let mut previews = Vec::new();
    let mut duration_ms = 0f64;
    for frame in animation_frames(bytes, format)?.take(config.max_animation_frames) {
        let frame = frame?;
        let (numer, denom) = frame.delay().numer_denom_ms();
        if denom > 0 {
            duration_ms += numer as f64 / denom as f64;
        }
        let image = DynamicImage::ImageRgba8(frame.into_buffer());
        previews.push(Preview::from_image(&image, config.preview_size));
    }
    if previews.is_empty() {
        return Err(FrameError::NoFrames);
    }

    let total = previews.len();
    let duration = (duration_ms > 0.0).then_some(duration_ms / 1000.0);
    let cap = adaptive_cap(bytes.len() as u64, plan_limit, total, duration);
    let selected = select_motion_keyframes(total, cap, &motion_scores(&previews));
    drop(previews);

    let mut frames = Vec::with_capacity(selected.len());
    let mut wanted = selected.iter().copied().peekable();
    for (index, frame) in animation_frames(bytes, format)?.enumerate() {
        let Some(&next) = wanted.peek() else {
            break;
        };
        let frame = frame?;
        if index != next {
            continue;
        }
        wanted.next();
        let png = encode_png(DynamicImage::ImageRgba8(frame.into_buffer()), config.max_edge)?;
        frames.push(SampledFrame {
            index,
            payload: MediaPayload {
                bytes: png,
                mime: "image/png".to_string(),
            },
        });
    }
    if frames.is_empty() {
        return Err(FrameError::NoFrames);
    }
    Ok(FrameSample {
        frames,
        total_frames: Some(total),
    })
}

/// Bounded pool for CPU-bound frame work.
pub struct FrameSampler {
    config: FrameConfig,
    pool: rayon::ThreadPool,
}

impl FrameSampler {
    pub fn new(config: FrameConfig) -> Result<Self, FrameError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("frame-worker-{}", i))
            .build()
            .map_err(|e| FrameError::Pool(e.to_string()))?;
        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Runs `job` on the pool without blocking the runtime.
    pub async fn run<T, F>(&self, job: F) -> Result<T, FrameError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            // The receiver is gone when the scan was cancelled
            let _ = tx.send(job());
        });
        rx.await
            .map_err(|_| FrameError::Pool("worker dropped the job".to_string()))
    }

    /// [`sample_animation`] on the pool.
    pub async fn sample_animation(
        &self,
        bytes: Vec<u8>,
        format: AnimatedFormat,
        plan_limit: Option<usize>,
    ) -> Result<FrameSample, FrameError> {
        let config = self.config.clone();
        self.run(move || sample_animation(&bytes, format, plan_limit, &config))
            .await?
    }
}
