//! Video frame extraction through ffprobe/ffmpeg.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::frames::{
    adaptive_cap, motion_scores, select_motion_keyframes, FrameError, FrameSample, FrameSampler,
    Preview, SampledFrame,
};
use crate::services::MediaPayload;

/// What ffprobe could tell about the first video stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoMeta {
    pub total_frames: Option<usize>,
    pub frame_rate: Option<f64>,
    pub duration_secs: Option<f64>,
}

impl VideoMeta {
    fn is_empty(&self) -> bool {
        self.total_frames.is_none() && self.frame_rate.is_none() && self.duration_secs.is_none()
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    nb_frames: Option<String>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// `"30000/1001"` or `"25"`; `"0/0"` and `"N/A"` are unknown.
fn parse_rate(value: Option<&str>) -> Option<f64> {
    let value = value?;
    let rate = match value.split_once('/') {
        Some((num, den)) => {
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num.parse::<f64>().ok()? / den
        }
        None => value.parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

fn parse_meta(json: &str) -> Result<VideoMeta, FrameError> {
    let probe: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| FrameError::Probe(format!("JSON parse error: {}", e)))?;
    let stream = probe.streams.first();

    let total_frames = stream
        .and_then(|s| s.nb_frames.as_deref())
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n > 0);
    let frame_rate = stream.and_then(|s| {
        parse_rate(s.avg_frame_rate.as_deref()).or_else(|| parse_rate(s.r_frame_rate.as_deref()))
    });
    let duration_secs = stream
        .and_then(|s| s.duration.as_deref())
        .or_else(|| probe.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    let total_frames = total_frames.or_else(|| match (frame_rate, duration_secs) {
        (Some(rate), Some(duration)) => Some((rate * duration).round() as usize),
        _ => None,
    });

    Ok(VideoMeta {
        total_frames,
        frame_rate,
        duration_secs,
    })
}

/// Evenly spaced frame numbers to extract before motion selection.
fn candidate_indices(meta: &VideoMeta, cap: usize, pool: usize) -> Vec<usize> {
    let mut count = (cap * 3).clamp(cap, pool.max(cap));
    let total = meta.total_frames.unwrap_or(0);
    if total == 0 {
        return (0..count).collect();
    }
    count = count.min(total);
    if count <= 1 {
        return vec![0];
    }
    let step = (total - 1) as f64 / (count - 1) as f64;
    let mut indices: Vec<usize> = (0..count)
        .map(|i| (i as f64 * step).round() as usize)
        .collect();
    indices.dedup();
    indices
}

impl FrameSampler {
    /// Reads stream metadata with ffprobe.
    pub async fn probe_video(&self, path: &Path) -> Result<VideoMeta, FrameError> {
        let output = tokio::time::timeout(
            self.config().ffmpeg_timeout,
            Command::new(&self.config().ffprobe_path)
                .args([
                    "-v",
                    "error",
                    "-select_streams",
                    "v:0",
                    "-show_entries",
                    "stream=nb_frames,r_frame_rate,avg_frame_rate,duration",
                    "-show_entries",
                    "format=duration",
                    "-of",
                    "json",
                ])
                .arg(path)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| FrameError::Timeout)??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FrameError::Probe(stderr.trim().to_string()));
        }
        let meta = parse_meta(&String::from_utf8_lossy(&output.stdout))?;
        if meta.is_empty() {
            return Err(FrameError::Probe("no video stream".to_string()));
        }
        Ok(meta)
    }

    /// Extracts `indices` as JPEG files into `dir`, returned in frame order.
    async fn extract_frames(
        &self,
        path: &Path,
        indices: &[usize],
        dir: &Path,
    ) -> Result<Vec<PathBuf>, FrameError> {
        let select = indices
            .iter()
            .map(|i| format!("eq(n\\,{})", i))
            .collect::<Vec<_>>()
            .join("+");
        let edge = self.config().max_edge;
        let filter = format!(
            "select={},scale='min({edge},iw)':'min({edge},ih)':force_original_aspect_ratio=decrease",
            select
        );

        let output = tokio::time::timeout(
            self.config().ffmpeg_timeout,
            Command::new(&self.config().ffmpeg_path)
                .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-i"])
                .arg(path)
                .args(["-vf", &filter, "-vsync", "0", "-qscale:v", "3"])
                .arg(dir.join("frame_%05d.jpg"))
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| FrameError::Timeout)??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FrameError::Ffmpeg(stderr.trim().to_string()));
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            files.push(entry.path());
        }
        files.sort();
        Ok(files)
    }

    /// Probes, extracts a candidate pool and keeps the highest-motion
    /// frames within the adaptive cap.
    #[cfg(not(feature = "no_video"))]
    pub async fn sample_video(
        &self,
        path: &Path,
        size_bytes: u64,
        plan_limit: Option<usize>,
    ) -> Result<FrameSample, FrameError> {
        let meta = self.probe_video(path).await?;
        let cap = adaptive_cap(
            size_bytes,
            plan_limit,
            meta.total_frames.unwrap_or(0),
            meta.duration_secs,
        );
        let indices = candidate_indices(&meta, cap, self.config().candidate_pool);

        let dir = tempfile::Builder::new().prefix("frames-").tempdir()?;
        let files = self.extract_frames(path, &indices, dir.path()).await?;
        debug!(
            candidates = indices.len(),
            extracted = files.len(),
            cap,
            "Extracted video frames"
        );

        let mut candidates = Vec::with_capacity(files.len());
        for (index, file) in indices.iter().copied().zip(files) {
            candidates.push((index, tokio::fs::read(&file).await?));
        }
        if candidates.is_empty() {
            return Err(FrameError::NoFrames);
        }

        let preview_size = self.config().preview_size;
        let frames = self
            .run(move || -> Result<Vec<SampledFrame>, FrameError> {
                let mut previews = Vec::with_capacity(candidates.len());
                let mut decoded = Vec::with_capacity(candidates.len());
                for (index, bytes) in candidates {
                    // Frames ffmpeg wrote but that do not decode are dropped
                    let Ok(image) = image::load_from_memory(&bytes) else {
                        continue;
                    };
                    previews.push(Preview::from_image(&image, preview_size));
                    decoded.push((index, bytes));
                }
                let selected =
                    select_motion_keyframes(decoded.len(), cap, &motion_scores(&previews));
                Ok(selected
                    .into_iter()
                    .map(|pos| {
                        let (index, bytes) = std::mem::take(&mut decoded[pos]);
                        SampledFrame {
                            index,
                            payload: MediaPayload {
                                bytes,
                                mime: "image/jpeg".to_string(),
                            },
                        }
                    })
                    .collect())
            })
            .await??;

        if frames.is_empty() {
            return Err(FrameError::NoFrames);
        }
        Ok(FrameSample {
            frames,
            total_frames: meta.total_frames,
        })
    }

    #[cfg(feature = "no_video")]
    pub async fn sample_video(
        &self,
        _path: &Path,
        _size_bytes: u64,
        _plan_limit: Option<usize>,
    ) -> Result<FrameSample, FrameError> {
        Err(FrameError::VideoDisabled)
    }
}

/// Whether ffmpeg and ffprobe can be started.
pub async fn ffmpeg_available(sampler: &FrameSampler) -> bool {
    for binary in [&sampler.config().ffmpeg_path, &sampler.config().ffprobe_path] {
        let status = Command::new(binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if !status.is_ok_and(|s| s.success()) {
            return false;
        }
    }
    true
}
