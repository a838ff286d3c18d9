//! Classification of a downloaded payload.
//!
//! Each image (or sampled frame) goes to the similarity index first. A
//! strong enough match decides on its own; otherwise the external
//! classifier is called and its result may be written back to the index.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use rand::Rng;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::context::{ScanContext, ScanJob};
use super::frames::{FrameError, FrameSample};
use super::media_kind::{animation_format, sniff, Sniffed, SNIFF_LEN};
use crate::collector::MediaWorkItem;
use crate::download_manager::LocalPayload;
use crate::limits::{LimitError, Resource};
use crate::metrics;
use crate::services::{
    ClassifierInput, ClassifyRequest, MediaPayload, RecordMetadata, ServiceError,
    SimilarityIndex, SimilarityMatch,
};
use crate::verdict_cache::{PipelineMetrics, Verdict, VerdictSource};

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier: {0}")]
    Service(#[from] ServiceError),

    #[error("frames: {0}")]
    Frames(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("limits: {0}")]
    Limit(#[from] LimitError),
}

/// What classification made of a payload.
#[derive(Debug)]
pub(crate) enum PayloadVerdict {
    Verdict(Verdict),
    /// Not an image, animation or video; carries the detected type.
    Unsupported(String),
}

async fn read_head(payload: &LocalPayload) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(payload.path()).await?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    (&mut file).take(SNIFF_LEN as u64).read_to_end(&mut head).await?;
    Ok(head)
}

/// Detects the media kind and classifies the payload accordingly.
pub(crate) async fn classify_payload(
    ctx: &ScanContext,
    job: &ScanJob,
    item: &MediaWorkItem,
    payload: &LocalPayload,
) -> Result<PayloadVerdict, ClassifyError> {
    let started = Instant::now();
    let head = read_head(payload).await?;
    let sniffed = sniff(
        &head,
        item.extension_hint.as_deref(),
        payload.content_type.as_deref(),
    );

    let mut verdict = match sniffed {
        Sniffed::Unsupported(mime) => {
            return Ok(PayloadVerdict::Unsupported(
                mime.unwrap_or_else(|| "unknown".to_string()),
            ))
        }
        Sniffed::Image(mime) => {
            let bytes = tokio::fs::read(payload.path()).await?;
            let maybe_animated = matches!(
                mime.as_str(),
                "image/gif" | "image/webp" | "image/png" | "image/apng"
            );
            let (format, bytes) = if maybe_animated {
                let probe_mime = mime.clone();
                ctx.frames
                    .run(move || (animation_format(&bytes, &probe_mime), bytes))
                    .await?
            } else {
                (None, bytes)
            };

            match format {
                Some(format) => {
                    let sample = {
                        let _permit = ctx
                            .pool
                            .acquire(&job.tenant_id, Resource::FrameDecode, job.limits)
                            .await?;
                        ctx.frames
                            .sample_animation(bytes, format, job.limits.max_frames_per_video)
                            .await?
                    };
                    classify_frames(ctx, job, sample).await?
                }
                None => classify_image(ctx, job, MediaPayload { bytes, mime }).await?,
            }
        }
        Sniffed::Video(mime) => {
            let sampled = {
                let _permit = ctx
                    .pool
                    .acquire(&job.tenant_id, Resource::VideoWorker, job.limits)
                    .await?;
                ctx.frames
                    .sample_video(payload.path(), payload.len(), job.limits.max_frames_per_video)
                    .await
            };
            let sample = match sampled {
                Err(FrameError::VideoDisabled) => return Ok(PayloadVerdict::Unsupported(mime)),
                other => other?,
            };
            classify_frames(ctx, job, sample).await?
        }
    };

    verdict.metrics.classify_ms = started.elapsed().as_millis() as u64;
    Ok(PayloadVerdict::Verdict(verdict))
}

/// Classifies sampled frames concurrently; the first flagged frame wins and
/// stops the rest. Frames that fail are skipped unless all of them do.
async fn classify_frames(
    ctx: &ScanContext,
    job: &ScanJob,
    sample: FrameSample,
) -> Result<Verdict, ClassifyError> {
    let width = job.limits.max_concurrent_classifier_calls.max(1);
    let mut results = futures::stream::iter(sample.frames.into_iter().map(|frame| async move {
        (frame.index, classify_image(ctx, job, frame.payload).await)
    }))
    .buffer_unordered(width);

    let mut pipeline = PipelineMetrics {
        frames_total: sample.total_frames,
        ..Default::default()
    };
    let mut last_error = None;

    while let Some((index, result)) = results.next().await {
        match result {
            Ok(verdict) => {
                pipeline.frames_scanned += 1;
                pipeline.classifier_calls += verdict.metrics.classifier_calls;
                pipeline.best_similarity = match (pipeline.best_similarity, verdict.metrics.best_similarity) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
                if verdict.metrics.source != VerdictSource::NoSignal {
                    pipeline.source = verdict.metrics.source;
                }
                if verdict.is_flagged {
                    debug!(frame = index, "Frame flagged, skipping remaining frames");
                    pipeline.source = verdict.metrics.source;
                    return Ok(verdict.with_metrics(pipeline));
                }
            }
            Err(e) => {
                debug!(frame = index, "Frame classification failed: {}", e);
                last_error = Some(e);
            }
        }
    }

    if pipeline.frames_scanned == 0 {
        return Err(last_error.unwrap_or(ClassifyError::Frames(FrameError::NoFrames)));
    }
    Ok(Verdict::clean("no_flagged_frames").with_metrics(pipeline))
}

fn roll_refresh(divisor: u32) -> bool {
    divisor > 0 && rand::rng().random_range(0..divisor) == 0
}

async fn query_similarity(ctx: &ScanContext, payload: &MediaPayload) -> Vec<SimilarityMatch> {
    let result = tokio::time::timeout(
        ctx.classification.similarity_timeout,
        ctx.similarity.query_similar(payload),
    )
    .await;
    match result {
        Ok(Ok(matches)) => {
            metrics::record_service_call("similarity", "ok");
            matches
        }
        Ok(Err(e)) => {
            metrics::record_service_call("similarity", "error");
            if ctx.diagnostics.should_emit("similarity_query") {
                warn!("Similarity query failed, continuing without it: {}", e);
            }
            Vec::new()
        }
        Err(_) => {
            metrics::record_service_call("similarity", "timeout");
            if ctx.diagnostics.should_emit("similarity_query") {
                warn!("Similarity query timed out, continuing without it");
            }
            Vec::new()
        }
    }
}

/// Verdict decided by a similarity match at or above `threshold`, best
/// match first. Tenant-scoped records only count for their own tenant.
fn similarity_verdict(
    matches: &[SimilarityMatch],
    job: &ScanJob,
    threshold: f32,
) -> Option<(Verdict, VerdictSource)> {
    let mut ordered: Vec<&SimilarityMatch> =
        matches.iter().filter(|m| m.score >= threshold).collect();
    ordered.sort_by(|a, b| b.score.total_cmp(&a.score));

    for m in ordered {
        if let Some(owner) = m.tenant_id.as_deref() {
            if owner != job.tenant_id {
                continue;
            }
            let category = m
                .category
                .clone()
                .unwrap_or_else(|| "custom_block".to_string());
            return Some((
                Verdict::flagged(category, "custom_block_match", m.score),
                VerdictSource::CustomBlock,
            ));
        }
        match m.category.as_deref() {
            None => {
                let mut verdict = Verdict::clean("similarity_match");
                verdict.score = Some(m.score);
                return Some((verdict, VerdictSource::Similarity));
            }
            Some(category) if job.policy.allows(category) => {
                return Some((
                    Verdict::flagged(category, "similarity_match", m.score),
                    VerdictSource::Similarity,
                ));
            }
            Some(_) => continue,
        }
    }
    None
}

fn spawn_delete_record(index: Arc<dyn SimilarityIndex>, record_id: String, timeout: Duration) {
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, index.delete_record(&record_id)).await {
            Ok(Ok(())) => debug!(record_id = %record_id, "Similarity record evicted for refresh"),
            Ok(Err(e)) => debug!(record_id = %record_id, "Similarity record eviction failed: {}", e),
            Err(_) => debug!(record_id = %record_id, "Similarity record eviction timed out"),
        }
    });
}

fn spawn_add_record(ctx: &ScanContext, payload: MediaPayload, metadata: RecordMetadata) {
    let index = ctx.similarity.clone();
    let timeout = ctx.classification.vector_write_timeout;
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, index.add_record(&payload, metadata)).await {
            Ok(Ok(record_id)) => debug!(record_id = %record_id, "Similarity record written"),
            Ok(Err(e)) => debug!("Similarity record write failed: {}", e),
            Err(_) => debug!("Similarity record write timed out"),
        }
    });
}

/// Similarity index, then classifier, for one still image.
pub(crate) async fn classify_image(
    ctx: &ScanContext,
    job: &ScanJob,
    payload: MediaPayload,
) -> Result<Verdict, ClassifyError> {
    let config = &ctx.classification;
    let similarity_up = ctx.similarity.is_available();
    let matches = if similarity_up {
        query_similarity(ctx, &payload).await
    } else {
        Vec::new()
    };

    let best = matches.iter().max_by(|a, b| a.score.total_cmp(&b.score));
    let best_score = best.map(|m| m.score);
    let refresh = best.is_some() && !job.limits.tier.is_premium() && roll_refresh(config.refresh_divisor);
    if refresh {
        if let Some(best) = best {
            spawn_delete_record(
                ctx.similarity.clone(),
                best.record_id.clone(),
                config.vector_write_timeout,
            );
        }
    }

    let mut pipeline = PipelineMetrics {
        best_similarity: best_score,
        ..Default::default()
    };

    let allow_shortcut = !matches.is_empty()
        && !refresh
        && (!job.policy.high_accuracy
            || best_score.is_some_and(|s| s >= config.high_accuracy_similarity));
    if allow_shortcut {
        if let Some((verdict, source)) =
            similarity_verdict(&matches, job, config.similarity_threshold)
        {
            pipeline.source = source;
            return Ok(verdict.with_metrics(pipeline));
        }
    }

    let skip_vector = !similarity_up
        || (best_score.is_some_and(|s| s >= config.similarity_threshold) && !refresh);

    if !ctx.classifier.is_available() {
        // A match held back for corroboration or refresh is still the best signal left.
        if let Some((verdict, source)) =
            similarity_verdict(&matches, job, config.similarity_threshold)
        {
            debug!("Classifier unavailable, using similarity match");
            pipeline.source = source;
            return Ok(verdict.with_metrics(pipeline));
        }
        debug!("Classifier unavailable, no verdict signal left");
        return Ok(Verdict::clean("classifier_unavailable").with_metrics(pipeline));
    }

    let response = {
        let _permit = ctx
            .pool
            .acquire(&job.tenant_id, Resource::ClassifierCall, job.limits)
            .await?;
        let request = ClassifyRequest {
            input: ClassifierInput::Image(payload.clone()),
            tenant_id: job.tenant_id.clone(),
            similarity_hint: best_score,
        };
        match tokio::time::timeout(config.classifier_timeout, ctx.classifier.classify(request)).await {
            Ok(Ok(response)) => {
                metrics::record_service_call("classifier", "ok");
                response
            }
            Ok(Err(e)) => {
                metrics::record_service_call("classifier", "error");
                return Err(e.into());
            }
            Err(_) => {
                metrics::record_service_call("classifier", "timeout");
                return Err(ServiceError::Timeout.into());
            }
        }
    };
    pipeline.classifier_calls = 1;
    pipeline.source = VerdictSource::Classifier;

    if !skip_vector {
        if let Some(top) = response.top_flagged() {
            spawn_add_record(
                ctx,
                payload,
                RecordMetadata {
                    category: Some(top.category.clone()),
                    score: top.score,
                },
            );
        } else if best_score.map_or(true, |s| s <= config.sfw_vector_max_similarity) {
            let top_score = response
                .categories
                .iter()
                .map(|c| c.score)
                .fold(0f32, f32::max);
            spawn_add_record(
                ctx,
                payload,
                RecordMetadata {
                    category: None,
                    score: top_score,
                },
            );
        }
    }

    Ok(match response.decide(&job.policy) {
        Some(decided) => Verdict::flagged(decided.category.clone(), "classifier", decided.score),
        None => Verdict::clean("classifier"),
    }
    .with_metrics(pipeline))
}
