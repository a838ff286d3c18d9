//! In-memory stand-ins for the scanner's external collaborators

use super::constants::FLAGGED_CATEGORY;
use async_trait::async_trait;
use media_scanner::collector::ChatMessage;
use media_scanner::services::{
    CategoryScore, ClassifierInput, ClassifierResponse, ClassifyRequest, ContentClassifier,
    FlaggedContentHandler, FlaggedEvent, MediaPayload, MessageSource, RecordMetadata,
    ServiceError, SimilarityIndex, SimilarityMatch,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Similarity index answering every query with the same matches.
pub struct FakeSimilarityIndex {
    available: bool,
    matches: Mutex<Vec<SimilarityMatch>>,
    queries: AtomicUsize,
    added: Mutex<Vec<RecordMetadata>>,
}

impl FakeSimilarityIndex {
    pub fn new(available: bool) -> Self {
        Self {
            available,
            matches: Mutex::new(Vec::new()),
            queries: AtomicUsize::new(0),
            added: Mutex::new(Vec::new()),
        }
    }

    pub fn with_matches(self, matches: Vec<SimilarityMatch>) -> Self {
        *self.matches.lock().unwrap() = matches;
        self
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn added(&self) -> Vec<RecordMetadata> {
        self.added.lock().unwrap().clone()
    }
}

#[async_trait]
impl SimilarityIndex for FakeSimilarityIndex {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn query_similar(&self, _: &MediaPayload) -> Result<Vec<SimilarityMatch>, ServiceError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if !self.available {
            return Err(ServiceError::Unavailable);
        }
        Ok(self.matches.lock().unwrap().clone())
    }

    async fn add_record(
        &self,
        _: &MediaPayload,
        metadata: RecordMetadata,
    ) -> Result<String, ServiceError> {
        let mut added = self.added.lock().unwrap();
        added.push(metadata);
        Ok(format!("record-{}", added.len()))
    }

    async fn delete_record(&self, _: &str) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Classifier that flags images whose top-left pixel is red, like
/// [`super::fixtures::FLAGGED_COLOR`].
pub struct FakeClassifier {
    available: bool,
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeClassifier {
    pub fn new() -> Self {
        Self {
            available: true,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Classifier that reports itself down and must never be called.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn is_flagged_image(bytes: &[u8]) -> bool {
    let Ok(image) = image::load_from_memory(bytes) else {
        return false;
    };
    let pixel = image.to_rgba8().get_pixel(0, 0).0;
    pixel[0] > 200 && pixel[1] < 50 && pixel[2] < 50
}

#[async_trait]
impl ContentClassifier for FakeClassifier {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn classify(&self, request: ClassifyRequest) -> Result<ClassifierResponse, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available {
            return Err(ServiceError::Unavailable);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let flagged = match &request.input {
            ClassifierInput::Image(payload) => is_flagged_image(&payload.bytes),
            ClassifierInput::Text(_) => false,
        };
        Ok(ClassifierResponse {
            flagged,
            categories: vec![CategoryScore {
                category: FLAGGED_CATEGORY.to_string(),
                score: if flagged { 0.97 } else { 0.02 },
                flagged,
            }],
        })
    }
}

/// Message source serving re-fetched messages from memory.
#[derive(Default)]
pub struct FakeMessageSource {
    messages: Mutex<HashMap<String, ChatMessage>>,
    fetches: AtomicUsize,
}

impl FakeMessageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, message: ChatMessage) {
        self.messages
            .lock()
            .unwrap()
            .insert(message.id.clone(), message);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for FakeMessageSource {
    async fn fetch_message(
        &self,
        _channel_id: &str,
        message_id: &str,
    ) -> Result<Option<ChatMessage>, ServiceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.messages.lock().unwrap().get(message_id).cloned())
    }
}

/// Flagged event as seen inside the callback.
#[derive(Debug, Clone)]
pub struct RecordedFlag {
    pub event: FlaggedEvent,
    /// Size of the evidence file while the callback ran.
    pub evidence_len: Option<u64>,
}

/// Handler recording every callback.
#[derive(Default)]
pub struct RecordingHandler {
    flags: Mutex<Vec<RecordedFlag>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(&self) -> Vec<RecordedFlag> {
        self.flags.lock().unwrap().clone()
    }
}

#[async_trait]
impl FlaggedContentHandler for RecordingHandler {
    async fn on_flagged(&self, event: FlaggedEvent) {
        let evidence_len = event
            .evidence
            .as_ref()
            .and_then(|e| std::fs::metadata(&e.path).ok())
            .map(|m| m.len());
        self.flags
            .lock()
            .unwrap()
            .push(RecordedFlag { event, evidence_len });
    }
}
