//! HTTP clients for the similarity index and classifier services.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    ClassifierInput, ClassifierResponse, ClassifyRequest, ContentClassifier, MediaPayload,
    RecordMetadata, ServiceError, SimilarityIndex, SimilarityMatch,
};

/// Connection settings for one HTTP service.
#[derive(Debug, Clone)]
pub struct HttpServiceConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// How long the service is reported unavailable after a failed call.
    pub failure_cooldown: Duration,
}

/// Marks a service down for a cooldown after transport failures.
struct ServiceHealth {
    down_until: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl ServiceHealth {
    fn new(cooldown: Duration) -> Self {
        Self {
            down_until: Mutex::new(None),
            cooldown,
        }
    }

    fn is_up(&self) -> bool {
        let mut down_until = self
            .down_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *down_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                *down_until = None;
                true
            }
            None => true,
        }
    }

    fn record<T>(&self, service: &str, result: &Result<T, ServiceError>) {
        let failed = matches!(
            result,
            Err(ServiceError::Timeout) | Err(ServiceError::Request(_)) | Err(ServiceError::Http(500..=599))
        );
        if failed {
            warn!(
                service,
                cooldown_secs = self.cooldown.as_secs(),
                "Service call failed, marking unavailable"
            );
            *self
                .down_until
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) =
                Some(Instant::now() + self.cooldown);
        }
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(ServiceError::from_reqwest)
}

fn encode(payload: &MediaPayload) -> String {
    base64::engine::general_purpose::STANDARD.encode(&payload.bytes)
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(ServiceError::Http(response.status().as_u16()))
    }
}

#[derive(Serialize)]
struct QueryBody<'a> {
    image_b64: String,
    mime: &'a str,
}

#[derive(Serialize)]
struct AddRecordBody<'a> {
    image_b64: String,
    mime: &'a str,
    category: Option<String>,
    score: f32,
}

#[derive(Deserialize)]
struct AddRecordResponse {
    record_id: String,
}

/// Similarity index reached over HTTP.
pub struct HttpSimilarityIndex {
    client: reqwest::Client,
    base_url: String,
    health: ServiceHealth,
}

impl HttpSimilarityIndex {
    pub fn new(config: HttpServiceConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            client: build_client(config.timeout)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            health: ServiceHealth::new(config.failure_cooldown),
        })
    }

    async fn query(&self, payload: &MediaPayload) -> Result<Vec<SimilarityMatch>, ServiceError> {
        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(&QueryBody {
                image_b64: encode(payload),
                mime: &payload.mime,
            })
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        check_status(response)
            .await?
            .json()
            .await
            .map_err(ServiceError::from_reqwest)
    }
}

#[async_trait]
impl SimilarityIndex for HttpSimilarityIndex {
    fn is_available(&self) -> bool {
        self.health.is_up()
    }

    async fn query_similar(
        &self,
        payload: &MediaPayload,
    ) -> Result<Vec<SimilarityMatch>, ServiceError> {
        let result = self.query(payload).await;
        self.health.record("similarity", &result);
        result
    }

    async fn add_record(
        &self,
        payload: &MediaPayload,
        metadata: RecordMetadata,
    ) -> Result<String, ServiceError> {
        let response = self
            .client
            .post(format!("{}/records", self.base_url))
            .json(&AddRecordBody {
                image_b64: encode(payload),
                mime: &payload.mime,
                category: metadata.category,
                score: metadata.score,
            })
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        let body: AddRecordResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(ServiceError::from_reqwest)?;
        debug!(record_id = %body.record_id, "Similarity record added");
        Ok(body.record_id)
    }

    async fn delete_record(&self, record_id: &str) -> Result<(), ServiceError> {
        let response = self
            .client
            .delete(format!(
                "{}/records/{}",
                self.base_url,
                urlencoding::encode(record_id)
            ))
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        check_status(response).await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct ClassifyBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    image_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    tenant_id: &'a str,
    similarity_hint: Option<f32>,
}

/// Content classifier reached over HTTP.
pub struct HttpClassifier {
    client: reqwest::Client,
    base_url: String,
    health: ServiceHealth,
}

impl HttpClassifier {
    pub fn new(config: HttpServiceConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            client: build_client(config.timeout)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            health: ServiceHealth::new(config.failure_cooldown),
        })
    }

    async fn call(&self, request: &ClassifyRequest) -> Result<ClassifierResponse, ServiceError> {
        let body = match &request.input {
            ClassifierInput::Image(payload) => ClassifyBody {
                image_b64: Some(encode(payload)),
                mime: Some(&payload.mime),
                text: None,
                tenant_id: &request.tenant_id,
                similarity_hint: request.similarity_hint,
            },
            ClassifierInput::Text(text) => ClassifyBody {
                image_b64: None,
                mime: None,
                text: Some(text),
                tenant_id: &request.tenant_id,
                similarity_hint: request.similarity_hint,
            },
        };
        let response = self
            .client
            .post(format!("{}/classify", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        check_status(response)
            .await?
            .json()
            .await
            .map_err(ServiceError::from_reqwest)
    }
}

#[async_trait]
impl ContentClassifier for HttpClassifier {
    fn is_available(&self) -> bool {
        self.health.is_up()
    }

    async fn classify(&self, request: ClassifyRequest) -> Result<ClassifierResponse, ServiceError> {
        let result = self.call(&request).await;
        self.health.record("classifier", &result);
        result
    }
}
