use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// key: generation-request -> typed generator input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub company_id: i32,
    pub channel_id: i32,
    pub rule_id: Option<i32>,
    pub topic: String,
    pub prompt: String,
    pub use_random_context: bool,
    pub timezone: String,
}

/// Produces post text for a request. `Ok(None)` means the generator answered without usable
/// content.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Option<String>>;

    /// `false` when no backend is configured. Callers skip quota and generation entirely.
    fn is_enabled(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    #[serde(default)]
    content: Option<String>,
}

/// key: http-generator -> remote content generation service
#[derive(Clone)]
pub struct HttpContentGenerator {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpContentGenerator {
    pub fn new(
        endpoint: impl Into<String>,
        auth_token: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build generator client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            auth_token,
        })
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth_token {
            request.bearer_auth(token)
        } else {
            request
        }
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Option<String>> {
        let response = self
            .auth(self.client.post(&self.endpoint))
            .json(request)
            .send()
            .await
            .context("failed to contact content generator")?
            .error_for_status()
            .context("content generator rejected request")?;

        let parsed: GenerationResponse = response
            .json()
            .await
            .context("failed to decode generator response")?;

        Ok(parsed
            .content
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty()))
    }
}

/// Used when no generator endpoint is configured; every request yields no content.
pub struct DisabledGenerator;

#[async_trait]
impl ContentGenerator for DisabledGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Option<String>> {
        tracing::warn!(
            channel_id = request.channel_id,
            topic = %request.topic,
            "content generator not configured",
        );
        Ok(None)
    }

    fn is_enabled(&self) -> bool {
        false
    }
}
