//! Request and response bodies for the gateway API.

use crate::completion::{CompletionOptions, CompletionRequest, CompletionResponse, Message};
use crate::health::HealthRecord;
use crate::probe::ProviderFailure;
use crate::whitelist::ModelProviders;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub app: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CompletionBody {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
}

impl From<CompletionBody> for CompletionRequest {
    fn from(body: CompletionBody) -> Self {
        let mut request = CompletionRequest::new(body.messages).with_options(CompletionOptions {
            temperature: body.temperature,
            max_tokens: body.max_tokens,
            stream: body.stream,
        });
        request.model = body.model.filter(|m| !m.trim().is_empty());
        request.provider = body.provider.filter(|p| !p.trim().is_empty());
        request
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionReply {
    pub content: String,
    pub provider: String,
    pub model: Option<String>,
    pub latency_ms: u64,
}

impl From<CompletionResponse> for CompletionReply {
    fn from(response: CompletionResponse) -> Self {
        Self {
            content: response.content,
            provider: response.provider_id,
            model: response.model,
            latency_ms: response.latency.as_millis() as u64,
        }
    }
}

/// A whitelist entry together with its current health.
#[derive(Serialize)]
pub struct ProviderStatus {
    pub id: String,
    pub priority: i32,
    pub models: Vec<String>,
    pub timeout_ms: u64,
    pub enabled: bool,
    pub available: bool,
    pub has_adapter: bool,
    pub health: Option<HealthRecord>,
}

#[derive(Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderStatus>,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelProviders>,
}

#[derive(Serialize)]
pub struct FailuresResponse {
    pub failures: Vec<ProviderFailure>,
}

#[derive(Serialize)]
pub struct ReloadResponse {
    pub providers: usize,
}

#[derive(Serialize)]
pub struct ResetResponse {
    pub provider: String,
    pub reset: bool,
}
