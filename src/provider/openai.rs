//! Adapter for providers exposing an OpenAI-compatible `/chat/completions` endpoint.

use super::{AdapterError, Completion, ProviderAdapter};
use crate::completion::{CompletionOptions, Message};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Longest upstream body excerpt kept in error messages.
const ERROR_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct OpenAiCompatAdapter {
    id: String,
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl OpenAiCompatAdapter {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, client: Client) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            api_key: None,
            client,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(
        &self,
        conversation: &[Message],
        options: &CompletionOptions,
        model: Option<&str>,
        deadline: Duration,
    ) -> Result<Completion, AdapterError> {
        // Responses are always collected whole, so upstream streaming stays off.
        let body = serde_json::json!({
            "model": model,
            "messages": conversation,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": false,
        });

        let mut request = self
            .client
            .post(self.completions_url())
            .timeout(deadline)
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| classify(e, deadline))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AdapterError::RateLimited { retry_after });
        }

        let text = response.text().await.map_err(|e| classify(e, deadline))?;
        if !status.is_success() {
            return Err(AdapterError::Upstream(format!(
                "HTTP {}: {}",
                status.as_u16(),
                excerpt(&text)
            )));
        }

        Ok(normalize_response(&text))
    }
}

/// Pull the completion text out of an upstream body.
///
/// OpenAI-style bodies yield `choices[0].message.content`; a bare JSON
/// string is used as-is; anything else is passed through as raw text.
pub fn normalize_response(text: &str) -> Completion {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::String(content)) => Completion { content, model: None },
        Ok(body) => match body["choices"][0]["message"]["content"].as_str() {
            Some(content) => Completion {
                content: content.to_string(),
                model: body["model"].as_str().map(str::to_string),
            },
            None => Completion { content: text.to_string(), model: None },
        },
        Err(_) => Completion { content: text.to_string(), model: None },
    }
}

fn classify(error: reqwest::Error, deadline: Duration) -> AdapterError {
    if error.is_timeout() {
        AdapterError::Timeout(deadline)
    } else {
        AdapterError::Upstream(format!("request failed: {}", error))
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(ERROR_EXCERPT_CHARS).collect()
}
