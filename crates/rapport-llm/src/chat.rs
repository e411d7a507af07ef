use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use rapport_core::errors::ProviderError;
use rapport_core::provider::{ReasoningProvider, ReasoningRequest};
use rapport_core::security::ApiKey;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TEMPERATURE: f64 = 0.3;

/// Reasoning provider speaking the OpenAI-compatible chat-completions API in
/// JSON mode. The overall call deadline is owned by the caller.
pub struct ChatCompletionsProvider {
    client: Client,
    api_key: ApiKey,
    base_url: String,
    model: String,
}

impl ChatCompletionsProvider {
    pub fn new(
        api_key: ApiKey,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::NetworkError(format!("http client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into(),
            model: model.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, request: &ReasoningRequest) -> Value {
        json!({
            "model": self.model,
            "temperature": TEMPERATURE,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": request.instructions },
                { "role": "user", "content": request.conversation_text },
            ],
        })
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ReasoningProvider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        "chat-completions"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn complete(&self, request: &ReasoningRequest) -> Result<Value, ProviderError> {
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.api_key.0.expose_secret())
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(match ProviderError::from_status(status, body) {
                ProviderError::RateLimited { .. } => ProviderError::RateLimited { retry_after },
                other => other,
            });
        }

        let completion: ChatCompletion = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(format!("completion body: {e}")))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::MalformedResponse("no message content".into()))?;

        debug!(bytes = content.len(), "provider reply received");
        parse_json_object(&content)
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Interpret model output as a JSON object. Tolerates markdown code fences
/// and prose around the object; anything else is malformed.
pub fn parse_json_object(content: &str) -> Result<Value, ProviderError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let candidate = match (start, end) {
        (Some(s), Some(e)) if s < e => &content[s..=e],
        _ => {
            return Err(ProviderError::MalformedResponse(
                "reply contains no JSON object".into(),
            ))
        }
    };

    let value: Value = serde_json::from_str(candidate)
        .map_err(|e| ProviderError::MalformedResponse(format!("invalid JSON: {e}")))?;

    if value.is_object() {
        Ok(value)
    } else {
        Err(ProviderError::MalformedResponse("reply is not a JSON object".into()))
    }
}
