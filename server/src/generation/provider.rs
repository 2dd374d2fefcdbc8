use async_trait::async_trait;
use derive_more::derive::Display;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::HttpClient;

use super::{generation_user_prompt, system_prompt, GeneratedConversation, GenerationTask};

/// Dispatch failure taxonomy. Transient errors are eligible for the
/// processor's bounded retry policy; validation errors are terminal
/// immediately.
#[derive(Debug, Display)]
pub enum DispatchError {
    #[display("transient provider error: {_0}")]
    Transient(String),
    #[display("invalid generation request: {_0}")]
    Validation(String),
}

impl std::error::Error for DispatchError {}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::Transient(_))
    }
}

/// Seam between the dispatcher and the AI provider. The HTTP client below
/// is the production implementation; tests inject simulated providers with
/// controlled latency and failure modes.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, task: &GenerationTask)
        -> Result<GeneratedConversation, DispatchError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderApiConfig {
    pub key: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromptUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: i32,
    pub message: ChatMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: PromptUsage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiError {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatApiResponseOrError {
    Response(ChatApiResponse),
    Error(ChatApiError),
}

/// Production provider speaking the chat-completions wire format.
pub struct HttpProvider {
    http_client: HttpClient,
    api: ProviderApiConfig,
    model: ModelConfig,
}

impl HttpProvider {
    pub fn new(http_client: HttpClient, api: ProviderApiConfig, model: ModelConfig) -> Self {
        Self {
            http_client,
            api,
            model,
        }
    }
}

fn classify_send_error(error: reqwest::Error) -> DispatchError {
    if error.is_timeout() {
        return DispatchError::Transient("provider request timed out".to_string());
    }
    match error.status() {
        Some(StatusCode::BAD_REQUEST) => DispatchError::Validation(error.to_string()),
        _ => DispatchError::Transient(error.to_string()),
    }
}

#[async_trait]
impl GenerationProvider for HttpProvider {
    async fn generate(
        &self,
        task: &GenerationTask,
    ) -> Result<GeneratedConversation, DispatchError> {
        let resp = self
            .http_client
            .post(&self.api.endpoint)
            .bearer_auth(&self.api.key)
            .json(&json!({
                "model": &self.model.id,
                "temperature": self.model.temperature,
                "messages": [
                    {
                        "role": "system",
                        "content": system_prompt()
                    },
                    {
                        "role": "user",
                        "content": generation_user_prompt(task)
                    }
                ],
                "response_format": {
                    "type": "json_object",
                }
            }))
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(DispatchError::Transient(format!(
                "provider returned {status}"
            )));
        }
        if status.is_client_error() {
            return Err(DispatchError::Validation(format!(
                "provider rejected request with {status}"
            )));
        }

        let parsed = resp
            .json::<ChatApiResponseOrError>()
            .await
            .map_err(|e| DispatchError::Transient(format!("could not parse chat response: {e}")))?;

        let parsed = match parsed {
            ChatApiResponseOrError::Error(error) => {
                return Err(DispatchError::Transient(format!(
                    "chat API error: {}",
                    error.message
                )));
            }
            ChatApiResponseOrError::Response(parsed) => parsed,
        };

        let choice = parsed
            .choices
            .first()
            .ok_or_else(|| DispatchError::Transient("no choices in response".to_string()))?;

        Ok(GeneratedConversation {
            conversation_id: Uuid::new_v4(),
            content: choice.message.content.clone(),
            token_usage: parsed.usage.total_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(DispatchError::Transient("503".to_string()).is_transient());
        assert!(!DispatchError::Validation("bad payload".to_string()).is_transient());
    }

    #[test]
    fn parses_response_or_error_union() {
        let ok: ChatApiResponseOrError = serde_json::from_value(json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "{}"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
        }))
        .unwrap();
        assert!(matches!(ok, ChatApiResponseOrError::Response(_)));

        let err: ChatApiResponseOrError = serde_json::from_value(json!({
            "message": "Requests rate limit exceeded"
        }))
        .unwrap();
        assert!(matches!(err, ChatApiResponseOrError::Error(_)));
    }
}
