//! OpenAI-compatible chat completion client.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::caller::AiCaller;
use crate::result::{AiError, AnalysisResult};

/// Connection settings for [`HttpAiCaller`].
#[derive(Debug, Clone)]
pub struct HttpAiConfig {
    /// Base URL without the `/v1/chat/completions` suffix.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
}

impl HttpAiConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            temperature: 0.3,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// [`AiCaller`] backed by an OpenAI-compatible `/v1/chat/completions` endpoint.
///
/// The analysis instructions go in the system message and the prepared text
/// in the user message; the model is asked for a JSON object.
#[derive(Clone)]
pub struct HttpAiCaller {
    http: reqwest::Client,
    config: HttpAiConfig,
    label: String,
}

impl HttpAiCaller {
    pub fn new(config: HttpAiConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: HttpAiConfig) -> Self {
        let label = format!("openai-compatible:{}", config.model);
        Self { http, config, label }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl AiCaller for HttpAiCaller {
    fn provider(&self) -> &str {
        &self.label
    }

    async fn analyze(&self, text: &str, instructions: &str) -> Result<AnalysisResult, AiError> {
        if text.trim().is_empty() {
            return Err(AiError::InvalidInput("empty text".to_string()));
        }

        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: instructions,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            temperature: self.config.temperature,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let mut req = self.http.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status, message));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AiError::MalformedResponse(format!("invalid completion body: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AiError::MalformedResponse("no choices in completion".to_string()))?;

        debug!(model = %self.config.model, chars = content.len(), "completion received");
        parse_model_content(&content)
    }
}

fn map_transport_error(e: reqwest::Error) -> AiError {
    if e.is_timeout() {
        AiError::Transport(format!("request timed out: {e}"))
    } else {
        AiError::Transport(e.to_string())
    }
}

/// Map a non-success HTTP status to a classified error.
pub(crate) fn classify_status(status: StatusCode, message: String) -> AiError {
    let code = status.as_u16();
    if status == StatusCode::TOO_MANY_REQUESTS {
        AiError::RateLimited(message)
    } else if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        AiError::Unavailable {
            status: code,
            message,
        }
    } else {
        AiError::Rejected {
            status: code,
            message,
        }
    }
}

/// Parse the model's text answer, tolerating a fenced ```json block.
pub(crate) fn parse_model_content(content: &str) -> Result<AnalysisResult, AiError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let value: JsonValue = serde_json::from_str(unfenced)
        .map_err(|e| AiError::MalformedResponse(format!("model output is not JSON: {e}")))?;
    AnalysisResult::from_model_json(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, String::new()).is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, String::new()).is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, String::new()).is_transient());
    }

    #[test]
    fn parses_fenced_json() {
        let content = "```json\n{\"summary\": \"fenced\", \"tags\": [\"x\"]}\n```";
        let r = parse_model_content(content).unwrap();
        assert_eq!(r.summary, "fenced");
        assert_eq!(r.tags, vec!["x"]);
    }

    #[test]
    fn prose_is_a_permanent_failure() {
        let err = parse_model_content("Sure! Here is the summary.").unwrap_err();
        assert!(matches!(err, AiError::MalformedResponse(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        let caller = HttpAiCaller::new(HttpAiConfig::new("http://localhost:8000/", "m"));
        assert_eq!(caller.endpoint(), "http://localhost:8000/v1/chat/completions");
        assert_eq!(caller.provider(), "openai-compatible:m");
    }

    #[tokio::test]
    async fn blank_text_is_rejected_without_a_request() {
        let caller = HttpAiCaller::new(HttpAiConfig::new("http://127.0.0.1:9", "m"));
        let err = caller.analyze("   ", "instr").await.unwrap_err();
        assert!(matches!(err, AiError::InvalidInput(_)));
    }
}
