use std::time::Duration;

use phabreview_core::{Credentials, PhabReviewError};
use serde::{Deserialize, Serialize};

const LLM_TIMEOUT: Duration = Duration::from_secs(120);

/// Value of the `X-Title` header OpenRouter uses to attribute requests.
const APP_TITLE: &str = "phabreview";

/// A message in a chat conversation with the LLM.
///
/// # Examples
///
/// ```
/// use phabreview_review::llm::{ChatMessage, Role};
///
/// let msg = ChatMessage::user("Review this diff");
/// assert!(matches!(msg.role, Role::User));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: Role,
    /// Text content of the message.
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Role in the chat conversation.
///
/// # Examples
///
/// ```
/// use phabreview_review::llm::Role;
///
/// assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions.
    System,
    /// User input.
    User,
    /// Assistant response.
    Assistant,
}

/// Connection settings for the OpenRouter chat completions endpoint.
#[derive(Clone)]
pub struct LlmConfig {
    /// OpenRouter API key, sent as a bearer token.
    pub api_key: String,
    /// Model identifier, e.g. `xiaomi/mimo-v2-flash:free`.
    pub model: String,
    /// API root; `/chat/completions` is appended.
    pub base_url: String,
}

impl LlmConfig {
    /// Build the configuration from resolved credentials.
    ///
    /// `model` wins over the configured `REVIEW_MODEL`, which wins over the
    /// built-in default.
    ///
    /// # Examples
    ///
    /// ```
    /// use phabreview_core::Credentials;
    /// use phabreview_review::llm::LlmConfig;
    ///
    /// let creds = Credentials {
    ///     phabricator_url: "https://phab.example.com".into(),
    ///     phabricator_token: "api-x".into(),
    ///     openrouter_key: "sk-or-x".into(),
    ///     model: Some("openai/gpt-4o-mini".into()),
    ///     openrouter_base_url: "https://openrouter.ai/api/v1".into(),
    /// };
    /// assert_eq!(LlmConfig::from_credentials(&creds, None).model, "openai/gpt-4o-mini");
    /// assert_eq!(LlmConfig::from_credentials(&creds, Some("x/y")).model, "x/y");
    /// ```
    pub fn from_credentials(credentials: &Credentials, model: Option<&str>) -> Self {
        Self {
            api_key: credentials.openrouter_key.clone(),
            model: model.unwrap_or(credentials.model()).to_string(),
            base_url: credentials.openrouter_base_url.clone(),
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &phabreview_core::mask_secret(&self.api_key))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// OpenRouter chat completions client.
///
/// # Examples
///
/// ```
/// use phabreview_review::llm::{LlmClient, LlmConfig};
///
/// let config = LlmConfig {
///     api_key: "sk-or-test".into(),
///     model: "xiaomi/mimo-v2-flash:free".into(),
///     base_url: "https://openrouter.ai/api/v1".into(),
/// };
/// let client = LlmClient::new(&config).unwrap();
/// assert_eq!(client.model(), "xiaomi/mimo-v2-flash:free");
/// ```
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    /// Create a new client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PhabReviewError::Network`] if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self, PhabReviewError> {
        let client = reqwest::Client::builder()
            .timeout(LLM_TIMEOUT)
            .build()
            .map_err(|e| PhabReviewError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Return the model name from the configuration.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send a chat completion request and return the text response.
    ///
    /// # Errors
    ///
    /// - [`PhabReviewError::Auth`] when OpenRouter answers 401 or 403.
    /// - [`PhabReviewError::Llm`] for any other non-success status or an
    ///   error object in the body.
    /// - [`PhabReviewError::Network`] on transport failures and timeouts.
    /// - [`PhabReviewError::LlmEmptyResponse`] when the first choice carries
    ///   no text.
    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, PhabReviewError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": 0.1,
        });

        tracing::debug!(model = %self.config.model, %url, "sending chat completion");
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("X-Title", APP_TITLE)
            .json(&body)
            .send()
            .await
            .map_err(|e| PhabReviewError::Network(format!("LLM request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PhabReviewError::Auth(format!(
                "OpenRouter rejected the API key ({status})"
            )));
        }
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(PhabReviewError::Llm(format!(
                "LLM API error {status}: {body_text}"
            )));
        }

        let response_body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PhabReviewError::Llm(format!("failed to parse response: {e}")))?;

        if let Some(error) = response_body.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(PhabReviewError::Llm(message));
        }

        let content = response_body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| PhabReviewError::LlmEmptyResponse {
                model: self.config.model.clone(),
            })?;

        tracing::debug!(chars = content.len(), "received chat completion");
        Ok(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> LlmConfig {
        LlmConfig {
            api_key: "sk-or-test".into(),
            model: "test/model".into(),
            base_url,
        }
    }

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::system("be strict"), ChatMessage::user("diff")]
    }

    #[test]
    fn chat_message_serializes() {
        let json = serde_json::to_value(ChatMessage::system("hello")).unwrap();
        assert_eq!(json["role"], "system");
        assert_eq!(json["content"], "hello");
    }

    #[test]
    fn debug_masks_api_key() {
        let text = format!("{:?}", config("http://x".into()));
        assert!(!text.contains("sk-or-test"));
    }

    #[tokio::test]
    async fn returns_first_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-or-test"))
            .and(header("X-Title", "phabreview"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "{\"summary\": []}" } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = LlmClient::new(&config(server.uri())).unwrap();
        let text = client.chat(messages()).await.unwrap();
        assert_eq!(text, "{\"summary\": []}");
    }

    #[tokio::test]
    async fn blank_content_is_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "  \n" } }]
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(&config(server.uri())).unwrap();
        let err = client.chat(messages()).await.unwrap_err();
        assert_eq!(err.kind(), "LLMEmptyResponse");
        assert!(err.to_string().contains("test/model"));
    }

    #[tokio::test]
    async fn missing_choices_is_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })),
            )
            .mount(&server)
            .await;

        let client = LlmClient::new(&config(server.uri())).unwrap();
        let err = client.chat(messages()).await.unwrap_err();
        assert_eq!(err.kind(), "LLMEmptyResponse");
    }

    #[tokio::test]
    async fn server_error_is_llm_error_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream overloaded"))
            .mount(&server)
            .await;

        let client = LlmClient::new(&config(server.uri())).unwrap();
        let err = client.chat(messages()).await.unwrap_err();
        assert_eq!(err.kind(), "LLMError");
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("upstream overloaded"));
    }

    #[tokio::test]
    async fn unauthorized_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = LlmClient::new(&config(server.uri())).unwrap();
        let err = client.chat(messages()).await.unwrap_err();
        assert_eq!(err.kind(), "AuthError");
    }

    #[tokio::test]
    async fn error_object_in_body_is_llm_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": { "code": 429, "message": "rate limited" }
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(&config(server.uri())).unwrap();
        let err = client.chat(messages()).await.unwrap_err();
        assert_eq!(err.kind(), "LLMError");
        assert!(err.to_string().contains("rate limited"));
    }
}
