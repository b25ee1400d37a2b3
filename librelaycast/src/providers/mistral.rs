//! Mistral agents adapter
//!
//! Each credential is an API key plus an agent id and serves one language.
//! Limits are per request rate, so cooldowns are short.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::ProviderConfig;
use crate::error::{ConfigError, ProviderFailure, Result};
use crate::providers::{snippet, TranslationProvider};
use crate::types::{Credential, Language, Provider};

const DEFAULT_ENDPOINT: &str = "https://api.mistral.ai";
const MAX_TOKENS: u32 = 2000;
const PROBE_TEXT: &str = "Hello";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MistralError {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("credential has no agent id")]
    MissingAgent,

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("empty completion")]
    EmptyCompletion,

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<MistralError> for ProviderFailure {
    fn from(error: MistralError) -> Self {
        let message = error.to_string();
        match error {
            MistralError::RateLimited => ProviderFailure::RateLimited(message),
            MistralError::Auth(_) | MistralError::MissingAgent => {
                ProviderFailure::Unauthorized(message)
            }
            MistralError::Rejected(_) => ProviderFailure::Unsupported(message),
            MistralError::Api(..)
            | MistralError::Timeout
            | MistralError::Connection(_)
            | MistralError::EmptyCompletion
            | MistralError::Decode(_) => ProviderFailure::Transient(message),
        }
    }
}

pub fn classify_status(status: u16, body: &str) -> MistralError {
    match status {
        429 => MistralError::RateLimited,
        401 | 403 => MistralError::Auth(snippet(body)),
        400 | 422 => MistralError::Rejected(snippet(body)),
        s => MistralError::Api(s, snippet(body)),
    }
}

/// Instruction sent to the agent ahead of the text
pub fn prompt(text: &str, language: &Language) -> String {
    format!(
        "Translate the text into {} without explanation\n\n{}",
        language.name, text
    )
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    agent_id: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

pub struct MistralProvider {
    client: Client,
    endpoint: String,
    cooldown: Duration,
}

impl MistralProvider {
    pub fn new(config: &ProviderConfig, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "translation.mistral".to_string(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        let endpoint = config
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            endpoint,
            cooldown: config.cooldown,
        })
    }

    async fn complete(
        &self,
        credential: &Credential,
        text: &str,
        language: &Language,
    ) -> std::result::Result<String, MistralError> {
        let agent_id = credential
            .agent_id
            .as_deref()
            .ok_or(MistralError::MissingAgent)?;

        let request = CompletionRequest {
            agent_id,
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt(text, language),
            }],
            max_tokens: MAX_TOKENS,
        };

        let response = self
            .client
            .post(format!("{}/v1/agents/completions", self.endpoint))
            .bearer_auth(&credential.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MistralError::Timeout
                } else {
                    MistralError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let parsed = response
            .json::<CompletionResponse>()
            .await
            .map_err(|e| MistralError::Decode(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(MistralError::EmptyCompletion);
        }
        Ok(content)
    }
}

#[async_trait]
impl TranslationProvider for MistralProvider {
    fn provider(&self) -> Provider {
        Provider::Mistral
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn translate(
        &self,
        credential: &Credential,
        text: &str,
        language: &Language,
    ) -> std::result::Result<String, ProviderFailure> {
        self.complete(credential, text, language)
            .await
            .map_err(ProviderFailure::from)
    }

    async fn probe(&self, credential: &Credential) -> std::result::Result<(), ProviderFailure> {
        let language = Language::new(
            credential.language.as_deref().unwrap_or("English"),
            String::new(),
        );
        self.complete(credential, PROBE_TEXT, &language)
            .await
            .map(|_| ())
            .map_err(ProviderFailure::from)
    }
}
