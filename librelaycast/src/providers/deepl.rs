//! DeepL adapter
//!
//! Legacy provider: credentials are not bound to a language, the quota is
//! monthly, so an exhausted key cools down for a long time.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::ProviderConfig;
use crate::error::{ConfigError, ProviderFailure, Result};
use crate::providers::{snippet, TranslationProvider};
use crate::types::{Credential, Language, Provider};

const PRO_ENDPOINT: &str = "https://api.deepl.com";
const FREE_ENDPOINT: &str = "https://api-free.deepl.com";

/// Target codes DeepL accepts
const SUPPORTED_TARGETS: &[&str] = &[
    "AR", "BG", "CS", "DA", "DE", "EL", "EN", "EN-GB", "EN-US", "ES", "ET", "FI", "FR", "HU",
    "ID", "IT", "JA", "KO", "LT", "LV", "NB", "NL", "PL", "PT", "PT-BR", "PT-PT", "RO", "RU",
    "SK", "SL", "SV", "TR", "UK", "ZH",
];

/// Everything that can go wrong talking to DeepL
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeepLError {
    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("authorization failed: {0}")]
    Forbidden(String),

    #[error("too many requests")]
    TooManyRequests,

    #[error("server error {0}: {1}")]
    Server(u16, String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("target language {0} not supported")]
    UnsupportedLanguage(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<DeepLError> for ProviderFailure {
    fn from(error: DeepLError) -> Self {
        let message = error.to_string();
        match error {
            DeepLError::QuotaExceeded => ProviderFailure::RateLimited(message),
            DeepLError::Forbidden(_) => ProviderFailure::Unauthorized(message),
            DeepLError::BadRequest(_) | DeepLError::UnsupportedLanguage(_) => {
                ProviderFailure::Unsupported(message)
            }
            DeepLError::TooManyRequests
            | DeepLError::Server(..)
            | DeepLError::Timeout
            | DeepLError::Network(_)
            | DeepLError::Decode(_) => ProviderFailure::Transient(message),
        }
    }
}

/// Classify a non-success HTTP status
pub fn classify_status(status: u16, body: &str) -> DeepLError {
    match status {
        456 => DeepLError::QuotaExceeded,
        401 | 403 => DeepLError::Forbidden(snippet(body)),
        429 => DeepLError::TooManyRequests,
        400 | 413 | 414 => DeepLError::BadRequest(snippet(body)),
        s => DeepLError::Server(s, snippet(body)),
    }
}

pub fn is_supported_target(code: &str) -> bool {
    let code = code.trim();
    SUPPORTED_TARGETS
        .iter()
        .any(|supported| supported.eq_ignore_ascii_case(code))
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    text: [&'a str; 1],
    target_lang: String,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    translations: Vec<Translation>,
}

#[derive(Debug, Deserialize)]
struct Translation {
    text: String,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    #[serde(default)]
    character_count: u64,
    #[serde(default)]
    character_limit: u64,
}

pub struct DeepLProvider {
    client: Client,
    endpoint: Option<String>,
    cooldown: Duration,
}

impl DeepLProvider {
    pub fn new(config: &ProviderConfig, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "translation.deepl".to_string(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            cooldown: config.cooldown,
        })
    }

    /// Free-plan keys end in `:fx` and live on a separate host
    fn base_url(&self, credential: &Credential) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None if credential.api_key.ends_with(":fx") => FREE_ENDPOINT.to_string(),
            None => PRO_ENDPOINT.to_string(),
        }
    }

    fn auth_header(credential: &Credential) -> String {
        format!("DeepL-Auth-Key {}", credential.api_key)
    }

    async fn request_translation(
        &self,
        credential: &Credential,
        text: &str,
        language: &Language,
    ) -> std::result::Result<String, DeepLError> {
        let code = language.code.trim().to_uppercase();
        if !is_supported_target(&code) {
            return Err(DeepLError::UnsupportedLanguage(code));
        }

        let url = format!("{}/v2/translate", self.base_url(credential));
        let response = self
            .client
            .post(&url)
            .header("Authorization", Self::auth_header(credential))
            .json(&TranslateRequest {
                text: [text],
                target_lang: code,
            })
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let parsed = response
            .json::<TranslateResponse>()
            .await
            .map_err(|e| DeepLError::Decode(e.to_string()))?;

        parsed
            .translations
            .into_iter()
            .next()
            .map(|t| t.text)
            .ok_or_else(|| DeepLError::Decode("empty translations array".to_string()))
    }

    async fn request_usage(&self, credential: &Credential) -> std::result::Result<(), DeepLError> {
        let url = format!("{}/v2/usage", self.base_url(credential));
        let response = self
            .client
            .get(&url)
            .header("Authorization", Self::auth_header(credential))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let usage = response
            .json::<UsageResponse>()
            .await
            .map_err(|e| DeepLError::Decode(e.to_string()))?;

        if usage.character_limit > 0 && usage.character_count >= usage.character_limit {
            return Err(DeepLError::QuotaExceeded);
        }
        Ok(())
    }
}

fn transport_error(error: reqwest::Error) -> DeepLError {
    if error.is_timeout() {
        DeepLError::Timeout
    } else {
        DeepLError::Network(error.to_string())
    }
}

#[async_trait]
impl TranslationProvider for DeepLProvider {
    fn provider(&self) -> Provider {
        Provider::DeepL
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
        self.request_translation(credential, text, language)
            .await
            .map_err(ProviderFailure::from)
    }

    async fn probe(&self, credential: &Credential) -> std::result::Result<(), ProviderFailure> {
        self.request_usage(credential)
            .await
            .map_err(ProviderFailure::from)
    }
}
