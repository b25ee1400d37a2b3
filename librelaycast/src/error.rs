//! Error types for Relaycast

use thiserror::Error;

use crate::types::Provider;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Translation error: {0}")]
    Translation(#[from] TranslationError),

    #[error("Chat error: {0}")]
    Chat(#[from] ChatError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A submission refused before fan-out (size or format policy)
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl RelayError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::InvalidInput(_) | RelayError::Rejected(_) => 3,
            RelayError::Config(_) => 2,
            RelayError::Chat(ChatError::Api { code: 401, .. }) => 2,
            RelayError::Database(_)
            | RelayError::Translation(_)
            | RelayError::Chat(_)
            | RelayError::Render(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

/// Failure classes every translation adapter maps its own errors into.
///
/// This is the only provider-specific knowledge the router sees.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderFailure {
    /// Quota or request-rate exhaustion; the credential cools down
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Credential rejected by the provider; never retried
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Network error, timeout or server hiccup; no credential change
    #[error("transient failure: {0}")]
    Transient(String),

    /// The provider cannot serve this language at all
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ProviderFailure {
    pub fn message(&self) -> &str {
        match self {
            ProviderFailure::RateLimited(m)
            | ProviderFailure::Unauthorized(m)
            | ProviderFailure::Transient(m)
            | ProviderFailure::Unsupported(m) => m,
        }
    }
}

/// Last error observed for one provider during a routed translation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAttempt {
    pub provider: Provider,
    pub error: String,
}

#[derive(Error, Debug, Clone)]
pub enum TranslationError {
    #[error("all providers exhausted: {}", format_attempts(.attempts))]
    AllProvidersExhausted { attempts: Vec<ProviderAttempt> },
}

fn format_attempts(attempts: &[ProviderAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.provider, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug, Clone)]
pub enum ChatError {
    #[error("API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

#[derive(Error, Debug, Clone)]
pub enum RenderError {
    #[error("Renderer binary not available: {0}")]
    ToolMissing(String),

    #[error("Render process failed: {0}")]
    Process(String),

    #[error("Render timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Render pool closed")]
    PoolClosed,
}

impl From<std::io::Error> for RenderError {
    fn from(error: std::io::Error) -> Self {
        RenderError::Io(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_rejected() {
        let error = RelayError::Rejected("Caption too long".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_config_error() {
        let error = RelayError::Config(ConfigError::MissingField("telegram.bot_token".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_unauthorized_bot() {
        let error = RelayError::Chat(ChatError::Api {
            code: 401,
            description: "Unauthorized".to_string(),
        });
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_render_error() {
        let error = RelayError::Render(RenderError::Timeout(600));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting_config() {
        let error = RelayError::Config(ConfigError::MissingField("database.path".to_string()));
        assert_eq!(
            format!("{}", error),
            "Configuration error: Missing required field: database.path"
        );
    }

    #[test]
    fn test_translation_error_names_every_provider() {
        let error = TranslationError::AllProvidersExhausted {
            attempts: vec![
                ProviderAttempt {
                    provider: Provider::DeepL,
                    error: "rate limited: quota exceeded".to_string(),
                },
                ProviderAttempt {
                    provider: Provider::Mistral,
                    error: "no eligible credentials".to_string(),
                },
            ],
        };
        let message = error.to_string();
        assert!(message.contains("deepl: rate limited: quota exceeded"));
        assert!(message.contains("mistral: no eligible credentials"));
    }

    #[test]
    fn test_provider_failure_message() {
        let failure = ProviderFailure::Unauthorized("bad key".to_string());
        assert_eq!(failure.message(), "bad key");
        assert_eq!(failure.to_string(), "unauthorized: bad key");
    }

    #[test]
    fn test_error_conversion_from_chat_error() {
        let error: RelayError = ChatError::Network("connection reset".to_string()).into();
        match error {
            RelayError::Chat(_) => {}
            _ => panic!("Expected RelayError::Chat"),
        }
    }
}
