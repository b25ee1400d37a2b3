//! Configuration management for Relaycast

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::{Language, Provider};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token; `RELAYCAST_BOT_TOKEN` takes precedence
    #[serde(default)]
    pub bot_token: String,
    /// Channel whose posts are republished
    pub source_channel: String,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
    /// Quiet period after the last item of a media group before it is published
    #[serde(default = "default_group_settle", with = "duration_str")]
    pub group_settle: Duration,
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_group_settle() -> Duration {
    Duration::from_secs(2)
}

/// What a fan-out does with a destination whose step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip the destination and report it
    #[default]
    Skip,
    /// Degrade: untranslated text or unbranded original media
    SendOriginal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    #[serde(default)]
    pub default_provider: Provider,
    #[serde(default = "default_request_timeout", with = "duration_str")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Language authored posts are written in; destinations without a binding get it
    #[serde(default = "default_source_language")]
    pub source_language: Language,
    #[serde(default = "ProviderConfig::deepl")]
    pub deepl: ProviderConfig,
    #[serde(default = "ProviderConfig::mistral")]
    pub mistral: ProviderConfig,
}

fn default_source_language() -> Language {
    Language::new("Russian", "RU")
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            default_provider: Provider::default(),
            request_timeout: default_request_timeout(),
            failure_policy: FailurePolicy::default(),
            source_language: default_source_language(),
            deepl: ProviderConfig::deepl(),
            mistral: ProviderConfig::mistral(),
        }
    }
}

impl TranslationConfig {
    pub fn provider(&self, provider: Provider) -> &ProviderConfig {
        match provider {
            Provider::DeepL => &self.deepl,
            Provider::Mistral => &self.mistral,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Override for the provider's API base URL
    #[serde(default)]
    pub endpoint: Option<String>,
    /// How long a rate-limited credential is excluded
    #[serde(with = "duration_str")]
    pub cooldown: Duration,
    /// Period of the health sweep for this provider
    #[serde(with = "duration_str")]
    pub probe_period: Duration,
}

impl ProviderConfig {
    /// Quota-style provider: long cooldown, daily sweep
    pub fn deepl() -> Self {
        Self {
            endpoint: None,
            cooldown: Duration::from_secs(10 * 24 * 3600),
            probe_period: Duration::from_secs(24 * 3600),
        }
    }

    /// Request-rate provider: short cooldown, frequent sweep
    pub fn mistral() -> Self {
        Self {
            endpoint: None,
            cooldown: Duration::from_secs(3600),
            probe_period: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Parallel render workers; defaults to the CPU count
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_render_timeout", with = "duration_str")]
    pub timeout: Duration,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_font")]
    pub font_path: String,
    /// Parent of per-run scratch directories; system temp dir when unset
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_workers() -> usize {
    num_cpus::get().max(1)
}

fn default_render_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_font() -> String {
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf".to_string()
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout: default_render_timeout(),
            ffmpeg: default_ffmpeg(),
            font_path: default_font(),
            work_dir: None,
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Character budgets. Source limits are checked before fan-out, budgets per destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_source_text: usize,
    pub max_source_caption: usize,
    pub max_group_items: usize,
    /// Final text must stay strictly below this
    pub text_budget: usize,
    /// Final media caption must stay strictly below this
    pub caption_budget: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_source_text: 4096,
            max_source_caption: 1024,
            max_group_items: 3,
            text_budget: 4000,
            caption_budget: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    #[serde(with = "duration_str")]
    pub send_timeout: Duration,
    /// Reply to the source post with a delivery summary
    pub report_to_source: bool,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(120),
            report_to_source: true,
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let mut config = Self::from_toml(&content)?;
        if let Ok(token) = std::env::var("RELAYCAST_BOT_TOKEN") {
            config.telegram.bot_token = token;
        }
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline unusable
    pub fn validate(&self) -> Result<()> {
        if self.render.workers == 0 {
            return Err(invalid("render.workers", "must be at least 1"));
        }
        if self.limits.max_group_items == 0 {
            return Err(invalid("limits.max_group_items", "must be at least 1"));
        }
        if self.translation.request_timeout.is_zero() {
            return Err(invalid("translation.request_timeout", "must be non-zero"));
        }
        if self.translation.source_language.code.trim().is_empty() {
            return Err(invalid("translation.source_language.code", "must not be empty"));
        }
        Ok(())
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/relaycast/relay.db".to_string(),
            },
            telegram: TelegramConfig {
                bot_token: String::new(),
                source_channel: String::new(),
                api_base: default_telegram_api(),
                group_settle: default_group_settle(),
            },
            translation: TranslationConfig::default(),
            render: RenderConfig::default(),
            limits: LimitsConfig::default(),
            fanout: FanoutConfig::default(),
        }
    }

    /// Bot token, failing when neither the file nor the environment supplies one
    pub fn bot_token(&self) -> Result<&str> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::MissingField("telegram.bot_token".to_string()).into());
        }
        Ok(self.telegram.bot_token.trim())
    }

    pub fn work_dir(&self) -> Option<PathBuf> {
        self.render
            .work_dir
            .as_ref()
            .map(|dir| PathBuf::from(shellexpand::tilde(dir).to_string()))
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::RelayError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Resolve the configuration file path following XDG base directory layout
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("RELAYCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("relaycast").join("config.toml"))
}

/// Expand `~` in the configured database path
pub fn resolve_db_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

/// Human-readable durations ("30s", "10days") in the config file
mod duration_str {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
        [database]
        path = "/tmp/relay.db"

        [telegram]
        bot_token = "123:abc"
        source_channel = "-1001"
    "#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.translation.default_provider, Provider::DeepL);
        assert_eq!(config.translation.source_language, Language::new("Russian", "RU"));
        assert_eq!(config.translation.deepl.cooldown, Duration::from_secs(864_000));
        assert_eq!(config.translation.mistral.cooldown, Duration::from_secs(3600));
        assert_eq!(config.limits.text_budget, 4000);
        assert_eq!(config.limits.caption_budget, 1000);
        assert_eq!(config.render.failure_policy, FailurePolicy::Skip);
        assert!(config.render.workers >= 1);
        assert_eq!(config.telegram.api_base, "https://api.telegram.org");
    }

    #[test]
    fn test_human_readable_durations() {
        let content = format!(
            "{}\n[translation]\ndefault_provider = \"mistral\"\nrequest_timeout = \"45s\"\nfailure_policy = \"send_original\"\n[translation.mistral]\ncooldown = \"15m\"\nprobe_period = \"2h\"\n",
            MINIMAL
        );
        let config = Config::from_toml(&content).unwrap();
        assert_eq!(config.translation.default_provider, Provider::Mistral);
        assert_eq!(config.translation.request_timeout, Duration::from_secs(45));
        assert_eq!(config.translation.failure_policy, FailurePolicy::SendOriginal);
        assert_eq!(config.translation.mistral.cooldown, Duration::from_secs(900));
        assert_eq!(config.translation.mistral.probe_period, Duration::from_secs(7200));
        // Untouched provider keeps its defaults
        assert_eq!(config.translation.deepl.probe_period, Duration::from_secs(86_400));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let content = format!("{}\n[render]\nworkers = 0\n", MINIMAL);
        let result = Config::from_toml(&content);
        assert!(matches!(
            result,
            Err(crate::error::RelayError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn test_missing_bot_token() {
        let mut config = Config::default_config();
        config.telegram.bot_token = "   ".to_string();
        assert!(config.bot_token().is_err());
        config.telegram.bot_token = " 42:xyz ".to_string();
        assert_eq!(config.bot_token().unwrap(), "42:xyz");
    }

    #[test]
    #[serial]
    fn test_env_token_overrides_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        std::env::set_var("RELAYCAST_BOT_TOKEN", "999:env");
        let config = Config::load_from_path(&path);
        std::env::remove_var("RELAYCAST_BOT_TOKEN");

        assert_eq!(config.unwrap().telegram.bot_token, "999:env");
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_from_env() {
        std::env::set_var("RELAYCAST_CONFIG", "/etc/relaycast/config.toml");
        let path = resolve_config_path().unwrap();
        std::env::remove_var("RELAYCAST_CONFIG");
        assert_eq!(path, PathBuf::from("/etc/relaycast/config.toml"));
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let config = Config::default_config();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.translation.deepl.cooldown, config.translation.deepl.cooldown);
        assert_eq!(parsed.fanout.send_timeout, Duration::from_secs(120));
    }
}
