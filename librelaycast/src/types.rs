//! Core types for Relaycast

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Translation providers and credentials
// ============================================================================

/// External translation service. Exactly two are supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Legacy provider; credentials are not bound to a language
    #[default]
    DeepL,
    /// LLM agent provider; credentials are bound to one language
    Mistral,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::DeepL, Provider::Mistral];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::DeepL => "deepl",
            Provider::Mistral => "mistral",
        }
    }

    /// The fallback provider for this one
    pub fn other(&self) -> Provider {
        match self {
            Provider::DeepL => Provider::Mistral,
            Provider::Mistral => Provider::DeepL,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "deepl" => Ok(Provider::DeepL),
            "mistral" => Ok(Provider::Mistral),
            _ => Err(format!(
                "Unknown provider: '{}'. Valid options: deepl, mistral",
                s
            )),
        }
    }
}

/// Health state of a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    /// Excluded until `cooldown_until` has passed
    Cooling,
    /// Rejected by the provider; never retried, purged by the health sweep
    Invalid,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Cooling => "cooling",
            CredentialStatus::Invalid => "invalid",
        }
    }
}

impl FromStr for CredentialStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CredentialStatus::Active),
            "cooling" => Ok(CredentialStatus::Cooling),
            "invalid" => Ok(CredentialStatus::Invalid),
            other => Err(format!("unknown credential status '{}'", other)),
        }
    }
}

/// One provider account
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: i64,
    pub provider: Provider,
    pub api_key: String,
    /// Secondary secret (the Mistral agent id); absent for DeepL
    pub agent_id: Option<String>,
    /// Language name this credential is restricted to; `None` serves any language
    pub language: Option<String>,
    pub status: CredentialStatus,
    /// Unix timestamp; set only while cooling
    pub cooldown_until: Option<i64>,
    pub created_at: i64,
}

impl Credential {
    /// Key prefix that is safe to log
    pub fn masked_key(&self) -> String {
        mask_secret(&self.api_key)
    }

    /// Whether a cooling credential's window has elapsed at `now`
    pub fn cooldown_elapsed(&self, now: i64) -> bool {
        match (self.status, self.cooldown_until) {
            (CredentialStatus::Cooling, Some(until)) => now >= until,
            (CredentialStatus::Cooling, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("api_key", &self.masked_key())
            .field("agent_id", &self.agent_id.as_ref().map(|_| "***"))
            .field("language", &self.language)
            .field("status", &self.status)
            .field("cooldown_until", &self.cooldown_until)
            .finish()
    }
}

/// Input for registering a credential
#[derive(Clone)]
pub struct NewCredential {
    pub provider: Provider,
    pub api_key: String,
    pub agent_id: Option<String>,
    pub language: Option<String>,
}

impl NewCredential {
    pub fn deepl(api_key: impl Into<String>) -> Self {
        Self {
            provider: Provider::DeepL,
            api_key: api_key.into(),
            agent_id: None,
            language: None,
        }
    }

    pub fn mistral(
        api_key: impl Into<String>,
        agent_id: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            provider: Provider::Mistral,
            api_key: api_key.into(),
            agent_id: Some(agent_id.into()),
            language: Some(language.into()),
        }
    }
}

/// First eight characters of a secret followed by an ellipsis
pub fn mask_secret(secret: &str) -> String {
    let prefix: String = secret.chars().take(8).collect();
    format!("{}...", prefix)
}

// ============================================================================
// Languages and destinations
// ============================================================================

/// A target language: display name for prompts, code for DeepL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    pub name: String,
    pub code: String,
}

impl Language {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
        }
    }

    /// Languages are the same when their codes match, ignoring case and region
    pub fn same_as(&self, other: &Language) -> bool {
        base_code(&self.code).eq_ignore_ascii_case(base_code(&other.code))
    }
}

fn base_code(code: &str) -> &str {
    code.split(['-', '_']).next().unwrap_or(code).trim()
}

/// A publish target channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub channel_id: String,
    pub name: String,
    /// Overlay the channel name on rendered media
    pub branding: bool,
    pub link_discussion: String,
    pub text_discussion: String,
    pub link_invitation: String,
    pub text_invitation: String,
}

impl Destination {
    /// HTML links appended to every caption sent to this destination
    pub fn footer(&self) -> String {
        format!(
            "<a href=\"{}\">{}</a>\n\n<a href=\"{}\">{}</a>",
            self.link_discussion, self.text_discussion, self.link_invitation, self.text_invitation
        )
    }

    /// Compose the final caption from optional (translated) body text.
    ///
    /// The body is plain text and is escaped for HTML parse mode; the footer
    /// is markup already.
    pub fn compose_caption(&self, body: Option<&str>) -> String {
        match body {
            Some(text) => format!("{}\n\n{}", escape_html(text), self.footer()),
            None => self.footer(),
        }
    }
}

/// Escape the characters HTML parse mode treats as markup
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

// ============================================================================
// Authored posts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::Photo => "jpg",
            MediaKind::Video => "mp4",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }
}

/// Reference to a media file held by the chat platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub file_id: String,
}

/// Which caption budget applies to a post
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Text,
    Media,
    MediaGroup,
}

/// A post authored in the source channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePost {
    pub chat_id: String,
    pub message_id: i64,
    /// Message text or media caption
    pub text: Option<String>,
    pub media: Vec<MediaRef>,
}

impl SourcePost {
    pub fn text(chat_id: impl Into<String>, message_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            message_id,
            text: Some(text.into()),
            media: Vec::new(),
        }
    }

    /// Ledger key for this post
    pub fn source_post_id(&self) -> String {
        self.message_id.to_string()
    }

    pub fn content_type(&self) -> ContentType {
        match self.media.len() {
            0 => ContentType::Text,
            1 => ContentType::Media,
            _ => ContentType::MediaGroup,
        }
    }
}

/// Messages produced in one destination for one source post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub destination_id: String,
    pub message_ids: Vec<i64>,
    pub sent_at: i64,
}

/// Ephemeral request handed to the translation router
#[derive(Debug, Clone)]
pub struct TranslationJob {
    pub text: String,
    pub target: Language,
    /// Provider tried first; read from the operator setting per run
    pub preferred: Provider,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trip_names() {
        assert_eq!("DeepL".parse::<Provider>().unwrap(), Provider::DeepL);
        assert_eq!(" mistral ".parse::<Provider>().unwrap(), Provider::Mistral);
        assert!("google".parse::<Provider>().is_err());
        assert_eq!(Provider::DeepL.other(), Provider::Mistral);
        assert_eq!(Provider::default(), Provider::DeepL);
    }

    #[test]
    fn test_credential_debug_masks_secrets() {
        let credential = Credential {
            id: 1,
            provider: Provider::Mistral,
            api_key: "supersecretkey123".to_string(),
            agent_id: Some("ag:abc".to_string()),
            language: Some("Czech".to_string()),
            status: CredentialStatus::Active,
            cooldown_until: None,
            created_at: 0,
        };
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("supersecretkey123"));
        assert!(!debug.contains("ag:abc"));
        assert!(debug.contains("supersec..."));
    }

    #[test]
    fn test_cooldown_elapsed() {
        let mut credential = Credential {
            id: 1,
            provider: Provider::DeepL,
            api_key: "k".to_string(),
            agent_id: None,
            language: None,
            status: CredentialStatus::Cooling,
            cooldown_until: Some(100),
            created_at: 0,
        };
        assert!(!credential.cooldown_elapsed(99));
        assert!(credential.cooldown_elapsed(100));
        credential.status = CredentialStatus::Active;
        assert!(!credential.cooldown_elapsed(1_000));
    }

    #[test]
    fn test_language_same_as_ignores_case_and_region() {
        let english = Language::new("English", "EN-US");
        assert!(english.same_as(&Language::new("English", "en")));
        assert!(!english.same_as(&Language::new("Czech", "CS")));
    }

    #[test]
    fn test_compose_caption_with_and_without_body() {
        let destination = Destination {
            channel_id: "-100".to_string(),
            name: "News CZ".to_string(),
            branding: true,
            link_discussion: "https://t.me/chat".to_string(),
            text_discussion: "Discuss".to_string(),
            link_invitation: "https://t.me/join".to_string(),
            text_invitation: "Join".to_string(),
        };
        let footer = "<a href=\"https://t.me/chat\">Discuss</a>\n\n<a href=\"https://t.me/join\">Join</a>";
        assert_eq!(destination.compose_caption(None), footer);
        assert_eq!(
            destination.compose_caption(Some("Hello")),
            format!("Hello\n\n{}", footer)
        );
        assert_eq!(
            destination.compose_caption(Some("R&D: a < b > c")),
            format!("R&amp;D: a &lt; b &gt; c\n\n{}", footer)
        );
    }

    #[test]
    fn test_content_type() {
        let mut post = SourcePost::text("-1", 7, "hi");
        assert_eq!(post.content_type(), ContentType::Text);
        assert_eq!(post.source_post_id(), "7");
        post.media.push(MediaRef {
            kind: MediaKind::Photo,
            file_id: "a".to_string(),
        });
        assert_eq!(post.content_type(), ContentType::Media);
        post.media.push(MediaRef {
            kind: MediaKind::Video,
            file_id: "b".to_string(),
        });
        assert_eq!(post.content_type(), ContentType::MediaGroup);
    }
}
