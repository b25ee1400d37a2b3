//! Telegram Bot API client
//!
//! Plain JSON-over-HTTPS calls for messages and updates, multipart uploads
//! for media. Captions and texts go out with HTML parse mode so the
//! destination footer renders as links.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::chat::{ChatClient, ChatResult, OutgoingMedia};
use crate::error::{ChatError, ConfigError, Result};
use crate::types::{MediaKind, MediaRef};

/// Envelope every Bot API method answers with
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<i64>,
    description: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> ChatResult<T> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            (true, None) => Err(ChatError::Decode("ok response without result".to_string())),
            (false, _) => Err(ChatError::Api {
                code: self.error_code.unwrap_or(0),
                description: self.description.unwrap_or_default(),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub channel_post: Option<TgMessage>,
    #[serde(default)]
    pub edited_channel_post: Option<TgMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub chat: TgChat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<PhotoSize>>,
    #[serde(default)]
    pub video: Option<TgVideo>,
    #[serde(default)]
    pub media_group_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChat {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgVideo {
    pub file_id: String,
}

impl TgMessage {
    /// The single media item this message carries; photos pick the largest size
    pub fn media(&self) -> Option<MediaRef> {
        if let Some(sizes) = &self.photo {
            return sizes
                .iter()
                .max_by_key(|p| u64::from(p.width) * u64::from(p.height))
                .map(|p| MediaRef {
                    kind: MediaKind::Photo,
                    file_id: p.file_id.clone(),
                });
        }
        self.video.as_ref().map(|v| MediaRef {
            kind: MediaKind::Video,
            file_id: v.file_id.clone(),
        })
    }

    /// Text body or media caption
    pub fn body(&self) -> Option<String> {
        self.text.clone().or_else(|| self.caption.clone())
    }
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct InputMedia<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    media: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
}

pub struct TelegramClient {
    client: Client,
    method_base: String,
    file_base: String,
    timeout: Duration,
}

impl TelegramClient {
    pub fn new(api_base: &str, token: &str, timeout: Duration) -> Result<Self> {
        // Long polls hold the connection open; the per-request timeout is applied per call
        let client = Client::builder().build().map_err(|e| ConfigError::InvalidValue {
            field: "telegram".to_string(),
            reason: format!("failed to build HTTP client: {}", e),
        })?;
        let api_base = api_base.trim_end_matches('/');

        Ok(Self {
            client,
            method_base: format!("{}/bot{}", api_base, token),
            file_base: format!("{}/file/bot{}", api_base, token),
            timeout,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.method_base, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> ChatResult<T> {
        debug!(method, "Bot API call");
        let response = self
            .client
            .post(self.method_url(method))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        response
            .json::<ApiResponse<T>>()
            .await
            .map_err(|e| ChatError::Decode(e.to_string()))?
            .into_result()
    }

    async fn call_multipart<T: DeserializeOwned>(&self, method: &str, form: Form) -> ChatResult<T> {
        debug!(method, "Bot API upload");
        let response = self
            .client
            .post(self.method_url(method))
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        response
            .json::<ApiResponse<T>>()
            .await
            .map_err(|e| ChatError::Decode(e.to_string()))?
            .into_result()
    }

    async fn file_part(path: &Path) -> ChatResult<Part> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ChatError::Io(format!("{}: {}", path.display(), e)))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "media".to_string());
        Ok(Part::bytes(bytes).file_name(name))
    }

    /// Long-poll for channel posts and their edits
    pub async fn get_updates(&self, offset: i64, poll_secs: u64) -> ChatResult<Vec<Update>> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": poll_secs,
                "allowed_updates": ["channel_post", "edited_channel_post"],
            }),
            Duration::from_secs(poll_secs) + self.timeout,
        )
        .await
    }
}

fn transport_error(error: reqwest::Error, timeout: Duration) -> ChatError {
    if error.is_timeout() {
        ChatError::Timeout(timeout.as_secs())
    } else {
        ChatError::Network(error.to_string())
    }
}

fn method_for(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Photo => ("sendPhoto", "photo"),
        MediaKind::Video => ("sendVideo", "video"),
    }
}

#[async_trait]
impl ChatClient for TelegramClient {
    async fn download_media(&self, media: &MediaRef, dir: &Path) -> ChatResult<PathBuf> {
        let info: FileInfo = self
            .call("getFile", json!({ "file_id": media.file_id }), self.timeout)
            .await?;
        let file_path = info
            .file_path
            .ok_or_else(|| ChatError::Decode("getFile returned no file_path".to_string()))?;

        let bytes = self
            .client
            .get(format!("{}/{}", self.file_base, file_path))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?
            .error_for_status()
            .map_err(|e| ChatError::Network(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        let local = dir.join(format!(
            "source-{}.{}",
            uuid::Uuid::new_v4(),
            media.kind.extension()
        ));
        tokio::fs::write(&local, &bytes)
            .await
            .map_err(|e| ChatError::Io(e.to_string()))?;
        Ok(local)
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> ChatResult<i64> {
        let sent: SentMessage = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "HTML",
                    "link_preview_options": { "is_disabled": true },
                }),
                self.timeout,
            )
            .await?;
        Ok(sent.message_id)
    }

    async fn send_media(&self, chat_id: &str, media: &OutgoingMedia) -> ChatResult<i64> {
        let (method, field) = method_for(media.kind);
        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field, Self::file_part(&media.path).await?);
        if let Some(caption) = &media.caption {
            form = form
                .text("caption", caption.clone())
                .text("parse_mode", "HTML");
        }

        let sent: SentMessage = self.call_multipart(method, form).await?;
        Ok(sent.message_id)
    }

    async fn send_media_group(
        &self,
        chat_id: &str,
        items: &[OutgoingMedia],
    ) -> ChatResult<Vec<i64>> {
        let mut descriptors = Vec::with_capacity(items.len());
        let mut form = Form::new().text("chat_id", chat_id.to_string());

        for (index, item) in items.iter().enumerate() {
            let attach = format!("file{}", index);
            descriptors.push(InputMedia {
                kind: item.kind.as_str(),
                media: format!("attach://{}", attach),
                caption: item.caption.as_deref(),
                parse_mode: item.caption.as_ref().map(|_| "HTML"),
            });
            form = form.part(attach, Self::file_part(&item.path).await?);
        }

        let media_json =
            serde_json::to_string(&descriptors).map_err(|e| ChatError::Decode(e.to_string()))?;
        form = form.text("media", media_json);

        let sent: Vec<SentMessage> = self.call_multipart("sendMediaGroup", form).await?;
        Ok(sent.into_iter().map(|m| m.message_id).collect())
    }

    async fn delete_message(&self, chat_id: &str, message_id: i64) -> ChatResult<()> {
        let _: bool = self
            .call(
                "deleteMessage",
                json!({ "chat_id": chat_id, "message_id": message_id }),
                self.timeout,
            )
            .await?;
        Ok(())
    }

    async fn reply(&self, chat_id: &str, reply_to: i64, text: &str) -> ChatResult<i64> {
        let sent: SentMessage = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": chat_id,
                    "text": text,
                    "reply_parameters": { "message_id": reply_to },
                }),
                self.timeout,
            )
            .await?;
        Ok(sent.message_id)
    }
}
