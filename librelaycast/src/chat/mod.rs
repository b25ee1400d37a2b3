//! Chat platform boundary
//!
//! The fan-out only needs to fetch media, send to a channel, delete what it
//! sent earlier and talk back to the source post. Every failure comes back
//! as a [`ChatError`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::ChatError;
use crate::types::{MediaKind, MediaRef};

pub mod telegram;

// Mock chat is available for all builds (not just tests) to support integration tests
pub mod mock;

pub type ChatResult<T> = std::result::Result<T, ChatError>;

/// A local file ready to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMedia {
    pub kind: MediaKind,
    pub path: PathBuf,
    pub caption: Option<String>,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Fetch a media file into `dir`, returning the local path
    async fn download_media(&self, media: &MediaRef, dir: &Path) -> ChatResult<PathBuf>;

    /// Send HTML text, returning the new message id
    async fn send_text(&self, chat_id: &str, text: &str) -> ChatResult<i64>;

    async fn send_media(&self, chat_id: &str, media: &OutgoingMedia) -> ChatResult<i64>;

    /// Send an album; ids come back in item order
    async fn send_media_group(&self, chat_id: &str, items: &[OutgoingMedia])
        -> ChatResult<Vec<i64>>;

    async fn delete_message(&self, chat_id: &str, message_id: i64) -> ChatResult<()>;

    /// Plain-text reply to a message (submission errors, run summaries)
    async fn reply(&self, chat_id: &str, reply_to: i64, text: &str) -> ChatResult<i64>;
}
