//! Mock chat platform for testing
//!
//! Hands out increasing message ids, records sends, deletions and replies,
//! and can be told to fail downloads of particular files or sends and
//! deletions for particular chats.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::chat::{ChatClient, ChatResult, OutgoingMedia};
use crate::error::ChatError;
use crate::types::MediaRef;

/// One recorded send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPost {
    pub chat_id: String,
    pub text: Option<String>,
    pub media: Vec<OutgoingMedia>,
    pub message_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub chat_id: String,
    pub reply_to: i64,
    pub text: String,
}

#[derive(Clone)]
pub struct MockChat {
    next_id: Arc<AtomicI64>,
    send_delay: Duration,
    sent: Arc<Mutex<Vec<SentPost>>>,
    deleted: Arc<Mutex<Vec<(String, i64)>>>,
    replies: Arc<Mutex<Vec<Reply>>>,
    failing_sends: Arc<Mutex<HashSet<String>>>,
    failing_deletes: Arc<Mutex<HashSet<String>>>,
    failing_downloads: Arc<Mutex<HashSet<String>>>,
}

impl Default for MockChat {
    fn default() -> Self {
        Self {
            next_id: Arc::new(AtomicI64::new(1000)),
            send_delay: Duration::ZERO,
            sent: Arc::default(),
            deleted: Arc::default(),
            replies: Arc::default(),
            failing_sends: Arc::default(),
            failing_deletes: Arc::default(),
            failing_downloads: Arc::default(),
        }
    }
}

impl MockChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    pub fn fail_sends_to(&self, chat_id: &str) {
        lock(&self.failing_sends).insert(chat_id.to_string());
    }

    pub fn fail_deletes_in(&self, chat_id: &str) {
        lock(&self.failing_deletes).insert(chat_id.to_string());
    }

    pub fn fail_download_of(&self, file_id: &str) {
        lock(&self.failing_downloads).insert(file_id.to_string());
    }

    pub fn sent(&self) -> Vec<SentPost> {
        lock(&self.sent).clone()
    }

    pub fn sent_to(&self, chat_id: &str) -> Vec<SentPost> {
        lock(&self.sent)
            .iter()
            .filter(|s| s.chat_id == chat_id)
            .cloned()
            .collect()
    }

    pub fn deleted(&self) -> Vec<(String, i64)> {
        lock(&self.deleted).clone()
    }

    pub fn replies(&self) -> Vec<Reply> {
        lock(&self.replies).clone()
    }

    fn allocate(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn record_send(
        &self,
        chat_id: &str,
        text: Option<String>,
        media: Vec<OutgoingMedia>,
        count: usize,
    ) -> ChatResult<Vec<i64>> {
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        if lock(&self.failing_sends).contains(chat_id) {
            return Err(ChatError::Api {
                code: 403,
                description: "Forbidden: bot is not a member of the channel chat".to_string(),
            });
        }
        for item in &media {
            if !item.path.exists() {
                return Err(ChatError::Io(format!("{} does not exist", item.path.display())));
            }
        }

        let message_ids: Vec<i64> = (0..count.max(1)).map(|_| self.allocate()).collect();
        lock(&self.sent).push(SentPost {
            chat_id: chat_id.to_string(),
            text,
            media,
            message_ids: message_ids.clone(),
        });
        Ok(message_ids)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ChatClient for MockChat {
    async fn download_media(&self, media: &MediaRef, dir: &Path) -> ChatResult<PathBuf> {
        if lock(&self.failing_downloads).contains(&media.file_id) {
            return Err(ChatError::Api {
                code: 400,
                description: "Bad Request: file is too big".to_string(),
            });
        }
        let path = dir.join(format!(
            "source-{}.{}",
            media.file_id,
            media.kind.extension()
        ));
        tokio::fs::write(&path, format!("media:{}", media.file_id))
            .await
            .map_err(|e| ChatError::Io(e.to_string()))?;
        Ok(path)
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> ChatResult<i64> {
        let ids = self
            .record_send(chat_id, Some(text.to_string()), Vec::new(), 1)
            .await?;
        Ok(ids[0])
    }

    async fn send_media(&self, chat_id: &str, media: &OutgoingMedia) -> ChatResult<i64> {
        let ids = self
            .record_send(chat_id, media.caption.clone(), vec![media.clone()], 1)
            .await?;
        Ok(ids[0])
    }

    async fn send_media_group(
        &self,
        chat_id: &str,
        items: &[OutgoingMedia],
    ) -> ChatResult<Vec<i64>> {
        let caption = items.first().and_then(|i| i.caption.clone());
        self.record_send(chat_id, caption, items.to_vec(), items.len())
            .await
    }

    async fn delete_message(&self, chat_id: &str, message_id: i64) -> ChatResult<()> {
        if lock(&self.failing_deletes).contains(chat_id) {
            return Err(ChatError::Api {
                code: 400,
                description: "Bad Request: message can't be deleted".to_string(),
            });
        }
        lock(&self.deleted).push((chat_id.to_string(), message_id));
        Ok(())
    }

    async fn reply(&self, chat_id: &str, reply_to: i64, text: &str) -> ChatResult<i64> {
        lock(&self.replies).push(Reply {
            chat_id: chat_id.to_string(),
            reply_to,
            text: text.to_string(),
        });
        Ok(self.allocate())
    }
}
