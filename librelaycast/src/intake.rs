//! Authoring events from the source channel
//!
//! Bot API updates are filtered to the configured source channel and turned
//! into [`AuthoringEvent`]s. Album items arrive as separate messages sharing
//! a `media_group_id`; they are buffered until the group has been quiet for
//! the settle window and then published as one post keyed by the group's
//! first message id.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::chat::telegram::{TelegramClient, TgChat, TgMessage, Update};
use crate::chat::ChatResult;
use crate::types::{MediaRef, SourcePost};

/// How many published albums are remembered for edit replay
const PUBLISHED_GROUPS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthoringEvent {
    Published(SourcePost),
    Edited(SourcePost),
}

impl AuthoringEvent {
    pub fn post(&self) -> &SourcePost {
        match self {
            AuthoringEvent::Published(post) | AuthoringEvent::Edited(post) => post,
        }
    }
}

/// Matches a chat against the configured source channel: a numeric chat id
/// or an `@username`
#[derive(Debug, Clone)]
pub struct SourceFilter {
    channel: String,
}

impl SourceFilter {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into().trim().to_string(),
        }
    }

    pub fn matches(&self, chat: &TgChat) -> bool {
        if self.channel == chat.id.to_string() {
            return true;
        }
        match (self.channel.strip_prefix('@'), &chat.username) {
            (Some(wanted), Some(username)) => wanted.eq_ignore_ascii_case(username),
            _ => false,
        }
    }
}

struct PendingGroup {
    chat_id: String,
    items: Vec<(i64, MediaRef, Option<String>)>,
    last_seen: Instant,
}

struct PublishedGroup {
    group_id: String,
    post: SourcePost,
    members: Vec<i64>,
}

/// Turns raw updates into authoring events
pub struct UpdateCollector {
    filter: SourceFilter,
    settle: Duration,
    pending: HashMap<String, PendingGroup>,
    published: VecDeque<PublishedGroup>,
}

impl UpdateCollector {
    pub fn new(filter: SourceFilter, settle: Duration) -> Self {
        Self {
            filter,
            settle,
            pending: HashMap::new(),
            published: VecDeque::new(),
        }
    }

    /// Feed one update; events that are complete right away are returned
    pub fn accept(&mut self, update: Update, now: Instant) -> Option<AuthoringEvent> {
        if let Some(message) = update.channel_post {
            if !self.filter.matches(&message.chat) {
                return None;
            }
            return match message.media_group_id.clone() {
                Some(group_id) => {
                    self.buffer(group_id, message, now);
                    None
                }
                None => Some(AuthoringEvent::Published(single_post(&message))),
            };
        }

        if let Some(message) = update.edited_channel_post {
            if !self.filter.matches(&message.chat) {
                return None;
            }
            return match message.media_group_id.clone() {
                Some(group_id) => self.edit_group(&group_id, &message).map(AuthoringEvent::Edited),
                None => Some(AuthoringEvent::Edited(single_post(&message))),
            };
        }

        None
    }

    /// Publish every album that has been quiet for the settle window
    pub fn flush_ready(&mut self, now: Instant) -> Vec<AuthoringEvent> {
        let ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, group)| now.duration_since(group.last_seen) >= self.settle)
            .map(|(id, _)| id.clone())
            .collect();

        let mut events = Vec::with_capacity(ready.len());
        for group_id in ready {
            if let Some(mut group) = self.pending.remove(&group_id) {
                group.items.sort_by_key(|(message_id, _, _)| *message_id);
                let post = group_post(&group.chat_id, &group.items);
                debug!(group = %group_id, items = post.media.len(), "Media group settled");

                self.remember(PublishedGroup {
                    group_id,
                    post: post.clone(),
                    members: group.items.iter().map(|(id, _, _)| *id).collect(),
                });
                events.push(AuthoringEvent::Published(post));
            }
        }
        events.sort_by_key(|event| event.post().message_id);
        events
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn buffer(&mut self, group_id: String, message: TgMessage, now: Instant) {
        let Some(media) = message.media() else {
            warn!(message_id = message.message_id, "Album item without media ignored");
            return;
        };
        let group = self.pending.entry(group_id).or_insert_with(|| PendingGroup {
            chat_id: message.chat.id.to_string(),
            items: Vec::new(),
            last_seen: now,
        });
        group.items.push((message.message_id, media, message.body()));
        group.last_seen = now;
    }

    fn edit_group(&mut self, group_id: &str, message: &TgMessage) -> Option<SourcePost> {
        let Some(known) = self.published.iter_mut().find(|g| g.group_id == group_id) else {
            warn!(group = %group_id, "Edit of an unknown media group ignored");
            return None;
        };

        if let Some(position) = known.members.iter().position(|id| *id == message.message_id) {
            if let Some(media) = message.media() {
                known.post.media[position] = media;
            }
        }
        // An album has one caption, carried by its first item
        let caption = message.body().filter(|t| !t.trim().is_empty());
        if caption.is_some() || known.members.first() == Some(&message.message_id) {
            known.post.text = caption;
        }
        Some(known.post.clone())
    }

    fn remember(&mut self, group: PublishedGroup) {
        if self.published.len() >= PUBLISHED_GROUPS {
            self.published.pop_front();
        }
        self.published.push_back(group);
    }
}

fn single_post(message: &TgMessage) -> SourcePost {
    SourcePost {
        chat_id: message.chat.id.to_string(),
        message_id: message.message_id,
        text: message.body(),
        media: message.media().into_iter().collect(),
    }
}

fn group_post(chat_id: &str, items: &[(i64, MediaRef, Option<String>)]) -> SourcePost {
    SourcePost {
        chat_id: chat_id.to_string(),
        message_id: items.first().map(|(id, _, _)| *id).unwrap_or_default(),
        text: items
            .iter()
            .find_map(|(_, _, caption)| caption.clone().filter(|c| !c.trim().is_empty())),
        media: items.iter().map(|(_, media, _)| media.clone()).collect(),
    }
}

/// Long-poll loop state over the Bot API
pub struct UpdatePoller {
    client: TelegramClient,
    collector: UpdateCollector,
    offset: i64,
    poll_secs: u64,
}

impl UpdatePoller {
    pub fn new(client: TelegramClient, collector: UpdateCollector, poll_secs: u64) -> Self {
        Self {
            client,
            collector,
            offset: 0,
            poll_secs,
        }
    }

    /// One long poll; returns the events that became complete
    pub async fn poll(&mut self) -> ChatResult<Vec<AuthoringEvent>> {
        // Keep polls short while an album is settling so it is not held back
        let wait = if self.collector.has_pending() {
            1
        } else {
            self.poll_secs
        };

        let updates = self.client.get_updates(self.offset, wait).await?;
        let now = Instant::now();
        let mut events = Vec::new();
        for update in updates {
            self.offset = self.offset.max(update.update_id + 1);
            if let Some(event) = self.collector.accept(update, now) {
                events.push(event);
            }
        }
        events.extend(self.collector.flush_ready(Instant::now()));
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(value: serde_json::Value) -> Update {
        serde_json::from_value(value).unwrap()
    }

    fn album_item(update_id: i64, message_id: i64, file_id: &str, caption: Option<&str>) -> Update {
        update(json!({
            "update_id": update_id,
            "channel_post": {
                "message_id": message_id,
                "chat": { "id": -1001, "username": "source" },
                "media_group_id": "g1",
                "caption": caption,
                "photo": [{ "file_id": file_id, "width": 10, "height": 10 }]
            }
        }))
    }

    #[test]
    fn test_filter_by_id_or_username() {
        let chat = TgChat {
            id: -1001,
            username: Some("Source".to_string()),
        };
        assert!(SourceFilter::new("-1001").matches(&chat));
        assert!(SourceFilter::new("@source").matches(&chat));
        assert!(!SourceFilter::new("@other").matches(&chat));
        assert!(!SourceFilter::new("-1002").matches(&chat));
    }

    #[test]
    fn test_foreign_channel_ignored() {
        let mut collector = UpdateCollector::new(SourceFilter::new("-1001"), Duration::from_secs(2));
        let foreign = update(json!({
            "update_id": 1,
            "channel_post": { "message_id": 5, "chat": { "id": -999 }, "text": "hi" }
        }));
        assert!(collector.accept(foreign, Instant::now()).is_none());
    }

    #[test]
    fn test_text_post_published_immediately() {
        let mut collector = UpdateCollector::new(SourceFilter::new("-1001"), Duration::from_secs(2));
        let post = update(json!({
            "update_id": 1,
            "channel_post": { "message_id": 5, "chat": { "id": -1001 }, "text": "hello" }
        }));
        let event = collector.accept(post, Instant::now()).unwrap();
        assert_eq!(
            event,
            AuthoringEvent::Published(SourcePost::text("-1001", 5, "hello"))
        );
    }

    #[test]
    fn test_album_waits_for_settle_window() {
        let settle = Duration::from_secs(2);
        let mut collector = UpdateCollector::new(SourceFilter::new("-1001"), settle);
        let start = Instant::now();

        assert!(collector.accept(album_item(1, 11, "b", None), start).is_none());
        assert!(collector
            .accept(album_item(2, 10, "a", Some("Caption")), start)
            .is_none());
        assert!(collector.flush_ready(start + Duration::from_secs(1)).is_empty());

        let events = collector.flush_ready(start + settle);
        assert_eq!(events.len(), 1);
        let post = events[0].post();
        assert_eq!(post.message_id, 10);
        assert_eq!(post.text.as_deref(), Some("Caption"));
        let files: Vec<&str> = post.media.iter().map(|m| m.file_id.as_str()).collect();
        assert_eq!(files, vec!["a", "b"]);
        assert!(!collector.has_pending());
    }

    #[test]
    fn test_album_edit_rebuilds_whole_post() {
        let mut collector = UpdateCollector::new(SourceFilter::new("-1001"), Duration::ZERO);
        let now = Instant::now();
        collector.accept(album_item(1, 10, "a", Some("Old")), now);
        collector.accept(album_item(2, 11, "b", None), now);
        collector.flush_ready(now);

        let edit = update(json!({
            "update_id": 3,
            "edited_channel_post": {
                "message_id": 10,
                "chat": { "id": -1001 },
                "media_group_id": "g1",
                "caption": "New",
                "photo": [{ "file_id": "a", "width": 10, "height": 10 }]
            }
        }));
        match collector.accept(edit, now) {
            Some(AuthoringEvent::Edited(post)) => {
                assert_eq!(post.message_id, 10);
                assert_eq!(post.text.as_deref(), Some("New"));
                assert_eq!(post.media.len(), 2);
            }
            other => panic!("Expected edited album, got {:?}", other),
        }
    }

    #[test]
    fn test_edit_of_unknown_album_ignored() {
        let mut collector = UpdateCollector::new(SourceFilter::new("-1001"), Duration::ZERO);
        let edit = update(json!({
            "update_id": 3,
            "edited_channel_post": {
                "message_id": 10,
                "chat": { "id": -1001 },
                "media_group_id": "zz",
                "caption": "New",
                "photo": [{ "file_id": "a", "width": 10, "height": 10 }]
            }
        }));
        assert!(collector.accept(edit, Instant::now()).is_none());
    }
}
