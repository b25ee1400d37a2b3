//! Fan-out of one authored post to every destination
//!
//! A run moves through `Collecting -> Rendering -> Translating & Sending ->
//! Finalizing`. Destinations are processed as independent futures collected
//! in completion order, so a slow render or send for one channel never holds
//! back the others, and a failure in one is recorded in the
//! [`DeliveryReport`] instead of aborting the run. Only pre-flight steps
//! (listing destinations, downloading the source media) can fail a whole run.
//!
//! Downloaded media and every render output live in one scratch directory
//! per run that is removed on every exit path.
//!
//! Runs for the same source post never overlap: an edit that arrives while
//! its publish is still rendering waits for it, so the ledger it retracts
//! from is complete.

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{OnceCell, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::chat::{ChatClient, ChatResult, OutgoingMedia};
use crate::config::{Config, FailurePolicy, LimitsConfig};
use crate::destinations::DestinationResolver;
use crate::error::{ChatError, RelayError, RenderError, Result};
use crate::intake::AuthoringEvent;
use crate::ledger::DeliveryLedger;
use crate::render::{RenderJob, RenderPool};
use crate::settings::ProviderSwitch;
use crate::translation::TranslationRouter;
use crate::types::{ContentType, Delivery, Destination, Language, MediaKind, Provider, SourcePost, TranslationJob};

/// Behavior knobs of the orchestrator
#[derive(Debug, Clone)]
pub struct FanoutSettings {
    pub limits: LimitsConfig,
    pub send_timeout: Duration,
    pub report_to_source: bool,
    pub translation_policy: FailurePolicy,
    pub render_policy: FailurePolicy,
    /// Parent of per-run scratch directories; system temp dir when `None`
    pub work_dir: Option<PathBuf>,
}

impl FanoutSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            limits: config.limits.clone(),
            send_timeout: config.fanout.send_timeout,
            report_to_source: config.fanout.report_to_source,
            translation_policy: config.translation.failure_policy,
            render_policy: config.render.failure_policy,
            work_dir: config.work_dir(),
        }
    }
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self::from_config(&Config::default_config())
    }
}

/// Why one destination did not receive the post
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Render(String),
    Translation(String),
    /// Final text or caption is not under the budget
    Policy { length: usize, limit: usize },
    Send(String),
    /// Storage lookups for the destination failed
    Internal(String),
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Render(_) => "render",
            FailureKind::Translation(_) => "translation",
            FailureKind::Policy { .. } => "policy",
            FailureKind::Send(_) => "send",
            FailureKind::Internal(_) => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationFailure {
    pub destination_id: String,
    pub name: String,
    pub kind: FailureKind,
}

/// Per-run aggregate of what reached where
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub source_post_id: String,
    /// In completion order
    pub delivered: Vec<Delivery>,
    /// Destinations that got untranslated text or unbranded media
    pub degraded: Vec<String>,
    pub failures: Vec<DestinationFailure>,
}

impl DeliveryReport {
    fn new(source_post_id: String) -> Self {
        Self {
            source_post_id,
            ..Default::default()
        }
    }

    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failures.len()
    }

    /// Number of failures of one kind (`"render"`, `"policy"`, ...)
    pub fn failures_labeled(&self, label: &str) -> usize {
        self.failures
            .iter()
            .filter(|f| f.kind.label() == label)
            .count()
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Post {}: delivered to {} of {} channels",
            self.source_post_id,
            self.delivered.len(),
            self.attempted()
        );

        if !self.failures.is_empty() {
            let mut counts: Vec<(&'static str, usize)> = Vec::new();
            for failure in &self.failures {
                let label = failure.kind.label();
                match counts.iter_mut().find(|(l, _)| *l == label) {
                    Some((_, n)) => *n += 1,
                    None => counts.push((label, 1)),
                }
            }
            let detail: Vec<String> = counts
                .iter()
                .map(|(label, n)| format!("{} {}", label, n))
                .collect();
            summary.push_str(&format!("; failed: {}", detail.join(", ")));
        }
        if !self.degraded.is_empty() {
            summary.push_str(&format!("; sent degraded: {}", self.degraded.len()));
        }
        summary
    }
}

enum DestinationOutcome {
    Delivered { delivery: Delivery, degraded: bool },
    Failed(DestinationFailure),
}

fn failed(destination: &Destination, kind: FailureKind) -> DestinationOutcome {
    DestinationOutcome::Failed(DestinationFailure {
        destination_id: destination.channel_id.clone(),
        name: destination.name.clone(),
        kind,
    })
}

type TranslationCell = Arc<OnceCell<std::result::Result<String, String>>>;

/// State shared by the destination futures of one run
struct Run<'a> {
    post: &'a SourcePost,
    sources: Vec<(MediaKind, PathBuf)>,
    scratch: &'a Path,
    preferred: Provider,
    /// One translation per target language per run
    translations: Mutex<HashMap<String, TranslationCell>>,
}

pub struct Fanout {
    chat: Arc<dyn ChatClient>,
    resolver: DestinationResolver,
    router: TranslationRouter,
    renders: RenderPool,
    ledger: DeliveryLedger,
    switch: ProviderSwitch,
    settings: FanoutSettings,
    /// One turn per source post; entries nobody holds are pruned
    turns: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Fanout {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        resolver: DestinationResolver,
        router: TranslationRouter,
        renders: RenderPool,
        ledger: DeliveryLedger,
        switch: ProviderSwitch,
        settings: FanoutSettings,
    ) -> Self {
        Self {
            chat,
            resolver,
            router,
            renders,
            ledger,
            switch,
            settings,
            turns: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle(&self, event: AuthoringEvent) -> Result<DeliveryReport> {
        match event {
            AuthoringEvent::Published(post) => self.publish(&post).await,
            AuthoringEvent::Edited(post) => self.replay_edit(&post).await,
        }
    }

    /// Publish a new post to every destination
    pub async fn publish(&self, post: &SourcePost) -> Result<DeliveryReport> {
        let _turn = self.turn(&post.source_post_id()).await;
        self.screen(post).await?;
        self.run(post).await
    }

    /// Delete what an earlier publish of this post sent, then publish it afresh
    pub async fn replay_edit(&self, post: &SourcePost) -> Result<DeliveryReport> {
        let source_post_id = post.source_post_id();
        let _turn = self.turn(&source_post_id).await;
        self.screen(post).await?;

        let deliveries = self.ledger.lookup(&source_post_id).await?;
        info!(
            post = %source_post_id,
            destinations = deliveries.len(),
            "Retracting previous delivery before republishing"
        );
        join_all(
            deliveries
                .iter()
                .map(|delivery| self.retract(&source_post_id, delivery)),
        )
        .await;

        self.run(post).await
    }

    /// Wait until no other run of this source post is in progress.
    ///
    /// Waiters are served in arrival order.
    async fn turn(&self, source_post_id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut turns = self
                .turns
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            turns.retain(|_, slot| Arc::strong_count(slot) > 1);
            turns.entry(source_post_id.to_string()).or_default().clone()
        };
        if slot.try_lock().is_err() {
            debug!(post = %source_post_id, "Waiting for the previous run of this post");
        }
        slot.lock_owned().await
    }

    /// Submission limits checked before any fan-out work
    pub fn check_submission(&self, post: &SourcePost) -> Result<()> {
        let limits = &self.settings.limits;
        let length = post.text.as_deref().map_or(0, |t| t.chars().count());

        if post.media.len() > limits.max_group_items {
            return Err(RelayError::Rejected(format!(
                "Media group has {} items, at most {} are allowed. The post will not be sent",
                post.media.len(),
                limits.max_group_items
            )));
        }

        match post.content_type() {
            ContentType::Text => {
                if length == 0 || post.text.as_deref().is_some_and(|t| t.trim().is_empty()) {
                    return Err(RelayError::Rejected(
                        "Post has neither text nor media. Nothing to send".to_string(),
                    ));
                }
                if length > limits.max_source_text {
                    return Err(RelayError::Rejected(format!(
                        "Text has {} characters, more than {}. The post will not be sent",
                        length, limits.max_source_text
                    )));
                }
            }
            ContentType::Media | ContentType::MediaGroup => {
                if length > limits.max_source_caption {
                    return Err(RelayError::Rejected(format!(
                        "Caption has {} characters, more than {}. The post will not be sent",
                        length, limits.max_source_caption
                    )));
                }
            }
        }
        Ok(())
    }

    async fn screen(&self, post: &SourcePost) -> Result<()> {
        if let Err(e) = self.check_submission(post) {
            if let RelayError::Rejected(reason) = &e {
                warn!(post = %post.source_post_id(), "Submission rejected: {}", reason);
                self.notify_sender(post, reason).await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn run(&self, post: &SourcePost) -> Result<DeliveryReport> {
        // Collecting
        let destinations = self.resolver.list().await?;
        let preferred = self.switch.current().await?;
        let scratch = self.scratch_dir()?;

        let mut sources = Vec::with_capacity(post.media.len());
        for media in &post.media {
            let path = self.chat.download_media(media, scratch.path()).await?;
            sources.push((media.kind, path));
        }

        info!(
            post = %post.source_post_id(),
            destinations = destinations.len(),
            media = sources.len(),
            provider = %preferred,
            "Fan-out started"
        );

        let run = Run {
            post,
            sources,
            scratch: scratch.path(),
            preferred,
            translations: Mutex::new(HashMap::new()),
        };

        // Rendering, translating and sending, per destination
        let mut pending: FuturesUnordered<_> = destinations
            .into_iter()
            .map(|destination| self.deliver(&run, destination))
            .collect();

        let mut report = DeliveryReport::new(post.source_post_id());
        while let Some(outcome) = pending.next().await {
            match outcome {
                DestinationOutcome::Delivered { delivery, degraded } => {
                    if degraded {
                        report.degraded.push(delivery.destination_id.clone());
                    }
                    report.delivered.push(delivery);
                }
                DestinationOutcome::Failed(failure) => {
                    warn!(
                        post = %report.source_post_id,
                        destination = %failure.destination_id,
                        kind = failure.kind.label(),
                        "Destination failed: {:?}",
                        failure.kind
                    );
                    report.failures.push(failure);
                }
            }
        }
        drop(pending);
        drop(run);

        // Finalizing
        if let Err(e) = scratch.close() {
            warn!("Failed to remove run scratch directory: {}", e);
        }

        let summary = report.summary();
        info!("{}", summary);
        if self.settings.report_to_source {
            self.notify_sender(post, &summary).await;
        }
        Ok(report)
    }

    async fn deliver(&self, run: &Run<'_>, destination: Destination) -> DestinationOutcome {
        let language = match self.resolver.resolve_language(&destination.channel_id).await {
            Ok(language) => language,
            Err(e) => return failed(&destination, FailureKind::Internal(e.to_string())),
        };
        let mut degraded = false;

        let media = match self.render_for(run, &destination).await {
            Ok((media, fell_back)) => {
                degraded |= fell_back;
                media
            }
            Err(kind) => return failed(&destination, kind),
        };

        let body = match run.post.text.as_deref().filter(|t| !t.trim().is_empty()) {
            None => None,
            Some(text) if self.router.is_source_language(&language) => Some(text.to_string()),
            Some(text) => match self.translated(run, text, &language).await {
                Ok(translated) => Some(translated),
                Err(e) => match self.settings.translation_policy {
                    FailurePolicy::Skip => {
                        return failed(&destination, FailureKind::Translation(e));
                    }
                    FailurePolicy::SendOriginal => {
                        warn!(destination = %destination.channel_id, "Sending untranslated text: {}", e);
                        degraded = true;
                        Some(text.to_string())
                    }
                },
            },
        };

        let content = destination.compose_caption(body.as_deref());
        let limit = if media.is_empty() {
            self.settings.limits.text_budget
        } else {
            self.settings.limits.caption_budget
        };
        let length = content.chars().count();
        if length >= limit {
            self.notify_sender(
                run.post,
                &format!(
                    "Could not send to {}: {} characters, must be under {}",
                    destination.name, length, limit
                ),
            )
            .await;
            return failed(&destination, FailureKind::Policy { length, limit });
        }

        let message_ids = match self.send(&destination.channel_id, content, media).await {
            Ok(ids) => ids,
            Err(e) => return failed(&destination, FailureKind::Send(e.to_string())),
        };

        let source_post_id = run.post.source_post_id();
        if let Err(e) = self
            .ledger
            .record(&source_post_id, &destination.channel_id, &message_ids)
            .await
        {
            error!(
                post = %source_post_id,
                destination = %destination.channel_id,
                "Sent but could not record delivery: {}",
                e
            );
        }
        debug!(destination = %destination.channel_id, ?message_ids, "Delivered");

        DestinationOutcome::Delivered {
            delivery: Delivery {
                destination_id: destination.channel_id,
                message_ids,
                sent_at: chrono::Utc::now().timestamp(),
            },
            degraded,
        }
    }

    /// Render every source item for one destination, in item order.
    ///
    /// The flag is set when the original media stands in for a failed render.
    async fn render_for(
        &self,
        run: &Run<'_>,
        destination: &Destination,
    ) -> std::result::Result<(Vec<(MediaKind, PathBuf)>, bool), FailureKind> {
        if run.sources.is_empty() {
            return Ok((Vec::new(), false));
        }

        let branding = destination.branding.then(|| destination.name.clone());
        let jobs = run
            .sources
            .iter()
            .enumerate()
            .map(|(item, (kind, source))| RenderJob {
                destination_id: destination.channel_id.clone(),
                item,
                source: source.clone(),
                kind: *kind,
                branding: branding.clone(),
                output: RenderJob::output_in(run.scratch, &destination.channel_id, item, *kind),
            })
            .collect();

        let mut rendered: Vec<Option<PathBuf>> = vec![None; run.sources.len()];
        let mut first_error = None;
        for outcome in self.renders.render_all(jobs).await {
            match outcome.result {
                Ok(path) => rendered[outcome.item] = Some(path),
                Err(e) => {
                    warn!(destination = %outcome.destination_id, item = outcome.item, "Render failed: {}", e);
                    first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        let fell_back = match (first_error, self.settings.render_policy) {
            (None, _) => false,
            (Some(e), FailurePolicy::Skip) => return Err(FailureKind::Render(e)),
            (Some(_), FailurePolicy::SendOriginal) => true,
        };

        let media = run
            .sources
            .iter()
            .zip(rendered)
            .map(|((kind, source), path)| (*kind, path.unwrap_or_else(|| source.clone())))
            .collect();
        Ok((media, fell_back))
    }

    async fn translated(
        &self,
        run: &Run<'_>,
        text: &str,
        language: &Language,
    ) -> std::result::Result<String, String> {
        let cell = {
            let mut cache = run
                .translations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cache
                .entry(language.code.to_uppercase())
                .or_default()
                .clone()
        };

        cell.get_or_init(|| async {
            let job = TranslationJob {
                text: text.to_string(),
                target: language.clone(),
                preferred: run.preferred,
            };
            self.router.translate(&job).await.map_err(|e| e.to_string())
        })
        .await
        .clone()
    }

    async fn send(
        &self,
        chat_id: &str,
        content: String,
        media: Vec<(MediaKind, PathBuf)>,
    ) -> ChatResult<Vec<i64>> {
        let send_timeout = self.settings.send_timeout;
        let call = async {
            match media.len() {
                0 => self.chat.send_text(chat_id, &content).await.map(|id| vec![id]),
                1 => {
                    let (kind, path) = media[0].clone();
                    let outgoing = OutgoingMedia {
                        kind,
                        path,
                        caption: Some(content.clone()),
                    };
                    self.chat.send_media(chat_id, &outgoing).await.map(|id| vec![id])
                }
                _ => {
                    // Only the first album item carries the caption
                    let items: Vec<OutgoingMedia> = media
                        .iter()
                        .enumerate()
                        .map(|(index, (kind, path))| OutgoingMedia {
                            kind: *kind,
                            path: path.clone(),
                            caption: (index == 0).then(|| content.clone()),
                        })
                        .collect();
                    self.chat.send_media_group(chat_id, &items).await
                }
            }
        };

        timeout(send_timeout, call)
            .await
            .unwrap_or_else(|_| Err(ChatError::Timeout(send_timeout.as_secs())))
    }

    /// Best-effort deletion of one destination's earlier messages
    async fn retract(&self, source_post_id: &str, delivery: &Delivery) {
        let mut complete = true;
        for message_id in &delivery.message_ids {
            let call = self
                .chat
                .delete_message(&delivery.destination_id, *message_id);
            match timeout(self.settings.send_timeout, call).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(destination = %delivery.destination_id, message_id, "Delete failed: {}", e);
                    complete = false;
                }
                Err(_) => {
                    warn!(destination = %delivery.destination_id, message_id, "Delete timed out");
                    complete = false;
                }
            }
        }

        if complete {
            if let Err(e) = self
                .ledger
                .forget(source_post_id, &delivery.destination_id)
                .await
            {
                warn!(destination = %delivery.destination_id, "Failed to drop ledger entry: {}", e);
            }
        }
    }

    fn scratch_dir(&self) -> Result<TempDir> {
        let dir = match &self.settings.work_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent).map_err(RenderError::from)?;
                tempfile::Builder::new()
                    .prefix("relaycast-run-")
                    .tempdir_in(parent)
            }
            None => tempfile::Builder::new().prefix("relaycast-run-").tempdir(),
        };
        Ok(dir.map_err(RenderError::from)?)
    }

    async fn notify_sender(&self, post: &SourcePost, text: &str) {
        if let Err(e) = self.chat.reply(&post.chat_id, post.message_id, text).await {
            warn!(post = %post.source_post_id(), "Failed to reply to source post: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> DeliveryReport {
        DeliveryReport {
            source_post_id: "42".to_string(),
            delivered: vec![Delivery {
                destination_id: "-1".to_string(),
                message_ids: vec![1],
                sent_at: 0,
            }],
            degraded: Vec::new(),
            failures: vec![
                DestinationFailure {
                    destination_id: "-2".to_string(),
                    name: "Two".to_string(),
                    kind: FailureKind::Render("boom".to_string()),
                },
                DestinationFailure {
                    destination_id: "-3".to_string(),
                    name: "Three".to_string(),
                    kind: FailureKind::Policy {
                        length: 4100,
                        limit: 4000,
                    },
                },
                DestinationFailure {
                    destination_id: "-4".to_string(),
                    name: "Four".to_string(),
                    kind: FailureKind::Render("boom".to_string()),
                },
            ],
        }
    }

    #[test]
    fn test_summary_counts_by_kind() {
        let report = report();
        assert_eq!(report.attempted(), 4);
        assert_eq!(report.failures_labeled("render"), 2);
        assert_eq!(
            report.summary(),
            "Post 42: delivered to 1 of 4 channels; failed: render 2, policy 1"
        );
    }

    #[test]
    fn test_summary_all_delivered() {
        let mut report = report();
        report.failures.clear();
        report.degraded.push("-1".to_string());
        assert_eq!(
            report.summary(),
            "Post 42: delivered to 1 of 1 channels; sent degraded: 1"
        );
    }
}
