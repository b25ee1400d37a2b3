//! Wiring of the relay pipeline
//!
//! [`RelayService`] owns one instance of every component, built either from
//! configuration (HTTP adapters, Bot API, ffmpeg) or from caller-supplied
//! collaborators for tests and embedding.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::chat::telegram::TelegramClient;
use crate::chat::ChatClient;
use crate::config::Config;
use crate::credentials::CredentialPool;
use crate::db::Database;
use crate::destinations::DestinationResolver;
use crate::error::Result;
use crate::fanout::{Fanout, FanoutSettings};
use crate::health::{HealthMonitor, SweepReport};
use crate::intake::{AuthoringEvent, SourceFilter, UpdateCollector, UpdatePoller};
use crate::ledger::DeliveryLedger;
use crate::providers::ProviderRegistry;
use crate::render::ffmpeg::FfmpegRenderer;
use crate::render::{MediaRenderer, RenderPool};
use crate::settings::ProviderSwitch;
use crate::translation::TranslationRouter;
use crate::types::Provider;

/// Long-poll wait for Bot API updates
const POLL_SECS: u64 = 25;

pub struct RelayService {
    config: Config,
    db: Database,
    credentials: CredentialPool,
    destinations: DestinationResolver,
    switch: ProviderSwitch,
    fanout: Arc<Fanout>,
    health: HealthMonitor,
}

impl RelayService {
    /// Connect to the database and build the production collaborators
    pub async fn from_config(config: Config) -> Result<Self> {
        let db = Database::new(&config.database.path).await?;
        let providers = ProviderRegistry::from_config(&config.translation)?;
        let chat = TelegramClient::new(
            &config.telegram.api_base,
            config.bot_token()?,
            config.fanout.send_timeout,
        )?;
        let renderer = FfmpegRenderer::new(&config.render);

        Ok(Self::with_parts(
            config,
            db,
            providers,
            Arc::new(chat),
            Arc::new(renderer),
        ))
    }

    pub fn with_parts(
        config: Config,
        db: Database,
        providers: ProviderRegistry,
        chat: Arc<dyn ChatClient>,
        renderer: Arc<dyn MediaRenderer>,
    ) -> Self {
        let credentials = CredentialPool::new(db.clone());
        let source_language = config.translation.source_language.clone();
        let destinations = DestinationResolver::new(db.clone(), source_language.clone());
        let switch = ProviderSwitch::new(db.clone(), config.translation.default_provider);
        let router = TranslationRouter::new(
            credentials.clone(),
            providers.clone(),
            source_language,
            config.translation.request_timeout,
        );
        let renders = RenderPool::new(renderer, config.render.workers, config.render.timeout);
        let health = HealthMonitor::new(
            credentials.clone(),
            providers,
            config.translation.request_timeout,
        );

        let fanout = Fanout::new(
            chat,
            destinations.clone(),
            router,
            renders,
            DeliveryLedger::new(db.clone()),
            switch.clone(),
            FanoutSettings::from_config(&config),
        );

        Self {
            config,
            db,
            credentials,
            destinations,
            switch,
            fanout: Arc::new(fanout),
            health,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn credentials(&self) -> &CredentialPool {
        &self.credentials
    }

    pub fn destinations(&self) -> &DestinationResolver {
        &self.destinations
    }

    pub fn provider_switch(&self) -> &ProviderSwitch {
        &self.switch
    }

    pub fn fanout(&self) -> Arc<Fanout> {
        self.fanout.clone()
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Each provider's sweep period
    pub fn probe_periods(&self) -> Vec<(Provider, Duration)> {
        Provider::ALL
            .iter()
            .map(|&p| (p, self.config.translation.provider(p).probe_period))
            .collect()
    }

    /// One sweep of every provider, in order
    pub async fn sweep_all(&self) -> Result<Vec<(Provider, SweepReport)>> {
        let mut reports = Vec::with_capacity(Provider::ALL.len());
        for provider in Provider::ALL {
            reports.push((provider, self.health.sweep(provider).await?));
        }
        Ok(reports)
    }

    /// Run the fan-out for one event on its own task
    pub fn dispatch(&self, event: AuthoringEvent) -> JoinHandle<()> {
        let fanout = self.fanout.clone();
        tokio::spawn(async move {
            let post_id = event.post().source_post_id();
            match fanout.handle(event).await {
                Ok(report) => info!(post = %post_id, "Run complete: {}", report.summary()),
                Err(e) => error!(post = %post_id, "Run aborted: {}", e),
            }
        })
    }

    /// Bot API poller for the configured source channel
    pub fn poller(&self) -> Result<UpdatePoller> {
        let telegram = &self.config.telegram;
        let client = TelegramClient::new(
            &telegram.api_base,
            self.config.bot_token()?,
            self.config.fanout.send_timeout,
        )?;
        let collector = UpdateCollector::new(
            SourceFilter::new(telegram.source_channel.clone()),
            telegram.group_settle,
        );
        Ok(UpdatePoller::new(client, collector, POLL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::mock::MockChat;
    use crate::providers::mock::MockProvider;
    use crate::render::mock::MockRenderer;
    use crate::types::{Destination, SourcePost};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_dispatch_runs_fanout() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default_config();
        config.database.path = temp_dir.path().join("svc.db").to_string_lossy().to_string();
        config.render.work_dir = Some(temp_dir.path().join("work").to_string_lossy().to_string());

        let db = Database::new(&config.database.path).await.unwrap();
        let providers = ProviderRegistry::new()
            .with(Arc::new(MockProvider::new(Provider::DeepL)))
            .with(Arc::new(MockProvider::new(Provider::Mistral)));
        let chat = MockChat::new();
        let service = RelayService::with_parts(
            config,
            db,
            providers,
            Arc::new(chat.clone()),
            Arc::new(MockRenderer::new()),
        );

        service
            .destinations()
            .add(&Destination {
                channel_id: "-200".to_string(),
                name: "Mirror".to_string(),
                branding: false,
                link_discussion: "https://t.me/d".to_string(),
                text_discussion: "Discuss".to_string(),
                link_invitation: "https://t.me/i".to_string(),
                text_invitation: "Join".to_string(),
            })
            .await
            .unwrap();

        let event = AuthoringEvent::Published(SourcePost::text("-100", 1, "Привет"));
        service.dispatch(event).await.unwrap();

        let sent = chat.sent_to("-200");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.as_deref().unwrap().starts_with("Привет\n\n"));
        assert_eq!(service.probe_periods().len(), 2);
    }

    #[tokio::test]
    async fn test_from_config_requires_bot_token() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default_config();
        config.database.path = temp_dir.path().join("svc.db").to_string_lossy().to_string();
        assert!(RelayService::from_config(config).await.is_err());
    }
}
