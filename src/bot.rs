use crate::config::BotConfig;
use crate::dispatch::{LoggingDispatcher, MessageDispatcher};
use crate::error::SessionError;
use crate::health::HealthState;
use crate::router::EventRouter;
use crate::session::{ReconnectPolicy, SessionExit, SessionLifecycleController};
use crate::store::{CredentialStore, MetadataCache};
use crate::transport::{SidecarTransportFactory, TransportFactory};
use anyhow::Result;
use log::info;
use std::sync::Arc;
use tokio::task;

pub struct Bot {
    config: BotConfig,
    credentials: Arc<CredentialStore>,
    cache: Arc<MetadataCache>,
    controller: Arc<SessionLifecycleController>,
}

impl Bot {
    pub fn builder() -> BotBuilder {
        BotBuilder::new()
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn controller(&self) -> Arc<SessionLifecycleController> {
        self.controller.clone()
    }

    pub fn cache(&self) -> Arc<MetadataCache> {
        self.cache.clone()
    }

    pub fn credentials(&self) -> Arc<CredentialStore> {
        self.credentials.clone()
    }

    pub fn health_state(&self) -> HealthState {
        HealthState {
            status: self.controller.status(),
            qr: self.controller.qr_codes(),
            pairing: self.controller.pairing(),
        }
    }

    /// Starts the periodic cache write-back and the session loop. The saver
    /// stops when the loop returns.
    pub async fn run(&self) -> Result<task::JoinHandle<Result<SessionExit, SessionError>>> {
        if self.controller.is_running() {
            return Err(SessionError::AlreadyRunning.into());
        }

        let saver = self
            .cache
            .clone()
            .run_background_saver(self.config.store_write_interval());
        let controller = self.controller.clone();
        let handle = tokio::spawn(async move {
            let _saver = scopeguard::guard(saver, |saver| saver.abort());
            controller.run().await
        });
        Ok(handle)
    }

    /// Asks the session loop to stop and writes the cache back one last time.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down, saving metadata store...");
        self.controller.shutdown();
        self.cache.flush().await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct BotBuilder {
    config: BotConfig,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    dispatcher: Option<Arc<dyn MessageDispatcher>>,
    reconnect_policy: Option<Arc<dyn ReconnectPolicy>>,
}

impl BotBuilder {
    fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: BotConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom transport instead of the configured sidecar program.
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn MessageDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Overrides the policy selected by [`BotConfig::on_logout`].
    pub fn with_reconnect_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.reconnect_policy = Some(policy);
        self
    }

    pub async fn build(self) -> Result<Bot> {
        let config = self.config;

        info!(
            "Opening credential store at '{}'...",
            config.session_dir.display()
        );
        let credentials = Arc::new(
            CredentialStore::open(&config.session_dir)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to open credential store: {}", e))?,
        );

        let cache = Arc::new(MetadataCache::new(
            &config.store_file,
            config.max_messages_per_chat,
        ));
        cache
            .load()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load metadata store: {}", e))?;

        let factory = self.transport_factory.unwrap_or_else(|| {
            Arc::new(SidecarTransportFactory::new(
                config.sidecar.clone(),
                config.sidecar_args.clone(),
            ))
        });
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(LoggingDispatcher));
        let policy = self
            .reconnect_policy
            .unwrap_or_else(|| config.reconnect_policy());

        let router = EventRouter::new(
            cache.clone(),
            credentials.clone(),
            dispatcher,
            config.public_mode(),
        );
        let mut controller =
            SessionLifecycleController::new(credentials.clone(), cache.clone(), factory, router)
                .with_reconnect_policy(policy);
        if let Some(flow) = config.pairing_flow() {
            controller = controller.with_pairing(flow);
        }

        Ok(Bot {
            config,
            credentials,
            cache,
            controller: Arc::new(controller),
        })
    }
}
