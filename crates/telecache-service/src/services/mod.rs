//! Provides the internal telecache services and a way to initialize them.
//!
//! [`Service::create`] builds the disk cache, both transports, the fetch strategy and the cache
//! janitor according to the provided [`Config`], and hands them out as one unit.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Handle;

use crate::caching::{DiskCache, Janitor};
use crate::config::Config;
use crate::download::bot_api::BotApiClient;
use crate::download::runtime::SessionRuntime;
use crate::download::session::{LocalApiSession, ObjectSession, SessionFactory};
use crate::utils::http::{DownloadTimeouts, create_client};

pub mod fetch;
pub mod metadata;

use self::fetch::FetchService;
use self::metadata::MemoryMetadata;

/// All services of a running telecache instance.
#[derive(Debug)]
pub struct Service {
    cache: Arc<DiskCache>,
    metadata: Arc<MemoryMetadata>,
    runtime: Arc<SessionRuntime>,
    fetch: FetchService,
    janitor: Option<Janitor>,
}

impl Service {
    /// Creates all services.
    ///
    /// Background downloads are spawned onto `io_pool`. The session runtime is only started if a
    /// session URL is configured.
    pub fn create(config: &Config, io_pool: Handle) -> Result<Self> {
        let cache = DiskCache::from_config(config).context("failed to create cache directory")?;
        let cache = Arc::new(cache);

        let metadata = match config.metadata_index {
            Some(ref path) => MemoryMetadata::from_file(path)?,
            None => MemoryMetadata::new(),
        };
        let metadata = Arc::new(metadata);

        let client = create_client(&DownloadTimeouts::from_config(config));
        let bot_api = BotApiClient::new(client, &config.bot_api.url, &config.bot_api.token);

        let runtime = Arc::new(SessionRuntime::new(
            session_factory(config),
            config.session.queue_capacity,
            config.connect_timeout,
        ));
        if config.session.url.is_some() {
            runtime
                .start()
                .context("failed to start session runtime")?;
        } else {
            tracing::warn!("No session configured, oversized objects cannot be served");
        }

        let fetch = FetchService::new(
            cache.clone(),
            bot_api,
            runtime.clone(),
            metadata.clone(),
            config.max_background_downloads,
            io_pool,
        );

        let janitor = Janitor::spawn(cache.clone(), config.cache.cleanup_interval)
            .context("failed to spawn cache janitor")?;

        Ok(Self {
            cache,
            metadata,
            runtime,
            fetch,
            janitor,
        })
    }

    pub fn fetch(&self) -> &FetchService {
        &self.fetch
    }

    pub fn cache(&self) -> &Arc<DiskCache> {
        &self.cache
    }

    /// The metadata index, for registering objects.
    pub fn metadata(&self) -> &Arc<MemoryMetadata> {
        &self.metadata
    }

    pub fn runtime(&self) -> &Arc<SessionRuntime> {
        &self.runtime
    }

    /// Stops the janitor and the session runtime.
    pub fn shutdown(mut self) {
        if let Some(janitor) = self.janitor.take() {
            janitor.shutdown();
        }
        self.runtime.shutdown();
    }
}

/// Creates sessions talking to the configured self-hosted bot API server.
fn session_factory(config: &Config) -> SessionFactory {
    let url = config.session.url.clone().unwrap_or_default();
    let token = config.session_token().to_owned();
    let timeouts = DownloadTimeouts::streaming(config);

    Arc::new(move || {
        let client = BotApiClient::new(create_client(&timeouts), &url, token.clone());
        Box::new(LocalApiSession::new(client)) as Box<dyn ObjectSession>
    })
}
