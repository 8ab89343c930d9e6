use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use telecache_service::config::Config;
use telecache_service::services::Service;

use crate::endpoints;

/// Starts all services and the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let io_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("telecache-io")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("telecache-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let service = Service::create(&config, io_pool.handle().to_owned())
        .context("failed to create service state")?;
    let service = Arc::new(service);

    let socket = config.bind.parse::<SocketAddr>()?;
    let server = axum_server::bind(socket)
        .serve(endpoints::create_app(service.clone()).into_make_service());
    tracing::info!("Starting HTTP server on {}", socket);

    web_pool.block_on(server)?;

    if let Ok(service) = Arc::try_unwrap(service) {
        service.shutdown();
    }
    tracing::info!("System shutdown complete");

    Ok(())
}
