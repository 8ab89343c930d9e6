use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use telecache_service::services::Service;
use tower::ServiceBuilder;

mod cache;
mod error;
mod files;
mod metrics;

pub use error::ResponseError;
use metrics::MetricsLayer;

use cache::{cache_file, cache_size, cache_status, clear_cache, clear_file_cache};
use files::{get_file, get_thumbnail};

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: Arc<Service>) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);
    Router::new()
        .route("/files/:object_id", get(get_file))
        .route("/thumbnail/:object_id", get(get_thumbnail))
        .route("/api/cache_file/:object_id", post(cache_file))
        .route("/api/cache_status/:object_id", get(cache_status))
        .route("/api/cache_size", get(cache_size))
        .route("/clear_cache", post(clear_cache))
        .route("/clear_file_cache", post(clear_file_cache))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
