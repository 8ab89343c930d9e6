use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use telecache_service::services::Service;
use telecache_service::services::metadata::MetadataLookup;

use super::ResponseError;

const OCTET_STREAM: &str = "application/octet-stream";

/// Streams an object, with headers derived from its declared mime type.
///
/// Media is displayed inline, everything else is offered as a download named after the object id.
pub async fn get_file(
    State(service): State<Arc<Service>>,
    Path(object_id): Path<String>,
) -> Result<Response, ResponseError> {
    let stream = service.fetch().fetch_object(&object_id).await?;

    let meta = service.metadata().lookup(&object_id).unwrap_or_default();
    let content_type = meta
        .mime_type
        .as_deref()
        .and_then(|mime| HeaderValue::from_str(mime).ok())
        .unwrap_or(HeaderValue::from_static(OCTET_STREAM));
    let disposition = if meta.media_kind().is_inline() {
        HeaderValue::from_static("inline")
    } else {
        HeaderValue::from_str(&format!("attachment; filename=\"{object_id}\""))
            .unwrap_or(HeaderValue::from_static("attachment"))
    };

    let headers = [
        (header::CONTENT_TYPE, content_type),
        (header::CONTENT_DISPOSITION, disposition),
    ];
    Ok((headers, Body::from_stream(stream)).into_response())
}

/// Streams a thumbnail. Thumbnails are always JPEG images.
pub async fn get_thumbnail(
    State(service): State<Arc<Service>>,
    Path(object_id): Path<String>,
) -> Result<Response, ResponseError> {
    let stream = service.fetch().fetch_object(&object_id).await?;

    let headers = [
        (header::CONTENT_TYPE, "image/jpeg"),
        (header::CONTENT_DISPOSITION, "inline"),
    ];
    Ok((headers, Body::from_stream(stream)).into_response())
}
