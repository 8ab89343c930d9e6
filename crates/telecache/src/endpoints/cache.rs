use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use telecache_service::services::Service;

use super::ResponseError;
use super::error::{ActionResponse, fetch_error_status};

/// Starts caching an object in the background.
pub async fn cache_file(
    State(service): State<Arc<Service>>,
    Path(object_id): Path<String>,
) -> Response {
    match service.fetch().prefetch(&object_id) {
        Ok(()) => {
            ActionResponse::success(format!("Started caching file {object_id} in the background."))
                .into_response()
        }
        Err(err) => {
            let status = fetch_error_status(&err);
            (status, ActionResponse::failure(err.to_string())).into_response()
        }
    }
}

/// Reports how much of an object is cached.
pub async fn cache_status(
    State(service): State<Arc<Service>>,
    Path(object_id): Path<String>,
) -> Result<Response, ResponseError> {
    let response = match service.fetch().cache_status(&object_id).await? {
        Some(report) => Json(report).into_response(),
        None => {
            let body = json!({
                "status": "error",
                "message": "File not found or file size is unknown.",
            });
            (StatusCode::NOT_FOUND, Json(body)).into_response()
        }
    };
    Ok(response)
}

pub async fn cache_size(State(service): State<Arc<Service>>) -> Result<Response, ResponseError> {
    let bytes = service.fetch().cache_size().await?;
    Ok(Json(json!({ "bytes": bytes })).into_response())
}

/// Removes all cached objects.
pub async fn clear_cache(State(service): State<Arc<Service>>) -> Response {
    match service.fetch().clear_cache().await {
        Ok(()) => ActionResponse::success("Cache cleared").into_response(),
        Err(err) => {
            tracing::error!(error = &err as &dyn std::error::Error, "Failed to clear the cache");
            let status = fetch_error_status(&err);
            (status, ActionResponse::failure(err.to_string())).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ClearFileCacheRequest {
    file_id: Option<String>,
    thumbnail_id: Option<String>,
}

/// Removes the cache files of an object and its thumbnail.
pub async fn clear_file_cache(
    State(service): State<Arc<Service>>,
    request: Result<Json<ClearFileCacheRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = request else {
        return (
            StatusCode::BAD_REQUEST,
            ActionResponse::failure("Invalid JSON data"),
        )
            .into_response();
    };
    let Some(file_id) = request.file_id else {
        return (
            StatusCode::BAD_REQUEST,
            ActionResponse::failure("File ID missing"),
        )
            .into_response();
    };

    let mut object_ids = vec![file_id];
    object_ids.extend(request.thumbnail_id);
    service.fetch().invalidate(&object_ids).await;

    ActionResponse::success("Cache cleared").into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::{Client, StatusCode};
    use serde_json::{Value, json};

    use crate::test;

    #[tokio::test]
    async fn test_cache_status() {
        let env = test::setup_server();
        env.add_object("abc", &[7; 100], None);

        let response = Client::new()
            .get(env.server.url("/api/cache_status/abc"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        insta::assert_json_snapshot!(body, @r###"
        {
          "cached_bytes": 0,
          "status": "not_cached",
          "total_bytes": 100
        }
        "###);

        std::fs::write(env.cache_file("abc"), [7u8; 40]).unwrap();
        let body: Value = Client::new()
            .get(env.server.url("/api/cache_status/abc"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "caching");
        assert_eq!(body["cached_bytes"], 40);
    }

    #[tokio::test]
    async fn test_cache_status_unknown_size() {
        let env = test::setup_server();

        let response = Client::new()
            .get(env.server.url("/api/cache_status/unknown"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Value = response.json().await.unwrap();
        insta::assert_json_snapshot!(body, @r###"
        {
          "message": "File not found or file size is unknown.",
          "status": "error"
        }
        "###);
    }

    #[tokio::test]
    async fn test_cache_file() {
        let env = test::setup_server();
        env.add_object("abc", &[1; 100], None);
        let client = Client::new();

        let response = client
            .post(env.server.url("/api/cache_file/abc"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["success"], true);

        for _ in 0..500 {
            if env.service.fetch().inflight().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let body: Value = client
            .get(env.server.url("/api/cache_status/abc"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "completed");

        let body: Value = client
            .get(env.server.url("/api/cache_size"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({ "bytes": 100 }));
    }

    #[tokio::test]
    async fn test_cache_file_in_progress() {
        let env = test::setup_server_with_idle_pool();
        env.add_object("abc", &[1; 100], None);
        env.service.fetch().prefetch("abc").unwrap();

        let response = Client::new()
            .post(env.server.url("/api/cache_file/abc"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: Value = response.json().await.unwrap();
        insta::assert_json_snapshot!(body, @r###"
        {
          "message": "caching is already in progress for this file",
          "success": false
        }
        "###);
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let env = test::setup_server();
        std::fs::write(env.cache_file("a"), b"aaa").unwrap();
        std::fs::write(env.cache_file("b"), b"bbb").unwrap();

        let response = Client::new()
            .post(env.server.url("/clear_cache"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({"success": true, "message": "Cache cleared"}));
        assert!(!env.cache_file("a").exists());
        assert!(env.cache_dir.path().is_dir());
    }

    #[tokio::test]
    async fn test_clear_file_cache() {
        let env = test::setup_server();
        std::fs::write(env.cache_file("file"), b"file").unwrap();
        std::fs::write(env.cache_file("thumb"), b"thumb").unwrap();
        std::fs::write(env.cache_file("other"), b"other").unwrap();
        let client = Client::new();

        let response = client
            .post(env.server.url("/clear_file_cache"))
            .json(&json!({"file_id": "file", "thumbnail_id": "thumb"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!env.cache_file("file").exists());
        assert!(!env.cache_file("thumb").exists());
        assert!(env.cache_file("other").exists());

        let response = client
            .post(env.server.url("/clear_file_cache"))
            .json(&json!({"thumbnail_id": "thumb"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({"success": false, "message": "File ID missing"}));

        let response = client
            .post(env.server.url("/clear_file_cache"))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["message"], "Invalid JSON data");
    }
}
