//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. The cache directory is recreated lazily, so dropping the
//!    handle too early may silently leak it.
//!
//!  - When using [`MockBotApi`], hold on to it until all requests have been made. It stops
//!    serving when dropped.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{self, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router, middleware};
use serde_json::json;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the telecache crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("telecache=trace,telecache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct MockState {
    token: String,
    size_limit: Option<usize>,
    files: Mutex<HashMap<String, Vec<u8>>>,
}

/// A fake bot API server.
///
/// Objects are registered with [`add_file`](Self::add_file). `getFile` resolves them to
/// `documents/<file_id>`, unless they are larger than the size limit, in which case it answers
/// like the public bot API does for oversized files. Unknown ids are answered with `400`.
///
/// Every request is counted, see [`accesses`](Self::accesses).
pub struct MockBotApi {
    server: Server,
    state: Arc<MockState>,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl MockBotApi {
    /// The public bot API with its download size limit.
    pub fn public(token: &str, size_limit: usize) -> Self {
        Self::new(token, Some(size_limit))
    }

    /// A self-hosted bot API server without size limit.
    pub fn local(token: &str) -> Self {
        Self::new(token, None)
    }

    fn new(token: &str, size_limit: Option<usize>) -> Self {
        let state = Arc::new(MockState {
            token: format!("bot{token}"),
            size_limit,
            files: Default::default(),
        });
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: extract::Request, next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route("/:token/getMe", get(get_me))
            .route("/:token/getFile", get(get_file))
            .route("/file/:token/*path", get(download))
            .layer(middleware::from_fn(hitcounter))
            .with_state(state.clone());

        let server = Server::with_router(router);

        Self {
            server,
            state,
            hits,
        }
    }

    /// Registers an object with the given contents.
    pub fn add_file(&self, file_id: &str, contents: impl Into<Vec<u8>>) {
        let mut files = self.state.files.lock().unwrap();
        files.insert(file_id.to_owned(), contents.into());
    }

    /// The base URL to configure the client with.
    pub fn url(&self) -> String {
        self.server.url("")
    }

    /// Returns the number of requests since the last call, and resets the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns all requested URIs along with their count, and resets the counter.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }
}

fn api_error(status: StatusCode, description: &str) -> Response {
    let body = json!({
        "ok": false,
        "error_code": status.as_u16(),
        "description": description,
    });
    (status, Json(body)).into_response()
}

fn unauthorized() -> Response {
    api_error(StatusCode::UNAUTHORIZED, "Unauthorized")
}

async fn get_me(State(state): State<Arc<MockState>>, Path(token): Path<String>) -> Response {
    if token != state.token {
        return unauthorized();
    }
    Json(json!({
        "ok": true,
        "result": {"id": 1, "is_bot": true, "username": "telecache_test_bot"},
    }))
    .into_response()
}

async fn get_file(
    State(state): State<Arc<MockState>>,
    Path(token): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if token != state.token {
        return unauthorized();
    }
    let file_id = query.get("file_id").cloned().unwrap_or_default();
    let size = match state.files.lock().unwrap().get(&file_id) {
        Some(contents) => contents.len(),
        None => return api_error(StatusCode::BAD_REQUEST, "Bad Request: invalid file_id"),
    };

    if state.size_limit.is_some_and(|limit| size > limit) {
        return api_error(StatusCode::BAD_REQUEST, "Bad Request: file is too big");
    }

    Json(json!({
        "ok": true,
        "result": {
            "file_id": file_id,
            "file_unique_id": format!("unique-{file_id}"),
            "file_size": size,
            "file_path": format!("documents/{file_id}"),
        },
    }))
    .into_response()
}

async fn download(
    State(state): State<Arc<MockState>>,
    Path((token, path)): Path<(String, String)>,
) -> Response {
    if token != state.token {
        return unauthorized();
    }
    let file_id = path.trim_start_matches("documents/");
    match state.files.lock().unwrap().get(file_id) {
        Some(contents) => contents.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
