//! The session-based transport.
//!
//! An [`ObjectSession`] is created, connected and used exclusively on the session runtime thread,
//! which is why it is neither `Send` nor `Sync` and hands out thread-local futures and streams.

use std::cell::Cell;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::LocalBoxFuture;
use futures::stream::LocalBoxStream;
use futures::{FutureExt, StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;

use super::bot_api::BotApiClient;
use super::{CHUNK_SIZE, FetchError};

/// A stream of object bytes that lives on the session runtime thread.
pub type LocalByteStream = LocalBoxStream<'static, Result<Bytes, FetchError>>;

/// Creates the session on the runtime thread.
pub type SessionFactory = Arc<dyn Fn() -> Box<dyn ObjectSession> + Send + Sync>;

/// A persistent, authenticated connection to the object storage without a size ceiling.
pub trait ObjectSession {
    /// Establishes the session. Called again after a failed attempt.
    fn connect(&self) -> LocalBoxFuture<'_, Result<(), FetchError>>;

    /// Whether [`connect`](Self::connect) has succeeded.
    fn is_connected(&self) -> bool;

    /// Starts streaming the contents of `object_id`.
    fn stream_object(&self, object_id: &str)
    -> LocalBoxFuture<'_, Result<LocalByteStream, FetchError>>;
}

/// A session backed by a self-hosted bot API server.
///
/// Self-hosted servers have no download size ceiling. When running in local mode, `getFile`
/// answers with an absolute path on the server's disk. If that path is readable from this host,
/// the object is streamed straight from disk, otherwise it is downloaded over HTTP.
#[derive(Debug)]
pub struct LocalApiSession {
    client: BotApiClient,
    connected: Cell<bool>,
}

impl LocalApiSession {
    pub fn new(client: BotApiClient) -> Self {
        Self {
            client,
            connected: Cell::new(false),
        }
    }
}

impl ObjectSession for LocalApiSession {
    fn connect(&self) -> LocalBoxFuture<'_, Result<(), FetchError>> {
        async move {
            let user = self.client.get_me().await?;
            tracing::info!(bot_id = user.id, username = ?user.username, "Session connected");
            self.connected.set(true);
            Ok(())
        }
        .boxed_local()
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn stream_object(
        &self,
        object_id: &str,
    ) -> LocalBoxFuture<'_, Result<LocalByteStream, FetchError>> {
        let object_id = object_id.to_owned();
        async move {
            let file = self.client.get_file(&object_id).await?;
            let file_path = file.file_path.ok_or(FetchError::NotFoundUpstream)?;

            let local_path = Path::new(&file_path);
            if local_path.is_absolute() {
                match tokio::fs::File::open(local_path).await {
                    Ok(file) => {
                        tracing::debug!(path = %local_path.display(), "Streaming from local file");
                        let stream = ReaderStream::with_capacity(file, CHUNK_SIZE)
                            .map_err(|err| FetchError::transport(&err));
                        return Ok(stream.boxed_local());
                    }
                    Err(err) => tracing::debug!(
                        error = &err as &dyn std::error::Error,
                        "Local file not readable, downloading instead"
                    ),
                }
            }

            let stream = self.client.download(&file_path).await?;
            Ok(stream.boxed_local())
        }
        .boxed_local()
    }
}
