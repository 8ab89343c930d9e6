//! The tiered retrieval strategy.
//!
//! An object is served from the first tier that can provide it:
//!
//! 1. A fresh and complete cache file is streamed straight from disk.
//! 2. Otherwise the object is resolved through the bot API and downloaded over HTTP, writing
//!    every chunk to the cache while it is handed to the consumer.
//! 3. If the bot API refuses the object because it is too big, a job is submitted to the
//!    session runtime, which writes the cache file itself and forwards the chunks.
//!
//! Every stream produced here yields chunks of exactly [`CHUNK_SIZE`] bytes, except for the last
//! one. Dropping a stream early discards the partial cache file.

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tokio::runtime::Handle;

use crate::caching::{CacheStatusReport, CacheWriter, DiskCache, FetchError, validate_object_id};
use crate::download::bot_api::{BotApiClient, GetFileError, RemoteFile};
use crate::download::runtime::SessionRuntime;
use crate::download::{ByteStream, CHUNK_SIZE, rechunk};
use crate::utils::defer::defer;

use super::metadata::MetadataLookup;

/// Retrieves objects through the cache and the two transports.
#[derive(Clone, Debug)]
pub struct FetchService {
    inner: Arc<FetchServiceInner>,
}

#[derive(Debug)]
struct FetchServiceInner {
    cache: Arc<DiskCache>,
    bot_api: BotApiClient,
    runtime: Arc<SessionRuntime>,
    metadata: Arc<dyn MetadataLookup>,
    inflight: InflightRegistry,
    spawn_pool: Handle,
}

impl FetchService {
    /// Creates the service.
    ///
    /// Background downloads started by [`prefetch`](Self::prefetch) run on `spawn_pool`, at most
    /// `max_inflight` of them at a time.
    pub fn new(
        cache: Arc<DiskCache>,
        bot_api: BotApiClient,
        runtime: Arc<SessionRuntime>,
        metadata: Arc<dyn MetadataLookup>,
        max_inflight: usize,
        spawn_pool: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(FetchServiceInner {
                cache,
                bot_api,
                runtime,
                metadata,
                inflight: InflightRegistry::new(max_inflight),
                spawn_pool,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<DiskCache> {
        &self.inner.cache
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataLookup> {
        &self.inner.metadata
    }

    /// Background downloads currently running.
    pub fn inflight(&self) -> &InflightRegistry {
        &self.inner.inflight
    }

    /// Returns a stream of the contents of `object_id`.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_object(&self, object_id: &str) -> Result<ByteStream, FetchError> {
        validate_object_id(object_id)?;
        let declared_size = self
            .inner
            .metadata
            .lookup(object_id)
            .and_then(|meta| meta.size);

        if self.is_cache_hit(object_id, declared_size).await {
            if let Some(stream) = self.inner.cache.open_for_read(object_id).await {
                tracing::debug!("Serving from cache");
                metric!(counter("fetch.cache") += 1, "hit" => "true");
                return Ok(stream);
            }
        }
        metric!(counter("fetch.cache") += 1, "hit" => "false");

        let start = Instant::now();
        let result = match self.inner.bot_api.get_file(object_id).await {
            Ok(file) => self.fetch_direct(object_id, file).await,
            Err(GetFileError::TooBig) => {
                tracing::debug!("Falling back to the session runtime");
                self.fetch_via_session(object_id)
            }
            Err(err) => Err(err.into()),
        };

        match &result {
            Ok(_) => {
                metric!(timer("fetch.resolve.duration") = start.elapsed(), "status" => "ok");
            }
            Err(err) => {
                tracing::debug!(error = err as &dyn std::error::Error, "Failed to fetch object");
                metric!(timer("fetch.resolve.duration") = start.elapsed(), "status" => err.metric_tag());
                match err {
                    FetchError::RuntimeNotStarted | FetchError::QueueFull => {}
                    _ => self.invalidate(&[object_id]).await,
                }
            }
        }
        result
    }

    async fn is_cache_hit(&self, object_id: &str, declared_size: Option<u64>) -> bool {
        let object_id = object_id.to_owned();
        self.with_cache(move |cache| Ok(cache.is_cache_hit(&object_id, declared_size)))
            .await
            .unwrap_or(false)
    }

    /// Runs `f` on the blocking pool, as the cache is accessed through blocking file system calls.
    async fn with_cache<F, R>(&self, f: F) -> Result<R, FetchError>
    where
        F: FnOnce(&DiskCache) -> Result<R, FetchError> + Send + 'static,
        R: Send + 'static,
    {
        let cache = self.inner.cache.clone();
        tokio::task::spawn_blocking(move || f(&cache))
            .await
            .map_err(io::Error::from)?
    }

    async fn fetch_direct(&self, object_id: &str, file: RemoteFile) -> Result<ByteStream, FetchError> {
        let file_path = file.file_path.ok_or(FetchError::NotFoundUpstream)?;
        let body = self.inner.bot_api.download(&file_path).await?;
        let writer = self.inner.cache.open_for_write(object_id).await?;

        metric!(counter("fetch.transport") += 1, "transport" => "bot_api");
        Ok(write_through(rechunk(body, CHUNK_SIZE), writer))
    }

    fn fetch_via_session(&self, object_id: &str) -> Result<ByteStream, FetchError> {
        let destination = self.inner.cache.path_for(object_id)?;
        let receiver = self.inner.runtime.submit(object_id, destination)?;

        metric!(counter("fetch.transport") += 1, "transport" => "session");
        Ok(rechunk(receiver.into_byte_stream(), CHUNK_SIZE).boxed())
    }

    /// Reports how much of `object_id` is cached.
    ///
    /// Returns `None` if the declared size of the object is unknown.
    pub async fn cache_status(
        &self,
        object_id: &str,
    ) -> Result<Option<CacheStatusReport>, FetchError> {
        let Some(declared_size) = self
            .inner
            .metadata
            .lookup(object_id)
            .and_then(|meta| meta.size)
        else {
            return Ok(None);
        };
        let object_id = object_id.to_owned();
        self.with_cache(move |cache| cache.status(&object_id, declared_size).map(Some))
            .await
    }

    /// Removes all cached objects.
    pub async fn clear_cache(&self) -> Result<(), FetchError> {
        self.with_cache(DiskCache::clear_all).await
    }

    /// Removes the cache files of the given objects.
    pub async fn invalidate<S: AsRef<str>>(&self, object_ids: &[S]) {
        let object_ids: Vec<String> = object_ids.iter().map(|id| id.as_ref().to_owned()).collect();
        let result = self
            .with_cache(move |cache| {
                cache.invalidate(&object_ids);
                Ok(())
            })
            .await;
        if let Err(err) = result {
            tracing::error!(error = &err as &dyn std::error::Error, "Failed to invalidate cache files");
        }
    }

    /// The total size of the cache in bytes.
    pub async fn cache_size(&self) -> Result<u64, FetchError> {
        self.with_cache(|cache| Ok(cache.total_size_bytes()?)).await
    }

    /// Downloads `object_id` into the cache in the background.
    ///
    /// Fails with [`FetchError::AlreadyInProgress`] if the object is already being cached this way.
    pub fn prefetch(&self, object_id: &str) -> Result<(), FetchError> {
        validate_object_id(object_id)?;

        let service = self.clone();
        let id = object_id.to_owned();
        self.inner
            .inflight
            .spawn(&self.inner.spawn_pool, object_id, async move {
                let mut stream = match service.fetch_object(&id).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            object_id = %id,
                            "Background caching failed"
                        );
                        return;
                    }
                };
                let mut bytes = 0;
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(chunk) => bytes += chunk.len(),
                        Err(err) => {
                            tracing::warn!(
                                error = &err as &dyn std::error::Error,
                                object_id = %id,
                                "Background caching failed"
                            );
                            return;
                        }
                    }
                }
                tracing::info!(object_id = %id, bytes, "Background caching completed");
            })
    }
}

/// Writes every chunk of `chunks` to `writer` before yielding it.
///
/// The cache file is committed once `chunks` is exhausted. On errors, or when the stream is
/// dropped early, the writer is dropped and removes the partial file.
fn write_through<S>(chunks: S, writer: CacheWriter) -> ByteStream
where
    S: futures::Stream<Item = Result<bytes::Bytes, FetchError>> + Send + 'static,
{
    let state = Some((Box::pin(chunks), writer));
    stream::unfold(state, |state| async move {
        let (mut chunks, mut writer) = state?;
        match chunks.next().await {
            Some(Ok(chunk)) => match writer.write_chunk(&chunk).await {
                Ok(()) => Some((Ok(chunk), Some((chunks, writer)))),
                Err(err) => Some((Err(FetchError::CacheIo(err)), None)),
            },
            Some(Err(err)) => Some((Err(err), None)),
            None => match writer.commit().await {
                Ok(bytes) => {
                    tracing::debug!(bytes, "Cached object");
                    None
                }
                Err(err) => Some((Err(FetchError::CacheIo(err)), None)),
            },
        }
    })
    .boxed()
}

/// The set of objects being cached in the background.
///
/// The number of concurrent background downloads is bounded, and an object can only be cached
/// once at a time.
#[derive(Debug, Clone)]
pub struct InflightRegistry {
    objects: Arc<Mutex<HashSet<String>>>,
    capacity: usize,
}

impl InflightRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            objects: Default::default(),
            capacity,
        }
    }

    /// Spawns `future` on `pool`, registered under `object_id` until it completes.
    pub fn spawn<F>(&self, pool: &Handle, object_id: &str, future: F) -> Result<(), FetchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        {
            let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
            if objects.contains(object_id) {
                return Err(FetchError::AlreadyInProgress);
            }
            if objects.len() >= self.capacity {
                return Err(FetchError::TooManyInflight);
            }
            objects.insert(object_id.to_owned());
        }

        let objects = self.objects.clone();
        let id = object_id.to_owned();
        let guard = defer(move || {
            let mut objects = objects.lock().unwrap_or_else(PoisonError::into_inner);
            objects.remove(&id);
        });

        pool.spawn(async move {
            let _guard = guard;
            future.await;
        });
        Ok(())
    }

    pub fn contains(&self, object_id: &str) -> bool {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects.contains(object_id)
    }

    pub fn len(&self) -> usize {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
