use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use futures::TryStreamExt;
use serde::Serialize;
use tokio_util::io::ReaderStream;

use crate::config::{CacheConfig, Config};
use crate::download::{ByteStream, CHUNK_SIZE};

use super::{CacheWriter, FetchError};

/// Checks that `object_id` can be used as a file name directly inside the cache directory.
///
/// Object ids are opaque, but they must not be empty, must not name the directory itself or its
/// parent, and must not contain path separators or NUL bytes.
pub fn validate_object_id(object_id: &str) -> Result<(), FetchError> {
    let invalid = object_id.is_empty()
        || object_id == "."
        || object_id == ".."
        || object_id.contains(['/', '\\', '\0']);

    if invalid {
        return Err(FetchError::InvalidObjectId(object_id.to_owned()));
    }
    Ok(())
}

/// The on-disk cache directory.
///
/// The cache is a flat namespace: every object occupies exactly one file named after its id.
#[derive(Debug)]
pub struct DiskCache {
    cache_dir: PathBuf,
    config: CacheConfig,
    /// Held for the duration of a sweep, so that overlapping sweeps are skipped.
    pub(super) sweep_lock: Mutex<()>,
}

impl DiskCache {
    /// Creates the cache at `cache_dir`, creating the directory if needed.
    pub fn new(cache_dir: impl Into<PathBuf>, config: CacheConfig) -> io::Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;

        Ok(Self {
            cache_dir,
            config,
            sweep_lock: Mutex::new(()),
        })
    }

    pub fn from_config(config: &Config) -> io::Result<Self> {
        Self::new(config.cache_dir.clone(), config.cache)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The location of the cache file for `object_id`.
    pub fn path_for(&self, object_id: &str) -> Result<PathBuf, FetchError> {
        validate_object_id(object_id)?;
        Ok(self.cache_dir.join(object_id))
    }

    /// Looks up the cache file for `object_id`, returning `None` if there is none.
    pub fn entry(&self, object_id: &str) -> Result<Option<CacheEntry>, FetchError> {
        let path = self.path_for(object_id)?;
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(None);
        };
        if !metadata.is_file() {
            return Ok(None);
        }

        Ok(Some(CacheEntry {
            path,
            size_bytes: metadata.len(),
            modified_at: metadata.modified()?,
        }))
    }

    /// Whether a cache file for `object_id` exists and is younger than `max_age`.
    pub fn is_freshly_cached(&self, object_id: &str) -> bool {
        self.is_cache_hit(object_id, None)
    }

    /// Whether `object_id` can be served from the cache.
    ///
    /// That is the case if its cache file is younger than `max_age` and, if `declared_size` is
    /// known, not smaller than that. Never fails, any error is treated as "not cached".
    pub fn is_cache_hit(&self, object_id: &str, declared_size: Option<u64>) -> bool {
        let entry = match self.entry(object_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    object_id,
                    "Failed to check cache freshness"
                );
                return false;
            }
        };

        entry.is_fresh(self.config.max_age)
            && declared_size.is_none_or(|declared| entry.size_bytes >= declared)
    }

    /// Opens the cache file for `object_id` as a stream of chunks of at most [`CHUNK_SIZE`] bytes.
    ///
    /// Returns `None` if the file does not exist or cannot be opened.
    pub async fn open_for_read(&self, object_id: &str) -> Option<ByteStream> {
        let path = self.path_for(object_id).ok()?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        path = %path.display(),
                        "Failed to open cache file"
                    );
                }
                return None;
            }
        };

        let stream = ReaderStream::with_capacity(file, CHUNK_SIZE).map_err(FetchError::CacheIo);
        Some(Box::pin(stream))
    }

    /// Replaces the cache file for `object_id` with an empty one.
    ///
    /// Returns a write-through sink for the new file.
    pub async fn open_for_write(&self, object_id: &str) -> Result<CacheWriter, FetchError> {
        let path = self.path_for(object_id)?;
        Ok(CacheWriter::create(path).await?)
    }

    /// Removes the cache files of the given objects.
    ///
    /// This is best effort: missing files, invalid ids and failing removals are logged and skipped.
    pub fn invalidate<S: AsRef<str>>(&self, object_ids: &[S]) {
        for object_id in object_ids {
            let object_id = object_id.as_ref();
            let path = match self.path_for(object_id) {
                Ok(path) => path,
                Err(err) => {
                    tracing::debug!(error = &err as &dyn std::error::Error, "Skipping invalidation");
                    continue;
                }
            };
            match catch_not_found(|| std::fs::remove_file(&path)) {
                Ok(Some(())) => tracing::info!(object_id, "Removed cache file"),
                Ok(None) => tracing::debug!(object_id, "No cache file to remove"),
                Err(err) => tracing::error!(
                    error = &err as &dyn std::error::Error,
                    object_id,
                    "Failed to remove cache file"
                ),
            }
        }
    }

    /// Removes every cache file, leaving an empty cache directory behind.
    pub fn clear_all(&self) -> Result<(), FetchError> {
        tracing::info!(cache_dir = %self.cache_dir.display(), "Clearing the cache");
        catch_not_found(|| std::fs::remove_dir_all(&self.cache_dir))?;
        std::fs::create_dir_all(&self.cache_dir)?;
        metric!(counter("cache.cleared") += 1);
        Ok(())
    }

    /// The sum of the sizes of all files in the cache directory.
    pub fn total_size_bytes(&self) -> io::Result<u64> {
        let mut total = 0;
        for entry in self.list_entries()? {
            total += entry.size_bytes;
        }
        Ok(total)
    }

    /// Reports how much of `object_id` is cached, given its declared size.
    pub fn status(
        &self,
        object_id: &str,
        declared_size: u64,
    ) -> Result<CacheStatusReport, FetchError> {
        let cached_bytes = self.entry(object_id)?.map(|entry| entry.size_bytes);
        Ok(CacheStatusReport::new(cached_bytes, declared_size))
    }

    /// Lists all files in the cache directory.
    ///
    /// Entries that vanish while listing and anything that is not a regular file are skipped.
    pub(super) fn list_entries(&self) -> io::Result<Vec<CacheEntry>> {
        let Some(read_dir) = catch_not_found(|| std::fs::read_dir(&self.cache_dir))? else {
            tracing::warn!(cache_dir = %self.cache_dir.display(), "Cache directory not found");
            return Ok(vec![]);
        };

        let mut entries = vec![];
        for entry in read_dir {
            let path = entry?.path();
            let Some(metadata) = catch_not_found(|| path.metadata())? else {
                continue;
            };
            if !metadata.is_file() {
                tracing::debug!(path = %path.display(), "Skipping non-file in cache directory");
                continue;
            }
            entries.push(CacheEntry {
                path,
                size_bytes: metadata.len(),
                modified_at: metadata.modified()?,
            });
        }
        Ok(entries)
    }
}

/// A file in the cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_at: SystemTime,
}

impl CacheEntry {
    /// Time since the last modification. Modification times in the future count as zero.
    pub fn age(&self) -> Duration {
        self.modified_at.elapsed().unwrap_or_default()
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age() < max_age
    }
}

/// The caching state of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// There is no cache file.
    NotCached,
    /// A cache file exists, but is smaller than the declared size.
    Caching,
    /// The cache file is at least as large as the declared size.
    Completed,
}

/// A [`CacheStatus`] along with the sizes it was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStatusReport {
    pub status: CacheStatus,
    pub cached_bytes: u64,
    pub total_bytes: u64,
}

impl CacheStatusReport {
    /// Computes the status from the on-disk size, `None` meaning there is no cache file.
    pub fn new(cached_bytes: Option<u64>, declared_size: u64) -> Self {
        let status = match cached_bytes {
            None => CacheStatus::NotCached,
            Some(cached) if cached >= declared_size => CacheStatus::Completed,
            Some(_) => CacheStatus::Caching,
        };
        Self {
            status,
            cached_bytes: cached_bytes.unwrap_or(0),
            total_bytes: declared_size,
        }
    }
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
