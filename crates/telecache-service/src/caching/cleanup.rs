use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;

use super::fs::catch_not_found;
use super::{CacheEntry, DiskCache};

/// Entry function for the cleanup command.
///
/// Runs a single sweep over the configured cache directory.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: Config, dry_run: bool) -> Result<()> {
    DiskCache::from_config(&config)?.cleanup(dry_run)?;
    Ok(())
}

/// Outcome of one cache sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    /// Files removed because they were older than `max_age`.
    pub removed_expired: usize,
    /// Files removed to bring the cache below its size ceiling.
    pub removed_evicted: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl DiskCache {
    /// Sweeps the cache directory.
    ///
    /// First every file older than `max_age` is removed. If the remaining files still exceed the
    /// size ceiling, the oldest ones are evicted until the total fits.
    ///
    /// Returns `None` if another sweep is still running, in which case nothing is done.
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> io::Result<Option<CleanupStats>> {
        let _guard = match self.sweep_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("Cache sweep already running, skipping");
                return Ok(None);
            }
        };

        tracing::info!(cache_dir = %self.cache_dir().display(), dry_run, "Cleaning up cache");
        let stats = self.sweep(dry_run)?;

        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} expired and {} evicted files, totaling {} bytes",
            stats.removed_expired,
            stats.removed_evicted,
            stats.removed_bytes,
        );

        metric!(gauge("cache.size.files") = stats.retained_files as u64);
        metric!(gauge("cache.size.bytes") = stats.retained_bytes);
        metric!(counter("cache.cleanup.expired") += stats.removed_expired as i64);
        metric!(counter("cache.cleanup.evicted") += stats.removed_evicted as i64);
        metric!(counter("cache.cleanup.bytes_removed") += stats.removed_bytes as i64);

        Ok(Some(stats))
    }

    fn sweep(&self, dry_run: bool) -> io::Result<CleanupStats> {
        let max_age = self.config().max_age;
        let max_size = self.config().max_size_bytes();
        let mut stats = CleanupStats::default();

        let mut retained = Vec::new();
        for entry in self.list_entries()? {
            if entry.is_fresh(max_age) {
                retained.push(entry);
                continue;
            }
            tracing::debug!(path = %entry.path.display(), "Removing expired file");
            if remove_entry(&entry, dry_run) {
                stats.removed_expired += 1;
                stats.removed_bytes += entry.size_bytes;
            }
        }

        let mut total: u64 = retained.iter().map(|entry| entry.size_bytes).sum();
        if total > max_size {
            tracing::info!(total, max_size, "Cache exceeds its size limit, evicting oldest files");
            retained.sort_by_key(|entry| entry.modified_at);

            let mut evict = 0;
            while total > max_size && evict < retained.len() {
                let entry = &retained[evict];
                evict += 1;
                tracing::debug!(path = %entry.path.display(), "Evicting file");
                if remove_entry(entry, dry_run) {
                    stats.removed_evicted += 1;
                    stats.removed_bytes += entry.size_bytes;
                    total -= entry.size_bytes;
                }
            }
            retained.drain(..evict);
        }

        stats.retained_files = retained.len();
        stats.retained_bytes = total;
        Ok(stats)
    }
}

/// Removes a single cache file, returning `true` if it is gone afterwards.
///
/// Failures are logged and do not abort the sweep.
fn remove_entry(entry: &CacheEntry, dry_run: bool) -> bool {
    if dry_run {
        return true;
    }
    match catch_not_found(|| std::fs::remove_file(&entry.path)) {
        Ok(_) => true,
        Err(err) => {
            sentry::with_scope(
                |scope| scope.set_extra("path", entry.path.display().to_string().into()),
                || {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "Failed to clean cache file"
                    )
                },
            );
            false
        }
    }
}

/// A background thread sweeping the cache at a fixed interval.
///
/// The janitor stops when it is dropped or [`shutdown`](Self::shutdown) is called.
#[derive(Debug)]
pub struct Janitor {
    shutdown: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Janitor {
    /// Spawns the janitor thread.
    ///
    /// Returns `None` without spawning anything if `interval` is zero.
    pub fn spawn(cache: Arc<DiskCache>, interval: Duration) -> io::Result<Option<Self>> {
        if interval.is_zero() {
            tracing::info!("Periodic cache cleanup is disabled");
            return Ok(None);
        }

        let (shutdown, shutdown_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("telecache-janitor".into())
            .spawn(move || {
                tracing::info!(?interval, "Started cache janitor");
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if let Err(err) = cache.cleanup(false) {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "Cache sweep failed"
                        );
                    }
                }
                tracing::info!("Stopped cache janitor");
            })?;

        Ok(Some(Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        }))
    }

    /// Stops the janitor and waits for a running sweep to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // the thread may already be gone
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Cache janitor panicked");
            }
        }
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.stop();
    }
}
