//! The on-disk object cache.
//!
//! Every cached object is stored as a single file directly in the cache directory, named after
//! its object id. Files are written through while they are being downloaded, so a partially
//! written file is visible to readers. Consumers decide whether a file is complete by comparing
//! its size with the declared size of the object, see [`DiskCache::status`].
//!
//! Freshness is decided solely by the modification time of a file. Files that are older than
//! the configured `max_age` are no longer served and get removed by the periodic [`Janitor`],
//! which also evicts the oldest files once the cache grows beyond its size ceiling.

mod cleanup;
mod fetch_error;
mod fs;
mod writer;


pub use cleanup::{CleanupStats, Janitor, cleanup};
pub use fetch_error::FetchError;
pub use fs::{CacheEntry, CacheStatus, CacheStatusReport, DiskCache, validate_object_id};
pub use writer::CacheWriter;
