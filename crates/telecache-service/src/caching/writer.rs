use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// A write-through sink for one cache file.
///
/// Chunks are appended to the cache file as they arrive, so the partially written file is
/// visible in the cache directory right away. A writer that is dropped before
/// [`commit`](Self::commit) was called removes its file again, which means a failed or aborted
/// transfer never leaves a truncated file behind.
///
/// Every writer writes to a file of its own. Creating a writer for a path that is already being
/// written unlinks the older file, whose writer then keeps writing to a file that is no longer
/// part of the cache. The last writer to be created wins, and dropping a writer that has been
/// superseded this way leaves the newer file alone.
#[derive(Debug)]
pub struct CacheWriter {
    path: PathBuf,
    file: Option<File>,
    identity: Option<FileIdentity>,
    written: u64,
}

impl CacheWriter {
    /// Creates a new file at `path`, replacing any existing file.
    pub async fn create(path: PathBuf) -> io::Result<Self> {
        let file = loop {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            let created = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match created {
                Ok(file) => break file,
                // another writer created the file in between
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        };

        let identity = file_identity(&file.metadata().await?);
        Ok(Self {
            path,
            file: Some(file),
            identity,
            written: 0,
        })
    }

    /// Appends `chunk` to the cache file.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::other("cache writer already finished"));
        };
        file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flushes all outstanding writes and keeps the file in the cache.
    ///
    /// Returns the number of bytes written.
    pub async fn commit(mut self) -> io::Result<u64> {
        // a failed flush leaves `file` in place, so the partial file is removed on drop
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
        }
        self.file = None;
        tracing::trace!(path = %self.path.display(), bytes = self.written, "Committed cache file");
        Ok(self.written)
    }

    /// The number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// The path of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheWriter {
    /// Whether the file at `path` is still the one this writer created.
    fn owns_path(&self) -> bool {
        let Some(identity) = self.identity else {
            return true;
        };
        match std::fs::metadata(&self.path) {
            Ok(metadata) => file_identity(&metadata) == Some(identity),
            Err(_) => false,
        }
    }
}

type FileIdentity = (u64, u64);

#[cfg(unix)]
fn file_identity(metadata: &Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn file_identity(_metadata: &Metadata) -> Option<FileIdentity> {
    None
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        // `file` is only taken by `commit`
        if self.file.take().is_none() {
            return;
        }
        if !self.owns_path() {
            tracing::debug!(path = %self.path.display(), "Partial cache file was superseded");
            return;
        }
        tracing::debug!(path = %self.path.display(), "Removing partial cache file");
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    path = %self.path.display(),
                    "Failed to remove partial cache file"
                );
            }
        }
    }
}
