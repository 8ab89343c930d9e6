//! Declared metadata of objects: their total size and mime type.
//!
//! Metadata is owned by whoever registers the objects. The cache only consumes it through
//! [`MetadataLookup`] to decide whether a cache file is complete, and to pick response headers.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// What is known about an object ahead of downloading it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// The declared total size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl ObjectMeta {
    pub fn media_kind(&self) -> MediaKind {
        MediaKind::from_mime(self.mime_type.as_deref())
    }
}

/// Looks up the declared metadata of an object.
pub trait MetadataLookup: fmt::Debug + Send + Sync {
    fn lookup(&self, object_id: &str) -> Option<ObjectMeta>;
}

/// An in-memory metadata index.
#[derive(Debug, Default)]
pub struct MemoryMetadata {
    entries: RwLock<HashMap<String, ObjectMeta>>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON object mapping object ids to their metadata.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read(path)
            .with_context(|| format!("failed to read metadata index {}", path.display()))?;
        let entries: HashMap<String, ObjectMeta> =
            serde_json::from_slice(&contents).context("failed to parse metadata index")?;

        tracing::info!(objects = entries.len(), "Loaded metadata index");
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    pub fn register(&self, object_id: impl Into<String>, meta: ObjectMeta) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(object_id.into(), meta);
    }

    pub fn remove(&self, object_id: &str) -> Option<ObjectMeta> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(object_id)
    }
}

impl MetadataLookup for MemoryMetadata {
    fn lookup(&self, object_id: &str) -> Option<ObjectMeta> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(object_id).cloned()
    }
}

/// The broad class of an object, derived from the prefix of its mime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Image,
    Audio,
    Binary,
}

impl MediaKind {
    pub fn from_mime(mime_type: Option<&str>) -> Self {
        let Some(mime_type) = mime_type else {
            return Self::Binary;
        };
        let top_level = mime_type.split('/').next().unwrap_or_default();
        match top_level.trim().to_ascii_lowercase().as_str() {
            "video" => Self::Video,
            "image" => Self::Image,
            "audio" => Self::Audio,
            _ => Self::Binary,
        }
    }

    /// Whether browsers should render the object in place instead of downloading it.
    pub fn is_inline(self) -> bool {
        !matches!(self, Self::Binary)
    }
}
