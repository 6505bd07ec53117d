//! Device-local draft persistence.
//!
//! [`LocalCache`] is the synchronous key/value capability the engine needs
//! from the device. One adapter is picked at startup by [`open`]; the engine
//! itself only talks to a [`DraftSlot`], which owns the single draft blob.

use std::fmt;
use std::sync::Arc;

use time::OffsetDateTime;

use crate::config::{CacheBackend, ConfigPaths, LocalCacheConfig};
use crate::error::{SyncError, SyncResult};
use crate::model::{Draft, PlanDocument, DRAFT_SCHEMA_VERSION};

mod file;
mod memory;

pub use file::FileCache;
pub use memory::{DisabledCache, MemoryCache};

/// Synchronous key/value storage on the device.
///
/// Every failure is reported as [`SyncError::StorageUnavailable`].
pub trait LocalCache: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> SyncResult<Option<String>>;
    fn set(&self, key: &str, blob: &str) -> SyncResult<()>;
    fn remove(&self, key: &str) -> SyncResult<()>;
}

/// Picks the adapter named in the config. A file cache whose directory cannot
/// be prepared degrades to memory so editing keeps working.
pub fn open(config: &LocalCacheConfig, paths: &ConfigPaths) -> Arc<dyn LocalCache> {
    match config.backend {
        CacheBackend::File => match FileCache::open(&paths.cache_dir) {
            Ok(cache) => Arc::new(cache),
            Err(err) => {
                tracing::warn!(?err, "draft cache directory unusable, keeping drafts in memory");
                Arc::new(MemoryCache::default())
            }
        },
        CacheBackend::Memory => Arc::new(MemoryCache::default()),
        CacheBackend::Disabled => Arc::new(DisabledCache),
    }
}

/// The single draft slot of this device.
#[derive(Debug, Clone)]
pub struct DraftSlot {
    cache: Arc<dyn LocalCache>,
    key: String,
}

impl DraftSlot {
    pub fn new(cache: Arc<dyn LocalCache>, key: impl Into<String>) -> Self {
        Self {
            cache,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reads the draft. An unreadable blob counts as no draft at all.
    pub fn load(&self) -> SyncResult<Option<Draft>> {
        let Some(raw) = self.cache.get(&self.key)? else {
            return Ok(None);
        };
        match decode_draft(&raw) {
            Ok(draft) => Ok(Some(draft)),
            Err(err) => {
                tracing::warn!(key = %self.key, %err, "ignoring unreadable draft");
                Ok(None)
            }
        }
    }

    pub fn store(&self, data: &PlanDocument, saved_at: OffsetDateTime) -> SyncResult<Draft> {
        let draft = Draft::new(data.clone(), saved_at);
        let blob = serde_json::to_string(&draft)
            .map_err(|err| SyncError::CorruptLocalBlob(err.to_string()))?;
        self.cache.set(&self.key, &blob)?;
        Ok(draft)
    }

    pub fn clear(&self) -> SyncResult<()> {
        self.cache.remove(&self.key)
    }
}

/// Parses a draft blob, rejecting layouts newer than this build understands.
pub fn decode_draft(raw: &str) -> SyncResult<Draft> {
    let draft: Draft =
        serde_json::from_str(raw).map_err(|err| SyncError::CorruptLocalBlob(err.to_string()))?;
    if draft.schema_version > DRAFT_SCHEMA_VERSION {
        return Err(SyncError::CorruptLocalBlob(format!(
            "unsupported draft schema version {}",
            draft.schema_version
        )));
    }
    Ok(draft)
}
