use std::collections::HashMap;

use parking_lot::Mutex;

use super::LocalCache;
use crate::error::{SyncError, SyncResult};

/// Process-lifetime cache; drafts vanish on exit.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl LocalCache for MemoryCache {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, blob: &str) -> SyncResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), blob.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Stands in for storage the platform refuses to provide (private browsing,
/// locked keychain).
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCache;

impl LocalCache for DisabledCache {
    fn get(&self, _key: &str) -> SyncResult<Option<String>> {
        Err(disabled())
    }

    fn set(&self, _key: &str, _blob: &str) -> SyncResult<()> {
        Err(disabled())
    }

    fn remove(&self, _key: &str) -> SyncResult<()> {
        Err(disabled())
    }
}

fn disabled() -> SyncError {
    SyncError::StorageUnavailable("local cache disabled".to_string())
}
