use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tempfile::TempDir;
use time::macros::datetime;
use time::OffsetDateTime;

use crate::cache::{LocalCache, MemoryCache};
use crate::clock::ManualClock;
use crate::config::{ConfigPaths, StorageOptions};
use crate::error::{SyncError, SyncResult};
use crate::model::{
    OwnerId, Period, PlanDocument, PlanId, PlanVersion, Quarter, SavedPlan,
};
use crate::storage::{self, RemoteStore, StorageHandle};

pub(crate) const START: OffsetDateTime = datetime!(2026-01-05 09:00 UTC);

pub(crate) fn temp_paths(root: &TempDir) -> ConfigPaths {
    let base = root.path();
    ConfigPaths::rooted(
        base.join("config"),
        base.join("config/config.toml"),
        base.join("data"),
    )
}

pub(crate) fn init_storage() -> Result<(TempDir, StorageHandle)> {
    let temp = TempDir::new()?;
    let paths = temp_paths(&temp);
    paths.ensure_directories()?;
    let mut options = StorageOptions::default();
    options.database_path = paths.database_path.clone();
    let storage = storage::init(&paths, &options)?;
    Ok((temp, storage))
}

pub(crate) fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(START))
}

pub(crate) fn doc(value: Value) -> PlanDocument {
    PlanDocument::new(value)
}

pub(crate) fn owner(name: &str) -> OwnerId {
    OwnerId::parse(name).expect("non-empty owner")
}

pub(crate) fn q3() -> Period {
    Period::new(Quarter::Q3, 2026)
}

pub(crate) fn q4() -> Period {
    Period::new(Quarter::Q4, 2026)
}

/// Wraps a real store, counting upserts and failing writes on demand.
#[derive(Debug)]
pub(crate) struct FlakyRemote {
    inner: StorageHandle,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    hard_delete_race: AtomicBool,
    upserts: AtomicUsize,
}

impl FlakyRemote {
    pub(crate) fn new(inner: StorageHandle) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            hard_delete_race: AtomicBool::new(false),
            upserts: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes another writer remove a plan just before each hard delete.
    pub(crate) fn lose_hard_delete_races(&self, lose: bool) {
        self.hard_delete_race.store(lose, Ordering::SeqCst);
    }

    pub(crate) fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> SyncResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(SyncError::RemoteWriteFailed("network unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn check_read(&self) -> SyncResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            Err(SyncError::RemoteReadFailed("network unreachable".into()))
        } else {
            Ok(())
        }
    }
}

impl RemoteStore for FlakyRemote {
    fn upsert(
        &self,
        owner: &OwnerId,
        period: Period,
        data: &PlanDocument,
        at: OffsetDateTime,
    ) -> SyncResult<SavedPlan> {
        self.check_write()?;
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(owner, period, data, at)
    }

    fn select_active(&self, owner: &OwnerId, period: Period) -> SyncResult<Option<SavedPlan>> {
        self.check_read()?;
        self.inner.select_active(owner, period)
    }

    fn fetch_plan(&self, plan_id: PlanId) -> SyncResult<Option<SavedPlan>> {
        self.check_read()?;
        self.inner.fetch_plan(plan_id)
    }

    fn list_active(&self, owner: &OwnerId) -> SyncResult<Vec<SavedPlan>> {
        self.check_read()?;
        self.inner.list_active(owner)
    }

    fn list_trashed(&self, owner: &OwnerId) -> SyncResult<Vec<SavedPlan>> {
        self.check_read()?;
        self.inner.list_trashed(owner)
    }

    fn update_data(
        &self,
        plan_id: PlanId,
        data: &PlanDocument,
        at: OffsetDateTime,
    ) -> SyncResult<bool> {
        self.check_write()?;
        self.inner.update_data(plan_id, data, at)
    }

    fn soft_delete(&self, plan_id: PlanId, at: OffsetDateTime) -> SyncResult<bool> {
        self.check_write()?;
        self.inner.soft_delete(plan_id, at)
    }

    fn restore(&self, plan_id: PlanId) -> SyncResult<bool> {
        self.check_write()?;
        self.inner.restore(plan_id)
    }

    fn hard_delete(&self, plan_id: PlanId) -> SyncResult<bool> {
        self.check_write()?;
        if self.hard_delete_race.load(Ordering::SeqCst) {
            self.inner.hard_delete(plan_id)?;
        }
        self.inner.hard_delete(plan_id)
    }

    fn list_versions(&self, plan_id: PlanId) -> SyncResult<Vec<PlanVersion>> {
        self.check_read()?;
        self.inner.list_versions(plan_id)
    }

    fn latest_version(&self, plan_id: PlanId) -> SyncResult<Option<PlanVersion>> {
        self.check_read()?;
        self.inner.latest_version(plan_id)
    }

    fn append_version(
        &self,
        plan_id: PlanId,
        data: &PlanDocument,
        at: OffsetDateTime,
    ) -> SyncResult<PlanVersion> {
        self.check_write()?;
        self.inner.append_version(plan_id, data, at)
    }

    fn fetch_version(&self, version_id: i64) -> SyncResult<Option<PlanVersion>> {
        self.check_read()?;
        self.inner.fetch_version(version_id)
    }

    fn expired_trash(&self, cutoff: OffsetDateTime) -> SyncResult<Vec<SavedPlan>> {
        self.check_read()?;
        self.inner.expired_trash(cutoff)
    }
}

/// Memory cache that counts writes.
#[derive(Debug, Default)]
pub(crate) struct CountingCache {
    inner: MemoryCache,
    writes: AtomicUsize,
}

impl CountingCache {
    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl LocalCache for CountingCache {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, blob: &str) -> SyncResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, blob)
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.inner.remove(key)
    }
}
