use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::clock::Clock;
use crate::config::SnapshotConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{OwnerId, Period, PlanDocument, PlanId, PlanVersion};
use crate::storage::RemoteStore;

/// Appends numbered copies of the cloud plan to its version history.
///
/// Snapshots always read the plan from the store right before writing, so a
/// save that landed a moment earlier is what gets captured.
#[derive(Debug)]
pub struct Snapshotter {
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    enabled: bool,
    interval: Duration,
    last_run: Option<OffsetDateTime>,
}

impl Snapshotter {
    pub fn new(config: &SnapshotConfig, remote: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            remote,
            clock,
            enabled: config.enabled,
            interval: config.interval(),
            last_run: None,
        }
    }

    /// Starts the interval for a new editing session.
    pub fn start(&mut self) {
        self.last_run = Some(self.clock.now());
    }

    /// Takes a periodic snapshot once the interval has elapsed.
    pub fn tick(&mut self, owner: &OwnerId, period: Period) -> SyncResult<Option<PlanVersion>> {
        if !self.enabled {
            return Ok(None);
        }
        let now = self.clock.now();
        let started = *self.last_run.get_or_insert(now);
        if now - started < self.interval {
            return Ok(None);
        }
        self.last_run = Some(now);
        self.snapshot_now(owner, period)
    }

    /// Snapshots the active plan unless its data matches the newest version.
    pub fn snapshot_now(&self, owner: &OwnerId, period: Period) -> SyncResult<Option<PlanVersion>> {
        let Some(plan) = self.remote.select_active(owner, period)? else {
            return Ok(None);
        };
        if let Some(latest) = self.remote.latest_version(plan.id)? {
            if latest.data.same_content(&plan.data) {
                tracing::debug!(plan_id = plan.id, version = latest.version, "plan unchanged, no snapshot");
                return Ok(None);
            }
        }
        let version = self
            .remote
            .append_version(plan.id, &plan.data, self.clock.now())?;
        tracing::debug!(plan_id = plan.id, version = version.version, "snapshot taken");
        Ok(Some(version))
    }

    /// Versions of one of `owner`'s plans, newest first. Trashed plans keep
    /// their history readable.
    pub fn list_versions(&self, owner: &OwnerId, plan_id: PlanId) -> SyncResult<Vec<PlanVersion>> {
        match self.remote.fetch_plan(plan_id)? {
            Some(plan) if &plan.owner_id == owner => self.remote.list_versions(plan_id),
            _ => Err(SyncError::PlanNotFound(plan_id)),
        }
    }

    /// Copies a version's data forward onto `owner`'s plan for `period` and
    /// returns it. Versions of any other plan are reported as not found.
    ///
    /// No version is created or removed; the restored data becomes eligible
    /// for the next snapshot like any other edit.
    pub fn restore_version(
        &self,
        owner: &OwnerId,
        period: Period,
        version_id: i64,
    ) -> SyncResult<PlanDocument> {
        let version = self
            .remote
            .fetch_version(version_id)?
            .ok_or(SyncError::VersionRestoreNotFound(version_id))?;
        let plan = self
            .remote
            .fetch_plan(version.plan_id)?
            .filter(|plan| &plan.owner_id == owner && plan.period == period)
            .ok_or(SyncError::VersionRestoreNotFound(version_id))?;
        if !plan.is_active() {
            return Err(SyncError::PlanInTrash(plan.id));
        }
        if !self
            .remote
            .update_data(plan.id, &version.data, self.clock.now())?
        {
            return Err(SyncError::PlanInTrash(plan.id));
        }
        tracing::info!(plan_id = plan.id, version = version.version, "version restored");
        Ok(version.data)
    }
}
