use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::clock::Clock;
use crate::config::TrashConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{OwnerId, PlanId, SavedPlan};
use crate::storage::RemoteStore;

/// A trashed plan and when automatic purge may remove it.
#[derive(Debug, Clone, PartialEq)]
pub struct TrashEntry {
    pub plan: SavedPlan,
    /// `None` when retention is disabled.
    pub purge_at: Option<OffsetDateTime>,
}

/// Soft-delete lifecycle: active, trashed, then restored or purged.
#[derive(Debug, Clone)]
pub struct TrashManager {
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    retention: Option<Duration>,
}

impl TrashManager {
    pub fn new(config: &TrashConfig, remote: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            remote,
            clock,
            retention: config.retention(),
        }
    }

    /// Moves an active plan to the trash. Its versions stay attached.
    pub fn delete(&self, owner: &OwnerId, plan_id: PlanId) -> SyncResult<SavedPlan> {
        let plan = self.owned(owner, plan_id)?;
        if !plan.is_active() {
            return Err(SyncError::PlanInTrash(plan_id));
        }
        if !self.remote.soft_delete(plan_id, self.clock.now())? {
            return Err(SyncError::PlanInTrash(plan_id));
        }
        tracing::info!(plan_id, period = %plan.period, "plan moved to trash");
        self.owned(owner, plan_id)
    }

    /// Brings a trashed plan back, unless another plan became active for the
    /// same period in the meantime.
    pub fn restore(&self, owner: &OwnerId, plan_id: PlanId) -> SyncResult<SavedPlan> {
        let plan = self.owned(owner, plan_id)?;
        if plan.is_active() {
            return Err(SyncError::NotInTrash(plan_id));
        }
        if self.remote.select_active(owner, plan.period)?.is_some() {
            return Err(SyncError::ActivePlanExists {
                period: plan.period,
            });
        }
        if !self.remote.restore(plan_id)? {
            return Err(SyncError::NotInTrash(plan_id));
        }
        tracing::info!(plan_id, period = %plan.period, "plan restored from trash");
        self.owned(owner, plan_id)
    }

    /// Irreversibly removes a trashed plan and its versions.
    pub fn permanent_delete(&self, owner: &OwnerId, plan_id: PlanId) -> SyncResult<()> {
        let plan = self.owned(owner, plan_id)?;
        if plan.is_active() {
            return Err(SyncError::PermanentDeleteOfActivePlan(plan_id));
        }
        if !self.remote.hard_delete(plan_id)? {
            return Err(SyncError::PlanNotFound(plan_id));
        }
        tracing::info!(plan_id, "plan permanently deleted");
        Ok(())
    }

    /// Permanently deletes everything in `owner`'s trash.
    pub fn empty_bin(&self, owner: &OwnerId) -> SyncResult<usize> {
        let mut removed = 0;
        for plan in self.remote.list_trashed(owner)? {
            if self.remote.hard_delete(plan.id)? {
                removed += 1;
            }
        }
        tracing::info!(owner = %owner, removed, "trash emptied");
        Ok(removed)
    }

    pub fn list(&self, owner: &OwnerId) -> SyncResult<Vec<TrashEntry>> {
        let entries = self
            .remote
            .list_trashed(owner)?
            .into_iter()
            .map(|plan| TrashEntry {
                purge_at: self
                    .retention
                    .and_then(|retention| plan.purge_eligible_at(retention)),
                plan,
            })
            .collect();
        Ok(entries)
    }

    /// Purges every trashed plan, for all owners, whose retention window
    /// has passed. Meant to be called by a scheduled job.
    pub fn purge_expired(&self) -> SyncResult<usize> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let cutoff = self.clock.now() - retention;
        let mut purged = 0;
        for plan in self.remote.expired_trash(cutoff)? {
            if self.remote.hard_delete(plan.id)? {
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(purged, "expired trash purged");
        }
        Ok(purged)
    }

    fn owned(&self, owner: &OwnerId, plan_id: PlanId) -> SyncResult<SavedPlan> {
        self.remote
            .fetch_plan(plan_id)?
            .filter(|plan| &plan.owner_id == owner)
            .ok_or(SyncError::PlanNotFound(plan_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Period, Quarter};
    use crate::storage::StorageHandle;
    use crate::test_support::{clock, doc, init_storage, owner, q3, FlakyRemote};
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager(
        retention_days: u32,
    ) -> anyhow::Result<(TempDir, Arc<StorageHandle>, Arc<ManualClock>, TrashManager)> {
        let (temp, storage) = init_storage()?;
        let storage = Arc::new(storage);
        let clock = clock();
        let manager = TrashManager::new(
            &TrashConfig { retention_days },
            storage.clone(),
            clock.clone(),
        );
        Ok((temp, storage, clock, manager))
    }

    #[test]
    fn delete_restore_and_permanent_delete() -> anyhow::Result<()> {
        let (_temp, storage, clock, trash) = manager(30)?;
        let alice = owner("alice");
        let plan = storage.upsert(&alice, q3(), &doc(json!({"v": 1})), clock.now())?;
        storage.append_version(plan.id, &doc(json!({"v": 1})), clock.now())?;
        storage.append_version(plan.id, &doc(json!({"v": 2})), clock.now())?;
        let versions_before = storage.list_versions(plan.id)?;

        clock.advance(Duration::hours(1));
        let trashed = trash.delete(&alice, plan.id)?;
        assert!(!trashed.is_active());
        assert!(storage.list_active(&alice)?.is_empty());
        assert!(storage.select_active(&alice, q3())?.is_none());
        let listed = trash.list(&alice)?;
        assert_eq!(listed.len(), 1);
        assert_eq!(
            listed[0].purge_at,
            trashed.deleted_at.map(|at| at + Duration::days(30))
        );

        let restored = trash.restore(&alice, plan.id)?;
        assert!(restored.is_active());
        assert_eq!(storage.list_active(&alice)?.len(), 1);
        assert_eq!(storage.list_versions(plan.id)?, versions_before);

        trash.delete(&alice, plan.id)?;
        trash.permanent_delete(&alice, plan.id)?;
        assert!(storage.fetch_plan(plan.id)?.is_none());
        assert!(storage.list_versions(plan.id)?.is_empty());
        assert!(trash.list(&alice)?.is_empty());
        Ok(())
    }

    #[test]
    fn active_plans_cannot_be_permanently_deleted() -> anyhow::Result<()> {
        let (_temp, storage, clock, trash) = manager(30)?;
        let plan = storage.upsert(&owner("alice"), q3(), &doc(json!({})), clock.now())?;
        assert_matches!(
            trash.permanent_delete(&owner("alice"), plan.id),
            Err(SyncError::PermanentDeleteOfActivePlan(_))
        );
        assert_matches!(
            trash.restore(&owner("alice"), plan.id),
            Err(SyncError::NotInTrash(_))
        );
        assert!(storage.fetch_plan(plan.id)?.is_some());
        Ok(())
    }

    #[test]
    fn plan_removed_by_another_writer_is_not_found() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let remote = Arc::new(FlakyRemote::new(storage));
        let clock = clock();
        let trash = TrashManager::new(&TrashConfig { retention_days: 30 }, remote.clone(), clock.clone());
        let plan = remote.upsert(&owner("alice"), q3(), &doc(json!({})), clock.now())?;
        trash.delete(&owner("alice"), plan.id)?;

        remote.lose_hard_delete_races(true);
        assert_matches!(
            trash.permanent_delete(&owner("alice"), plan.id),
            Err(SyncError::PlanNotFound(id)) if id == plan.id
        );
        assert!(remote.fetch_plan(plan.id)?.is_none());
        Ok(())
    }

    #[test]
    fn other_owners_plans_are_invisible() -> anyhow::Result<()> {
        let (_temp, storage, clock, trash) = manager(30)?;
        let plan = storage.upsert(&owner("alice"), q3(), &doc(json!({})), clock.now())?;
        assert_matches!(
            trash.delete(&owner("bob"), plan.id),
            Err(SyncError::PlanNotFound(_))
        );
        assert_matches!(trash.delete(&owner("alice"), 404), Err(SyncError::PlanNotFound(404)));
        Ok(())
    }

    #[test]
    fn restore_refuses_to_shadow_a_newer_plan() -> anyhow::Result<()> {
        let (_temp, storage, clock, trash) = manager(30)?;
        let alice = owner("alice");
        let old = storage.upsert(&alice, q3(), &doc(json!({"old": true})), clock.now())?;
        trash.delete(&alice, old.id)?;
        storage.upsert(&alice, q3(), &doc(json!({"new": true})), clock.now())?;

        assert_matches!(
            trash.restore(&alice, old.id),
            Err(SyncError::ActivePlanExists { period }) if period == q3()
        );
        Ok(())
    }

    #[test]
    fn empty_bin_only_touches_the_callers_trash() -> anyhow::Result<()> {
        let (_temp, storage, clock, trash) = manager(30)?;
        let alice = owner("alice");
        let bob = owner("bob");
        let q4 = Period::new(Quarter::Q4, 2026);
        for (who, period) in [(&alice, q3()), (&alice, q4), (&bob, q3())] {
            let plan = storage.upsert(who, period, &doc(json!({})), clock.now())?;
            trash.delete(who, plan.id)?;
        }
        let kept = storage.upsert(&alice, q3(), &doc(json!({"live": true})), clock.now())?;

        assert_eq!(trash.empty_bin(&alice)?, 2);
        assert!(trash.list(&alice)?.is_empty());
        assert_eq!(trash.list(&bob)?.len(), 1);
        assert!(storage.fetch_plan(kept.id)?.is_some());
        Ok(())
    }

    #[test]
    fn purge_respects_the_retention_window() -> anyhow::Result<()> {
        let (_temp, storage, clock, trash) = manager(30)?;
        let alice = owner("alice");
        let plan = storage.upsert(&alice, q3(), &doc(json!({})), clock.now())?;
        trash.delete(&alice, plan.id)?;

        clock.advance(Duration::days(29));
        assert_eq!(trash.purge_expired()?, 0);
        clock.advance(Duration::days(1));
        assert_eq!(trash.purge_expired()?, 1);
        assert!(storage.fetch_plan(plan.id)?.is_none());
        Ok(())
    }

    #[test]
    fn zero_retention_never_purges() -> anyhow::Result<()> {
        let (_temp, storage, clock, trash) = manager(0)?;
        let plan = storage.upsert(&owner("alice"), q3(), &doc(json!({})), clock.now())?;
        trash.delete(&owner("alice"), plan.id)?;
        clock.advance(Duration::days(3650));
        assert_eq!(trash.purge_expired()?, 0);
        assert_eq!(trash.list(&owner("alice"))?[0].purge_at, None);
        Ok(())
    }
}
