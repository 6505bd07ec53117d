//! Wires the engine together for one editing session.
//!
//! [`Engine`] is built once at startup and hands out a [`PlanSession`] per
//! (identity, period). The session is where storage failures from autosave
//! and snapshotting stop: they become status and log lines, never errors.

use std::sync::Arc;

use anyhow::{Context, Result};
use time::OffsetDateTime;

use crate::autosave::{AutoSaveEvent, AutoSaveStatus, Autosaver, StatusHandle};
use crate::cache::{self, DraftSlot, LocalCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, ConfigPaths};
use crate::error::{SyncError, SyncResult};
use crate::model::{OwnerId, PlanDocument, PlanVersion};
use crate::reconcile::{ReconcileState, Reconciler};
use crate::snapshots::Snapshotter;
use crate::storage::{self, RemoteStore};
use crate::trash::TrashManager;

pub mod context;
mod worker;

pub use context::{AuthState, SessionContext};
pub use worker::SessionWorker;

/// Startup wiring: the local cache adapter and the store are chosen here,
/// once, and shared by every session.
#[derive(Debug, Clone)]
pub struct Engine {
    config: AppConfig,
    drafts: DraftSlot,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn open(config: &AppConfig, paths: &ConfigPaths) -> Result<Self> {
        paths.ensure_directories()?;
        let cache = cache::open(&config.local_cache, paths);
        let storage = storage::init(paths, &config.storage).context("opening plan store")?;
        Ok(Self::new(
            config.clone(),
            cache,
            Arc::new(storage),
            Arc::new(SystemClock),
        ))
    }

    pub fn new(
        config: AppConfig,
        cache: Arc<dyn LocalCache>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let drafts = DraftSlot::new(cache, config.local_cache.draft_key.clone());
        Self {
            config,
            drafts,
            remote,
            clock,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn drafts(&self) -> &DraftSlot {
        &self.drafts
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn session(&self, context: SessionContext) -> PlanSession {
        PlanSession {
            reconciler: Reconciler::new(
                self.drafts.clone(),
                self.remote.clone(),
                self.clock.clone(),
            ),
            autosaver: Autosaver::new(
                &self.config.auto_save,
                self.drafts.clone(),
                self.remote.clone(),
                self.clock.clone(),
                context.clone(),
            ),
            snapshotter: self.snapshotter(),
            document: PlanDocument::empty(),
            context,
            remote: self.remote.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn snapshotter(&self) -> Snapshotter {
        Snapshotter::new(
            &self.config.snapshots,
            self.remote.clone(),
            self.clock.clone(),
        )
    }

    pub fn trash(&self) -> TrashManager {
        TrashManager::new(&self.config.trash, self.remote.clone(), self.clock.clone())
    }
}

/// Snapshot of a session for display.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub reconcile: &'static str,
    pub autosave_ready: bool,
    pub save: AutoSaveStatus,
    pub pending_save: bool,
    pub last_save: String,
}

/// One user editing one period.
#[derive(Debug)]
pub struct PlanSession {
    context: SessionContext,
    document: PlanDocument,
    reconciler: Reconciler,
    autosaver: Autosaver,
    snapshotter: Snapshotter,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
}

impl PlanSession {
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn state(&self) -> &ReconcileState {
        self.reconciler.state()
    }

    /// The document the editor shows.
    pub fn document(&self) -> &PlanDocument {
        &self.document
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.autosaver.status_handle()
    }

    /// Runs reconciliation for the current context. Safe to call again once
    /// auth has resolved or after a failed remote read.
    pub fn open(&mut self) -> SyncResult<&ReconcileState> {
        let installed = self.reconciler.run(&self.context)?;
        self.settle(installed);
        Ok(self.reconciler.state())
    }

    pub fn restore_draft(&mut self) -> SyncResult<&ReconcileState> {
        let installed = self.reconciler.restore()?;
        self.settle(installed);
        Ok(self.reconciler.state())
    }

    pub fn dismiss_restore(&mut self) -> SyncResult<&ReconcileState> {
        let installed = self.reconciler.dismiss_restore()?;
        self.settle(installed);
        Ok(self.reconciler.state())
    }

    pub fn migrate(&mut self) -> SyncResult<&ReconcileState> {
        let installed = self.reconciler.migrate()?;
        self.settle(installed);
        Ok(self.reconciler.state())
    }

    pub fn dismiss_migration(&mut self) -> SyncResult<&ReconcileState> {
        let installed = self.reconciler.dismiss_migration()?;
        self.settle(installed);
        Ok(self.reconciler.state())
    }

    /// Records the editor's current document. Returns whether a save is
    /// now scheduled.
    pub fn edit(&mut self, document: PlanDocument) -> bool {
        self.document = document.clone();
        self.autosaver.update(document)
    }

    /// Fires due saves and periodic snapshots.
    pub fn tick(&mut self) -> Option<AutoSaveEvent> {
        let event = self.autosaver.poll();
        if let Some(owner) = self.snapshot_owner() {
            if let Err(err) = self.snapshotter.tick(&owner, self.context.period) {
                tracing::warn!(%err, "periodic snapshot failed");
            }
        }
        event
    }

    pub fn force_save(&mut self) -> Option<AutoSaveEvent> {
        self.autosaver.force_save()
    }

    /// Version history of the active plan for this period, newest first.
    pub fn versions(&self) -> SyncResult<Vec<PlanVersion>> {
        let owner = self.context.owner().ok_or(SyncError::Unauthenticated)?;
        match self.remote.select_active(owner, self.context.period)? {
            Some(plan) => self.snapshotter.list_versions(owner, plan.id),
            None => Ok(Vec::new()),
        }
    }

    /// Restores a version of this period's plan and makes it the working
    /// document. On failure the working document is left alone.
    pub fn restore_version(&mut self, version_id: i64) -> SyncResult<&PlanDocument> {
        let owner = self.context.owner().ok_or(SyncError::Unauthenticated)?;
        let restored = self
            .snapshotter
            .restore_version(owner, self.context.period, version_id)?;
        self.autosaver.install(restored.clone());
        self.document = restored;
        Ok(&self.document)
    }

    /// Flushes the current context, then reconciles the new one.
    pub fn switch_context(&mut self, context: SessionContext) -> SyncResult<&ReconcileState> {
        if context != self.context {
            self.finish();
            tracing::info!(period = %context.period, "switching session context");
            self.context = context.clone();
            self.document = PlanDocument::empty();
            self.autosaver.reset(context);
        }
        self.open()
    }

    pub fn status(&self) -> SessionStatus {
        let save = self.autosaver.status();
        SessionStatus {
            reconcile: self.reconciler.state().name(),
            autosave_ready: self.autosaver.is_reconciled(),
            pending_save: self.autosaver.has_pending_save(),
            last_save: save.describe(self.clock.now()),
            save,
        }
    }

    /// Final flush and session-end snapshot.
    pub fn close(mut self) -> Option<AutoSaveEvent> {
        self.finish()
    }

    fn finish(&mut self) -> Option<AutoSaveEvent> {
        let event = self.autosaver.force_save();
        if let Some(owner) = self.snapshot_owner() {
            if let Err(err) = self.snapshotter.snapshot_now(&owner, self.context.period) {
                tracing::warn!(%err, "session-end snapshot failed");
            }
        }
        event
    }

    fn settle(&mut self, installed: Option<PlanDocument>) {
        if let Some(document) = &installed {
            self.document = document.clone();
        }
        if !self.reconciler.allows_autosave() {
            return;
        }
        if self.autosaver.is_reconciled() {
            if let Some(document) = installed {
                self.autosaver.install(document);
            }
        } else {
            self.autosaver.complete_reconciliation(&self.document);
            self.snapshotter.start();
        }
    }

    fn snapshot_owner(&self) -> Option<OwnerId> {
        if !self.autosaver.is_reconciled() {
            return None;
        }
        self.context.owner().cloned()
    }
}
