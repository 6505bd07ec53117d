use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use time::{Duration, OffsetDateTime};

use crate::cache::DraftSlot;
use crate::clock::Clock;
use crate::config::AutoSaveConfig;
use crate::model::{OwnerId, Period, PlanDocument};
use crate::session::SessionContext;
use crate::storage::RemoteStore;

mod debounce;

pub use debounce::Debouncer;

/// Backend a save lands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveTarget {
    /// The device's single draft slot.
    Local,
    /// The account store, keyed by owner and period.
    Remote { owner: OwnerId, period: Period },
}

impl fmt::Display for SaveTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveTarget::Local => f.write_str("local draft"),
            SaveTarget::Remote { owner, period } => write!(f, "cloud plan {owner}/{period}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveState {
    #[default]
    Idle,
    Saving,
    Saved,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AutoSaveStatus {
    pub state: SaveState,
    pub last_saved_at: Option<OffsetDateTime>,
    /// The working document differs from what was last persisted.
    pub unsaved_changes: bool,
}

impl AutoSaveStatus {
    pub fn time_since_last_save(&self, now: OffsetDateTime) -> Option<Duration> {
        self.last_saved_at.map(|at| now - at)
    }

    /// Human readable save indicator, e.g. "Saved 3 minutes ago".
    pub fn describe(&self, now: OffsetDateTime) -> String {
        if self.state == SaveState::Saving {
            return "Saving…".to_string();
        }
        match self.time_since_last_save(now) {
            None => "Not saved yet".to_string(),
            Some(elapsed) => format!("Saved {}", describe_elapsed(elapsed)),
        }
    }
}

pub fn describe_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.whole_seconds().max(0);
    let (amount, unit) = match seconds {
        0..=9 => return "just now".to_string(),
        10..=59 => (seconds, "second"),
        60..=3_599 => (seconds / 60, "minute"),
        3_600..=86_399 => (seconds / 3_600, "hour"),
        _ => (seconds / 86_400, "day"),
    };
    let plural = if amount == 1 { "" } else { "s" };
    format!("{amount} {unit}{plural} ago")
}

/// Shared, cheaply cloned view of the autosave status. Readers on other
/// threads see `Saving` while a write is in flight.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle(Arc<RwLock<AutoSaveStatus>>);

impl StatusHandle {
    pub fn get(&self) -> AutoSaveStatus {
        self.0.read().clone()
    }

    fn update(&self, f: impl FnOnce(&mut AutoSaveStatus)) {
        f(&mut self.0.write());
    }
}

#[derive(Debug, Clone)]
pub enum AutoSaveEvent {
    Saved {
        target: SaveTarget,
        at: OffsetDateTime,
    },
    Failed {
        target: SaveTarget,
        message: String,
        /// When the next attempt is due, if the failure is worth retrying.
        retry_at: Option<OffsetDateTime>,
    },
}

#[derive(Debug, Clone)]
struct Working {
    document: PlanDocument,
    serialized: String,
}

/// Debounced persistence of the working document.
///
/// Nothing is scheduled or written until [`Autosaver::complete_reconciliation`]
/// has run for the current context. A save only happens when the working
/// document's serialization differs from the last successfully saved one;
/// failures leave that baseline alone so the next cycle tries again.
#[derive(Debug)]
pub struct Autosaver {
    enabled: bool,
    debouncer: Debouncer,
    drafts: DraftSlot,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    context: SessionContext,
    reconciled: bool,
    working: Option<Working>,
    baseline: Option<String>,
    status: StatusHandle,
}

impl Autosaver {
    pub fn new(
        config: &AutoSaveConfig,
        drafts: DraftSlot,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        context: SessionContext,
    ) -> Self {
        Self {
            enabled: config.enabled,
            debouncer: Debouncer::new(config.debounce_duration()),
            drafts,
            remote,
            clock,
            context,
            reconciled: false,
            working: None,
            baseline: None,
            status: StatusHandle::default(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn status(&self) -> AutoSaveStatus {
        self.status.get()
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn describe_last_save(&self) -> String {
        self.status.get().describe(self.clock.now())
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.status.get().unsaved_changes
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled
    }

    pub fn working_document(&self) -> Option<&PlanDocument> {
        self.working.as_ref().map(|working| &working.document)
    }

    pub fn has_pending_save(&self) -> bool {
        self.debouncer.is_scheduled()
    }

    /// Switches to a new identity or period and closes the gate until
    /// reconciliation for it completes.
    pub fn reset(&mut self, context: SessionContext) {
        self.context = context;
        self.reconciled = false;
        self.debouncer.cancel();
        self.working = None;
        self.baseline = None;
        self.status.update(|status| *status = AutoSaveStatus::default());
    }

    /// Opens the gate with the document reconciliation settled on.
    pub fn complete_reconciliation(&mut self, loaded: &PlanDocument) {
        self.install(loaded.clone());
        self.reconciled = true;
        tracing::debug!(destination = ?self.context.save_target(), "autosave armed");
    }

    /// Replaces the working document with one that is already persisted.
    pub fn install(&mut self, document: PlanDocument) {
        let serialized = document.serialized();
        self.debouncer.cancel();
        self.baseline = Some(serialized.clone());
        self.working = Some(Working {
            document,
            serialized,
        });
        self.status
            .update(|status| status.unsaved_changes = false);
    }

    /// Records a new working document. Returns whether a save is now pending.
    pub fn update(&mut self, document: PlanDocument) -> bool {
        if !self.reconciled {
            tracing::trace!("autosave gated until reconciliation completes");
            return false;
        }
        let serialized = document.serialized();
        if self.baseline.as_deref() == Some(serialized.as_str()) {
            self.debouncer.cancel();
            self.working = Some(Working {
                document,
                serialized,
            });
            self.status
                .update(|status| status.unsaved_changes = false);
            return false;
        }

        let unchanged = self
            .working
            .as_ref()
            .is_some_and(|working| working.serialized == serialized);
        self.working = Some(Working {
            document,
            serialized,
        });
        self.status.update(|status| status.unsaved_changes = true);
        if !self.enabled {
            return false;
        }
        if !(unchanged && self.debouncer.is_scheduled()) {
            self.debouncer.schedule(self.clock.now());
        }
        true
    }

    /// Persists the working document once the debounce window has passed.
    pub fn poll(&mut self) -> Option<AutoSaveEvent> {
        if !self.reconciled {
            return None;
        }
        let now = self.clock.now();
        self.debouncer.take_due(now)?;
        self.persist(now)
    }

    /// Persists immediately, skipping the debounce window.
    pub fn force_save(&mut self) -> Option<AutoSaveEvent> {
        if !self.reconciled {
            return None;
        }
        self.debouncer.cancel();
        let now = self.clock.now();
        self.persist(now)
    }

    fn persist(&mut self, now: OffsetDateTime) -> Option<AutoSaveEvent> {
        let working = self.working.as_ref()?;
        if self.baseline.as_deref() == Some(working.serialized.as_str()) {
            return None;
        }
        let target = self.context.save_target()?;

        self.status.update(|status| status.state = SaveState::Saving);
        let result = match &target {
            SaveTarget::Local => self.drafts.store(&working.document, now).map(|_| ()),
            SaveTarget::Remote { owner, period } => self
                .remote
                .upsert(owner, *period, &working.document, now)
                .map(|_| ()),
        };

        match result {
            Ok(()) => {
                self.baseline = Some(working.serialized.clone());
                self.status.update(|status| {
                    status.state = SaveState::Saved;
                    status.last_saved_at = Some(now);
                    status.unsaved_changes = false;
                });
                tracing::debug!(destination = %target, "autosaved");
                Some(AutoSaveEvent::Saved { target, at: now })
            }
            Err(err) => {
                let retry_at = if err.is_transient() {
                    Some(self.debouncer.schedule(now))
                } else {
                    None
                };
                self.status.update(|status| status.state = SaveState::Idle);
                tracing::warn!(destination = %target, %err, "autosave failed");
                Some(AutoSaveEvent::Failed {
                    target,
                    message: err.to_string(),
                    retry_at,
                })
            }
        }
    }
}
