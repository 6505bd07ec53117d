//! Decides, once per (session, period), which copy of the plan is
//! authoritative and whether the user has to be asked about a local draft.
//!
//! [`transition`] is a pure function over [`ReconcileState`]; [`Reconciler`]
//! gathers the observation and carries out the returned [`Effect`]s.

use std::sync::Arc;

use strum::IntoStaticStr;

use crate::cache::DraftSlot;
use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::model::{Draft, PlanDocument, SavedPlan};
use crate::session::SessionContext;
use crate::storage::RemoteStore;

/// Where the working document came from once the flow settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentSource {
    Cloud,
    LocalDraft,
    Migrated,
    Fresh,
}

#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ReconcileState {
    Init,
    Checking,
    /// Signed in, the cloud plan was loaded and there was no draft.
    SilentLoad { plan: SavedPlan },
    /// Anonymous with a draft on this device.
    RestorePrompt { draft: Draft },
    /// Signed in with a draft on this device. When the cloud already holds a
    /// plan it has been loaded and wins unless the user migrates.
    MigratePrompt {
        draft: Draft,
        cloud: Option<SavedPlan>,
    },
    /// Nothing stored anywhere.
    FreshStart,
    /// A prompt was answered.
    Resolved { source: DocumentSource },
}

impl ReconcileState {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Whether the flow has left `Init`/`Checking`.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ReconcileState::Init | ReconcileState::Checking)
    }

    /// Whether autosave may write. A draft the user has not been asked about
    /// must not be clobbered, and a blank form must not overwrite the cloud.
    pub fn allows_autosave(&self) -> bool {
        match self {
            ReconcileState::SilentLoad { .. }
            | ReconcileState::FreshStart
            | ReconcileState::Resolved { .. } => true,
            ReconcileState::MigratePrompt { cloud, .. } => cloud.is_some(),
            ReconcileState::Init
            | ReconcileState::Checking
            | ReconcileState::RestorePrompt { .. } => false,
        }
    }

    pub fn pending_draft(&self) -> Option<&Draft> {
        match self {
            ReconcileState::RestorePrompt { draft } | ReconcileState::MigratePrompt { draft, .. } => {
                Some(draft)
            }
            _ => None,
        }
    }
}

/// What was found in both stores.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub signed_in: bool,
    pub remote: Option<SavedPlan>,
    pub draft: Option<Draft>,
}

#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ReconcileEvent {
    Begin,
    Observed(Observation),
    Restore,
    DismissRestore,
    Migrate,
    DismissMigration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Make this the working document.
    Install(PlanDocument),
    UpsertRemote(PlanDocument),
    ClearDraft,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: ReconcileState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: ReconcileState) -> Self {
        Self {
            next,
            effects: Vec::new(),
        }
    }

    fn with(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

pub fn transition(state: &ReconcileState, event: ReconcileEvent) -> SyncResult<Transition> {
    use ReconcileEvent as E;
    use ReconcileState as S;

    let transition = match (state, event) {
        (S::Init, E::Begin) => Transition::to(S::Checking),
        (S::Checking, E::Observed(observation)) => decide(observation),
        (S::RestorePrompt { draft }, E::Restore) => Transition::to(S::Resolved {
            source: DocumentSource::LocalDraft,
        })
        .with(Effect::Install(draft.data.clone())),
        (S::RestorePrompt { .. }, E::DismissRestore) => Transition::to(S::Resolved {
            source: DocumentSource::Fresh,
        })
        .with(Effect::ClearDraft)
        .with(Effect::Install(PlanDocument::empty())),
        (S::MigratePrompt { draft, .. }, E::Migrate) => Transition::to(S::Resolved {
            source: DocumentSource::Migrated,
        })
        .with(Effect::UpsertRemote(draft.data.clone()))
        .with(Effect::ClearDraft)
        .with(Effect::Install(draft.data.clone())),
        // The cloud plan was installed on entering the prompt and may have
        // been edited since; only a fresh start installs anything.
        (S::MigratePrompt { cloud: Some(_), .. }, E::DismissMigration) => {
            Transition::to(S::Resolved {
                source: DocumentSource::Cloud,
            })
            .with(Effect::ClearDraft)
        }
        (S::MigratePrompt { cloud: None, .. }, E::DismissMigration) => {
            Transition::to(S::Resolved {
                source: DocumentSource::Fresh,
            })
            .with(Effect::ClearDraft)
            .with(Effect::Install(PlanDocument::empty()))
        }
        (state, event) => {
            return Err(SyncError::InvalidTransition {
                state: state.name(),
                event: (&event).into(),
            })
        }
    };
    Ok(transition)
}

/// Picks the branch for what `Checking` observed.
pub fn decide(observation: Observation) -> Transition {
    use ReconcileState as S;

    let Observation {
        signed_in,
        remote,
        draft,
    } = observation;
    match (signed_in, remote, draft) {
        (true, Some(plan), None) => {
            let data = plan.data.clone();
            Transition::to(S::SilentLoad { plan }).with(Effect::Install(data))
        }
        (true, Some(plan), Some(draft)) => {
            let data = plan.data.clone();
            Transition::to(S::MigratePrompt {
                draft,
                cloud: Some(plan),
            })
            .with(Effect::Install(data))
        }
        (true, None, Some(draft)) => Transition::to(S::MigratePrompt { draft, cloud: None }),
        (false, _, Some(draft)) => Transition::to(S::RestorePrompt { draft }),
        (_, _, None) => {
            Transition::to(S::FreshStart).with(Effect::Install(PlanDocument::empty()))
        }
    }
}

/// Runs the flow against the real stores.
#[derive(Debug)]
pub struct Reconciler {
    drafts: DraftSlot,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    context: Option<SessionContext>,
    state: ReconcileState,
}

impl Reconciler {
    pub fn new(drafts: DraftSlot, remote: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            drafts,
            remote,
            clock,
            context: None,
            state: ReconcileState::Init,
        }
    }

    pub fn state(&self) -> &ReconcileState {
        &self.state
    }

    pub fn allows_autosave(&self) -> bool {
        self.state.allows_autosave()
    }

    /// Drives the flow from `Init` to a settled state for `context`.
    ///
    /// Returns the document to install, if the settled state loaded one.
    /// Does nothing while auth is still resolving or once the flow has
    /// settled for this context; a different context starts over.
    pub fn run(&mut self, context: &SessionContext) -> SyncResult<Option<PlanDocument>> {
        if self.context.as_ref() != Some(context) {
            self.context = Some(context.clone());
            self.state = ReconcileState::Init;
        }
        if !context.is_resolved() || self.state.is_settled() {
            return Ok(None);
        }
        if self.state == ReconcileState::Init {
            self.apply(ReconcileEvent::Begin)?;
        }

        let remote = match context.owner() {
            Some(owner) => self.remote.select_active(owner, context.period)?,
            None => None,
        };
        let mut draft = match self.drafts.load() {
            Ok(draft) => draft,
            Err(err) => {
                tracing::warn!(%err, "local cache unreadable, continuing without a draft");
                None
            }
        };
        // A draft that already matches the cloud plan is left over from a
        // migration whose cleanup failed.
        if let (Some(plan), Some(local)) = (&remote, &draft) {
            if local.data.same_content(&plan.data) {
                match self.drafts.clear() {
                    Ok(()) => tracing::info!(plan_id = plan.id, "cleared draft already in the cloud"),
                    Err(err) => tracing::warn!(%err, "stale draft could not be cleared"),
                }
                draft = None;
            }
        }
        let installed = self.apply(ReconcileEvent::Observed(Observation {
            signed_in: context.owner().is_some(),
            remote,
            draft,
        }))?;
        tracing::info!(state = self.state.name(), period = %context.period, "reconciled");
        Ok(installed)
    }

    pub fn restore(&mut self) -> SyncResult<Option<PlanDocument>> {
        self.apply(ReconcileEvent::Restore)
    }

    pub fn dismiss_restore(&mut self) -> SyncResult<Option<PlanDocument>> {
        self.apply(ReconcileEvent::DismissRestore)
    }

    pub fn migrate(&mut self) -> SyncResult<Option<PlanDocument>> {
        self.apply(ReconcileEvent::Migrate)
    }

    pub fn dismiss_migration(&mut self) -> SyncResult<Option<PlanDocument>> {
        self.apply(ReconcileEvent::DismissMigration)
    }

    /// Applies one event. Effects run in order; the state only advances when
    /// all of them succeeded.
    fn apply(&mut self, event: ReconcileEvent) -> SyncResult<Option<PlanDocument>> {
        let Transition { next, effects } = transition(&self.state, event)?;
        let mut installed = None;
        let mut upserted = false;
        for effect in effects {
            match effect {
                Effect::Install(document) => installed = Some(document),
                Effect::UpsertRemote(document) => {
                    let context = self.context.as_ref().ok_or(SyncError::Unauthenticated)?;
                    let owner = context.owner().ok_or(SyncError::Unauthenticated)?;
                    let plan =
                        self.remote
                            .upsert(owner, context.period, &document, self.clock.now())?;
                    tracing::info!(plan_id = plan.id, "migrated local draft");
                    upserted = true;
                }
                Effect::ClearDraft => match self.drafts.clear() {
                    Ok(()) => {}
                    Err(err) if upserted => {
                        tracing::warn!(%err, "draft migrated but could not be cleared");
                    }
                    Err(err) => return Err(err),
                },
            }
        }
        tracing::debug!(from = self.state.name(), to = next.name(), "reconcile transition");
        self.state = next;
        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{LocalCache, MemoryCache};
    use crate::clock::ManualClock;
    use crate::test_support::{clock, doc, init_storage, owner, q3, FlakyRemote, START};
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    fn draft(value: serde_json::Value) -> Draft {
        Draft::new(doc(value), START)
    }

    fn cloud_plan() -> SavedPlan {
        SavedPlan {
            id: 7,
            owner_id: owner("alice"),
            period: q3(),
            data: doc(json!({"source": "cloud"})),
            created_at: START,
            updated_at: START,
            deleted_at: None,
        }
    }

    #[test]
    fn each_observation_lands_in_exactly_one_branch() {
        let observe = |signed_in, remote, draft| {
            decide(Observation {
                signed_in,
                remote,
                draft,
            })
        };

        let silent = observe(true, Some(cloud_plan()), None);
        assert_matches!(silent.next, ReconcileState::SilentLoad { .. });
        assert_eq!(
            silent.effects,
            vec![Effect::Install(doc(json!({"source": "cloud"})))]
        );

        let both = observe(true, Some(cloud_plan()), Some(draft(json!({"local": 1}))));
        assert_matches!(both.next, ReconcileState::MigratePrompt { cloud: Some(_), .. });
        assert!(both.next.allows_autosave());

        let draft_only = observe(true, None, Some(draft(json!({"local": 1}))));
        assert_matches!(draft_only.next, ReconcileState::MigratePrompt { cloud: None, .. });
        assert!(draft_only.effects.is_empty());
        assert!(!draft_only.next.allows_autosave());

        let anonymous = observe(false, None, Some(draft(json!({"local": 1}))));
        assert_matches!(anonymous.next, ReconcileState::RestorePrompt { .. });
        assert!(!anonymous.next.allows_autosave());

        let nothing = observe(false, None, None);
        assert_eq!(nothing.next, ReconcileState::FreshStart);
        assert_eq!(nothing.effects, vec![Effect::Install(PlanDocument::empty())]);
    }

    #[test]
    fn migration_upserts_before_clearing_the_draft() -> anyhow::Result<()> {
        let state = ReconcileState::MigratePrompt {
            draft: draft(json!({"local": true})),
            cloud: None,
        };
        let transition = transition(&state, ReconcileEvent::Migrate)?;
        assert_eq!(
            transition.effects,
            vec![
                Effect::UpsertRemote(doc(json!({"local": true}))),
                Effect::ClearDraft,
                Effect::Install(doc(json!({"local": true}))),
            ]
        );
        Ok(())
    }

    #[test]
    fn events_outside_their_state_are_rejected() {
        assert_matches!(
            transition(&ReconcileState::FreshStart, ReconcileEvent::Migrate),
            Err(SyncError::InvalidTransition {
                state: "fresh-start",
                event: "migrate"
            })
        );
        assert_matches!(
            transition(&ReconcileState::Init, ReconcileEvent::Restore),
            Err(SyncError::InvalidTransition { .. })
        );
    }

    struct Harness {
        _temp: TempDir,
        remote: Arc<FlakyRemote>,
        cache: Arc<MemoryCache>,
        slot: DraftSlot,
        clock: Arc<ManualClock>,
        reconciler: Reconciler,
    }

    fn harness() -> anyhow::Result<Harness> {
        let (temp, storage) = init_storage()?;
        let remote = Arc::new(FlakyRemote::new(storage));
        let cache = Arc::new(MemoryCache::default());
        let slot = DraftSlot::new(cache.clone(), "plan-draft");
        let clock = clock();
        let reconciler = Reconciler::new(slot.clone(), remote.clone(), clock.clone());
        Ok(Harness {
            _temp: temp,
            remote,
            cache,
            slot,
            clock,
            reconciler,
        })
    }

    #[test]
    fn signed_in_draft_without_cloud_plan_migrates() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.slot.store(&doc(json!({"vision": "offline work"})), START)?;
        let context = SessionContext::signed_in(owner("alice"), q3());

        assert_eq!(h.reconciler.run(&context)?, None);
        assert_matches!(h.reconciler.state(), ReconcileState::MigratePrompt { cloud: None, .. });

        let installed = h.reconciler.migrate()?;
        assert_eq!(installed, Some(doc(json!({"vision": "offline work"}))));
        assert_eq!(
            h.reconciler.state(),
            &ReconcileState::Resolved {
                source: DocumentSource::Migrated
            }
        );
        assert!(h.slot.load()?.is_none());
        let stored = h.remote.select_active(&owner("alice"), q3())?.expect("migrated");
        assert!(stored.data.same_content(&doc(json!({"vision": "offline work"}))));
        Ok(())
    }

    #[test]
    fn migrating_over_an_existing_cloud_plan_replaces_it() -> anyhow::Result<()> {
        let mut h = harness()?;
        let cloud = h
            .remote
            .upsert(&owner("alice"), q3(), &doc(json!({"source": "cloud"})), START)?;
        h.slot.store(&doc(json!({"source": "draft"})), START)?;
        let context = SessionContext::signed_in(owner("alice"), q3());

        assert_eq!(h.reconciler.run(&context)?, Some(doc(json!({"source": "cloud"}))));
        assert_matches!(h.reconciler.state(), ReconcileState::MigratePrompt { cloud: Some(_), .. });

        h.clock.advance(time::Duration::minutes(1));
        let installed = h.reconciler.migrate()?;
        assert_eq!(installed, Some(doc(json!({"source": "draft"}))));
        assert_eq!(
            h.reconciler.state(),
            &ReconcileState::Resolved {
                source: DocumentSource::Migrated
            }
        );
        let stored = h.remote.select_active(&owner("alice"), q3())?.expect("plan");
        assert_eq!(stored.id, cloud.id);
        assert!(stored.data.same_content(&doc(json!({"source": "draft"}))));
        assert!(h.slot.load()?.is_none());
        Ok(())
    }

    #[test]
    fn leftover_draft_matching_the_cloud_is_cleared_on_load() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.remote
            .upsert(&owner("alice"), q3(), &doc(json!({"goal": "ship"})), START)?;
        h.slot.store(&doc(json!({"goal": "ship"})), START)?;

        h.reconciler
            .run(&SessionContext::signed_in(owner("alice"), q3()))?;
        assert_matches!(h.reconciler.state(), ReconcileState::SilentLoad { .. });
        assert!(h.slot.load()?.is_none());
        Ok(())
    }

    #[test]
    fn failed_migration_keeps_the_draft_and_the_prompt() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.slot.store(&doc(json!({"keep": "me"})), START)?;
        h.reconciler
            .run(&SessionContext::signed_in(owner("alice"), q3()))?;

        h.remote.fail_writes(true);
        assert_matches!(h.reconciler.migrate(), Err(SyncError::RemoteWriteFailed(_)));
        assert_matches!(h.reconciler.state(), ReconcileState::MigratePrompt { .. });
        assert!(h.slot.load()?.is_some());

        h.remote.fail_writes(false);
        h.reconciler.migrate()?;
        assert!(h.slot.load()?.is_none());
        Ok(())
    }

    #[test]
    fn waits_for_auth_to_resolve() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.slot.store(&doc(json!({"x": 1})), START)?;

        assert_eq!(h.reconciler.run(&SessionContext::resolving(q3()))?, None);
        assert_eq!(h.reconciler.state(), &ReconcileState::Init);

        h.reconciler.run(&SessionContext::anonymous(q3()))?;
        assert_matches!(h.reconciler.state(), ReconcileState::RestorePrompt { .. });
        Ok(())
    }

    #[test]
    fn remote_read_failure_stays_in_checking() -> anyhow::Result<()> {
        let mut h = harness()?;
        let context = SessionContext::signed_in(owner("alice"), q3());
        h.remote.fail_reads(true);

        assert_matches!(h.reconciler.run(&context), Err(SyncError::RemoteReadFailed(_)));
        assert_eq!(h.reconciler.state(), &ReconcileState::Checking);
        assert!(!h.reconciler.allows_autosave());

        h.remote.fail_reads(false);
        h.reconciler.run(&context)?;
        assert_eq!(h.reconciler.state(), &ReconcileState::FreshStart);
        Ok(())
    }

    #[test]
    fn rerunning_a_settled_flow_is_a_no_op() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.remote
            .upsert(&owner("alice"), q3(), &doc(json!({"a": 1})), START)?;
        let context = SessionContext::signed_in(owner("alice"), q3());

        assert_eq!(h.reconciler.run(&context)?, Some(doc(json!({"a": 1}))));
        h.slot.store(&doc(json!({"late": "draft"})), START)?;
        assert_eq!(h.reconciler.run(&context)?, None);
        assert_matches!(h.reconciler.state(), ReconcileState::SilentLoad { .. });
        Ok(())
    }

    #[test]
    fn switching_context_starts_over() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.slot.store(&doc(json!({"local": 1})), START)?;
        h.reconciler.run(&SessionContext::anonymous(q3()))?;
        assert_matches!(h.reconciler.state(), ReconcileState::RestorePrompt { .. });

        h.reconciler
            .run(&SessionContext::signed_in(owner("alice"), q3()))?;
        assert_matches!(h.reconciler.state(), ReconcileState::MigratePrompt { .. });
        Ok(())
    }

    #[test]
    fn corrupt_draft_counts_as_no_draft() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.cache.set("plan-draft", "{{{")?;
        let installed = h.reconciler.run(&SessionContext::anonymous(q3()))?;
        assert_eq!(installed, Some(PlanDocument::empty()));
        assert_eq!(h.reconciler.state(), &ReconcileState::FreshStart);
        Ok(())
    }

    #[test]
    fn dismissing_migration_keeps_the_cloud_plan() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.remote
            .upsert(&owner("alice"), q3(), &doc(json!({"cloud": true})), START)?;
        h.slot.store(&doc(json!({"local": true})), START)?;
        let context = SessionContext::signed_in(owner("alice"), q3());

        assert_eq!(h.reconciler.run(&context)?, Some(doc(json!({"cloud": true}))));
        h.clock.advance(time::Duration::minutes(1));
        assert_eq!(h.reconciler.dismiss_migration()?, None);
        assert_eq!(
            h.reconciler.state(),
            &ReconcileState::Resolved {
                source: DocumentSource::Cloud
            }
        );
        assert!(h.slot.load()?.is_none());
        assert_eq!(h.remote.upserts(), 1);
        Ok(())
    }

    #[test]
    fn dismissing_restore_discards_the_draft() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.slot.store(&doc(json!({"old": "notes"})), START)?;
        h.reconciler.run(&SessionContext::anonymous(q3()))?;

        assert_eq!(h.reconciler.dismiss_restore()?, Some(PlanDocument::empty()));
        assert!(h.slot.load()?.is_none());
        assert!(h.reconciler.allows_autosave());
        Ok(())
    }
}
