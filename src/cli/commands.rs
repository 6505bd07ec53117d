use std::fmt::Write as _;
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::autosave::{describe_elapsed, AutoSaveEvent};
use crate::model::{OwnerId, Period, PlanDocument, PlanId, PlanVersion};
use crate::reconcile::ReconcileState;
use crate::session::{Engine, PlanSession, SessionContext, SessionStatus, SessionWorker};
use crate::trash::TrashEntry;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Args, Debug, Clone)]
pub struct ScopeArgs {
    /// Planning period, e.g. 2026-Q3
    #[arg(long)]
    pub period: Period,
    /// Signed-in account; omit to work on this device's local draft
    #[arg(long)]
    pub owner: Option<String>,
}

impl ScopeArgs {
    fn context(&self) -> Result<SessionContext> {
        Ok(match &self.owner {
            Some(raw) => SessionContext::signed_in(parse_owner(raw)?, self.period),
            None => SessionContext::anonymous(self.period),
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct PlanScopeArgs {
    /// Planning period, e.g. 2026-Q3
    #[arg(long)]
    pub period: Period,
    /// Account owning the plan
    #[arg(long)]
    pub owner: String,
}

#[derive(Args, Debug, Clone)]
pub struct OwnerArgs {
    /// Account owning the plans
    #[arg(long)]
    pub owner: String,
}

/// Answer for a pending restore/migrate prompt.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftChoice {
    /// Continue from the local draft (anonymous sessions)
    Restore,
    /// Throw the local draft away
    Discard,
    /// Upload the local draft to the account, replacing any cloud copy
    Migrate,
    /// Keep the cloud copy and drop the local draft
    KeepCloud,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,
    /// How to answer a restore or migration prompt
    #[arg(long, value_enum)]
    pub on_draft: Option<DraftChoice>,
    /// Read JSON documents (one per line) from this file instead of stdin
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum VersionsCommand {
    /// List the version history of a plan, newest first
    List(PlanScopeArgs),
    /// Snapshot the current plan now (skipped when unchanged)
    Snapshot(PlanScopeArgs),
    /// Copy a version forward into its plan
    Restore(VersionRestoreArgs),
}

#[derive(Args, Debug, Clone)]
pub struct VersionRestoreArgs {
    #[command(flatten)]
    pub scope: PlanScopeArgs,
    /// Version identifier as shown by `versions list`
    pub version_id: i64,
}

#[derive(Args, Debug, Clone)]
pub struct VersionsArgs {
    #[command(subcommand)]
    pub command: VersionsCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum TrashCommand {
    /// List trashed plans and when they will be purged
    List(OwnerArgs),
    /// Move a plan to the trash
    Delete(TrashPlanArgs),
    /// Bring a plan back from the trash
    Restore(TrashPlanArgs),
    /// Permanently delete a trashed plan and its versions
    Purge(TrashPlanArgs),
    /// Permanently delete everything in the trash
    Empty(OwnerArgs),
    /// Purge plans whose retention window has passed, for every account
    PurgeExpired,
}

#[derive(Args, Debug, Clone)]
pub struct TrashPlanArgs {
    #[command(flatten)]
    pub owner: OwnerArgs,
    /// Plan identifier
    pub plan_id: PlanId,
}

#[derive(Args, Debug, Clone)]
pub struct TrashArgs {
    #[command(subcommand)]
    pub command: TrashCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum DraftCommand {
    /// Print the local draft
    Show,
    /// Delete the local draft
    Clear,
}

#[derive(Args, Debug, Clone)]
pub struct DraftArgs {
    #[command(subcommand)]
    pub command: DraftCommand,
}

/// Reconciles, answers any prompt, then streams documents through a
/// background session and flushes at end of input.
pub fn edit(engine: &Engine, args: &EditArgs, input: impl BufRead) -> Result<String> {
    let documents = read_documents(input)?;
    let mut session = engine.session(args.scope.context()?);
    let mut out = String::new();

    let state = session.open().context("reconciling plan")?.clone();
    let _ = writeln!(&mut out, "{}", describe_state(&state));
    if let Some(choice) = args.on_draft {
        answer_prompt(&mut session, &state, choice)?;
        let _ = writeln!(&mut out, "{}", describe_state(session.state()));
    }
    if !session.status().autosave_ready {
        bail!("a local draft needs a decision first; pass --on-draft");
    }

    let worker = SessionWorker::spawn(session, engine.config().auto_save.poll_interval())?;
    let events = worker.events().clone();
    let count = documents.len();
    for document in documents {
        worker.edit(document)?;
    }
    worker.shutdown(SHUTDOWN_TIMEOUT)?;

    let _ = writeln!(&mut out, "Applied {count} edit{}", plural(count));
    for event in events.try_iter() {
        let _ = writeln!(&mut out, "{}", format_event(&event));
    }
    Ok(out)
}

pub fn status(engine: &Engine, args: &ScopeArgs) -> Result<String> {
    let mut session = engine.session(args.context()?);
    let state = session.open().context("reconciling plan")?.clone();
    Ok(format_status(&state, &session.status(), engine.now()))
}

pub fn show(engine: &Engine, args: &PlanScopeArgs) -> Result<String> {
    let owner = parse_owner(&args.owner)?;
    match engine.remote().select_active(&owner, args.period)? {
        Some(plan) => Ok(format!(
            "Plan #{} ({}), updated {}\n{}\n",
            plan.id,
            plan.period,
            format_timestamp(plan.updated_at),
            plan.data.to_pretty_json()
        )),
        None => Ok(format!("No active plan for {} in {}.\n", owner, args.period)),
    }
}

pub fn versions(engine: &Engine, args: &VersionsArgs) -> Result<String> {
    let snapshotter = engine.snapshotter();
    match &args.command {
        VersionsCommand::List(scope) => {
            let owner = parse_owner(&scope.owner)?;
            let plan = engine
                .remote()
                .select_active(&owner, scope.period)?
                .ok_or_else(|| anyhow!("no active plan for {} in {}", owner, scope.period))?;
            let versions = snapshotter.list_versions(&owner, plan.id)?;
            Ok(format_versions(&versions))
        }
        VersionsCommand::Snapshot(scope) => {
            let owner = parse_owner(&scope.owner)?;
            match snapshotter.snapshot_now(&owner, scope.period)? {
                Some(version) => Ok(format!(
                    "Created version {} (#{}) of plan #{}\n",
                    version.version, version.id, version.plan_id
                )),
                None => Ok("Nothing to snapshot: no active plan or unchanged since the last version.\n".to_string()),
            }
        }
        VersionsCommand::Restore(restore) => {
            let owner = parse_owner(&restore.scope.owner)?;
            let document = snapshotter
                .restore_version(&owner, restore.scope.period, restore.version_id)
                .with_context(|| format!("restoring version #{}", restore.version_id))?;
            Ok(format!(
                "Restored version #{}\n{}\n",
                restore.version_id,
                document.to_pretty_json()
            ))
        }
    }
}

pub fn trash(engine: &Engine, args: &TrashArgs) -> Result<String> {
    let trash = engine.trash();
    match &args.command {
        TrashCommand::List(owner) => {
            let owner = parse_owner(&owner.owner)?;
            Ok(format_trash(&trash.list(&owner)?, engine.now()))
        }
        TrashCommand::Delete(target) => {
            let owner = parse_owner(&target.owner.owner)?;
            let plan = trash.delete(&owner, target.plan_id)?;
            Ok(format!("Moved plan #{} ({}) to the trash\n", plan.id, plan.period))
        }
        TrashCommand::Restore(target) => {
            let owner = parse_owner(&target.owner.owner)?;
            let plan = trash.restore(&owner, target.plan_id)?;
            Ok(format!("Restored plan #{} ({})\n", plan.id, plan.period))
        }
        TrashCommand::Purge(target) => {
            let owner = parse_owner(&target.owner.owner)?;
            trash.permanent_delete(&owner, target.plan_id)?;
            Ok(format!("Permanently deleted plan #{}\n", target.plan_id))
        }
        TrashCommand::Empty(owner) => {
            let owner = parse_owner(&owner.owner)?;
            let removed = trash.empty_bin(&owner)?;
            Ok(format!("Removed {removed} plan{} from the trash\n", plural(removed)))
        }
        TrashCommand::PurgeExpired => {
            let purged = trash.purge_expired()?;
            Ok(format!("Purged {purged} expired plan{}\n", plural(purged)))
        }
    }
}

pub fn draft(engine: &Engine, args: &DraftArgs) -> Result<String> {
    let drafts = engine.drafts();
    match args.command {
        DraftCommand::Show => match drafts.load()? {
            Some(draft) => Ok(format!(
                "Draft saved {} ({})\n{}\n",
                format_timestamp(draft.saved_at()),
                describe_elapsed(engine.now() - draft.saved_at()),
                draft.data.to_pretty_json()
            )),
            None => Ok("No local draft.\n".to_string()),
        },
        DraftCommand::Clear => {
            drafts.clear()?;
            Ok("Local draft cleared.\n".to_string())
        }
    }
}

fn answer_prompt(session: &mut PlanSession, state: &ReconcileState, choice: DraftChoice) -> Result<()> {
    let result = match (state, choice) {
        (ReconcileState::RestorePrompt { .. }, DraftChoice::Restore) => session.restore_draft(),
        (ReconcileState::RestorePrompt { .. }, DraftChoice::Discard) => session.dismiss_restore(),
        (ReconcileState::MigratePrompt { .. }, DraftChoice::Migrate) => session.migrate(),
        (ReconcileState::MigratePrompt { .. }, DraftChoice::Discard | DraftChoice::KeepCloud) => {
            session.dismiss_migration()
        }
        (state, choice) if state.pending_draft().is_some() => {
            bail!("--on-draft {choice:?} does not answer a {} prompt", state.name())
        }
        _ => return Ok(()),
    };
    result.context("applying draft decision")?;
    Ok(())
}

fn read_documents(input: impl BufRead) -> Result<Vec<PlanDocument>> {
    let mut documents = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let line = line.context("reading input")?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let document = PlanDocument::from_json(trimmed)
            .with_context(|| format!("line {}: not a JSON document", idx + 1))?;
        documents.push(document);
    }
    Ok(documents)
}

fn parse_owner(raw: &str) -> Result<OwnerId> {
    OwnerId::parse(raw).ok_or_else(|| anyhow!("owner cannot be empty"))
}

fn describe_state(state: &ReconcileState) -> String {
    match state {
        ReconcileState::Init => "Waiting for sign-in to resolve".to_string(),
        ReconcileState::Checking => "Checking for saved work".to_string(),
        ReconcileState::SilentLoad { plan } => {
            format!("Loaded cloud plan #{} ({})", plan.id, plan.period)
        }
        ReconcileState::RestorePrompt { draft } => format!(
            "Found a local draft from {}; restore or discard it",
            format_timestamp(draft.saved_at())
        ),
        ReconcileState::MigratePrompt { draft, cloud } => match cloud {
            Some(plan) => format!(
                "Loaded cloud plan #{}; a local draft from {} can replace it (migrate) or be dropped",
                plan.id,
                format_timestamp(draft.saved_at())
            ),
            None => format!(
                "Found a local draft from {}; migrate it to your account or discard it",
                format_timestamp(draft.saved_at())
            ),
        },
        ReconcileState::FreshStart => "Nothing saved yet, starting fresh".to_string(),
        ReconcileState::Resolved { source } => format!("Resolved from {source:?}"),
    }
}

fn format_status(state: &ReconcileState, status: &SessionStatus, now: OffsetDateTime) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "state     {}", status.reconcile);
    let _ = writeln!(&mut out, "          {}", describe_state(state));
    let _ = writeln!(
        &mut out,
        "autosave  {}",
        if status.autosave_ready { "ready" } else { "waiting" }
    );
    let _ = writeln!(&mut out, "saved     {}", status.last_save);
    if let Some(draft) = state.pending_draft() {
        let _ = writeln!(
            &mut out,
            "draft     saved {}",
            describe_elapsed(now - draft.saved_at())
        );
    }
    out
}

fn format_versions(versions: &[PlanVersion]) -> String {
    if versions.is_empty() {
        return "No versions yet.\n".to_string();
    }
    let mut out = String::new();
    for version in versions {
        let _ = writeln!(
            &mut out,
            "v{:<4} #{:<6} {}",
            version.version,
            version.id,
            format_timestamp(version.created_at)
        );
    }
    out
}

fn format_trash(entries: &[TrashEntry], now: OffsetDateTime) -> String {
    if entries.is_empty() {
        return "Trash is empty.\n".to_string();
    }
    let mut out = String::new();
    for entry in entries {
        let plan = &entry.plan;
        let deleted = plan
            .deleted_at
            .map(format_timestamp)
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(&mut out, "#{}  {}  deleted {}", plan.id, plan.period, deleted);
        match entry.purge_at {
            Some(at) if at <= now => {
                let _ = writeln!(&mut out, "    purge due");
            }
            Some(at) => {
                let days = (at - now).whole_days();
                let _ = writeln!(&mut out, "    purged in {days} day{}", plural(days as usize));
            }
            None => {
                let _ = writeln!(&mut out, "    kept until deleted");
            }
        }
    }
    out
}

fn format_event(event: &AutoSaveEvent) -> String {
    match event {
        AutoSaveEvent::Saved { target, at } => {
            format!("Saved to {target} at {}", format_timestamp(*at))
        }
        AutoSaveEvent::Failed {
            target,
            message,
            retry_at,
        } => match retry_at {
            Some(at) => format!(
                "Not saved to {target}: {message} (retrying at {})",
                format_timestamp(*at)
            ),
            None => format!("Not saved to {target}: {message}"),
        },
    }
}

fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}
