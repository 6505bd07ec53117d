use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rusqlite::config::DbConfig;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use time::OffsetDateTime;

use crate::config::{ConfigPaths, StorageOptions};
use crate::error::{read_failure, write_failure, SyncResult};
use crate::model::{OwnerId, Period, PlanDocument, PlanId, PlanVersion, Quarter, SavedPlan};

mod schema;

const PLAN_COLUMNS: &str = "id, owner_id, quarter, year, data, created_at, updated_at, deleted_at";
const VERSION_COLUMNS: &str = "id, plan_id, version, data, created_at";

/// The account-scoped store holding saved plans, their version series and
/// trash state.
///
/// Implementations must keep at most one active plan per owner and period;
/// concurrent upserts for the same key resolve last-write-wins.
pub trait RemoteStore: Send + Sync + std::fmt::Debug {
    /// Inserts or overwrites the active plan for `(owner, period)`.
    fn upsert(
        &self,
        owner: &OwnerId,
        period: Period,
        data: &PlanDocument,
        at: OffsetDateTime,
    ) -> SyncResult<SavedPlan>;

    fn select_active(&self, owner: &OwnerId, period: Period) -> SyncResult<Option<SavedPlan>>;

    /// Looks a plan up regardless of trash state.
    fn fetch_plan(&self, plan_id: PlanId) -> SyncResult<Option<SavedPlan>>;

    fn list_active(&self, owner: &OwnerId) -> SyncResult<Vec<SavedPlan>>;

    /// Trashed plans, most recently deleted first.
    fn list_trashed(&self, owner: &OwnerId) -> SyncResult<Vec<SavedPlan>>;

    /// Replaces the data of an active plan. `false` when no active plan matched.
    fn update_data(&self, plan_id: PlanId, data: &PlanDocument, at: OffsetDateTime)
        -> SyncResult<bool>;

    /// `false` when the plan is missing or already trashed.
    fn soft_delete(&self, plan_id: PlanId, at: OffsetDateTime) -> SyncResult<bool>;

    /// `false` when the plan is missing or not trashed.
    fn restore(&self, plan_id: PlanId) -> SyncResult<bool>;

    /// Removes a trashed plan and its versions. `false` when the plan is
    /// missing or still active.
    fn hard_delete(&self, plan_id: PlanId) -> SyncResult<bool>;

    /// Versions of a plan, newest first.
    fn list_versions(&self, plan_id: PlanId) -> SyncResult<Vec<PlanVersion>>;

    fn latest_version(&self, plan_id: PlanId) -> SyncResult<Option<PlanVersion>>;

    /// Appends a snapshot numbered one past the highest existing version.
    fn append_version(
        &self,
        plan_id: PlanId,
        data: &PlanDocument,
        at: OffsetDateTime,
    ) -> SyncResult<PlanVersion>;

    fn fetch_version(&self, version_id: i64) -> SyncResult<Option<PlanVersion>>;

    /// Trashed plans deleted at or before `cutoff`, across all owners.
    fn expired_trash(&self, cutoff: OffsetDateTime) -> SyncResult<Vec<SavedPlan>>;
}

/// SQLite-backed [`RemoteStore`]. Cheap to clone; every call opens its own
/// connection.
#[derive(Debug, Clone)]
pub struct StorageHandle {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
}

impl StorageHandle {
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)
            .with_context(|| format!("opening database {}", self.db_path.display()))?;
        prepare_connection(&conn, &self.options)?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    fn upsert_plan(
        &self,
        owner: &OwnerId,
        period: Period,
        data: &PlanDocument,
        at: OffsetDateTime,
    ) -> Result<SavedPlan> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = at.unix_timestamp();
        tx.execute(
            "INSERT INTO plans (owner_id, quarter, year, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (owner_id, quarter, year) WHERE deleted_at IS NULL
             DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![
                owner.as_str(),
                period.quarter.number(),
                period.year,
                data.serialized(),
                now
            ],
        )
        .context("upserting plan")?;
        let plan = tx
            .query_row(
                &format!(
                    "SELECT {PLAN_COLUMNS} FROM plans
                     WHERE owner_id = ?1 AND quarter = ?2 AND year = ?3 AND deleted_at IS NULL"
                ),
                params![owner.as_str(), period.quarter.number(), period.year],
                plan_from_row,
            )
            .context("reading back upserted plan")?;
        tx.commit()?;
        Ok(plan)
    }

    fn append_plan_version(
        &self,
        plan_id: PlanId,
        data: &PlanDocument,
        at: OffsetDateTime,
    ) -> Result<PlanVersion> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = tx
            .query_row("SELECT 1 FROM plans WHERE id = ?1", params![plan_id], |_row| {
                Ok(())
            })
            .optional()?
            .is_some();
        if !exists {
            bail!("plan {plan_id} not found");
        }
        let version: u32 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM plan_versions WHERE plan_id = ?1",
            params![plan_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO plan_versions (plan_id, version, data, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![plan_id, version, data.serialized(), at.unix_timestamp()],
        )
        .context("inserting plan version")?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(PlanVersion {
            id,
            plan_id,
            version,
            data: data.clone(),
            created_at: truncate_to_seconds(at),
        })
    }

    fn query_plans<P: rusqlite::Params>(&self, filter: &str, params: P) -> Result<Vec<SavedPlan>> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {PLAN_COLUMNS} FROM plans {filter}");
            let mut stmt = conn.prepare(&sql)?;
            let plans = stmt
                .query_map(params, plan_from_row)?
                .collect::<Result<Vec<_>, _>>()
                .context("querying plans")?;
            Ok(plans)
        })
    }

    fn query_plan<P: rusqlite::Params>(&self, filter: &str, params: P) -> Result<Option<SavedPlan>> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {PLAN_COLUMNS} FROM plans {filter}");
            let plan = conn.query_row(&sql, params, plan_from_row).optional()?;
            Ok(plan)
        })
    }

    fn query_versions<P: rusqlite::Params>(
        &self,
        filter: &str,
        params: P,
    ) -> Result<Vec<PlanVersion>> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {VERSION_COLUMNS} FROM plan_versions {filter}");
            let mut stmt = conn.prepare(&sql)?;
            let versions = stmt
                .query_map(params, version_from_row)?
                .collect::<Result<Vec<_>, _>>()
                .context("querying plan versions")?;
            Ok(versions)
        })
    }

    fn execute(&self, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
        self.with_connection(|conn| Ok(conn.execute(sql, params)?))
    }
}

impl RemoteStore for StorageHandle {
    fn upsert(
        &self,
        owner: &OwnerId,
        period: Period,
        data: &PlanDocument,
        at: OffsetDateTime,
    ) -> SyncResult<SavedPlan> {
        self.upsert_plan(owner, period, data, at)
            .map_err(write_failure)
    }

    fn select_active(&self, owner: &OwnerId, period: Period) -> SyncResult<Option<SavedPlan>> {
        self.query_plan(
            "WHERE owner_id = ?1 AND quarter = ?2 AND year = ?3 AND deleted_at IS NULL",
            params![owner.as_str(), period.quarter.number(), period.year],
        )
        .map_err(read_failure)
    }

    fn fetch_plan(&self, plan_id: PlanId) -> SyncResult<Option<SavedPlan>> {
        self.query_plan("WHERE id = ?1", params![plan_id])
            .map_err(read_failure)
    }

    fn list_active(&self, owner: &OwnerId) -> SyncResult<Vec<SavedPlan>> {
        self.query_plans(
            "WHERE owner_id = ?1 AND deleted_at IS NULL ORDER BY year DESC, quarter DESC",
            params![owner.as_str()],
        )
        .map_err(read_failure)
    }

    fn list_trashed(&self, owner: &OwnerId) -> SyncResult<Vec<SavedPlan>> {
        self.query_plans(
            "WHERE owner_id = ?1 AND deleted_at IS NOT NULL ORDER BY deleted_at DESC, id DESC",
            params![owner.as_str()],
        )
        .map_err(read_failure)
    }

    fn update_data(
        &self,
        plan_id: PlanId,
        data: &PlanDocument,
        at: OffsetDateTime,
    ) -> SyncResult<bool> {
        self.execute(
            "UPDATE plans SET data = ?1, updated_at = ?2 WHERE id = ?3 AND deleted_at IS NULL",
            params![data.serialized(), at.unix_timestamp(), plan_id],
        )
        .map(|updated| updated > 0)
        .map_err(write_failure)
    }

    fn soft_delete(&self, plan_id: PlanId, at: OffsetDateTime) -> SyncResult<bool> {
        self.execute(
            "UPDATE plans SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![at.unix_timestamp(), plan_id],
        )
        .map(|updated| updated > 0)
        .map_err(write_failure)
    }

    fn restore(&self, plan_id: PlanId) -> SyncResult<bool> {
        self.execute(
            "UPDATE plans SET deleted_at = NULL WHERE id = ?1 AND deleted_at IS NOT NULL",
            params![plan_id],
        )
        .map(|updated| updated > 0)
        .map_err(write_failure)
    }

    fn hard_delete(&self, plan_id: PlanId) -> SyncResult<bool> {
        self.execute(
            "DELETE FROM plans WHERE id = ?1 AND deleted_at IS NOT NULL",
            params![plan_id],
        )
        .map(|deleted| deleted > 0)
        .map_err(write_failure)
    }

    fn list_versions(&self, plan_id: PlanId) -> SyncResult<Vec<PlanVersion>> {
        self.query_versions("WHERE plan_id = ?1 ORDER BY version DESC", params![plan_id])
            .map_err(read_failure)
    }

    fn latest_version(&self, plan_id: PlanId) -> SyncResult<Option<PlanVersion>> {
        self.query_versions(
            "WHERE plan_id = ?1 ORDER BY version DESC LIMIT 1",
            params![plan_id],
        )
        .map(|versions| versions.into_iter().next())
        .map_err(read_failure)
    }

    fn append_version(
        &self,
        plan_id: PlanId,
        data: &PlanDocument,
        at: OffsetDateTime,
    ) -> SyncResult<PlanVersion> {
        self.append_plan_version(plan_id, data, at)
            .map_err(write_failure)
    }

    fn fetch_version(&self, version_id: i64) -> SyncResult<Option<PlanVersion>> {
        self.query_versions("WHERE id = ?1", params![version_id])
            .map(|versions| versions.into_iter().next())
            .map_err(read_failure)
    }

    fn expired_trash(&self, cutoff: OffsetDateTime) -> SyncResult<Vec<SavedPlan>> {
        self.query_plans(
            "WHERE deleted_at IS NOT NULL AND deleted_at <= ?1 ORDER BY deleted_at ASC",
            params![cutoff.unix_timestamp()],
        )
        .map_err(read_failure)
    }
}

fn plan_from_row(row: &Row<'_>) -> rusqlite::Result<SavedPlan> {
    let owner: String = row.get(1)?;
    let quarter: u8 = row.get(2)?;
    let deleted_at = match row.get::<_, Option<i64>>(7)? {
        Some(ts) => Some(timestamp_from(7, ts)?),
        None => None,
    };
    Ok(SavedPlan {
        id: row.get(0)?,
        owner_id: OwnerId::parse(&owner)
            .ok_or_else(|| conversion_error(1, Type::Text, "blank owner id"))?,
        period: Period::new(
            Quarter::from_number(quarter)
                .ok_or_else(|| conversion_error(2, Type::Integer, "quarter out of range"))?,
            row.get(3)?,
        ),
        data: document_column(row, 4)?,
        created_at: timestamp_from(5, row.get(5)?)?,
        updated_at: timestamp_from(6, row.get(6)?)?,
        deleted_at,
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<PlanVersion> {
    Ok(PlanVersion {
        id: row.get(0)?,
        plan_id: row.get(1)?,
        version: row.get(2)?,
        data: document_column(row, 3)?,
        created_at: timestamp_from(4, row.get(4)?)?,
    })
}

fn document_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<PlanDocument> {
    let raw: String = row.get(idx)?;
    PlanDocument::from_json(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn timestamp_from(idx: usize, ts: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(err)))
}

fn conversion_error(idx: usize, ty: Type, message: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, message.into())
}

fn truncate_to_seconds(at: OffsetDateTime) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(at.unix_timestamp()).unwrap_or(at)
}

pub fn init(paths: &ConfigPaths, storage: &StorageOptions) -> Result<StorageHandle> {
    let db_path = if storage.database_path.as_os_str().is_empty() {
        &paths.database_path
    } else {
        &storage.database_path
    };
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, storage)?;
    schema::apply(&conn)?;
    tracing::debug!(path = %db_path.display(), "plan store ready");
    Ok(StorageHandle {
        db_path: Arc::new(db_path.clone()),
        options: Arc::new(storage.clone()),
    })
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FKEY, true)
        .context("enabling foreign keys")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )
    .context("setting wal_autocheckpoint")?;
    Ok(())
}
