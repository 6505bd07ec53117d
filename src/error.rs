use thiserror::Error;

use crate::model::{Period, PlanId};

/// Failures the sync engine distinguishes between.
///
/// Storage adapters speak `anyhow` internally and convert at their trait
/// boundary; callers only ever see these variants.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The device-local cache cannot be used (blocked, read-only, missing).
    #[error("local cache unavailable: {0}")]
    StorageUnavailable(String),

    #[error("remote read failed: {0}")]
    RemoteReadFailed(String),

    /// Network, auth or quota failure while writing to the account store.
    #[error("remote write failed: {0}")]
    RemoteWriteFailed(String),

    /// The stored draft blob could not be decoded.
    #[error("corrupt local draft: {0}")]
    CorruptLocalBlob(String),

    #[error("version {0} not found")]
    VersionRestoreNotFound(i64),

    #[error("plan {0} is active; only trashed plans can be permanently deleted")]
    PermanentDeleteOfActivePlan(PlanId),

    #[error("plan {0} not found")]
    PlanNotFound(PlanId),

    #[error("plan {0} is in the trash")]
    PlanInTrash(PlanId),

    #[error("plan {0} is not in the trash")]
    NotInTrash(PlanId),

    #[error("an active plan already exists for {period}")]
    ActivePlanExists { period: Period },

    #[error("this operation requires a signed-in account")]
    Unauthenticated,

    #[error("cannot {event} while {state}")]
    InvalidTransition {
        state: &'static str,
        event: &'static str,
    },
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Transient failures are retried by the next debounce cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteReadFailed(_) | SyncError::RemoteWriteFailed(_)
        )
    }
}

pub(crate) fn read_failure(err: anyhow::Error) -> SyncError {
    SyncError::RemoteReadFailed(format!("{err:#}"))
}

pub(crate) fn write_failure(err: anyhow::Error) -> SyncError {
    SyncError::RemoteWriteFailed(format!("{err:#}"))
}
