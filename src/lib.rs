pub mod autosave;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod session;
pub mod snapshots;
pub mod storage;
pub mod trash;

#[cfg(test)]
mod test_support;

pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use error::{SyncError, SyncResult};
pub use session::{Engine, PlanSession, SessionContext};
