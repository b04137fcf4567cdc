pub mod admission;
pub mod comm;
pub mod common;
pub mod engine;
pub mod ledger;
pub mod reactor;
pub mod reconcile;
pub mod registry;
pub mod request;

#[cfg(test)]
pub(crate) mod tests;

pub use crate::common::ids::{GroupId, JobId, UserId};
pub use crate::common::{Map, Set, WrappedArcMutex};

pub type Error = crate::common::error::CoreError;
pub type Result<T> = std::result::Result<T, Error>;

/// Job priority as reported by the scheduler. Bigger number -> higher priority.
pub type Priority = u32;

/// Wall-clock time used for creation, use and release times.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
