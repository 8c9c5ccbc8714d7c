//! The agent pool: registry, bulk lifecycle and pool-wide aggregates

mod handlers;
#[allow(clippy::module_inception)]
mod pool;

pub(crate) use pool::PoolInner;
pub use pool::{Pool, PoolEventContext, StartupReport};
