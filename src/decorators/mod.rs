//! Resilience decorators over [`crate::storage::TableStorage`].
//!
//! Each decorator owns an `Arc<dyn TableStorage<T>>` and implements the same
//! contract, so they stack in any order. [`crate::factory::TableStorageFactory`]
//! assembles the usual chain: logging, optional cache, retry, reconnect and
//! finally the remote client.

mod cache;
mod logging;
mod reconnect;
pub mod reloading;
mod retry;

pub use cache::{CacheStats, CachedTableStorage};
pub use logging::LoggingTableStorage;
pub use reconnect::ReconnectingTableStorage;
pub use reloading::{ClientFactory, ReloadingCell};
pub use retry::{storage_policy, RetryingTableStorage};

pub(crate) use retry::check_count;
