//! Window store implementations.
//!
//! `LocalStore` keeps windows in process memory and is used when no shared
//! store is configured or reachable. `RedisStore` keeps them in Redis sorted
//! sets so several service instances enforce one quota.

mod local;
mod redis;

pub use self::local::{LocalStore, LocalStoreConfig, Sweeper};
pub use self::redis::{RedisStore, RedisStoreConfig};
