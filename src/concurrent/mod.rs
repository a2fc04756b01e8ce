// Concurrency primitives shared across the replication core.

pub mod rwlock_wp;

pub use rwlock_wp::{RwLockReadGuard, RwLockWP, RwLockWriteGuard};
