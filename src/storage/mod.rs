//! Collaborator interfaces this crate consumes but does not implement in
//! production: block allocation/IO ([`engine`]) and the append-only,
//! index-addressed log primitive ([`log_store`]) that both the consensus
//! journal and the free-PBA journal are built on.
//!
//! Each trait ships an in-memory reference implementation, gated behind
//! `test-util`, used by this crate's own integration tests and available to
//! downstream callers who want to exercise the core without a real
//! block-storage backend.

pub mod checksum;
pub mod engine;
pub mod log_store;

pub use checksum::hardware_crc32c;
pub use engine::StorageEngine;
pub use log_store::{LogStore, LogStoreId};

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

#[cfg(any(test, feature = "test-util"))]
pub use memory::{InMemoryLogStore, InMemoryStorageEngine};
