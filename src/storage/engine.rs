//! `StorageEngine` collaborator contract (design §4.1).
//!
//! The production backend (home-grown allocator, "jungle", or a plain file
//! pool — see [`crate::config::StorageBackend`]) lives outside this crate
//! entirely; this trait is the seam. Idiomatic `async fn` stands in for the
//! design's explicit completion-callback parameters (`cb`) — a `Future`
//! resolving is exactly the callback firing, so every ordering guarantee
//! the design states in terms of callbacks still holds.

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::common::Pba;
use crate::error::Result;

use super::log_store::LogStore;

/// Allocates and frees PBAs, moves payload bytes by PBA, and hosts the two
/// kinds of durable log store this crate needs (the consensus journal and
/// the free-PBA journal), plus per-replica-set superblocks.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Returns one or more PBAs whose concatenation covers `size` bytes.
    /// The returned PBAs are reserved until [`StorageEngine::free_pba`] is
    /// called on each, or until crash recovery reclaims them via the
    /// free-PBA journal.
    async fn alloc_pbas(&self, size: usize) -> Result<Vec<Pba>>;

    /// Writes `data` across `pbas` in order. `data.len()` must not exceed
    /// the total size the `pbas` were allocated to cover.
    async fn async_write(&self, pbas: &[Pba], data: Bytes) -> Result<()>;

    /// Reads `len` bytes back from `pbas`, in the order they were
    /// allocated/written.
    async fn async_read(&self, pbas: &[Pba], len: usize) -> Result<Bytes>;

    /// Idempotent. Callable only once a durable `FreePbaRecord` names this
    /// PBA (design §4.7); the engine is not required to re-check that —
    /// it is the core's invariant to uphold, not the collaborator's.
    async fn free_pba(&self, pba: Pba) -> Result<()>;

    /// Allocates a new, empty log store and returns a handle to it.
    async fn create_log_store(&self) -> Result<Box<dyn LogStore>>;

    /// Opens a previously created log store by id.
    async fn open_log_store(&self, id: super::log_store::LogStoreId) -> Result<Box<dyn LogStore>>;

    /// Persists the fixed-layout superblock bytes for replica set `uuid`.
    async fn superblock_write(&self, uuid: Uuid, bytes: Bytes) -> Result<()>;

    /// Reads back the superblock for `uuid`, if one has ever been written.
    async fn superblock_read(&self, uuid: Uuid) -> Result<Option<Bytes>>;

    /// Removes the superblock for `uuid`. Called once by
    /// [`crate::service::ReplicationService`] after `on_replica_stop`
    /// completes, per the data model's `ReplicaSet` lifecycle.
    async fn superblock_remove(&self, uuid: Uuid) -> Result<()>;
}
