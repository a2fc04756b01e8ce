//! Consumer contract for replica-set event dispatch (design §6
//! "ReplicaSetListener callbacks", §9 "virtual listener interface" redesign
//! flag: a trait passed by ownership, no dynamic inheritance tree).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::common::{FullyQualifiedPba, Lsn, Pba};

/// Per-LSN bookkeeping the state machine threads through a listener
/// callback. `key` is the originating header channel's key, conveyed
/// as-is. `resolved` lets a listener that called `PbaResolver::map` during
/// `on_pre_commit` (a follower doing a strong-consistent read) hand back
/// which FQPBAs it resolved, so the state machine can evict them from the
/// resolver once this LSN commits — the eviction trigger spec §4.4 names
/// but does not say how to wire up.
#[derive(Debug, Clone)]
pub struct ReplicaContext {
    pub key: Bytes,
    resolved: Arc<Mutex<Vec<FullyQualifiedPba>>>,
}

impl ReplicaContext {
    pub fn new(key: Bytes) -> Self {
        Self { key, resolved: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn record_resolved(&self, fqpba: FullyQualifiedPba) {
        self.resolved.lock().push(fqpba);
    }

    pub fn take_resolved(&self) -> Vec<FullyQualifiedPba> {
        std::mem::take(&mut self.resolved.lock())
    }
}

/// Driven by [`crate::state_machine::ReplicaStateMachine`]. `ReplicaSet`
/// owns exactly one `Box<dyn ReplicaSetListener>` — ownership rooted where
/// the design's redesign notes specify, not shared.
#[async_trait]
pub trait ReplicaSetListener: Send + Sync {
    /// Fired in strict log-index order as soon as an entry is ordered
    /// (not yet committed). May record pending keys for strong-consistent
    /// reads; returning does not commit anything.
    async fn on_pre_commit(&self, lsn: Lsn, header: &Bytes, ctx: &ReplicaContext);

    /// Fired on the single commit thread, in strict LSN order. Returns the
    /// PBAs the listener is releasing at this LSN; ownership of those PBAs
    /// transfers to the state machine, which must durably record them in
    /// the `FreePbaJournal` before the `StorageEngine` is told to free
    /// them.
    async fn on_commit(&self, lsn: Lsn, header: &Bytes, pbas: &[Pba], ctx: &ReplicaContext) -> Vec<Pba>;

    /// Fired when a previously pre-committed entry at `lsn` is overwritten
    /// (followers only). Must free any resources created during
    /// `on_pre_commit` for this `lsn`. Mutually exclusive with `on_commit`
    /// for the same `lsn`.
    async fn on_rollback(&self, lsn: Lsn, header: &Bytes, ctx: &ReplicaContext);

    /// Fired once, after the commit thread has drained and the journal and
    /// superblock have been flushed.
    async fn on_replica_stop(&self);
}
