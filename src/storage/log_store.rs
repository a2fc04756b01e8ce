//! `LogStore` collaborator contract (design §4.2).
//!
//! One append-only, index-addressed durable log. Both the consensus
//! journal and the [`FreePbaJournal`](crate::free_pba_journal::FreePbaJournal)
//! are built on a `LogStore`; this crate never opens one for the consensus
//! journal itself (that is the `ConsensusLog` collaborator's business) but
//! does own and drive one for the free-PBA journal.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Identifies a log store within a [`crate::storage::engine::StorageEngine`].
/// Recorded in the replica-set superblock as `free_pba_store_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogStoreId(pub u32);

/// A visitor invoked once per record during [`LogStore::foreach`]. Returns
/// `true` to continue iterating, `false` to stop early.
pub type Visitor<'a> = dyn FnMut(u64, &[u8]) -> bool + Send + 'a;

#[async_trait]
pub trait LogStore: Send + Sync {
    fn id(&self) -> LogStoreId;

    /// Appends `bytes` at `lsn`. Must survive restart with entries
    /// recoverable in the same LSN order they were written.
    async fn write_async(&self, lsn: u64, bytes: Bytes) -> Result<()>;

    /// Iterates stored records starting at `start_lsn` in ascending LSN
    /// order, calling `visitor` for each until it returns `false` or the
    /// log is exhausted.
    async fn foreach(&self, start_lsn: u64, visitor: &mut Visitor<'_>) -> Result<()>;

    /// Physically removes all records at or before `upto_lsn`.
    async fn truncate(&self, upto_lsn: u64) -> Result<()>;

    /// Forces durability of everything written up to and including `lsn`.
    async fn flush_sync(&self, lsn: u64) -> Result<()>;
}
