//! `ConsensusLog` collaborator contract (design §4.3 of the system
//! overview table / purpose & scope).
//!
//! The consensus engine (leader election, log replication, snapshot
//! framing) is entirely external; what this crate needs from it is two
//! things: a way to append an entry and learn its assigned LSN, and a sink
//! it can drive with ordered pre-commit/commit/rollback notifications.
//! [`ConsensusSink`] is implemented by
//! [`crate::state_machine::ReplicaStateMachine`]; callers never implement
//! it themselves.

use async_trait::async_trait;

use crate::common::{LogEntry, Lsn};
use crate::error::Result;

/// Driven by a `ConsensusLog` implementation as entries become ordered
/// (`on_log_pre_commit`) and, later, committed or rolled back by consensus.
#[async_trait]
pub trait ConsensusSink: Send + Sync {
    async fn on_log_pre_commit(&self, lsn: Lsn, entry: LogEntry);
    async fn on_log_commit(&self, lsn: Lsn, entry: LogEntry);
    async fn on_log_rollback(&self, lsn: Lsn, entry: LogEntry);
}

#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// Registers the sink that receives this log's delivery callbacks.
    /// Called once, during `ReplicaSet` construction.
    fn attach_sink(&self, sink: std::sync::Arc<dyn ConsensusSink>);

    /// Appends `entry`, blocking until consensus has ordered it, and
    /// returns its assigned LSN. Unlike every other suspension point in
    /// this crate, this has no timeout: consensus is authoritative (design
    /// §5, "Cancellation and timeouts").
    async fn append(&self, entry: LogEntry) -> Result<Lsn>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod memory {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;

    /// A single-replica "consensus" log: every append is immediately its
    /// own quorum. Pre-commit fires synchronously inside `append` (as a
    /// real leader would do per design §4.6 step 4); commit is delivered
    /// asynchronously off a background task so tests can observe the
    /// pre-commit/commit split.
    pub struct InMemoryConsensusLog {
        next_lsn: AtomicU64,
        sink: Mutex<Option<Arc<dyn ConsensusSink>>>,
        commit_tx: mpsc::UnboundedSender<(Lsn, LogEntry)>,
    }

    impl InMemoryConsensusLog {
        pub fn new() -> Arc<Self> {
            let (commit_tx, mut commit_rx) = mpsc::unbounded_channel::<(Lsn, LogEntry)>();
            let this = Arc::new(Self {
                next_lsn: AtomicU64::new(1),
                sink: Mutex::new(None),
                commit_tx,
            });
            let weak = Arc::downgrade(&this);
            tokio::spawn(async move {
                while let Some((lsn, entry)) = commit_rx.recv().await {
                    if let Some(strong) = weak.upgrade() {
                        if let Some(sink) = strong.sink.lock().clone() {
                            sink.on_log_commit(lsn, entry).await;
                        }
                    }
                }
            });
            this
        }
    }

    #[async_trait]
    impl ConsensusLog for InMemoryConsensusLog {
        fn attach_sink(&self, sink: Arc<dyn ConsensusSink>) {
            *self.sink.lock() = Some(sink);
        }

        async fn append(&self, entry: LogEntry) -> Result<Lsn> {
            let lsn = Lsn::new(self.next_lsn.fetch_add(1, Ordering::SeqCst));
            if let Some(sink) = self.sink.lock().clone() {
                sink.on_log_pre_commit(lsn, entry.clone()).await;
            }
            let _ = self.commit_tx.send((lsn, entry));
            Ok(lsn)
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use memory::InMemoryConsensusLog;
