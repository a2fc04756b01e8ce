//! `ReplicaSet` lifecycle and the leader write path (design §2
//! "ReplicaSet / Service" row, §4.6).

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::common::{LogEntry, Lsn, Pba};
use crate::consensus::ConsensusLog;
use crate::data_channel::DataChannel;
use crate::error::Result;
use crate::listener::ReplicaSetListener;
use crate::pba_resolver::PbaResolver;
use crate::state_machine::ReplicaStateMachine;
use crate::storage::engine::StorageEngine;

/// One replica set: a consensus log, a data channel, a state machine, and
/// (for replicas that resolve remote references) a `PbaResolver`. Per the
/// redesign notes, ownership is rooted here — every other component that
/// needs one of these back is handed an `Arc` clone or a bare id, never a
/// shared-pointer graph with this as just one more node in it.
pub struct ReplicaSet {
    group_id: Uuid,
    storage: Arc<dyn StorageEngine>,
    data_channel: Arc<dyn DataChannel>,
    consensus_log: Arc<dyn ConsensusLog>,
    state_machine: Arc<ReplicaStateMachine>,
    #[allow(dead_code)]
    resolver: Option<Arc<PbaResolver>>,
}

impl ReplicaSet {
    /// Opens (creating on first use) the replica set identified by
    /// `group_id`, running state-machine recovery before returning.
    pub async fn open(
        group_id: Uuid,
        storage: Arc<dyn StorageEngine>,
        data_channel: Arc<dyn DataChannel>,
        consensus_log: Arc<dyn ConsensusLog>,
        listener: Box<dyn ReplicaSetListener>,
        resolver: Option<Arc<PbaResolver>>,
    ) -> Result<Arc<Self>> {
        let state_machine =
            ReplicaStateMachine::open(group_id, storage.clone(), listener, resolver.clone()).await?;
        consensus_log.attach_sink(state_machine.clone());

        Ok(Arc::new(Self {
            group_id,
            storage,
            data_channel,
            consensus_log,
            state_machine,
            resolver,
        }))
    }

    pub fn group_id(&self) -> Uuid {
        self.group_id
    }

    pub fn commit_lsn(&self) -> Lsn {
        self.state_machine.commit_lsn()
    }

    /// The leader write path (§4.6): allocate, write the bulk payload to
    /// both local storage and peers in parallel, then append the header
    /// entry to consensus. `on_pre_commit` fires on this call's own task
    /// (the leader optimization) because `ConsensusLog::append` on the
    /// in-memory implementation invokes the attached sink synchronously
    /// before returning; a production `ConsensusLog` is expected to do the
    /// same.
    pub async fn write(&self, header: Bytes, key: Bytes, value: Bytes) -> Result<Lsn> {
        let pbas = self.storage.alloc_pbas(value.len()).await?;

        let write_and_push = tokio::try_join!(
            self.storage.async_write(&pbas, value.clone()),
            self.data_channel.push(self.group_id, &pbas, value),
        );
        if let Err(e) = write_and_push {
            self.free_allocated(&pbas).await;
            return Err(e);
        }

        let entry = LogEntry::new(header, key, pbas.clone());
        match self.consensus_log.append(entry).await {
            Ok(lsn) => Ok(lsn),
            Err(e) => {
                self.free_allocated(&pbas).await;
                Err(e)
            }
        }
    }

    async fn free_allocated(&self, pbas: &[Pba]) {
        for pba in pbas {
            if let Err(error) = self.storage.free_pba(*pba).await {
                tracing::error!(%pba, %error, "failed to free pba after aborted write");
            }
        }
    }

    /// Drains the commit thread, flushes the journal and superblock,
    /// notifies the listener, then removes the superblock entirely —
    /// the replica set's lifecycle ends here.
    pub async fn stop(&self) -> Result<()> {
        self.state_machine.stop().await?;
        self.storage.superblock_remove(self.group_id).await
    }
}
