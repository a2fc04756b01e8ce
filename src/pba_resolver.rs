//! Remote→local PBA resolution cache (design §2 "PbaResolver" row, §4.4).
//!
//! Converts a [`FullyQualifiedPba`] into a local [`Pba`] by on-demand
//! fetch-and-write, with at-most-once materialization per FQPBA across
//! concurrent callers racing the same miss — the *single-flight* section
//! called out in the redesign notes ("a sharded map with a per-key
//! in-flight sentinel").

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::common::{FullyQualifiedPba, Pba};
use crate::data_channel::DataChannel;
use crate::error::{Result, ReplicoreError};
use crate::storage::engine::StorageEngine;

/// `None` while the in-flight fetch is still running; `Some(pba)` once it
/// has published a result. A closed channel with no value sent means the
/// fetch failed — every waiter observes that independently and returns
/// `RemoteUnavailable` rather than electing a new leader for the retry.
type InFlight = watch::Receiver<Option<Pba>>;

enum Slot {
    Resolved(Pba),
    InFlight(InFlight),
}

pub struct PbaResolver {
    pba_map: DashMap<FullyQualifiedPba, Slot>,
    storage: Arc<dyn StorageEngine>,
    data_channel: Arc<dyn DataChannel>,
    fetch_timeout: Duration,
}

impl PbaResolver {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        data_channel: Arc<dyn DataChannel>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            pba_map: DashMap::new(),
            storage,
            data_channel,
            fetch_timeout,
        }
    }

    /// Resolves `fqpba` to a local PBA, fetching and materializing it on
    /// first miss. Concurrent callers on the same key await the same
    /// fetch; only one of them actually calls `DataChannel::fetch` and
    /// `StorageEngine::async_write`.
    pub async fn map(&self, fqpba: &FullyQualifiedPba) -> Result<Pba> {
        loop {
            // The `match` below must fully resolve (and drop the DashMap
            // shard guard it holds) before we ever `.await` — holding a
            // shard guard across a suspension point would block every
            // other key hashing to that shard for as long as the fetch
            // takes.
            enum NextStep {
                AlreadyResolved(Pba),
                BecomeFetcher(watch::Sender<Option<Pba>>),
                JoinInFlight(InFlight),
            }

            let step = match self.pba_map.entry(fqpba.clone()) {
                Entry::Occupied(occupied) => match occupied.get() {
                    Slot::Resolved(pba) => NextStep::AlreadyResolved(*pba),
                    Slot::InFlight(rx) => NextStep::JoinInFlight(rx.clone()),
                },
                Entry::Vacant(vacant) => {
                    let (tx, rx) = watch::channel(None);
                    vacant.insert(Slot::InFlight(rx));
                    NextStep::BecomeFetcher(tx)
                }
            };

            match step {
                NextStep::AlreadyResolved(pba) => return Ok(pba),
                NextStep::BecomeFetcher(tx) => return self.fetch_and_install(fqpba, tx).await,
                NextStep::JoinInFlight(rx) => {
                    if let Some(pba) = self.await_in_flight(fqpba, rx).await? {
                        return Ok(pba);
                    }
                    // The original fetcher failed and dropped its sender
                    // without retrying; loop to re-enter as the new first
                    // caller.
                }
            }
        }
    }

    async fn await_in_flight(&self, fqpba: &FullyQualifiedPba, mut waiter: InFlight) -> Result<Option<Pba>> {
        let changed = tokio::time::timeout(self.fetch_timeout, async {
            loop {
                if let Some(pba) = *waiter.borrow() {
                    return Some(pba);
                }
                if waiter.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;
        match changed {
            Ok(result) => Ok(result),
            Err(_) => Err(ReplicoreError::RemoteUnavailable(fqpba.clone())),
        }
    }

    async fn fetch_and_install(
        &self,
        fqpba: &FullyQualifiedPba,
        tx: watch::Sender<Option<Pba>>,
    ) -> Result<Pba> {
        let outcome = tokio::time::timeout(self.fetch_timeout, async {
            let bytes = self.data_channel.fetch(fqpba).await?;
            let local_pbas = self.storage.alloc_pbas(bytes.len()).await?;
            self.storage.async_write(&local_pbas, bytes).await?;
            Ok::<Pba, ReplicoreError>(local_pbas[0])
        })
        .await;

        match outcome {
            Ok(Ok(local_pba)) => {
                self.pba_map.insert(fqpba.clone(), Slot::Resolved(local_pba));
                let _ = tx.send(Some(local_pba));
                Ok(local_pba)
            }
            Ok(Err(e)) => {
                self.pba_map.remove(fqpba);
                drop(tx);
                Err(e)
            }
            Err(_) => {
                self.pba_map.remove(fqpba);
                drop(tx);
                Err(ReplicoreError::RemoteUnavailable(fqpba.clone()))
            }
        }
    }

    /// Removes `fqpba` from the map. Driven by `on_commit`: once the log
    /// commits, the local PBA is the canonical reference and the remote
    /// mapping is no longer needed.
    pub fn forget(&self, fqpba: &FullyQualifiedPba) {
        self.pba_map.remove(fqpba);
    }
}
