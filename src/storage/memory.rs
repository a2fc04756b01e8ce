//! In-memory `StorageEngine`/`LogStore` reference implementations.
//!
//! Exercised by this crate's own tests, and usable by a downstream
//! integration test that wants the real state machine/journal/resolver
//! logic without standing up a real block-storage engine. Grounded in the
//! `DashMap`-over-`Arc<RwLock<HashMap>>` rationale the teacher crate
//! documents for its own concurrent registries.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::common::Pba;
use crate::error::{Result, ReplicoreError};

use super::engine::StorageEngine;
use super::log_store::{LogStore, LogStoreId, Visitor};

/// A `StorageEngine` that allocates PBAs from a monotonic counter and keeps
/// both block data and superblocks in process memory. Never actually runs
/// out of space; callers that want to exercise `OutOfSpace` should wrap
/// this in a small adapter that fails deterministically instead.
pub struct InMemoryStorageEngine {
    next_pba: AtomicU64,
    blocks: DashMap<Pba, Bytes>,
    freed: DashMap<Pba, ()>,
    superblocks: DashMap<Uuid, Bytes>,
    next_log_store_id: AtomicU32,
    log_stores: DashMap<u32, Arc<InMemoryLogStoreState>>,
}

impl Default for InMemoryStorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorageEngine {
    pub fn new() -> Self {
        Self {
            next_pba: AtomicU64::new(1),
            blocks: DashMap::new(),
            freed: DashMap::new(),
            superblocks: DashMap::new(),
            next_log_store_id: AtomicU32::new(1),
            log_stores: DashMap::new(),
        }
    }

    /// Test hook: true once `free_pba` has been called for `pba`.
    pub fn is_freed(&self, pba: Pba) -> bool {
        self.freed.contains_key(&pba)
    }

    /// Test hook: true while `pba` is still considered allocated.
    pub fn is_allocated(&self, pba: Pba) -> bool {
        self.blocks.contains_key(&pba) && !self.is_freed(pba)
    }
}

#[async_trait]
impl StorageEngine for InMemoryStorageEngine {
    async fn alloc_pbas(&self, size: usize) -> Result<Vec<Pba>> {
        // One contiguous extent per allocation; real engines may split
        // across multiple PBAs under fragmentation, which is exactly the
        // case the design leaves as an open allocator-policy question.
        let _ = size;
        let raw = self.next_pba.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Pba::new(raw)])
    }

    async fn async_write(&self, pbas: &[Pba], data: Bytes) -> Result<()> {
        if pbas.len() == 1 {
            self.blocks.insert(pbas[0], data);
            return Ok(());
        }
        // Split `data` evenly across the PBA list, mirroring how a real
        // engine would lay out a payload too large for one extent.
        let chunk = data.len().div_ceil(pbas.len().max(1));
        for (i, pba) in pbas.iter().enumerate() {
            let start = i * chunk;
            let end = (start + chunk).min(data.len());
            self.blocks.insert(*pba, data.slice(start..end));
        }
        Ok(())
    }

    async fn async_read(&self, pbas: &[Pba], len: usize) -> Result<Bytes> {
        let mut out = Vec::with_capacity(len);
        for pba in pbas {
            if let Some(bytes) = self.blocks.get(pba) {
                out.extend_from_slice(&bytes);
            }
        }
        out.truncate(len);
        Ok(Bytes::from(out))
    }

    async fn free_pba(&self, pba: Pba) -> Result<()> {
        self.freed.insert(pba, ());
        Ok(())
    }

    async fn create_log_store(&self) -> Result<Box<dyn LogStore>> {
        let id = self.next_log_store_id.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(InMemoryLogStoreState::new(LogStoreId(id)));
        self.log_stores.insert(id, state.clone());
        Ok(Box::new(InMemoryLogStore { state }))
    }

    async fn open_log_store(&self, id: LogStoreId) -> Result<Box<dyn LogStore>> {
        let state = self
            .log_stores
            .get(&id.0)
            .map(|entry| entry.clone())
            .ok_or_else(|| ReplicoreError::InvalidState(format!("no log store {}", id.0)))?;
        Ok(Box::new(InMemoryLogStore { state }))
    }

    async fn superblock_write(&self, uuid: Uuid, bytes: Bytes) -> Result<()> {
        self.superblocks.insert(uuid, bytes);
        Ok(())
    }

    async fn superblock_read(&self, uuid: Uuid) -> Result<Option<Bytes>> {
        Ok(self.superblocks.get(&uuid).map(|entry| entry.clone()))
    }

    async fn superblock_remove(&self, uuid: Uuid) -> Result<()> {
        self.superblocks.remove(&uuid);
        Ok(())
    }
}

struct InMemoryLogStoreState {
    id: LogStoreId,
    records: Mutex<BTreeMap<u64, Bytes>>,
    durable_upto: AtomicU64,
}

impl InMemoryLogStoreState {
    fn new(id: LogStoreId) -> Self {
        Self {
            id,
            records: Mutex::new(BTreeMap::new()),
            durable_upto: AtomicU64::new(0),
        }
    }
}

pub struct InMemoryLogStore {
    state: Arc<InMemoryLogStoreState>,
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    fn id(&self) -> LogStoreId {
        self.state.id
    }

    async fn write_async(&self, lsn: u64, bytes: Bytes) -> Result<()> {
        self.state.records.lock().insert(lsn, bytes);
        self.state.durable_upto.fetch_max(lsn, Ordering::SeqCst);
        Ok(())
    }

    async fn foreach(&self, start_lsn: u64, visitor: &mut Visitor<'_>) -> Result<()> {
        let snapshot: Vec<(u64, Bytes)> = self
            .state
            .records
            .lock()
            .range(start_lsn..)
            .map(|(lsn, bytes)| (*lsn, bytes.clone()))
            .collect();
        for (lsn, bytes) in snapshot {
            if !visitor(lsn, &bytes) {
                break;
            }
        }
        Ok(())
    }

    async fn truncate(&self, upto_lsn: u64) -> Result<()> {
        let mut records = self.state.records.lock();
        let tail = records.split_off(&(upto_lsn + 1));
        *records = tail;
        Ok(())
    }

    async fn flush_sync(&self, _lsn: u64) -> Result<()> {
        // Every write above is already "durable" in-process; nothing to do.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alloc_write_read_round_trips() {
        let engine = InMemoryStorageEngine::new();
        let pbas = engine.alloc_pbas(4096).await.unwrap();
        engine
            .async_write(&pbas, Bytes::from_static(&[0xABu8; 4096]))
            .await
            .unwrap();
        let back = engine.async_read(&pbas, 4096).await.unwrap();
        assert_eq!(back.len(), 4096);
        assert!(back.iter().all(|b| *b == 0xAB));
    }

    #[tokio::test]
    async fn free_pba_is_idempotent() {
        let engine = InMemoryStorageEngine::new();
        let pbas = engine.alloc_pbas(10).await.unwrap();
        engine.free_pba(pbas[0]).await.unwrap();
        engine.free_pba(pbas[0]).await.unwrap();
        assert!(engine.is_freed(pbas[0]));
    }

    #[tokio::test]
    async fn log_store_foreach_respects_start_lsn_and_early_stop() {
        let engine = InMemoryStorageEngine::new();
        let store = engine.create_log_store().await.unwrap();
        for lsn in 1..=5u64 {
            store
                .write_async(lsn, Bytes::from(vec![lsn as u8]))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        store
            .foreach(2, &mut |lsn, _| {
                seen.push(lsn);
                lsn < 4
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn log_store_truncate_removes_prefix() {
        let engine = InMemoryStorageEngine::new();
        let store = engine.create_log_store().await.unwrap();
        for lsn in 1..=5u64 {
            store.write_async(lsn, Bytes::new()).await.unwrap();
        }
        store.truncate(3).await.unwrap();

        let mut seen = Vec::new();
        store
            .foreach(1, &mut |lsn, _| {
                seen.push(lsn);
                true
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![4, 5]);
    }
}
