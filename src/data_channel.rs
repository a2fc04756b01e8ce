//! `DataChannel` collaborator contract (design §4 control-flow summary,
//! "DataChannel (iface)" row).
//!
//! Best-effort bulk transport. Shipping payload bytes by PBA is push
//! ("best effort" — the leader does not block a commit on every peer
//! acking); fetching a remote PBA on demand, from [`crate::pba_resolver`],
//! is the one place this channel's result gates forward progress, and it
//! does so only up to the resolver's configured timeout.

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::common::{FullyQualifiedPba, Pba};
use crate::error::Result;

#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Ships `value` under `pbas` to every peer in replica-set `group_id`.
    /// Best-effort: a peer that misses this push still recovers the bytes
    /// later via [`DataChannel::fetch`] when its `PbaResolver` needs them.
    async fn push(&self, group_id: Uuid, pbas: &[Pba], value: Bytes) -> Result<()>;

    /// Pulls the bytes stored under `fqpba` from its owning peer. Callers
    /// are responsible for bounding how long they wait; this trait itself
    /// never times out.
    async fn fetch(&self, fqpba: &FullyQualifiedPba) -> Result<Bytes>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod memory {
    use dashmap::DashMap;

    use super::*;
    use crate::error::ReplicoreError;

    /// A `DataChannel` that keeps every pushed block in process memory,
    /// addressed by the same `(srv_id, pba)` pair a real peer would use.
    /// `fetch` reads back from `push`'s own store, so tests can exercise
    /// the resolver's fetch path without a second process.
    #[derive(Default)]
    pub struct InMemoryDataChannel {
        local_srv_id: String,
        blocks: DashMap<FullyQualifiedPba, Bytes>,
    }

    impl InMemoryDataChannel {
        pub fn new(local_srv_id: impl Into<String>) -> Self {
            Self {
                local_srv_id: local_srv_id.into(),
                blocks: DashMap::new(),
            }
        }

        /// Test hook standing in for "peer ships bytes to us": seeds a
        /// block as though it had arrived via a real push from `srv_id`.
        pub fn seed(&self, srv_id: impl Into<std::sync::Arc<str>>, pba: Pba, bytes: Bytes) {
            self.blocks
                .insert(FullyQualifiedPba::new(srv_id, pba), bytes);
        }
    }

    #[async_trait]
    impl DataChannel for InMemoryDataChannel {
        async fn push(&self, _group_id: Uuid, pbas: &[Pba], value: Bytes) -> Result<()> {
            let chunk = value.len().div_ceil(pbas.len().max(1));
            for (i, pba) in pbas.iter().enumerate() {
                let start = i * chunk;
                let end = (start + chunk).min(value.len());
                self.blocks.insert(
                    FullyQualifiedPba::new(self.local_srv_id.as_str(), *pba),
                    value.slice(start..end),
                );
            }
            Ok(())
        }

        async fn fetch(&self, fqpba: &FullyQualifiedPba) -> Result<Bytes> {
            self.blocks
                .get(fqpba)
                .map(|entry| entry.clone())
                .ok_or_else(|| ReplicoreError::RemoteUnavailable(fqpba.clone()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn push_then_fetch_round_trips() {
            let channel = InMemoryDataChannel::new("replica-a");
            let pbas = vec![Pba::new(1)];
            channel
                .push(Uuid::nil(), &pbas, Bytes::from_static(b"payload"))
                .await
                .unwrap();

            let fqpba = FullyQualifiedPba::new("replica-a", pbas[0]);
            let back = channel.fetch(&fqpba).await.unwrap();
            assert_eq!(back, Bytes::from_static(b"payload"));
        }

        #[tokio::test]
        async fn fetch_unknown_fqpba_is_remote_unavailable() {
            let channel = InMemoryDataChannel::new("replica-a");
            let fqpba = FullyQualifiedPba::new("replica-b", Pba::new(99));
            let err = channel.fetch(&fqpba).await.unwrap_err();
            assert!(matches!(err, ReplicoreError::RemoteUnavailable(_)));
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use memory::InMemoryDataChannel;
