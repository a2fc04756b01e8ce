// Error taxonomy for the replication core.
//
// Every variant below corresponds to a named failure mode in the design's
// error-handling section; there is no catch-all `Other(String)` because each
// failure has a distinct, documented recovery path (see module docs on
// `free_pba_journal`, `pba_resolver`, and `state_machine`).

use std::fmt;

use uuid::Uuid;

use crate::common::{FullyQualifiedPba, Lsn};

#[derive(Debug, thiserror::Error)]
pub enum ReplicoreError {
    /// `StorageEngine::alloc_pbas` could not satisfy a size request.
    #[error("out of space: requested {requested} bytes")]
    OutOfSpace { requested: usize },

    /// Append or flush of the free-PBA journal failed; the commit this was
    /// guarding must not advance `commit_lsn`.
    #[error("free-PBA journal failure at lsn {lsn:?}: {source}")]
    LogStoreFailure {
        lsn: Lsn,
        #[source]
        source: std::io::Error,
    },

    /// The consensus log rejected or failed to durably order an append.
    #[error("consensus append failed: {0}")]
    ConsensusFailure(String),

    /// A fully-qualified PBA could not be fetched from its owning peer
    /// within the resolver's configured timeout.
    #[error("remote PBA unavailable: {0:?}")]
    RemoteUnavailable(FullyQualifiedPba),

    /// A durable record (FreePbaRecord or superblock) failed to decode or
    /// failed its checksum. Fatal for the owning replica set.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// `lookup_replica_set`/administrative operations on an unknown uuid.
    #[error("replica set not found: {0}")]
    NotFound(Uuid),

    /// `create_replica_set` called with a uuid already in the directory.
    #[error("replica set already exists: {0}")]
    AlreadyExists(Uuid),

    /// An operation was attempted in a state that forbids it (e.g. writing
    /// to a replica set that has already been stopped).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReplicoreError {
    pub fn corruption(context: impl fmt::Display) -> Self {
        ReplicoreError::Corruption(context.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReplicoreError>;
