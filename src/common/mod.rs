//! Shared identifiers used across the replication core.
//!
//! These are deliberately thin newtypes: the hard part of this crate is the
//! protocol built on top of them, not the types themselves.

use std::sync::Arc;

use bytes::Bytes;

/// A physical block address, local to one replica. Opaque to this crate
/// beyond ordering (used as a `DashMap`/`BTreeMap` key) — allocation and
/// freeing are entirely the `StorageEngine` collaborator's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pba(pub u64);

impl Pba {
    pub const fn new(raw: u64) -> Self {
        Pba(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Pba {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pba:{}", self.0)
    }
}

/// A PBA as named by a specific replica. Equality and hashing use both
/// fields, matching the data model's requirement that two replicas never
/// be confused for one another even if they happen to allocate the same
/// local PBA value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FullyQualifiedPba {
    pub srv_id: Arc<str>,
    pub pba: Pba,
}

impl FullyQualifiedPba {
    pub fn new(srv_id: impl Into<Arc<str>>, pba: Pba) -> Self {
        Self {
            srv_id: srv_id.into(),
            pba,
        }
    }
}

impl std::fmt::Display for FullyQualifiedPba {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pba, self.srv_id)
    }
}

/// The consensus log's sequence number. Strictly monotonic, 1-based
/// externally. Internally the [`FreePbaJournal`](crate::free_pba_journal::FreePbaJournal)
/// addresses its own [`LogStore`](crate::storage::log_store::LogStore) by
/// "store-LSN" = `consensus_lsn - 1`; the two conversions live here so the
/// off-by-one never gets re-derived ad hoc elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const fn new(raw: u64) -> Self {
        Lsn(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Converts this consensus-LSN to the store-LSN used to address the
    /// free-PBA journal's underlying `LogStore`.
    ///
    /// Per the external-interfaces section: "A record at store-LSN `s`
    /// corresponds to consensus-LSN `s + 1`."
    pub fn to_store_lsn(self) -> u64 {
        self.0 - 1
    }

    /// Inverse of [`Lsn::to_store_lsn`].
    pub fn from_store_lsn(store_lsn: u64) -> Self {
        Lsn(store_lsn + 1)
    }

    pub fn next(self) -> Self {
        Lsn(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        self.0.checked_sub(1).map(Lsn)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// The header-channel payload carried by one consensus log entry: an
/// opaque header and key, plus the list of PBAs under which the matching
/// bulk payload was (or will be) written by the data channel.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub header: Bytes,
    pub key: Bytes,
    pub pbas: Vec<Pba>,
}

impl LogEntry {
    pub fn new(header: impl Into<Bytes>, key: impl Into<Bytes>, pbas: Vec<Pba>) -> Self {
        Self {
            header: header.into(),
            key: key.into(),
            pbas,
        }
    }
}
