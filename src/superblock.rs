//! `ReplicaSetSuperblock` fixed-layout record (design §6, tag
//! `"replica_set"`).
//!
//! Written and read through [`StorageEngine::superblock_write`]/
//! [`StorageEngine::superblock_read`]; the in-memory copy
//! (`SuperblockState`) is what [`crate::state_machine::ReplicaStateMachine`]
//! actually guards with [`crate::concurrent::RwLockWP`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::common::Lsn;
use crate::error::{Result, ReplicoreError};
use crate::storage::log_store::LogStoreId;

pub const TAG: &str = "replica_set";

/// `uuid: 16 bytes | commit_lsn: i64 | free_pba_store_id: u32 | reserved padding`.
const RESERVED_PADDING: usize = 4;
const ENCODED_LEN: usize = 16 + 8 + 4 + RESERVED_PADDING;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaSetSuperblock {
    pub uuid: Uuid,
    pub commit_lsn: Lsn,
    pub free_pba_store_id: LogStoreId,
}

impl ReplicaSetSuperblock {
    pub fn new(uuid: Uuid, free_pba_store_id: LogStoreId) -> Self {
        Self {
            uuid,
            commit_lsn: Lsn::new(0),
            free_pba_store_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENCODED_LEN);
        buf.extend_from_slice(self.uuid.as_bytes());
        buf.put_i64_le(self.commit_lsn.get() as i64);
        buf.put_u32_le(self.free_pba_store_id.0);
        buf.extend_from_slice(&[0u8; RESERVED_PADDING]);
        buf.freeze()
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ENCODED_LEN {
            return Err(ReplicoreError::corruption(format!(
                "superblock length mismatch: expected {ENCODED_LEN}, found {}",
                bytes.len()
            )));
        }
        let mut uuid_bytes = [0u8; 16];
        bytes.copy_to_slice(&mut uuid_bytes);
        let uuid = Uuid::from_bytes(uuid_bytes);
        let commit_lsn_raw = bytes.get_i64_le();
        if commit_lsn_raw < 0 {
            return Err(ReplicoreError::corruption("superblock commit_lsn is negative"));
        }
        let commit_lsn = Lsn::new(commit_lsn_raw as u64);
        let free_pba_store_id = LogStoreId(bytes.get_u32_le());
        Ok(Self { uuid, commit_lsn, free_pba_store_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let sb = ReplicaSetSuperblock {
            uuid: Uuid::from_u128(0x1234_5678_9abc_def0_1122_3344_5566_7788),
            commit_lsn: Lsn::new(42),
            free_pba_store_id: LogStoreId(7),
        };
        let decoded = ReplicaSetSuperblock::decode(&sb.encode()).unwrap();
        assert_eq!(decoded, sb);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = ReplicaSetSuperblock::decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, ReplicoreError::Corruption(_)));
    }
}
