//! Record collocation
//!
//! Every mapobject, segmentation and feature value carries a partition key.
//! Site-scoped records use the owning site id; records without a site (e.g.
//! plate or well overlays) use a synthetic key derived from their type name
//! and external reference, so the key is stable across processes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::PartitionConfig;
use crate::experiment::SiteId;

/// Partition consistency violations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Partition key mismatch for {record}: expected {expected}, got {actual}")]
    KeyMismatch {
        record: String,
        expected: PartitionKey,
        actual: PartitionKey,
    },
}

/// Key shared by all records stored together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PartitionKey {
    /// Records owned by one site
    Site(SiteId),
    /// Records not scoped to a site
    Static(u64),
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::Site(id) => write!(f, "{}", id),
            PartitionKey::Static(value) => write!(f, "static#{:016x}", value),
        }
    }
}

/// Assigns partition keys and maps them onto shards
#[derive(Debug, Clone, Copy)]
pub struct PartitionPolicy {
    shard_count: u32,
}

impl PartitionPolicy {
    pub fn new(config: &PartitionConfig) -> Self {
        Self {
            shard_count: config.shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn key_for_site(&self, site_id: SiteId) -> PartitionKey {
        PartitionKey::Site(site_id)
    }

    /// Synthetic key for a record identified by its type name and an external
    /// reference id
    pub fn key_for_static(&self, type_name: &str, ref_id: u64) -> PartitionKey {
        let mut hasher = Sha256::new();
        hasher.update(type_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(ref_id.to_be_bytes());
        PartitionKey::Static(leading_u64(&hasher.finalize()))
    }

    /// Shard holding a partition
    pub fn shard_of(&self, key: PartitionKey) -> u32 {
        let mut hasher = Sha256::new();
        match key {
            PartitionKey::Site(id) => {
                hasher.update(b"site");
                hasher.update(id.0.to_be_bytes());
            }
            PartitionKey::Static(value) => {
                hasher.update(b"static");
                hasher.update(value.to_be_bytes());
            }
        }
        (leading_u64(&hasher.finalize()) % self.shard_count as u64) as u32
    }

    /// Reject a record whose key differs from its owner's key
    pub fn check(
        &self,
        record: impl fmt::Display,
        expected: PartitionKey,
        actual: PartitionKey,
    ) -> Result<(), PartitionError> {
        if expected != actual {
            return Err(PartitionError::KeyMismatch {
                record: record.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}

fn leading_u64(digest: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PartitionPolicy {
        PartitionPolicy::new(&PartitionConfig::default())
    }

    #[test]
    fn test_static_keys_are_stable_and_distinct() {
        let policy = policy();
        let a = policy.key_for_static("Wells", 7);
        assert_eq!(a, policy.key_for_static("Wells", 7));
        assert_ne!(a, policy.key_for_static("Wells", 8));
        assert_ne!(a, policy.key_for_static("Plates", 7));
    }

    #[test]
    fn test_shard_within_range() {
        let policy = PartitionPolicy::new(&PartitionConfig { shard_count: 5 });
        for i in 0..200 {
            assert!(policy.shard_of(PartitionKey::Site(SiteId(i))) < 5);
        }
        let key = policy.key_for_static("Plates", 1);
        assert_eq!(policy.shard_of(key), policy.shard_of(key));
    }

    #[test]
    fn test_check_rejects_mismatch() {
        let policy = policy();
        let site = policy.key_for_site(SiteId(1));
        assert!(policy.check("mapobject#1", site, site).is_ok());
        let err = policy
            .check("mapobject#1", site, PartitionKey::Site(SiteId(2)))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Partition key mismatch for mapobject#1: expected site#1, got site#2"
        );
    }
}
