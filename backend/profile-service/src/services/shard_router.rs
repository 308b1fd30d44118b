use crate::models::DataSource;
use sha2::{Digest, Sha256};

/// Maps a user onto one of `shard_count` physical partitions.
///
/// SHA-256 of the user id, read as a big-endian integer, reduced modulo the
/// shard count.
pub fn shard_for(user_id: &str, shard_count: u32) -> u32 {
    debug_assert!(shard_count > 0, "shard_count must be positive");
    let shard_count = shard_count.max(1) as u128;

    let digest = Sha256::digest(user_id.as_bytes());

    // Horner's method over the full digest keeps the result identical to
    // reducing the whole 256-bit number
    let remainder = digest
        .iter()
        .fold(0u128, |acc, byte| ((acc << 8) | *byte as u128) % shard_count);

    remainder as u32
}

/// Physical table name for one kind of observation in one shard
pub fn collection_name(source: DataSource, shard: u32) -> String {
    format!("{}_data_{}", source.as_str(), shard)
}

#[derive(Debug, Clone, Copy)]
pub struct ShardRouter {
    shard_count: u32,
}

impl ShardRouter {
    pub fn new(shard_count: u32) -> Self {
        Self {
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn shard_for(&self, user_id: &str) -> u32 {
        shard_for(user_id, self.shard_count)
    }

    pub fn collection_for(&self, user_id: &str, source: DataSource) -> String {
        collection_name(source, self.shard_for(user_id))
    }

    /// Every table name across all shards, for schema bootstrap
    pub fn all_collections(&self) -> Vec<String> {
        (0..self.shard_count)
            .flat_map(|shard| {
                [DataSource::Browsing, DataSource::History]
                    .into_iter()
                    .map(move |source| collection_name(source, shard))
            })
            .collect()
    }
}
