//! Persistent seen/unseen state.
//!
//! State is a two-level key-value map: one bucket per feed URL, one key per
//! item link inside it. [`StateStore`] names the primitives a backend must
//! provide; the seen/prune operations the processor uses are built on top of
//! them and may be overridden where a backend can do better.
//!
//! - [`Database`] - SQLite file, exclusive to one process
//! - [`MemoryStore`] - in-process map for tests and throwaway runs

mod buckets;
mod memory;
mod schema;
mod types;

use std::collections::HashSet;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use schema::Database;
pub use types::{StateError, SEEN_MARKER};

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Creates `bucket` if it does not exist yet.
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StateError>;

    /// Value stored under `key`, or `None` if the key (or bucket) is absent.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StateError>;

    /// Inserts or overwrites `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::MissingBucket`] if `bucket` was never created.
    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StateError>;

    /// Removes `key`, returning whether it existed.
    async fn delete(&self, bucket: &str, key: &str) -> Result<bool, StateError>;

    /// All keys of `bucket` in ascending order; empty if the bucket is absent.
    async fn keys(&self, bucket: &str) -> Result<Vec<String>, StateError>;

    /// All bucket names in ascending order.
    async fn buckets(&self) -> Result<Vec<String>, StateError>;

    /// Removes `bucket` and every key in it, returning whether it existed.
    async fn delete_bucket(&self, bucket: &str) -> Result<bool, StateError>;

    async fn seen(&self, bucket: &str, key: &str) -> Result<bool, StateError> {
        Ok(self.get(bucket, key).await?.is_some())
    }

    /// Records `key` as seen. Marking an already-seen key changes nothing.
    async fn mark_seen(&self, bucket: &str, key: &str) -> Result<(), StateError> {
        self.put(bucket, key, SEEN_MARKER).await
    }

    /// Deletes every key of `bucket` not in `current`. Returns how many went.
    async fn prune_feed(&self, bucket: &str, current: &[String]) -> Result<usize, StateError> {
        let current: HashSet<&str> = current.iter().map(String::as_str).collect();
        let mut removed = 0;
        for key in self.keys(bucket).await? {
            if !current.contains(key.as_str()) && self.delete(bucket, &key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Deletes every bucket not named in `current`. Returns how many went.
    async fn prune_buckets(&self, current: &[String]) -> Result<usize, StateError> {
        let current: HashSet<&str> = current.iter().map(String::as_str).collect();
        let mut removed = 0;
        for bucket in self.buckets().await? {
            if !current.contains(bucket.as_str()) && self.delete_bucket(&bucket).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes `key` from every bucket so the item is notified again.
    /// Returns how many buckets held it.
    async fn unsee(&self, key: &str) -> Result<usize, StateError> {
        let mut removed = 0;
        for bucket in self.buckets().await? {
            if self.delete(&bucket, key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
