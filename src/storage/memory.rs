use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::types::StateError;
use super::StateStore;

type Buckets = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// In-process state store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: Mutex<Buckets>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Buckets) -> T) -> T {
        // Every closure leaves the map consistent, so poisoning is harmless
        let mut guard = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StateError> {
        self.with(|b| {
            b.entry(bucket.to_owned()).or_default();
        });
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.with(|b| b.get(bucket).and_then(|keys| keys.get(key)).cloned()))
    }

    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StateError> {
        self.with(|b| match b.get_mut(bucket) {
            Some(keys) => {
                keys.insert(key.to_owned(), value.to_vec());
                Ok(())
            }
            None => Err(StateError::MissingBucket(bucket.to_owned())),
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool, StateError> {
        Ok(self.with(|b| {
            b.get_mut(bucket)
                .is_some_and(|keys| keys.remove(key).is_some())
        }))
    }

    async fn keys(&self, bucket: &str) -> Result<Vec<String>, StateError> {
        Ok(self.with(|b| {
            b.get(bucket)
                .map(|keys| keys.keys().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn buckets(&self) -> Result<Vec<String>, StateError> {
        Ok(self.with(|b| b.keys().cloned().collect()))
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<bool, StateError> {
        Ok(self.with(|b| b.remove(bucket).is_some()))
    }
}
