//! External contract for the durable record store (§6): a key/value
//! interface with a transactional batch op, classifiable errors, and
//! optimistic-concurrency versions. This crate ships only an in-memory
//! test double — a real deployment supplies its own implementation
//! (Postgres, FoundationDB, etc.) behind this trait.

use crate::error::ArbiterError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum TxOp<V> {
    Put { key: String, value: V },
    Delete { key: String },
}

#[async_trait]
pub trait DurableStore<V: Clone + Send + Sync>: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<(V, u64)>, ArbiterError>;
    async fn put(&self, key: &str, value: V, if_match: Option<u64>) -> Result<u64, ArbiterError>;
    async fn delete(&self, key: &str) -> Result<(), ArbiterError>;
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, V, u64)>, ArbiterError>;
    async fn tx(&self, ops: Vec<TxOp<V>>) -> Result<(), ArbiterError>;
    /// A lightweight read used by the health prober; defaults to `scan`
    /// with an empty prefix but implementations can override with a
    /// cheaper ping.
    async fn health_ping(&self) -> Result<(), ArbiterError> {
        self.scan("").await.map(|_| ())
    }
}

struct Record<V> {
    value: V,
    version: u64,
}

/// In-memory stand-in for a real durable store, used in tests and as the
/// default backend for local/offline operation. Can be toggled `offline`
/// to simulate an outage for circuit-breaker tests.
pub struct InMemoryDurableStore<V> {
    records: Mutex<HashMap<String, Record<V>>>,
    offline: std::sync::atomic::AtomicBool,
}

impl<V: Clone> InMemoryDurableStore<V> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            offline: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), ArbiterError> {
        if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
            Err(ArbiterError::Unavailable("durable store offline".into()))
        } else {
            Ok(())
        }
    }
}

impl<V: Clone> Default for InMemoryDurableStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V: Clone + Send + Sync> DurableStore<V> for InMemoryDurableStore<V> {
    async fn get(&self, key: &str) -> Result<Option<(V, u64)>, ArbiterError> {
        self.check_online()?;
        let records = self.records.lock().unwrap();
        Ok(records.get(key).map(|r| (r.value.clone(), r.version)))
    }

    async fn put(&self, key: &str, value: V, if_match: Option<u64>) -> Result<u64, ArbiterError> {
        self.check_online()?;
        let mut records = self.records.lock().unwrap();
        if let Some(expected) = if_match {
            if let Some(existing) = records.get(key) {
                if existing.version != expected {
                    return Err(ArbiterError::Conflict(format!(
                        "version mismatch for {key}: expected {expected}, found {}",
                        existing.version
                    )));
                }
            }
        }
        let next_version = records.get(key).map(|r| r.version + 1).unwrap_or(1);
        records.insert(
            key.to_string(),
            Record {
                value,
                version: next_version,
            },
        );
        Ok(next_version)
    }

    async fn delete(&self, key: &str) -> Result<(), ArbiterError> {
        self.check_online()?;
        self.records.lock().unwrap().remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, V, u64)>, ArbiterError> {
        self.check_online()?;
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, r)| (k.clone(), r.value.clone(), r.version))
            .collect())
    }

    async fn tx(&self, ops: Vec<TxOp<V>>) -> Result<(), ArbiterError> {
        self.check_online()?;
        let mut records = self.records.lock().unwrap();
        for op in ops {
            match op {
                TxOp::Put { key, value } => {
                    let next_version = records.get(&key).map(|r| r.version + 1).unwrap_or(1);
                    records.insert(
                        key,
                        Record {
                            value,
                            version: next_version,
                        },
                    );
                }
                TxOp::Delete { key } => {
                    records.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_store_returns_unavailable() {
        let store: InMemoryDurableStore<i32> = InMemoryDurableStore::new();
        store.put("a", 1, None).await.unwrap();
        store.set_offline(true);
        let err = store.get("a").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn optimistic_concurrency_rejects_stale_if_match() {
        let store: InMemoryDurableStore<i32> = InMemoryDurableStore::new();
        let v1 = store.put("a", 1, None).await.unwrap();
        assert_eq!(v1, 1);
        let err = store.put("a", 2, Some(v1 + 1)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }
}
