//! In-memory coordination store.
//!
//! Backs tests and single-process development with the same semantics as
//! the Redis store: holder-checked renew/release, TTL expiry, and a worker
//! directory. TTLs are measured with `tokio::time::Instant`, so tests
//! running under a paused clock can advance time deterministically.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{keys, CoordinationStore, WorkerEntry};
use crate::error::Result;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    workers: HashMap<String, (WorkerEntry, Instant)>,
}

impl Inner {
    fn get_live(&mut self, key: &str, now: Instant) -> Option<String> {
        match self.values.get(key) {
            Some(entry) if entry.live(now) => Some(entry.value.clone()),
            Some(_) => {
                self.values.remove(key);
                None
            }
            None => None,
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire a worker's directory entry immediately. Test helper for
    /// simulating a crashed worker without waiting out the TTL.
    pub fn expire_worker(&self, worker_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.workers.remove(worker_id);
        inner.values.remove(&keys::worker(worker_id));
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn try_acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        if inner.get_live(key, now).is_some() {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            Entry {
                value: holder_id.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn renew(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        if inner.get_live(key, now).as_deref() != Some(holder_id) {
            return Ok(false);
        }
        if let Some(entry) = inner.values.get_mut(key) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(true)
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        if inner.get_live(key, now).as_deref() != Some(holder_id) {
            return Ok(false);
        }
        inner.values.remove(key);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.get_live(key, now))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let next = inner
            .get_live(key, now)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        inner.values.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn put_worker(&self, entry: &WorkerEntry, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.workers.insert(
            entry.worker_id.clone(),
            (entry.clone(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn scan_workers(&self) -> Result<Vec<WorkerEntry>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.workers.retain(|_, (_, expires)| *expires > now);
        let mut workers: Vec<WorkerEntry> =
            inner.workers.values().map(|(w, _)| w.clone()).collect();
        workers.sort_by(|a, b| b.last_seen_unix_ms.cmp(&a.last_seen_unix_ms));
        Ok(workers)
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.workers.remove(worker_id);
        Ok(())
    }

    async fn set_flag(&self, key: &str) -> Result<()> {
        self.set(key, "1").await
    }

    async fn get_flag(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.as_deref() == Some("1"))
    }

    async fn clear_flag(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.values.remove(key);
        Ok(())
    }
}
