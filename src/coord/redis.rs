//! Redis-backed coordination store.
//!
//! Lease renew/release must be atomic against concurrent callers, so both
//! are compare-and-swap Lua scripts; plain GET-then-EXPIRE would let a lease
//! migrate between the read and the write.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{keys, CoordinationStore, Role, WorkerEntry};
use crate::error::Result;

const LUA_RENEW_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

const LUA_RELEASE_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    renew_script: redis::Script,
    release_script: redis::Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        let store = Self {
            conn,
            renew_script: redis::Script::new(LUA_RENEW_LOCK),
            release_script: redis::Script::new(LUA_RELEASE_LOCK),
        };
        // Fail fast on an unreachable store rather than at first lease use.
        let mut conn = store.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            tracing::warn!(response = %pong, "Unexpected PING response from coordination store");
        }
        Ok(store)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn try_acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn renew(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew_script
            .key(key)
            .arg(holder_id)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed > 0)
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release_script
            .key(key)
            .arg(holder_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(released > 0)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn put_worker(&self, entry: &WorkerEntry, ttl: Duration) -> Result<()> {
        let key = keys::worker(&entry.worker_id);
        let mut conn = self.conn.clone();
        redis::pipe()
            .hset_multiple(
                &key,
                &[
                    ("worker_id", entry.worker_id.clone()),
                    ("node_id", entry.node_id.clone()),
                    ("rpc_host", entry.rpc_host.clone()),
                    ("rpc_port", entry.rpc_port.to_string()),
                    ("role", entry.role.to_string()),
                    ("last_seen_unix_ms", entry.last_seen_unix_ms.to_string()),
                    ("load", entry.load.to_string()),
                    ("current_job_run_id", entry.current_job_run_id.clone()),
                    ("detached", (entry.detached as u8).to_string()),
                    ("draining", (entry.draining as u8).to_string()),
                ],
            )
            .ignore()
            .pexpire(&key, ttl.as_millis() as i64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn scan_workers(&self) -> Result<Vec<WorkerEntry>> {
        let mut conn = self.conn.clone();
        let worker_keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(keys::worker_scan_pattern())
                .await?;
            let mut found = Vec::new();
            while let Some(key) = iter.next_item().await {
                found.push(key);
            }
            found
        };

        let mut workers = Vec::with_capacity(worker_keys.len());
        for key in worker_keys {
            let fields: std::collections::HashMap<String, String> = conn.hgetall(&key).await?;
            if let Some(entry) = entry_from_fields(&fields) {
                workers.push(entry);
            }
        }
        workers.sort_by(|a, b| b.last_seen_unix_ms.cmp(&a.last_seen_unix_ms));
        Ok(workers)
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys::worker(worker_id)).await?;
        Ok(())
    }

    async fn set_flag(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, "1").await?;
        Ok(())
    }

    async fn get_flag(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value.as_deref() == Some("1"))
    }

    async fn clear_flag(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

fn entry_from_fields(fields: &std::collections::HashMap<String, String>) -> Option<WorkerEntry> {
    let worker_id = fields.get("worker_id")?.clone();
    let last_seen_unix_ms = fields.get("last_seen_unix_ms")?.parse().ok()?;
    Some(WorkerEntry {
        worker_id,
        node_id: fields.get("node_id").cloned().unwrap_or_default(),
        rpc_host: fields.get("rpc_host").cloned().unwrap_or_default(),
        rpc_port: fields
            .get("rpc_port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(0),
        role: fields
            .get("role")
            .and_then(|r| Role::from_str(r).ok())
            .unwrap_or(Role::Worker),
        last_seen_unix_ms,
        load: fields.get("load").and_then(|l| l.parse().ok()).unwrap_or(0),
        current_job_run_id: fields.get("current_job_run_id").cloned().unwrap_or_default(),
        detached: fields.get("detached").map(|d| d == "1").unwrap_or(false),
        draining: fields.get("draining").map(|d| d == "1").unwrap_or(false),
    })
}
