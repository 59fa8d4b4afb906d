//! Layered settings resolver.
//!
//! Lookup order: in-memory cache of RDB overrides, then the ambient process
//! environment (`TASKHERD_<KEY>`), then built-in defaults. A reload signal
//! (RPC or internal) invalidates the cache and bumps a generation counter so
//! callers can observe that a reload happened.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::Result;
use crate::store::RunStore;

pub mod keys {
    pub const LEADER_TICK_SECONDS: &str = "leader_tick_seconds";
    pub const ASSIGN_AHEAD_SECONDS: &str = "assign_ahead_seconds";
    pub const HEARTBEAT_INTERVAL_SECONDS: &str = "heartbeat_interval_seconds";
    pub const HEARTBEAT_TTL_SECONDS: &str = "heartbeat_ttl_seconds";
    pub const WORKER_DETACH_GRACE_SECONDS: &str = "worker_detach_grace_seconds";
    pub const LEADER_STALE_SECONDS: &str = "leader_stale_seconds";
    pub const SUBLEADER_CHECK_SECONDS: &str = "subleader_check_seconds";
    pub const REASSIGN_AFTER_SECONDS: &str = "reassign_after_seconds";
    pub const MAX_JOBS_PER_WORKER: &str = "max_jobs_per_worker";
    pub const CONTINUATION_RETRY_COUNT: &str = "continuation_retry_count";
    pub const CONTINUATION_RETRY_INTERVAL_SECONDS: &str = "continuation_retry_interval_seconds";
    pub const CONTINUATION_CONFIRM_SECONDS: &str = "continuation_confirm_seconds";
    pub const SKIP_LATE_RUNS_AFTER_SECONDS: &str = "skip_late_runs_after_seconds";
    pub const LOG_RETENTION_DAYS_DB: &str = "log_retention_days_db";
    pub const EVENTS_API_TOKEN: &str = "events_api_token";
}

fn default_for(key: &str) -> Option<&'static str> {
    Some(match key {
        keys::LEADER_TICK_SECONDS => "2",
        keys::ASSIGN_AHEAD_SECONDS => "60",
        keys::HEARTBEAT_INTERVAL_SECONDS => "5",
        keys::HEARTBEAT_TTL_SECONDS => "15",
        keys::WORKER_DETACH_GRACE_SECONDS => "10",
        keys::LEADER_STALE_SECONDS => "15",
        keys::SUBLEADER_CHECK_SECONDS => "5",
        keys::REASSIGN_AFTER_SECONDS => "10",
        keys::MAX_JOBS_PER_WORKER => "1",
        keys::CONTINUATION_RETRY_COUNT => "3",
        keys::CONTINUATION_RETRY_INTERVAL_SECONDS => "2.0",
        keys::CONTINUATION_CONFIRM_SECONDS => "30",
        keys::SKIP_LATE_RUNS_AFTER_SECONDS => "300",
        keys::LOG_RETENTION_DAYS_DB => "7",
        keys::EVENTS_API_TOKEN => "",
        _ => return None,
    })
}

/// Typed snapshot of the engine tunables, resolved once per loop iteration
/// so a reload takes effect at the next tick.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub leader_tick: Duration,
    pub assign_ahead_seconds: i64,
    pub heartbeat_interval: Duration,
    pub heartbeat_ttl_seconds: i64,
    pub worker_detach_grace_seconds: i64,
    pub leader_stale_seconds: i64,
    pub subleader_check: Duration,
    pub reassign_after_seconds: i64,
    pub max_jobs_per_worker: i64,
    pub continuation_retry_count: u32,
    pub continuation_retry_interval: Duration,
    pub continuation_confirm_seconds: i64,
    pub skip_late_runs_after_seconds: i64,
    pub log_retention_days_db: i64,
}

#[derive(Default)]
struct CacheState {
    /// None means not loaded (or invalidated); loaded on next lookup.
    overrides: Option<HashMap<String, String>>,
    secret_keys: HashSet<String>,
    generation: i64,
}

pub struct SettingsResolver {
    store: RunStore,
    cache: Mutex<CacheState>,
    env_prefix: &'static str,
}

impl SettingsResolver {
    pub fn new(store: RunStore) -> Self {
        Self {
            store,
            cache: Mutex::new(CacheState::default()),
            env_prefix: "TASKHERD_",
        }
    }

    /// Drop the cached overrides; the next lookup re-reads the RDB. Returns
    /// the new cache generation.
    pub fn reload(&self) -> i64 {
        let mut cache = self.cache.lock().unwrap();
        cache.overrides = None;
        cache.generation += 1;
        cache.generation
    }

    pub fn generation(&self) -> i64 {
        self.cache.lock().unwrap().generation
    }

    async fn overrides(&self) -> Result<HashMap<String, String>> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(ref overrides) = cache.overrides {
                return Ok(overrides.clone());
            }
        }
        let overrides = self.store.settings_overrides().await?;
        let secrets: HashSet<String> = self
            .store
            .secret_setting_keys()
            .await?
            .into_iter()
            .collect();
        let mut cache = self.cache.lock().unwrap();
        cache.overrides = Some(overrides.clone());
        cache.secret_keys = secrets;
        Ok(overrides)
    }

    async fn lookup(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.overrides().await?.get(key) {
            return Ok(Some(value.clone()));
        }
        let env_key = format!("{}{}", self.env_prefix, key.to_uppercase());
        if let Ok(value) = std::env::var(env_key) {
            return Ok(Some(value));
        }
        Ok(default_for(key).map(str::to_string))
    }

    pub async fn get_str(&self, key: &str) -> Result<String> {
        Ok(self.lookup(key).await?.unwrap_or_default())
    }

    pub async fn get_i64(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self
            .lookup(key)
            .await?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default))
    }

    pub async fn get_f64(&self, key: &str, default: f64) -> Result<f64> {
        Ok(self
            .lookup(key)
            .await?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default))
    }

    /// All resolvable keys with secret values redacted. This is the only
    /// view handed to non-privileged readers.
    pub async fn public_snapshot(&self) -> Result<HashMap<String, String>> {
        let overrides = self.overrides().await?;
        let secret_keys = {
            let cache = self.cache.lock().unwrap();
            cache.secret_keys.clone()
        };
        let mut snapshot: HashMap<String, String> = HashMap::new();
        for key in [
            keys::LEADER_TICK_SECONDS,
            keys::ASSIGN_AHEAD_SECONDS,
            keys::HEARTBEAT_INTERVAL_SECONDS,
            keys::HEARTBEAT_TTL_SECONDS,
            keys::WORKER_DETACH_GRACE_SECONDS,
            keys::LEADER_STALE_SECONDS,
            keys::SUBLEADER_CHECK_SECONDS,
            keys::REASSIGN_AFTER_SECONDS,
            keys::MAX_JOBS_PER_WORKER,
            keys::CONTINUATION_RETRY_COUNT,
            keys::CONTINUATION_RETRY_INTERVAL_SECONDS,
            keys::CONTINUATION_CONFIRM_SECONDS,
            keys::SKIP_LATE_RUNS_AFTER_SECONDS,
            keys::LOG_RETENTION_DAYS_DB,
        ] {
            snapshot.insert(key.to_string(), self.get_str(key).await?);
        }
        for (key, value) in overrides {
            if secret_keys.contains(&key) || key == keys::EVENTS_API_TOKEN {
                snapshot.insert(key, "<redacted>".to_string());
            } else {
                snapshot.entry(key).or_insert(value);
            }
        }
        Ok(snapshot)
    }

    /// Resolve the full engine tunable set in one pass.
    pub async fn engine_settings(&self) -> Result<EngineSettings> {
        let tick = self.get_i64(keys::LEADER_TICK_SECONDS, 2).await?.max(1);
        let heartbeat = self
            .get_i64(keys::HEARTBEAT_INTERVAL_SECONDS, 5)
            .await?
            .max(1);
        let subleader_check = self.get_i64(keys::SUBLEADER_CHECK_SECONDS, 5).await?.max(1);
        let retry_interval = self
            .get_f64(keys::CONTINUATION_RETRY_INTERVAL_SECONDS, 2.0)
            .await?
            .max(0.1);
        Ok(EngineSettings {
            leader_tick: Duration::from_secs(tick as u64),
            assign_ahead_seconds: self.get_i64(keys::ASSIGN_AHEAD_SECONDS, 60).await?.max(0),
            heartbeat_interval: Duration::from_secs(heartbeat as u64),
            heartbeat_ttl_seconds: self.get_i64(keys::HEARTBEAT_TTL_SECONDS, 15).await?.max(1),
            worker_detach_grace_seconds: self
                .get_i64(keys::WORKER_DETACH_GRACE_SECONDS, 10)
                .await?
                .max(0),
            leader_stale_seconds: self.get_i64(keys::LEADER_STALE_SECONDS, 15).await?.max(1),
            subleader_check: Duration::from_secs(subleader_check as u64),
            reassign_after_seconds: self.get_i64(keys::REASSIGN_AFTER_SECONDS, 10).await?.max(1),
            max_jobs_per_worker: self.get_i64(keys::MAX_JOBS_PER_WORKER, 1).await?.max(1),
            continuation_retry_count: self.get_i64(keys::CONTINUATION_RETRY_COUNT, 3).await?.max(0)
                as u32,
            continuation_retry_interval: Duration::from_secs_f64(retry_interval),
            continuation_confirm_seconds: self
                .get_i64(keys::CONTINUATION_CONFIRM_SECONDS, 30)
                .await?
                .max(1),
            skip_late_runs_after_seconds: self
                .get_i64(keys::SKIP_LATE_RUNS_AFTER_SECONDS, 300)
                .await?
                .max(0),
            log_retention_days_db: self.get_i64(keys::LOG_RETENTION_DAYS_DB, 7).await?.max(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn defaults_apply_without_overrides() {
        let store = RunStore::in_memory().await.unwrap();
        let resolver = SettingsResolver::new(store);
        assert_eq!(
            resolver.get_i64(keys::HEARTBEAT_TTL_SECONDS, 0).await.unwrap(),
            15
        );
        assert_eq!(
            resolver
                .get_f64(keys::CONTINUATION_RETRY_INTERVAL_SECONDS, 0.0)
                .await
                .unwrap(),
            2.0
        );
    }

    #[tokio::test]
    async fn db_override_wins_after_reload() {
        let store = RunStore::in_memory().await.unwrap();
        let resolver = SettingsResolver::new(store.clone());

        // Warm the cache with defaults, then write an override.
        assert_eq!(
            resolver.get_i64(keys::LEADER_TICK_SECONDS, 0).await.unwrap(),
            2
        );
        store
            .upsert_setting(keys::LEADER_TICK_SECONDS, "7", false, Utc::now())
            .await
            .unwrap();

        // Stale cache still serves the old value until a reload.
        assert_eq!(
            resolver.get_i64(keys::LEADER_TICK_SECONDS, 0).await.unwrap(),
            2
        );
        let generation = resolver.reload();
        assert_eq!(generation, 1);
        assert_eq!(
            resolver.get_i64(keys::LEADER_TICK_SECONDS, 0).await.unwrap(),
            7
        );
    }

    #[tokio::test]
    async fn secrets_are_redacted_in_public_snapshot() {
        let store = RunStore::in_memory().await.unwrap();
        store
            .upsert_setting(keys::EVENTS_API_TOKEN, "super-secret", true, Utc::now())
            .await
            .unwrap();
        let resolver = SettingsResolver::new(store);

        let snapshot = resolver.public_snapshot().await.unwrap();
        assert_eq!(
            snapshot.get(keys::EVENTS_API_TOKEN).map(String::as_str),
            Some("<redacted>")
        );
        // The raw accessor still resolves it for privileged engine use.
        assert_eq!(
            resolver.get_str(keys::EVENTS_API_TOKEN).await.unwrap(),
            "super-secret"
        );
    }
}
