//! Coordination-store adapter and the lease-based election tick.
//!
//! The store holds only ephemeral state: leases, the epoch counter, flags,
//! and the worker directory. All durable truth lives in the run store; reads
//! here are not linearizable across a partition, which is why run-row
//! fencing exists at the RDB layer.

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

pub mod keys {
    pub fn worker_seq() -> String {
        "taskherd:worker:id_seq".to_string()
    }

    pub fn worker(worker_id: &str) -> String {
        format!("taskherd:worker:{worker_id}:info")
    }

    pub fn worker_scan_pattern() -> String {
        "taskherd:worker:*:info".to_string()
    }

    pub fn leader_lock() -> String {
        "taskherd:leader:lock".to_string()
    }

    pub fn leader_epoch() -> String {
        "taskherd:leader:epoch".to_string()
    }

    pub fn leader_last_seen() -> String {
        "taskherd:leader:last_seen_ts".to_string()
    }

    pub fn subleader_lock(node_id: &str) -> String {
        format!("taskherd:subleader:{node_id}:lock")
    }

    pub fn detach(worker_id: &str) -> String {
        format!("taskherd:detach:{worker_id}")
    }

    pub fn degrade(worker_id: &str) -> String {
        format!("taskherd:degrade:{worker_id}")
    }

    pub fn run_lease(run_id: &str) -> String {
        format!("taskherd:run_lease:{run_id}")
    }

    pub fn settings_reload() -> String {
        "taskherd:settings:reload_requested".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Leader,
    SubLeader,
    Worker,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::SubLeader => write!(f, "subleader"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "leader" => Ok(Role::Leader),
            "subleader" => Ok(Role::SubLeader),
            "worker" => Ok(Role::Worker),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Ephemeral directory entry, refreshed by the owner's heartbeat and
/// expired by TTL when the owner dies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub worker_id: String,
    pub node_id: String,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub role: Role,
    pub last_seen_unix_ms: i64,
    pub load: i32,
    pub current_job_run_id: String,
    pub detached: bool,
    pub draining: bool,
}

impl WorkerEntry {
    pub fn rpc_target(&self) -> String {
        format!("{}:{}", self.rpc_host, self.rpc_port)
    }
}

/// Key/value coordination service: atomic set-if-absent, holder-checked
/// renew/release, integer increment, TTL, flags, and a worker directory.
///
/// Any operation that cannot confirm success within its deadline returns an
/// error; callers treat that as "role possibly lost" and step down.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// SET key holder NX with TTL. True when this call took the lease.
    async fn try_acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool>;

    /// Extend the TTL only if the holder still matches (compare-and-swap).
    async fn renew(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool>;

    /// Delete the key only if the holder still matches.
    async fn release(&self, key: &str, holder_id: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn incr(&self, key: &str) -> Result<i64>;

    async fn put_worker(&self, entry: &WorkerEntry, ttl: Duration) -> Result<()>;

    async fn scan_workers(&self) -> Result<Vec<WorkerEntry>>;

    async fn remove_worker(&self, worker_id: &str) -> Result<()>;

    async fn set_flag(&self, key: &str) -> Result<()>;

    async fn get_flag(&self, key: &str) -> Result<bool>;

    async fn clear_flag(&self, key: &str) -> Result<()>;
}

/// Allocate a fresh worker id from the store's monotone counter.
pub async fn allocate_worker_id(store: &Arc<dyn CoordinationStore>) -> Result<String> {
    let n = store.incr(&keys::worker_seq()).await?;
    Ok(format!("w-{n}"))
}

/// Read the cluster-wide epoch counter; 0 before the first election.
pub async fn cluster_epoch(store: &Arc<dyn CoordinationStore>) -> Result<i64> {
    let raw = store.get(&keys::leader_epoch()).await?;
    Ok(raw.and_then(|s| s.parse().ok()).unwrap_or(0))
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinationSettings {
    pub heartbeat_ttl: Duration,
    /// Directory refresh period. Lease maintenance still runs every tick;
    /// only the (heavier) directory write is throttled to this cadence.
    pub heartbeat_interval: Duration,
    pub leader_lock_ttl: Duration,
    pub subleader_lock_ttl: Duration,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            heartbeat_ttl: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(5),
            leader_lock_ttl: Duration::from_secs(10),
            subleader_lock_ttl: Duration::from_secs(10),
        }
    }
}

/// Result of one election tick.
#[derive(Debug, Clone)]
pub struct TickStatus {
    pub role: Role,
    /// Set only while this worker is leader; the epoch it acquired.
    pub leader_epoch: Option<i64>,
    /// Latest cluster epoch this worker has seen (fencing input).
    pub observed_epoch: i64,
    pub leader_worker_id: Option<String>,
    pub detached: bool,
}

/// Mutable worker state mirrored into the directory on every tick.
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    pub load: i32,
    pub current_job_run_id: String,
    pub draining: bool,
}

/// Drives lease acquisition, renewal, and the worker directory heartbeat for
/// one worker process. One tick per second keeps TTLs comfortably ahead of
/// the loop period.
pub struct Coordinator {
    store: Arc<dyn CoordinationStore>,
    worker_id: String,
    node_id: String,
    rpc_host: String,
    rpc_port: u16,
    settings: CoordinationSettings,
    is_leader: bool,
    leader_epoch: Option<i64>,
    is_subleader: bool,
    last_directory_write_ms: Option<i64>,
    last_role: Role,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        worker_id: String,
        node_id: String,
        rpc_host: String,
        rpc_port: u16,
        settings: CoordinationSettings,
    ) -> Self {
        Self {
            store,
            worker_id,
            node_id,
            rpc_host,
            rpc_port,
            settings,
            is_leader: false,
            leader_epoch: None,
            is_subleader: false,
            last_directory_write_ms: None,
            last_role: Role::Worker,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Adopt refreshed TTL/interval tunables; takes effect next tick.
    pub fn update_settings(&mut self, settings: CoordinationSettings) {
        self.settings = settings;
    }

    /// Swap identity after a detach cycle: the old directory entry is
    /// removed and the next tick registers the new id.
    pub async fn reassign_identity(&mut self, new_worker_id: String) -> Result<()> {
        self.store.remove_worker(&self.worker_id).await?;
        self.store
            .clear_flag(&keys::detach(&self.worker_id))
            .await?;
        self.worker_id = new_worker_id;
        self.is_leader = false;
        self.leader_epoch = None;
        self.is_subleader = false;
        Ok(())
    }

    pub async fn tick(&mut self, now_unix_ms: i64, snap: &DirectorySnapshot) -> Result<TickStatus> {
        let detached = self.store.get_flag(&keys::detach(&self.worker_id)).await?;

        let leader_lock = keys::leader_lock();
        let subleader_lock = keys::subleader_lock(&self.node_id);

        // A restarted process with the same worker id may still own a lease.
        let current_leader = self.store.get(&leader_lock).await?;
        if !self.is_leader && current_leader.as_deref() == Some(self.worker_id.as_str()) {
            self.is_leader = true;
            let raw = self.store.get(&keys::leader_epoch()).await?;
            self.leader_epoch = raw.and_then(|s| s.parse().ok());
        }

        let eligible = !detached && !snap.draining;

        if self.is_leader {
            let degraded = self.store.get_flag(&keys::degrade(&self.worker_id)).await?;
            let renewed = eligible
                && !degraded
                && self
                    .store
                    .renew(&leader_lock, &self.worker_id, self.settings.leader_lock_ttl)
                    .await?;
            if !renewed {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    degraded,
                    "Lost leadership, demoting to worker"
                );
                self.store.release(&leader_lock, &self.worker_id).await?;
                if degraded {
                    self.store
                        .clear_flag(&keys::degrade(&self.worker_id))
                        .await?;
                }
                self.is_leader = false;
                self.leader_epoch = None;
            }
        } else if eligible {
            // Sub-leader lease first, keyed by node id so leader and
            // sub-leader land on different hosts when there is more than
            // one.
            if self.is_subleader {
                let renewed = self
                    .store
                    .renew(
                        &subleader_lock,
                        &self.worker_id,
                        self.settings.subleader_lock_ttl,
                    )
                    .await?;
                if !renewed {
                    self.is_subleader = false;
                }
            } else {
                self.is_subleader = self
                    .store
                    .try_acquire(
                        &subleader_lock,
                        &self.worker_id,
                        self.settings.subleader_lock_ttl,
                    )
                    .await?;
            }

            let acquired = self
                .store
                .try_acquire(&leader_lock, &self.worker_id, self.settings.leader_lock_ttl)
                .await?;
            if acquired {
                let epoch = self.store.incr(&keys::leader_epoch()).await?;
                tracing::info!(worker_id = %self.worker_id, epoch, "Acquired leadership");
                self.is_leader = true;
                self.leader_epoch = Some(epoch);
                // Promotion releases the sub-leader role.
                if self.is_subleader {
                    self.store.release(&subleader_lock, &self.worker_id).await?;
                    self.is_subleader = false;
                }
            }
        } else {
            // Detached or draining workers hold no role.
            if self.is_subleader {
                self.store.release(&subleader_lock, &self.worker_id).await?;
                self.is_subleader = false;
            }
        }

        let role = if self.is_leader {
            Role::Leader
        } else if self.is_subleader {
            Role::SubLeader
        } else {
            Role::Worker
        };

        // Refresh the directory on the heartbeat cadence, immediately on a
        // role change, and always on the first tick.
        let refresh_due = self
            .last_directory_write_ms
            .map(|last| now_unix_ms - last >= self.settings.heartbeat_interval.as_millis() as i64)
            .unwrap_or(true);
        if refresh_due || role != self.last_role {
            let entry = WorkerEntry {
                worker_id: self.worker_id.clone(),
                node_id: self.node_id.clone(),
                rpc_host: self.rpc_host.clone(),
                rpc_port: self.rpc_port,
                role,
                last_seen_unix_ms: now_unix_ms,
                load: snap.load,
                current_job_run_id: snap.current_job_run_id.clone(),
                detached,
                draining: snap.draining,
            };
            self.store
                .put_worker(&entry, self.settings.heartbeat_ttl)
                .await?;
            self.last_directory_write_ms = Some(now_unix_ms);
            self.last_role = role;
        }

        let leader_worker_id = self.store.get(&leader_lock).await?;
        let observed_epoch = cluster_epoch(&self.store).await?;

        Ok(TickStatus {
            role,
            leader_epoch: if self.is_leader { self.leader_epoch } else { None },
            observed_epoch,
            leader_worker_id,
            detached,
        })
    }

    /// Forget any held role locally without touching the store. Called when
    /// a store operation fails mid-tick: the lease may or may not survive,
    /// so the safe local view is "not leader".
    pub fn demote_local(&mut self) {
        self.is_leader = false;
        self.leader_epoch = None;
        self.is_subleader = false;
    }

    /// Release held leases and drop the directory entry so followers notice
    /// the departure before the TTL would have lapsed.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.is_leader {
            self.store
                .release(&keys::leader_lock(), &self.worker_id)
                .await?;
            self.is_leader = false;
            self.leader_epoch = None;
        }
        if self.is_subleader {
            self.store
                .release(&keys::subleader_lock(&self.node_id), &self.worker_id)
                .await?;
            self.is_subleader = false;
        }
        self.store.remove_worker(&self.worker_id).await?;
        Ok(())
    }
}
