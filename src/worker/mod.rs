//! Worker-side runtime: the small mutable state shared by the coordination
//! loop, the RPC handlers, and subprocess supervision.
//!
//! All of it sits behind one mutex and no holder ever crosses an await
//! point with the lock taken; loops communicate through this single
//! serialization point instead of mutating each other's fields.

pub mod continuation;
pub mod executor;

use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::coord::{DirectorySnapshot, Role};

/// The run this worker is currently executing, if any. The two tokens
/// select the terminal state: `cancel` ends the run as CANCELED (operator
/// or leader intent), `abort` as FAILED (continuation denied).
#[derive(Debug, Clone)]
pub struct CurrentRun {
    pub job_run_id: Uuid,
    pub command_name: String,
    pub dispatch_epoch: i64,
    pub cancel: CancellationToken,
    pub abort: CancellationToken,
    /// Set once a detach-triggered continuation check is in flight, so the
    /// watcher does not start a second one.
    pub continuation_started: bool,
}

#[derive(Debug)]
pub struct RuntimeState {
    pub worker_id: String,
    pub node_id: String,
    pub role: Role,
    pub observed_epoch: i64,
    /// Epoch this worker acquired leadership under; None while follower.
    pub leader_epoch: Option<i64>,
    pub leader_worker_id: Option<String>,
    pub last_heartbeat_unix_ms: i64,
    pub detached: bool,
    pub draining: bool,
    pub current: Option<CurrentRun>,
}

/// Shared handle to the runtime state.
pub struct WorkerRuntime {
    state: Mutex<RuntimeState>,
}

impl WorkerRuntime {
    pub fn new(worker_id: String, node_id: String) -> Self {
        Self {
            state: Mutex::new(RuntimeState {
                worker_id,
                node_id,
                role: Role::Worker,
                observed_epoch: 0,
                leader_epoch: None,
                leader_worker_id: None,
                last_heartbeat_unix_ms: 0,
                detached: false,
                draining: false,
                current: None,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }

    pub fn worker_id(&self) -> String {
        self.lock().worker_id.clone()
    }

    pub fn observed_epoch(&self) -> i64 {
        self.lock().observed_epoch
    }

    pub fn role(&self) -> Role {
        self.lock().role
    }

    /// Directory view written on every coordination tick.
    pub fn directory_snapshot(&self) -> DirectorySnapshot {
        let state = self.lock();
        DirectorySnapshot {
            load: state.current.is_some() as i32,
            current_job_run_id: state
                .current
                .as_ref()
                .map(|run| run.job_run_id.to_string())
                .unwrap_or_default(),
            draining: state.draining,
        }
    }

    /// Record the outcome of a coordination tick.
    pub fn apply_tick(
        &self,
        role: Role,
        leader_epoch: Option<i64>,
        observed_epoch: i64,
        leader_worker_id: Option<String>,
        detached: bool,
        now_unix_ms: i64,
    ) {
        let mut state = self.lock();
        state.role = role;
        state.leader_epoch = leader_epoch;
        state.observed_epoch = observed_epoch;
        state.leader_worker_id = leader_worker_id;
        state.detached = detached;
        state.last_heartbeat_unix_ms = now_unix_ms;
    }

    /// The epoch this worker schedules under while leader: its acquisition
    /// epoch, falling back to the observed cluster epoch.
    pub fn effective_epoch(&self) -> i64 {
        let state = self.lock();
        state.leader_epoch.unwrap_or(state.observed_epoch)
    }

    /// Claim the single execution slot. Returns the previous occupant's run
    /// id when busy.
    pub fn begin_run(&self, run: CurrentRun) -> Result<(), Uuid> {
        let mut state = self.lock();
        match &state.current {
            Some(existing) => Err(existing.job_run_id),
            None => {
                state.current = Some(run);
                Ok(())
            }
        }
    }

    /// Release the execution slot if it still belongs to `job_run_id`.
    pub fn end_run(&self, job_run_id: Uuid) {
        let mut state = self.lock();
        if state
            .current
            .as_ref()
            .map(|run| run.job_run_id == job_run_id)
            .unwrap_or(false)
        {
            state.current = None;
        }
    }

    pub fn current_run(&self) -> Option<CurrentRun> {
        self.lock().current.clone()
    }

    /// Mark the current run's continuation check as started; false if there
    /// is no current run or a check is already in flight.
    pub fn claim_continuation(&self, job_run_id: Uuid) -> bool {
        let mut state = self.lock();
        match state.current.as_mut() {
            Some(run) if run.job_run_id == job_run_id && !run.continuation_started => {
                run.continuation_started = true;
                true
            }
            _ => false,
        }
    }

    pub fn set_draining(&self, draining: bool) {
        self.lock().draining = draining;
    }

    /// Adopt a fresh identity after a detach cycle completes.
    pub fn adopt_identity(&self, worker_id: String) {
        let mut state = self.lock();
        state.worker_id = worker_id;
        state.detached = false;
        state.role = Role::Worker;
    }
}
