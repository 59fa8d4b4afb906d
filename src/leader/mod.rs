//! Leader tick: materialization, event intake, assignment, dispatch, and
//! orphan reconciliation.
//!
//! Runs only on the worker currently holding the leader lease. Every
//! durable mutation goes through a conditional update, so a stale leader
//! racing a newer one loses quietly; the only special case is a worker
//! answering REJECTED_OLD_EPOCH, which tells this leader to step down.

pub mod monitor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::coord::{keys, CoordinationStore, Role, WorkerEntry};
use crate::error::Result;
use crate::model::{ConcurrencyPolicy, JobDefinition, JobKind, JobRun, RunState};
use crate::proto::{start_job_response, CancelJobRequest, StartJobRequest};
use crate::rpc::ControlPlane;
use crate::schedule::floor_to_minute;
use crate::settings::{EngineSettings, SettingsResolver};
use crate::store::{RunStore, WorkerLoad};

const ASSIGN_BATCH: i64 = 100;
const DISPATCH_BATCH: i64 = 20;
const EVENT_BATCH: i64 = 50;
const RECONCILE_BATCH: i64 = 100;
const DISPATCH_RPC_BUDGET: usize = 5;
const STATUS_PROBE_BUDGET: usize = 2;
const PING_BATCH: usize = 2;
const RUN_LEASE_TTL: Duration = Duration::from_secs(5);

/// Per-tick inputs fixed by the caller: the epoch this leader holds and the
/// settings snapshot the whole tick runs under.
#[derive(Debug, Clone)]
pub struct TickContext {
    pub worker_id: String,
    pub epoch: i64,
    pub settings: EngineSettings,
    pub now: DateTime<Utc>,
}

/// Counters for one tick, logged in a single structured line.
#[derive(Debug, Default)]
pub struct TickSnapshot {
    pub created_runs: usize,
    pub event_runs: usize,
    pub assigned_runs: usize,
    pub reassigned_runs: usize,
    pub dispatched_runs: usize,
    pub skipped_runs: usize,
    pub canceled_runs: usize,
    pub orphaned_runs: usize,
    pub confirming_runs: usize,
    /// A worker rejected our epoch: a newer leader exists and this one must
    /// demote itself.
    pub saw_newer_epoch: bool,
}

/// Consecutive ping failures before the leader considers declaring a worker
/// detached.
const DETACH_FAILURE_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy)]
struct UnreachableMark {
    failures: u32,
    since_unix_ms: i64,
}

pub struct Leader {
    store: RunStore,
    coord: Arc<dyn CoordinationStore>,
    control: Arc<dyn ControlPlane>,
    /// Unreachability score per worker, fed by the ping sweep.
    unreachable: std::sync::Mutex<HashMap<String, UnreachableMark>>,
}

impl Leader {
    pub fn new(
        store: RunStore,
        coord: Arc<dyn CoordinationStore>,
        control: Arc<dyn ControlPlane>,
    ) -> Self {
        Self {
            store,
            coord,
            control,
            unreachable: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn tick(&self, ctx: &TickContext) -> Result<TickSnapshot> {
        let mut snapshot = TickSnapshot::default();

        self.coord
            .set(
                &keys::leader_last_seen(),
                &ctx.now.timestamp_millis().to_string(),
            )
            .await?;

        let workers = self.active_workers(ctx).await?;
        let mut loads = self.store.load_by_worker().await?;

        self.materialize_time_runs(ctx, &mut snapshot).await?;
        self.intake_events(ctx, &mut snapshot).await?;
        self.assign_runs(ctx, &workers, &mut loads, &mut snapshot)
            .await?;
        self.dispatch_runs(ctx, &workers, &mut loads, &mut snapshot)
            .await?;
        self.reconcile_runs(ctx, &workers, &mut snapshot).await?;

        if ctx.settings.log_retention_days_db > 0 {
            let horizon = ctx.now - ChronoDuration::days(ctx.settings.log_retention_days_db);
            self.store.prune_audit_log(horizon).await?;
        }

        tracing::info!(
            epoch = ctx.epoch,
            created = snapshot.created_runs,
            event_runs = snapshot.event_runs,
            assigned = snapshot.assigned_runs,
            reassigned = snapshot.reassigned_runs,
            dispatched = snapshot.dispatched_runs,
            skipped = snapshot.skipped_runs,
            canceled = snapshot.canceled_runs,
            orphaned = snapshot.orphaned_runs,
            confirming = snapshot.confirming_runs,
            "Leader tick"
        );
        Ok(snapshot)
    }

    /// Directory entries with a fresh heartbeat.
    async fn active_workers(&self, ctx: &TickContext) -> Result<Vec<WorkerEntry>> {
        let ttl_ms = ctx.settings.heartbeat_ttl_seconds * 1000;
        let now_ms = ctx.now.timestamp_millis();
        Ok(self
            .coord
            .scan_workers()
            .await?
            .into_iter()
            .filter(|w| now_ms - w.last_seen_unix_ms <= ttl_ms)
            .collect())
    }

    // ----- materialization -----

    async fn materialize_time_runs(
        &self,
        ctx: &TickContext,
        snapshot: &mut TickSnapshot,
    ) -> Result<()> {
        let definitions = self.store.list_enabled_definitions(JobKind::Time).await?;
        let cutoff = ctx.now - ChronoDuration::seconds(ctx.settings.skip_late_runs_after_seconds);
        let window_start = floor_to_minute(cutoff);
        let window_end =
            floor_to_minute(ctx.now + ChronoDuration::seconds(ctx.settings.assign_ahead_seconds));

        for def in &definitions {
            if def.concurrency_policy == ConcurrencyPolicy::Forbid
                && self.store.has_live_run(def.id).await?
            {
                continue;
            }
            let mut slot = window_start;
            while slot <= window_end {
                // The backlog boundary slot may be sub-minute older than the
                // cutoff; runs behind it are never materialized.
                if slot >= cutoff && def.schedule.matches_slot(slot) {
                    let key = JobRun::time_key(def.id, slot);
                    let (_, created) = self
                        .store
                        .create_run_if_absent(def.id, Some(slot), &key, ctx.now)
                        .await?;
                    if created {
                        snapshot.created_runs += 1;
                    }
                }
                slot = slot + ChronoDuration::minutes(1);
            }
        }
        Ok(())
    }

    // ----- event intake -----

    async fn intake_events(&self, ctx: &TickContext, snapshot: &mut TickSnapshot) -> Result<()> {
        let events = self.store.unprocessed_events(EVENT_BATCH).await?;
        if events.is_empty() {
            return Ok(());
        }
        let definitions = self.store.list_enabled_definitions(JobKind::Event).await?;

        for event in &events {
            let matching: Vec<&JobDefinition> = definitions
                .iter()
                .filter(|def| {
                    def.schedule
                        .subscribed_event_types()
                        .iter()
                        .any(|t| t == &event.event_type)
                })
                .collect();
            let created = self.store.process_event(event, &matching, ctx.now).await?;
            snapshot.event_runs += created.len();
        }
        Ok(())
    }

    // ----- assignment -----

    async fn assign_runs(
        &self,
        ctx: &TickContext,
        workers: &[WorkerEntry],
        loads: &mut HashMap<String, WorkerLoad>,
        snapshot: &mut TickSnapshot,
    ) -> Result<()> {
        let window_end = ctx.now + ChronoDuration::seconds(ctx.settings.assign_ahead_seconds);
        let runs = self.store.assignable_runs(window_end, ASSIGN_BATCH).await?;
        if runs.is_empty() {
            return Ok(());
        }
        let late_cutoff =
            ctx.now - ChronoDuration::seconds(ctx.settings.skip_late_runs_after_seconds);

        for run in runs {
            if ctx.settings.skip_late_runs_after_seconds > 0 {
                if let Some(scheduled_for) = run.scheduled_for {
                    if scheduled_for < late_cutoff {
                        if self
                            .store
                            .skip_run(run.id, "skipped: behind backlog cutoff", ctx.now)
                            .await?
                        {
                            self.store
                                .audit("run_skipped", &run.id.to_string(), "behind backlog cutoff")
                                .await?;
                            snapshot.skipped_runs += 1;
                        }
                        continue;
                    }
                }
            }

            let Some(worker_id) = pick_worker(workers, loads, ctx) else {
                // Nothing eligible; later runs would pick the same pool.
                break;
            };

            // Short-lived lease so two schedulers racing on the same run
            // agree on one assigner even before the conditional update.
            let lease_key = keys::run_lease(&run.id.to_string());
            if !self
                .coord
                .try_acquire(&lease_key, &ctx.worker_id, RUN_LEASE_TTL)
                .await?
            {
                continue;
            }

            let updated = match run.state {
                RunState::Pending => {
                    self.store
                        .assign_run(run.id, run.version, &worker_id, ctx.epoch, ctx.now)
                        .await?
                }
                RunState::Orphaned => {
                    let updated = self
                        .store
                        .reassign_orphaned_run(run.id, run.version, &worker_id, ctx.epoch, ctx.now)
                        .await?;
                    if updated {
                        snapshot.reassigned_runs += 1;
                    }
                    updated
                }
                _ => false,
            };

            if updated {
                snapshot.assigned_runs += 1;
                loads.entry(worker_id).or_default().assigned += 1;
            } else {
                // Lost the conditional update; free the lease for whoever
                // won.
                self.coord.release(&lease_key, &ctx.worker_id).await?;
            }
        }
        Ok(())
    }

    // ----- dispatch -----

    async fn dispatch_runs(
        &self,
        ctx: &TickContext,
        workers: &[WorkerEntry],
        loads: &mut HashMap<String, WorkerLoad>,
        snapshot: &mut TickSnapshot,
    ) -> Result<()> {
        let runs = self.store.dispatchable_runs(DISPATCH_BATCH).await?;
        if runs.is_empty() {
            return Ok(());
        }
        let targets: HashMap<&str, String> = workers
            .iter()
            .filter(|w| !w.rpc_host.is_empty() && w.rpc_port > 0)
            .map(|w| (w.worker_id.as_str(), w.rpc_target()))
            .collect();
        let late_cutoff =
            ctx.now - ChronoDuration::seconds(ctx.settings.skip_late_runs_after_seconds);
        let mut definitions: HashMap<Uuid, JobDefinition> = HashMap::new();
        let mut rpc_calls = 0usize;

        for run in runs {
            if rpc_calls >= DISPATCH_RPC_BUDGET || snapshot.saw_newer_epoch {
                break;
            }
            let Some(scheduled_for) = run.scheduled_for else {
                continue;
            };
            if scheduled_for > ctx.now {
                continue;
            }
            let Some(assigned_worker) = run.assigned_worker_id.clone() else {
                continue;
            };

            if ctx.settings.skip_late_runs_after_seconds > 0 && scheduled_for < late_cutoff {
                if self
                    .store
                    .skip_run(run.id, "skipped: behind backlog cutoff", ctx.now)
                    .await?
                {
                    self.store
                        .audit("run_skipped", &run.id.to_string(), "behind backlog cutoff")
                        .await?;
                    snapshot.skipped_runs += 1;
                }
                continue;
            }

            let definition = match definitions.get(&run.job_definition_id) {
                Some(def) => def.clone(),
                None => match self.store.get_definition(run.job_definition_id).await? {
                    Some(def) => {
                        definitions.insert(def.id, def.clone());
                        def
                    }
                    None => continue,
                },
            };

            if definition.concurrency_policy == ConcurrencyPolicy::Replace {
                self.replace_older_runs(ctx, &definition, &run, &targets, snapshot)
                    .await?;
            }

            let Some(target) = targets.get(assigned_worker.as_str()) else {
                // Worker fell out of the directory; the reconcile phase
                // decides its fate.
                continue;
            };
            if loads
                .get(&assigned_worker)
                .map(|l| l.running >= ctx.settings.max_jobs_per_worker)
                .unwrap_or(false)
            {
                continue;
            }

            rpc_calls += 1;
            let request = StartJobRequest {
                leader_epoch: ctx.epoch,
                job_run_id: run.id.to_string(),
                command_name: definition.command_name.clone(),
                args_json: definition.default_args.to_string(),
                timeout_seconds: definition.timeout_seconds,
                attempt: run.attempt,
            };
            match self.control.start_job(target, request).await {
                Ok(response) => {
                    let accepted = self
                        .handle_start_result(ctx, &run, &assigned_worker, response.result, snapshot)
                        .await?;
                    if accepted {
                        loads.entry(assigned_worker).or_default().running += 1;
                    }
                }
                Err(e) => {
                    // Transport failure only; durable state stays as is and
                    // reassignment timing decides later.
                    tracing::debug!(
                        job_run_id = %run.id,
                        target = %target,
                        error = %e,
                        "StartJob transport failure"
                    );
                }
            }
        }
        Ok(())
    }

    async fn handle_start_result(
        &self,
        ctx: &TickContext,
        run: &JobRun,
        worker_id: &str,
        result: i32,
        snapshot: &mut TickSnapshot,
    ) -> Result<bool> {
        use start_job_response::Result as StartResult;
        match StartResult::try_from(result).unwrap_or(StartResult::Unspecified) {
            StartResult::Accepted => {
                tracing::info!(job_run_id = %run.id, worker_id, "StartJob accepted");
                snapshot.dispatched_runs += 1;
                return Ok(true);
            }
            StartResult::RejectedOldEpoch => {
                tracing::warn!(
                    job_run_id = %run.id,
                    worker_id,
                    epoch = ctx.epoch,
                    "Worker rejected our epoch; stepping down"
                );
                snapshot.saw_newer_epoch = true;
            }
            StartResult::RejectedDetached
            | StartResult::RejectedDraining
            | StartResult::RejectedAlreadyRunning => {
                // The worker positively refused; put the run back in the
                // assignment pool right away.
                if self
                    .store
                    .orphan_assigned_run(
                        run.id,
                        run.version,
                        "orphaned: worker refused dispatch",
                        ctx.now,
                    )
                    .await?
                {
                    snapshot.orphaned_runs += 1;
                }
            }
            StartResult::RejectedInvalid => {
                self.store
                    .audit(
                        "dispatch_rejected",
                        &run.id.to_string(),
                        "worker answered REJECTED_INVALID",
                    )
                    .await?;
            }
            StartResult::Unspecified => {}
        }
        Ok(false)
    }

    /// Concurrency policy `replace`: cancel every other live run of the
    /// definition before dispatching the new one.
    async fn replace_older_runs(
        &self,
        ctx: &TickContext,
        definition: &JobDefinition,
        keep: &JobRun,
        targets: &HashMap<&str, String>,
        snapshot: &mut TickSnapshot,
    ) -> Result<()> {
        let live = self
            .store
            .live_runs_for_definition(definition.id, keep.id)
            .await?;
        for other in live {
            let was_running = other.state == RunState::Running;
            if self
                .store
                .cancel_run(other.id, ctx.epoch, "canceled: replaced by newer run", ctx.now)
                .await?
            {
                snapshot.canceled_runs += 1;
                if was_running {
                    if let Some(target) = other
                        .assigned_worker_id
                        .as_deref()
                        .and_then(|w| targets.get(w))
                    {
                        let request = CancelJobRequest {
                            leader_epoch: ctx.epoch,
                            job_run_id: other.id.to_string(),
                            reason: "replaced by newer run".to_string(),
                        };
                        if let Err(e) = self.control.cancel_job(target, request).await {
                            tracing::debug!(
                                job_run_id = %other.id,
                                error = %e,
                                "CancelJob transport failure"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ----- reconciliation -----

    async fn reconcile_runs(
        &self,
        ctx: &TickContext,
        workers: &[WorkerEntry],
        snapshot: &mut TickSnapshot,
    ) -> Result<()> {
        let active: HashMap<&str, &WorkerEntry> = workers
            .iter()
            .map(|w| (w.worker_id.as_str(), w))
            .collect();

        // ASSIGNED runs whose worker vanished before starting.
        let reassign_cutoff =
            ctx.now - ChronoDuration::seconds(ctx.settings.reassign_after_seconds);
        for run in self
            .store
            .runs_in_state(RunState::Assigned, RECONCILE_BATCH)
            .await?
        {
            let Some(assigned_at) = run.assigned_at else {
                continue;
            };
            if assigned_at > reassign_cutoff {
                continue;
            }
            let worker_gone = run
                .assigned_worker_id
                .as_deref()
                .map(|w| match active.get(w) {
                    Some(entry) => entry.detached,
                    None => true,
                })
                .unwrap_or(true);
            if worker_gone
                && self
                    .store
                    .orphan_assigned_run(
                        run.id,
                        run.version,
                        "orphaned: assigned worker inactive",
                        ctx.now,
                    )
                    .await?
            {
                self.store
                    .audit(
                        "run_orphaned",
                        &run.id.to_string(),
                        "assigned worker inactive",
                    )
                    .await?;
                snapshot.orphaned_runs += 1;
            }
        }

        // RUNNING runs: a vanished worker first gets the continuation grace
        // window; only a lapsed deadline orphans the run.
        let mut probes = 0usize;
        for run in self
            .store
            .runs_in_state(RunState::Running, RECONCILE_BATCH)
            .await?
        {
            let Some(worker_id) = run.assigned_worker_id.as_deref() else {
                continue;
            };
            match run.continuation_state {
                crate::model::ContinuationState::Confirming => {
                    if run
                        .continuation_check_deadline_at
                        .map(|deadline| deadline <= ctx.now)
                        .unwrap_or(false)
                        && self
                            .store
                            .orphan_unconfirmed_run(
                                run.id,
                                "orphaned: confirming deadline exceeded",
                                ctx.now,
                            )
                            .await?
                    {
                        self.store
                            .audit(
                                "run_orphaned",
                                &run.id.to_string(),
                                "confirming deadline exceeded",
                            )
                            .await?;
                        snapshot.orphaned_runs += 1;
                    }
                }
                crate::model::ContinuationState::None => {
                    let entry = active.get(worker_id);
                    let missing = entry.is_none();
                    if missing {
                        let deadline = ctx.now
                            + ChronoDuration::seconds(ctx.settings.continuation_confirm_seconds);
                        if self
                            .store
                            .begin_confirming(
                                run.id,
                                deadline,
                                "confirming: worker heartbeat lost",
                                ctx.now,
                            )
                            .await?
                        {
                            snapshot.confirming_runs += 1;
                        }
                        continue;
                    }
                    // Worker is alive: spot-check that it still claims the
                    // run (catches a worker restart that lost the child).
                    if probes < STATUS_PROBE_BUDGET {
                        if let Some(entry) = entry {
                            probes += 1;
                            match self
                                .control
                                .get_status(&entry.rpc_target(), ctx.epoch)
                                .await
                            {
                                Ok(status)
                                    if status.current_job_run_id != run.id.to_string() =>
                                {
                                    let deadline = ctx.now
                                        + ChronoDuration::seconds(
                                            ctx.settings.continuation_confirm_seconds,
                                        );
                                    if self
                                        .store
                                        .begin_confirming(
                                            run.id,
                                            deadline,
                                            "confirming: worker reports different run",
                                            ctx.now,
                                        )
                                        .await?
                                    {
                                        snapshot.confirming_runs += 1;
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    tracing::debug!(
                                        worker_id,
                                        error = %e,
                                        "Status probe failed"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ----- auxiliary leader duties -----

    /// Round-robin liveness sweep over the directory. A worker that keeps
    /// heartbeating the store but stops answering RPC accumulates failures
    /// and, once the detach grace has passed, is flagged detached so the
    /// scheduler routes around it. Returns the advanced cursor.
    pub async fn ping_sweep(&self, ctx: &TickContext, cursor: usize) -> Result<usize> {
        let mut workers = self.active_workers(ctx).await?;
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        if workers.is_empty() {
            return Ok(0);
        }
        let now_ms = ctx.now.timestamp_millis();
        let start = cursor % workers.len();
        for i in 0..PING_BATCH.min(workers.len()) {
            let worker = &workers[(start + i) % workers.len()];
            if worker.worker_id == ctx.worker_id {
                continue;
            }
            match self
                .control
                .ping(&worker.rpc_target(), Role::Leader, ctx.epoch)
                .await
            {
                Ok(_) => {
                    self.unreachable.lock().unwrap().remove(&worker.worker_id);
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %worker.worker_id,
                        target = %worker.rpc_target(),
                        error = %e,
                        "Leader ping failed"
                    );
                    let declare = {
                        let mut unreachable = self.unreachable.lock().unwrap();
                        let mark =
                            unreachable
                                .entry(worker.worker_id.clone())
                                .or_insert(UnreachableMark {
                                    failures: 0,
                                    since_unix_ms: now_ms,
                                });
                        mark.failures += 1;
                        mark.failures >= DETACH_FAILURE_THRESHOLD
                            && now_ms - mark.since_unix_ms
                                >= ctx.settings.worker_detach_grace_seconds * 1000
                    };
                    if declare && !worker.detached {
                        tracing::warn!(
                            worker_id = %worker.worker_id,
                            "Worker unreachable past grace; declaring detached"
                        );
                        self.coord
                            .set_flag(&keys::detach(&worker.worker_id))
                            .await?;
                        self.store
                            .audit(
                                "worker_detached",
                                &worker.worker_id,
                                "unreachable past detach grace",
                            )
                            .await?;
                        self.unreachable.lock().unwrap().remove(&worker.worker_id);
                    }
                }
            }
        }
        Ok((start + PING_BATCH) % workers.len())
    }

    /// Apply a pending settings-reload request: refresh the local cache and
    /// fan the reload out to every live worker.
    pub async fn apply_reload_request(
        &self,
        ctx: &TickContext,
        resolver: &SettingsResolver,
    ) -> Result<bool> {
        let flag = keys::settings_reload();
        if !self.coord.get_flag(&flag).await? {
            return Ok(false);
        }
        self.coord.clear_flag(&flag).await?;
        let generation = resolver.reload();

        let workers = self.active_workers(ctx).await?;
        let mut ok = 0usize;
        for worker in &workers {
            if worker.worker_id == ctx.worker_id {
                ok += 1;
                continue;
            }
            match self
                .control
                .reload_settings(&worker.rpc_target(), ctx.epoch, &ctx.worker_id)
                .await
            {
                Ok(response) if response.ok => ok += 1,
                Ok(response) => {
                    tracing::warn!(
                        worker_id = %worker.worker_id,
                        message = %response.message,
                        "Settings reload refused"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %worker.worker_id,
                        error = %e,
                        "Settings reload failed"
                    );
                }
            }
        }
        self.store
            .audit(
                "settings_reload",
                &ctx.worker_id,
                &format!("generation={generation} ok={ok}/{}", workers.len()),
            )
            .await?;
        tracing::info!(generation, ok, total = workers.len(), "Settings reload applied");
        Ok(true)
    }
}

/// Candidate choice: fresh, not detached, not draining, under the load cap,
/// and not the leader unless nothing else qualifies. Score is load
/// ascending, then freshest heartbeat, then smallest worker id.
fn pick_worker(
    workers: &[WorkerEntry],
    loads: &HashMap<String, WorkerLoad>,
    ctx: &TickContext,
) -> Option<String> {
    let eligible = |w: &&WorkerEntry| {
        if w.detached || w.draining {
            return false;
        }
        let load = loads
            .get(&w.worker_id)
            .map(|l| l.assigned + l.running)
            .unwrap_or(0);
        load < ctx.settings.max_jobs_per_worker
    };

    let mut pool: Vec<&WorkerEntry> = workers
        .iter()
        .filter(|w| w.role != Role::Leader)
        .filter(eligible)
        .collect();
    if pool.is_empty() {
        pool = workers
            .iter()
            .filter(|w| w.role == Role::Leader)
            .filter(eligible)
            .collect();
    }

    pool.into_iter()
        .min_by(|a, b| {
            let load_a = loads
                .get(&a.worker_id)
                .map(|l| l.assigned + l.running)
                .unwrap_or(0);
            let load_b = loads
                .get(&b.worker_id)
                .map(|l| l.assigned + l.running)
                .unwrap_or(0);
            load_a
                .cmp(&load_b)
                .then(b.last_seen_unix_ms.cmp(&a.last_seen_unix_ms))
                .then(a.worker_id.cmp(&b.worker_id))
        })
        .map(|w| w.worker_id.clone())
}
