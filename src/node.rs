//! Node wiring: one process = one worker, plus whatever roles its leases
//! grant it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::coord::{
    allocate_worker_id, CoordinationSettings, CoordinationStore, Coordinator, MemoryStore,
    RedisStore, Role,
};
use crate::error::{Result, TaskherdError};
use crate::http::{run_http_api, HttpState};
use crate::leader::monitor::SubLeaderMonitor;
use crate::leader::{Leader, TickContext};
use crate::rpc::{ControlPlane, GrpcControlPlane, RpcServer, WorkerControlService};
use crate::settings::SettingsResolver;
use crate::store::RunStore;
use crate::tls::TlsIdentity;
use crate::worker::continuation::{
    confirm_or_abort, ContinuationConfig, ContinuationVerdict,
};
use crate::worker::executor::JobExecutor;
use crate::worker::WorkerRuntime;

const COORDINATION_TICK: Duration = Duration::from_secs(1);

/// Main node that owns every subsystem of a worker process.
pub struct Node {
    config: NodeConfig,
    store: RunStore,
    coord: Arc<dyn CoordinationStore>,
    runtime: Arc<WorkerRuntime>,
    resolver: Arc<SettingsResolver>,
    executor: JobExecutor,
    control: Arc<dyn ControlPlane>,
    tls: Option<TlsIdentity>,
}

impl Node {
    /// Connect the stores, load TLS material, and allocate this worker's
    /// identity from the coordination store's counter.
    pub async fn bootstrap(config: NodeConfig, logs_dir: PathBuf) -> Result<Self> {
        let tls = if config.tls.is_complete() {
            Some(
                TlsIdentity::load(&config.tls)
                    .await
                    .map_err(|e| TaskherdError::Internal(e.to_string()))?,
            )
        } else {
            None
        };

        // "memory://" selects the in-process store: single-worker setups
        // and tests run without an external service.
        let coord: Arc<dyn CoordinationStore> = if config.redis_url == "memory://" {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(RedisStore::connect(&config.redis_url).await?)
        };

        let store = if config.database_url == "sqlite::memory:" {
            RunStore::in_memory().await?
        } else {
            RunStore::connect(&config.database_url).await?
        };

        let worker_id = allocate_worker_id(&coord).await?;
        let runtime = Arc::new(WorkerRuntime::new(worker_id, config.node_id.clone()));
        let resolver = Arc::new(SettingsResolver::new(store.clone()));
        let executor = JobExecutor::new(logs_dir);
        let control: Arc<dyn ControlPlane> = Arc::new(GrpcControlPlane::new(tls.clone()));

        Ok(Self {
            config,
            store,
            coord,
            runtime,
            resolver,
            executor,
            control,
            tls,
        })
    }

    /// Run the node until the shutdown token fires.
    ///
    /// Subsystems, each its own task:
    /// 1. The RPC server answering the control plane.
    /// 2. The coordination loop: heartbeat, election, detach watch.
    /// 3. The leader loop, active only while the lease is held.
    /// 4. The sub-leader monitor, active only while that lease is held.
    /// 5. Optionally the HTTP ingestion/status API.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let rpc_port = self.config.resolve_rpc_port()?;
        let bind_addr: SocketAddr = format!("0.0.0.0:{rpc_port}")
            .parse()
            .map_err(|e| TaskherdError::Internal(format!("bad bind address: {e}")))?;

        tracing::info!(
            worker_id = %self.runtime.worker_id(),
            node_id = %self.config.node_id,
            rpc_port,
            "Starting worker"
        );

        let service = WorkerControlService::new(
            self.runtime.clone(),
            self.store.clone(),
            self.executor.clone(),
            self.resolver.clone(),
        );
        let rpc_server = RpcServer::new(bind_addr, self.tls.clone());
        let rpc_shutdown = shutdown.clone();
        let rpc_handle = tokio::spawn(async move {
            if let Err(e) = rpc_server.run(service, rpc_shutdown).await {
                tracing::error!(error = %e, "RPC server failed");
            }
        });

        if let Some(http_addr) = self.config.http_addr {
            let http_state = HttpState {
                store: self.store.clone(),
                coord: self.coord.clone(),
                resolver: self.resolver.clone(),
                runtime: self.runtime.clone(),
            };
            tokio::spawn(async move {
                run_http_api(http_addr, http_state).await;
            });
        }

        let coordination = tokio::spawn(coordination_loop(
            self.coord.clone(),
            self.runtime.clone(),
            self.store.clone(),
            self.control.clone(),
            self.resolver.clone(),
            self.config.clone(),
            rpc_port,
            shutdown.clone(),
        ));

        let leader_loop_handle = tokio::spawn(leader_loop(
            Leader::new(self.store.clone(), self.coord.clone(), self.control.clone()),
            self.runtime.clone(),
            self.resolver.clone(),
            self.coord.clone(),
            shutdown.clone(),
        ));

        let monitor_handle = tokio::spawn(monitor_loop(
            SubLeaderMonitor::new(self.coord.clone(), self.control.clone()),
            self.runtime.clone(),
            self.resolver.clone(),
            shutdown.clone(),
        ));

        shutdown.cancelled().await;
        tracing::info!("Shutdown requested, draining");
        // The coordination loop releases leases and the directory entry on
        // its way out; wait for it before tearing the rest down.
        let _ = coordination.await;
        leader_loop_handle.abort();
        monitor_handle.abort();
        let _ = rpc_handle.await;
        Ok(())
    }
}

/// Heartbeat + election + detach watch, one pass per second.
#[allow(clippy::too_many_arguments)]
async fn coordination_loop(
    coord: Arc<dyn CoordinationStore>,
    runtime: Arc<WorkerRuntime>,
    store: RunStore,
    control: Arc<dyn ControlPlane>,
    resolver: Arc<SettingsResolver>,
    config: NodeConfig,
    rpc_port: u16,
    shutdown: CancellationToken,
) {
    let mut coordinator = Coordinator::new(
        coord.clone(),
        runtime.worker_id(),
        config.node_id.clone(),
        config.rpc_host.clone(),
        rpc_port,
        CoordinationSettings::default(),
    );
    let mut interval = tokio::time::interval(COORDINATION_TICK);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        if let Ok(settings) = resolver.engine_settings().await {
            coordinator.update_settings(CoordinationSettings {
                heartbeat_ttl: Duration::from_secs(settings.heartbeat_ttl_seconds as u64),
                heartbeat_interval: settings.heartbeat_interval,
                ..CoordinationSettings::default()
            });
        }

        let snapshot = runtime.directory_snapshot();
        let now_ms = Utc::now().timestamp_millis();
        match coordinator.tick(now_ms, &snapshot).await {
            Ok(status) => {
                runtime.apply_tick(
                    status.role,
                    status.leader_epoch,
                    status.observed_epoch,
                    status.leader_worker_id,
                    status.detached,
                    now_ms,
                );
                if status.detached {
                    handle_detach(
                        &coord, &runtime, &store, &control, &resolver, &mut coordinator,
                    )
                    .await;
                }
            }
            Err(e) => {
                // The lease may or may not have survived; assume not and
                // let the next successful tick re-establish roles.
                tracing::warn!(error = %e, "Coordination tick failed, dropping roles locally");
                coordinator.demote_local();
                runtime.apply_tick(
                    Role::Worker,
                    None,
                    runtime.observed_epoch(),
                    None,
                    false,
                    now_ms,
                );
            }
        }
    }

    if let Err(e) = coordinator.shutdown().await {
        tracing::warn!(error = %e, "Coordination shutdown incomplete");
    }
}

/// Detach lifecycle: wind down the current run through the continuation
/// protocol, then rejoin the cluster under a fresh worker id.
async fn handle_detach(
    coord: &Arc<dyn CoordinationStore>,
    runtime: &Arc<WorkerRuntime>,
    store: &RunStore,
    control: &Arc<dyn ControlPlane>,
    resolver: &Arc<SettingsResolver>,
    coordinator: &mut Coordinator,
) {
    match runtime.current_run() {
        Some(current) => {
            if !runtime.claim_continuation(current.job_run_id) {
                return; // A check is already in flight.
            }
            let settings = match resolver.engine_settings().await {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!(error = %e, "Settings unavailable, aborting run on detach");
                    current.abort.cancel();
                    return;
                }
            };
            let config = ContinuationConfig {
                retry_count: settings.continuation_retry_count,
                retry_interval: settings.continuation_retry_interval,
                confirm_seconds: settings.continuation_confirm_seconds,
            };
            let store = store.clone();
            let coord = coord.clone();
            let control = control.clone();
            let worker_id = runtime.worker_id();
            tokio::spawn(async move {
                let verdict = confirm_or_abort(
                    &store,
                    &coord,
                    &control,
                    &worker_id,
                    current.job_run_id,
                    current.dispatch_epoch,
                    config,
                )
                .await
                .unwrap_or(ContinuationVerdict::Abort);
                if verdict == ContinuationVerdict::Abort {
                    current.abort.cancel();
                }
            });
        }
        None => {
            // Nothing running: finish the detach by re-registering.
            match allocate_worker_id(coord).await {
                Ok(new_id) => {
                    tracing::info!(
                        old_worker_id = %runtime.worker_id(),
                        new_worker_id = %new_id,
                        "Detach complete, re-registering"
                    );
                    if let Err(e) = coordinator.reassign_identity(new_id.clone()).await {
                        tracing::warn!(error = %e, "Re-registration failed");
                        return;
                    }
                    runtime.adopt_identity(new_id);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Worker id allocation failed during detach");
                }
            }
        }
    }
}

/// Scheduling work, performed only while this worker holds the leader
/// lease. A stale-epoch rejection from any worker flags this leader
/// degraded so the election tick demotes it within a second.
async fn leader_loop(
    leader: Leader,
    runtime: Arc<WorkerRuntime>,
    resolver: Arc<SettingsResolver>,
    coord: Arc<dyn CoordinationStore>,
    shutdown: CancellationToken,
) {
    let mut ping_cursor = 0usize;
    loop {
        let settings = match resolver.engine_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, "Settings unavailable, skipping leader tick");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(settings.leader_tick) => {}
            _ = shutdown.cancelled() => break,
        }

        if runtime.role() != Role::Leader {
            continue;
        }
        let ctx = TickContext {
            worker_id: runtime.worker_id(),
            epoch: runtime.effective_epoch(),
            settings,
            now: Utc::now(),
        };

        match leader.tick(&ctx).await {
            Ok(snapshot) if snapshot.saw_newer_epoch => {
                tracing::warn!(epoch = ctx.epoch, "Newer epoch observed, stepping down");
                let flag = crate::coord::keys::degrade(&ctx.worker_id);
                if let Err(e) = coord.set_flag(&flag).await {
                    tracing::warn!(error = %e, "Failed to flag self for demotion");
                }
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Leader tick failed");
                continue;
            }
        }

        if let Err(e) = leader.apply_reload_request(&ctx, &resolver).await {
            tracing::warn!(error = %e, "Reload fan-out failed");
        }
        match leader.ping_sweep(&ctx, ping_cursor).await {
            Ok(cursor) => ping_cursor = cursor,
            Err(e) => tracing::debug!(error = %e, "Ping sweep failed"),
        }
    }
}

/// Leader liveness watch, active only while holding the sub-leader lease.
async fn monitor_loop(
    mut monitor: SubLeaderMonitor,
    runtime: Arc<WorkerRuntime>,
    resolver: Arc<SettingsResolver>,
    shutdown: CancellationToken,
) {
    loop {
        let settings = match resolver.engine_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, "Settings unavailable, skipping monitor pass");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(settings.subleader_check) => {}
            _ = shutdown.cancelled() => break,
        }

        if runtime.role() != Role::SubLeader {
            continue;
        }
        match monitor
            .check(
                &settings,
                runtime.observed_epoch(),
                Utc::now().timestamp_millis(),
            )
            .await
        {
            Ok(outcome) => {
                tracing::debug!(?outcome, "Sub-leader monitor pass");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Sub-leader monitor pass failed");
            }
        }
    }
}
