//! Worker-side implementation of the control-plane contract.
//!
//! Every mutating operation gates on the caller's `leader_epoch` against
//! this worker's observed epoch; a stale leader is told so and mutates
//! nothing. `StartJob` is idempotent: a duplicate for the run already being
//! executed answers ACCEPTED again.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::coord::Role;
use crate::proto::worker_control_server::WorkerControl;
use crate::proto::{
    cancel_job_response, confirm_continuation_response, start_job_response,
    CancelJobRequest, CancelJobResponse, ConfirmContinuationRequest, ConfirmContinuationResponse,
    DrainRequest, DrainResponse, GetStatusRequest, GetStatusResponse, PingRequest, PingResponse,
    ReloadSettingsRequest, ReloadSettingsResponse, StartJobRequest, StartJobResponse,
};
use crate::settings::SettingsResolver;
use crate::store::RunStore;
use crate::worker::executor::JobExecutor;
use crate::worker::{CurrentRun, WorkerRuntime};

pub struct WorkerControlService {
    runtime: Arc<WorkerRuntime>,
    store: RunStore,
    executor: JobExecutor,
    resolver: Arc<SettingsResolver>,
}

impl WorkerControlService {
    pub fn new(
        runtime: Arc<WorkerRuntime>,
        store: RunStore,
        executor: JobExecutor,
        resolver: Arc<SettingsResolver>,
    ) -> Self {
        Self {
            runtime,
            store,
            executor,
            resolver,
        }
    }

    fn start_response(result: start_job_response::Result, message: &str) -> StartJobResponse {
        StartJobResponse {
            result: result.into(),
            message: message.to_string(),
        }
    }
}

#[tonic::async_trait]
impl WorkerControl for WorkerControlService {
    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(caller_role = %req.caller_role, epoch = req.leader_epoch, "Ping");
        let state = self.runtime.lock();
        Ok(Response::new(PingResponse {
            worker_id: state.worker_id.clone(),
            node_id: state.node_id.clone(),
            observed_epoch: state.observed_epoch,
            now_unix_ms: Utc::now().timestamp_millis(),
        }))
    }

    async fn get_status(
        &self,
        _request: Request<GetStatusRequest>,
    ) -> Result<Response<GetStatusResponse>, Status> {
        let state = self.runtime.lock();
        Ok(Response::new(GetStatusResponse {
            worker_id: state.worker_id.clone(),
            node_id: state.node_id.clone(),
            role: state.role.to_string(),
            detached: state.detached,
            draining: state.draining,
            load: state.current.is_some() as i32,
            current_job_run_id: state
                .current
                .as_ref()
                .map(|run| run.job_run_id.to_string())
                .unwrap_or_default(),
            observed_epoch: state.observed_epoch,
            last_heartbeat_unix_ms: state.last_heartbeat_unix_ms,
        }))
    }

    async fn start_job(
        &self,
        request: Request<StartJobRequest>,
    ) -> Result<Response<StartJobResponse>, Status> {
        let req = request.into_inner();

        let job_run_id = match Uuid::from_str(req.job_run_id.trim()) {
            Ok(id) => id,
            Err(_) => {
                return Ok(Response::new(Self::start_response(
                    start_job_response::Result::RejectedInvalid,
                    "invalid job_run_id",
                )));
            }
        };

        // Admission gates under the runtime lock; no I/O while held.
        let worker_id = {
            let state = self.runtime.lock();
            if req.leader_epoch < state.observed_epoch {
                return Ok(Response::new(Self::start_response(
                    start_job_response::Result::RejectedOldEpoch,
                    "old epoch",
                )));
            }
            if state.detached {
                return Ok(Response::new(Self::start_response(
                    start_job_response::Result::RejectedDetached,
                    "detached",
                )));
            }
            if state.draining {
                return Ok(Response::new(Self::start_response(
                    start_job_response::Result::RejectedDraining,
                    "draining",
                )));
            }
            if let Some(current) = &state.current {
                if current.job_run_id == job_run_id {
                    // Duplicate dispatch of the run already underway.
                    return Ok(Response::new(Self::start_response(
                        start_job_response::Result::Accepted,
                        "already accepted",
                    )));
                }
                return Ok(Response::new(Self::start_response(
                    start_job_response::Result::RejectedAlreadyRunning,
                    "already running",
                )));
            }
            state.worker_id.clone()
        };

        let command_name = req.command_name.trim().to_string();
        if command_name.is_empty() {
            return Ok(Response::new(Self::start_response(
                start_job_response::Result::RejectedInvalid,
                "invalid command_name",
            )));
        }
        let args_json = if req.args_json.trim().is_empty() {
            "{}".to_string()
        } else {
            req.args_json.clone()
        };
        match serde_json::from_str::<serde_json::Value>(&args_json) {
            Ok(value) if value.is_object() || value.is_array() => {}
            _ => {
                return Ok(Response::new(Self::start_response(
                    start_job_response::Result::RejectedInvalid,
                    "args_json must be a JSON object or array",
                )));
            }
        }

        let log_ref = self
            .executor
            .log_path(&worker_id, job_run_id)
            .display()
            .to_string();

        // Fenced ASSIGNED -> RUNNING before anything is spawned; a miss
        // means the run is not ours to start (state, worker, or epoch).
        let marked = self
            .store
            .mark_running(job_run_id, &worker_id, req.leader_epoch, &log_ref, Utc::now())
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        if !marked {
            return Ok(Response::new(Self::start_response(
                start_job_response::Result::RejectedInvalid,
                "run not eligible (state/worker/epoch)",
            )));
        }

        let cancel = CancellationToken::new();
        let abort = CancellationToken::new();
        let current = CurrentRun {
            job_run_id,
            command_name: command_name.clone(),
            dispatch_epoch: req.leader_epoch,
            cancel: cancel.clone(),
            abort: abort.clone(),
            continuation_started: false,
        };
        if let Err(busy_with) = self.runtime.begin_run(current) {
            // Lost the slot race after the DB transition; undo by finishing
            // as FAILED so the leader reassigns cleanly.
            tracing::warn!(job_run_id = %job_run_id, busy_with = %busy_with, "Execution slot taken");
            let _ = self
                .store
                .finish_run(
                    job_run_id,
                    &worker_id,
                    req.leader_epoch,
                    crate::model::RunState::Failed,
                    None,
                    "worker slot taken after accept",
                    &log_ref,
                    Utc::now(),
                )
                .await;
            return Ok(Response::new(Self::start_response(
                start_job_response::Result::RejectedAlreadyRunning,
                "already running",
            )));
        }

        let runtime = self.runtime.clone();
        let store = self.store.clone();
        let executor = self.executor.clone();
        let dispatch_epoch = req.leader_epoch;
        let timeout_seconds = req.timeout_seconds;
        tokio::spawn(async move {
            let outcome = executor
                .execute(
                    &worker_id,
                    job_run_id,
                    &command_name,
                    &args_json,
                    timeout_seconds,
                    cancel,
                    abort,
                )
                .await;

            let closed = store
                .finish_run(
                    job_run_id,
                    &worker_id,
                    dispatch_epoch,
                    outcome.final_state,
                    outcome.exit_code,
                    &outcome.error_summary,
                    &log_ref,
                    Utc::now(),
                )
                .await;
            match closed {
                Ok(true) => {}
                Ok(false) => {
                    // The row moved under us (leader cancel or orphaning);
                    // the transition is a no-op by design.
                    tracing::info!(job_run_id = %job_run_id, "Terminal transition missed; row already moved");
                }
                Err(e) => {
                    tracing::error!(job_run_id = %job_run_id, error = %e, "Failed to record run outcome");
                }
            }
            runtime.end_run(job_run_id);
        });

        Ok(Response::new(Self::start_response(
            start_job_response::Result::Accepted,
            "accepted",
        )))
    }

    async fn cancel_job(
        &self,
        request: Request<CancelJobRequest>,
    ) -> Result<Response<CancelJobResponse>, Status> {
        let req = request.into_inner();

        let running = {
            let state = self.runtime.lock();
            if req.leader_epoch < state.observed_epoch {
                return Ok(Response::new(CancelJobResponse {
                    result: cancel_job_response::Result::RejectedOldEpoch.into(),
                    message: "old epoch".to_string(),
                }));
            }
            state.current.clone()
        };

        let job_run_id = Uuid::from_str(req.job_run_id.trim()).ok();
        if let (Some(current), Some(id)) = (&running, job_run_id) {
            if current.job_run_id == id {
                tracing::info!(job_run_id = %id, reason = %req.reason, "Cancel requested");
                current.cancel.cancel();
                return Ok(Response::new(CancelJobResponse {
                    result: cancel_job_response::Result::Accepted.into(),
                    message: "cancel requested".to_string(),
                }));
            }
        }

        // Not running here; answer from durable state.
        if let Some(id) = job_run_id {
            if let Some(run) = self
                .store
                .get_run(id)
                .await
                .map_err(|e| Status::internal(e.to_string()))?
            {
                if run.state.is_terminal() {
                    return Ok(Response::new(CancelJobResponse {
                        result: cancel_job_response::Result::AlreadyFinished.into(),
                        message: run.state.to_string(),
                    }));
                }
            }
        }
        Ok(Response::new(CancelJobResponse {
            result: cancel_job_response::Result::NotFound.into(),
            message: "not running on this worker".to_string(),
        }))
    }

    async fn drain(
        &self,
        request: Request<DrainRequest>,
    ) -> Result<Response<DrainResponse>, Status> {
        let req = request.into_inner();
        {
            let state = self.runtime.lock();
            if req.leader_epoch < state.observed_epoch {
                return Err(Status::failed_precondition("old epoch"));
            }
        }
        self.runtime.set_draining(req.enable);
        tracing::info!(enable = req.enable, "Drain toggled");
        Ok(Response::new(DrainResponse {
            draining: req.enable,
        }))
    }

    async fn confirm_continuation(
        &self,
        request: Request<ConfirmContinuationRequest>,
    ) -> Result<Response<ConfirmContinuationResponse>, Status> {
        let req = request.into_inner();

        let (role, observed_epoch) = {
            let state = self.runtime.lock();
            (state.role, state.observed_epoch)
        };
        if !matches!(role, Role::Leader | Role::SubLeader) {
            return Err(Status::failed_precondition("not a coordinator"));
        }

        let deny = |message: &str| {
            Ok(Response::new(ConfirmContinuationResponse {
                decision: confirm_continuation_response::Decision::MustAbort.into(),
                message: message.to_string(),
            }))
        };

        let Ok(job_run_id) = Uuid::from_str(req.job_run_id.trim()) else {
            return deny("invalid job_run_id");
        };
        let run = self
            .store
            .get_run(job_run_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        let Some(run) = run else {
            return deny("run not found");
        };

        if run.state != crate::model::RunState::Running {
            return deny(&format!("run is {}", run.state));
        }
        if run.assigned_worker_id.as_deref() != Some(req.worker_id.as_str()) {
            return deny("run reassigned to another worker");
        }
        if run.leader_epoch != Some(req.leader_epoch) {
            return deny("run re-dispatched under a different epoch");
        }
        if req.leader_epoch > observed_epoch {
            // The caller knows a newer epoch than this coordinator; refuse
            // to rule rather than guess.
            return Err(Status::failed_precondition("coordinator behind caller epoch"));
        }

        tracing::info!(
            job_run_id = %job_run_id,
            worker_id = %req.worker_id,
            "Continuation allowed"
        );
        Ok(Response::new(ConfirmContinuationResponse {
            decision: confirm_continuation_response::Decision::AllowContinue.into(),
            message: "still assigned, keep running".to_string(),
        }))
    }

    async fn reload_settings(
        &self,
        request: Request<ReloadSettingsRequest>,
    ) -> Result<Response<ReloadSettingsResponse>, Status> {
        let req = request.into_inner();
        {
            let state = self.runtime.lock();
            if req.leader_epoch < state.observed_epoch {
                return Ok(Response::new(ReloadSettingsResponse {
                    ok: false,
                    message: "old epoch".to_string(),
                    cache_generation: 0,
                }));
            }
        }
        let generation = self.resolver.reload();
        tracing::info!(
            requested_by = %req.requested_by,
            generation,
            "Settings cache reloaded"
        );
        Ok(Response::new(ReloadSettingsResponse {
            ok: true,
            message: "reloaded".to_string(),
            cache_generation: generation,
        }))
    }
}
