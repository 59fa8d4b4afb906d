//! Continuation-under-detach protocol, worker side.
//!
//! A detached worker that is still mid-run marks the run CONFIRMING and
//! asks the coordinators whether it may finish. The leader is asked first,
//! then any sub-leader, for a bounded number of rounds. Silence counts as
//! denial: when every attempt fails the run is aborted rather than left
//! racing a reassignment.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::coord::{keys, CoordinationStore, Role};
use crate::error::Result;
use crate::proto::{confirm_continuation_response, ConfirmContinuationRequest};
use crate::rpc::ControlPlane;
use crate::store::RunStore;

#[derive(Debug, Clone, Copy)]
pub struct ContinuationConfig {
    pub retry_count: u32,
    pub retry_interval: Duration,
    pub confirm_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationVerdict {
    Continue,
    Abort,
}

/// Coordinator RPC targets: the current leader first, then sub-leaders by
/// freshest heartbeat.
pub async fn coordinator_targets(store: &Arc<dyn CoordinationStore>) -> Result<Vec<String>> {
    let leader_id = store.get(&keys::leader_lock()).await?;
    let workers = store.scan_workers().await?;
    let mut targets = Vec::new();
    if let Some(leader_id) = leader_id {
        if let Some(leader) = workers.iter().find(|w| w.worker_id == leader_id) {
            targets.push(leader.rpc_target());
        }
    }
    for worker in &workers {
        if worker.role == Role::SubLeader && !targets.contains(&worker.rpc_target()) {
            targets.push(worker.rpc_target());
        }
    }
    Ok(targets)
}

/// Run the confirm protocol for the current run of a freshly detached
/// worker. Returns the verdict; the caller fires the matching token.
pub async fn confirm_or_abort(
    run_store: &RunStore,
    coord: &Arc<dyn CoordinationStore>,
    control: &Arc<dyn ControlPlane>,
    worker_id: &str,
    job_run_id: Uuid,
    dispatch_epoch: i64,
    config: ContinuationConfig,
) -> Result<ContinuationVerdict> {
    let now = Utc::now();
    let deadline = now + chrono::Duration::seconds(config.confirm_seconds);
    let entered = run_store
        .begin_confirming(job_run_id, deadline, "confirming: worker detached", now)
        .await?;
    if !entered {
        // Already CONFIRMING (leader-side reconcile beat us) or no longer
        // RUNNING; in the latter case the verdict below resolves it.
        tracing::debug!(job_run_id = %job_run_id, "Continuation sub-state already set");
    }

    for attempt in 0..config.retry_count.max(1) {
        let targets = coordinator_targets(coord).await.unwrap_or_default();
        for target in &targets {
            let request = ConfirmContinuationRequest {
                worker_id: worker_id.to_string(),
                job_run_id: job_run_id.to_string(),
                leader_epoch: dispatch_epoch,
            };
            match control.confirm_continuation(target, request).await {
                Ok(response) => {
                    match confirm_continuation_response::Decision::try_from(response.decision) {
                        Ok(confirm_continuation_response::Decision::AllowContinue) => {
                            run_store.clear_confirming(job_run_id, Utc::now()).await?;
                            tracing::info!(
                                job_run_id = %job_run_id,
                                target = %target,
                                "Continuation allowed, keeping run"
                            );
                            return Ok(ContinuationVerdict::Continue);
                        }
                        Ok(confirm_continuation_response::Decision::MustAbort) => {
                            tracing::warn!(
                                job_run_id = %job_run_id,
                                target = %target,
                                message = %response.message,
                                "Continuation denied"
                            );
                            return Ok(ContinuationVerdict::Abort);
                        }
                        _ => {
                            tracing::debug!(job_run_id = %job_run_id, target = %target, "No verdict");
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        job_run_id = %job_run_id,
                        target = %target,
                        attempt,
                        error = %e,
                        "Continuation probe failed"
                    );
                }
            }
        }
        if attempt + 1 < config.retry_count.max(1) {
            tokio::time::sleep(config.retry_interval).await;
        }
    }

    tracing::warn!(job_run_id = %job_run_id, "Continuation attempts exhausted, aborting run");
    Ok(ContinuationVerdict::Abort)
}
