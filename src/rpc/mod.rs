//! Control-plane RPC: the contract between the leader (or sub-leader) and
//! workers.
//!
//! [`ControlPlane`] abstracts the outbound side so the leader tick and the
//! continuation protocol can be exercised against a fake in tests; the gRPC
//! implementation connects per call with short deadlines, matching the
//! "treat every call as failable and bounded" posture of the rest of the
//! engine.

pub mod client;
pub mod server;
pub mod service;

use async_trait::async_trait;

use crate::coord::Role;
use crate::error::Result;
use crate::proto;

pub use client::GrpcControlPlane;
pub use server::RpcServer;
pub use service::WorkerControlService;

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn ping(
        &self,
        target: &str,
        caller_role: Role,
        leader_epoch: i64,
    ) -> Result<proto::PingResponse>;

    async fn get_status(&self, target: &str, leader_epoch: i64)
        -> Result<proto::GetStatusResponse>;

    async fn start_job(
        &self,
        target: &str,
        request: proto::StartJobRequest,
    ) -> Result<proto::StartJobResponse>;

    async fn cancel_job(
        &self,
        target: &str,
        request: proto::CancelJobRequest,
    ) -> Result<proto::CancelJobResponse>;

    async fn drain(
        &self,
        target: &str,
        leader_epoch: i64,
        enable: bool,
    ) -> Result<proto::DrainResponse>;

    async fn confirm_continuation(
        &self,
        target: &str,
        request: proto::ConfirmContinuationRequest,
    ) -> Result<proto::ConfirmContinuationResponse>;

    async fn reload_settings(
        &self,
        target: &str,
        leader_epoch: i64,
        requested_by: &str,
    ) -> Result<proto::ReloadSettingsResponse>;
}
