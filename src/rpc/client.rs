//! Outbound control-plane client.
//!
//! Channels are built per call: control traffic is sparse, targets churn as
//! workers come and go, and a cached broken channel is worse than a fresh
//! connect. Every call carries a deadline; a timeout surfaces as a
//! transport-style error the caller counts toward unreachability.

use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};

use super::ControlPlane;
use crate::coord::Role;
use crate::error::{Result, TaskherdError};
use crate::proto;
use crate::proto::worker_control_client::WorkerControlClient;
use crate::tls::TlsIdentity;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const PROBE_DEADLINE: Duration = Duration::from_millis(500);
const COMMAND_DEADLINE: Duration = Duration::from_secs(1);

pub struct GrpcControlPlane {
    tls: Option<TlsIdentity>,
}

impl GrpcControlPlane {
    pub fn new(tls: Option<TlsIdentity>) -> Self {
        Self { tls }
    }

    async fn connect(&self, target: &str) -> Result<WorkerControlClient<Channel>> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{target}"))
            .map_err(TaskherdError::Transport)?
            .connect_timeout(CONNECT_TIMEOUT);
        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.client_tls_config())
                .map_err(TaskherdError::Transport)?;
        }
        let channel = endpoint.connect().await?;
        Ok(WorkerControlClient::new(channel))
    }
}

async fn with_deadline<T>(
    deadline: Duration,
    call: impl std::future::Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, call).await {
        Ok(Ok(response)) => Ok(response.into_inner()),
        Ok(Err(status)) => Err(TaskherdError::Grpc(status)),
        Err(_) => Err(TaskherdError::Grpc(tonic::Status::deadline_exceeded(
            "rpc deadline exceeded",
        ))),
    }
}

#[async_trait]
impl ControlPlane for GrpcControlPlane {
    async fn ping(
        &self,
        target: &str,
        caller_role: Role,
        leader_epoch: i64,
    ) -> Result<proto::PingResponse> {
        let mut client = self.connect(target).await?;
        with_deadline(
            PROBE_DEADLINE,
            client.ping(proto::PingRequest {
                caller_role: caller_role.to_string(),
                leader_epoch,
            }),
        )
        .await
    }

    async fn get_status(
        &self,
        target: &str,
        leader_epoch: i64,
    ) -> Result<proto::GetStatusResponse> {
        let mut client = self.connect(target).await?;
        with_deadline(
            PROBE_DEADLINE,
            client.get_status(proto::GetStatusRequest { leader_epoch }),
        )
        .await
    }

    async fn start_job(
        &self,
        target: &str,
        request: proto::StartJobRequest,
    ) -> Result<proto::StartJobResponse> {
        let mut client = self.connect(target).await?;
        with_deadline(COMMAND_DEADLINE, client.start_job(request)).await
    }

    async fn cancel_job(
        &self,
        target: &str,
        request: proto::CancelJobRequest,
    ) -> Result<proto::CancelJobResponse> {
        let mut client = self.connect(target).await?;
        with_deadline(COMMAND_DEADLINE, client.cancel_job(request)).await
    }

    async fn drain(
        &self,
        target: &str,
        leader_epoch: i64,
        enable: bool,
    ) -> Result<proto::DrainResponse> {
        let mut client = self.connect(target).await?;
        with_deadline(
            COMMAND_DEADLINE,
            client.drain(proto::DrainRequest {
                leader_epoch,
                enable,
            }),
        )
        .await
    }

    async fn confirm_continuation(
        &self,
        target: &str,
        request: proto::ConfirmContinuationRequest,
    ) -> Result<proto::ConfirmContinuationResponse> {
        let mut client = self.connect(target).await?;
        with_deadline(COMMAND_DEADLINE, client.confirm_continuation(request)).await
    }

    async fn reload_settings(
        &self,
        target: &str,
        leader_epoch: i64,
        requested_by: &str,
    ) -> Result<proto::ReloadSettingsResponse> {
        let mut client = self.connect(target).await?;
        with_deadline(
            COMMAND_DEADLINE,
            client.reload_settings(proto::ReloadSettingsRequest {
                leader_epoch,
                requested_by: requested_by.to_string(),
            }),
        )
        .await
    }
}
