use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use super::WorkerControlService;
use crate::error::Result;
use crate::proto::worker_control_server::WorkerControlServer;
use crate::tls::TlsIdentity;

pub struct RpcServer {
    addr: SocketAddr,
    tls: Option<TlsIdentity>,
}

impl RpcServer {
    pub fn new(addr: SocketAddr, tls: Option<TlsIdentity>) -> Self {
        Self { addr, tls }
    }

    /// Serve the worker control plane until the shutdown token fires.
    pub async fn run(
        self,
        service: WorkerControlService,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut builder = tonic::transport::Server::builder();
        if let Some(tls) = &self.tls {
            builder = builder.tls_config(tls.server_tls_config())?;
            tracing::info!(addr = %self.addr, "Starting RPC server (mTLS)");
        } else {
            tracing::info!(addr = %self.addr, "Starting RPC server (plaintext)");
        }

        builder
            .add_service(WorkerControlServer::new(service))
            .serve_with_shutdown(self.addr, shutdown.cancelled())
            .await?;
        Ok(())
    }
}
