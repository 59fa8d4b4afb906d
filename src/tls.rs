//! TLS material for the mutually authenticated control plane.
//!
//! Every worker carries the same three PEM files, conventionally laid out
//! as a bundle directory (`ca.pem`, `worker.pem`, `worker.key`) that the
//! deployment mounts identically on each host; explicit per-file paths
//! override the convention. All certificates are issued by the shared
//! cluster CA for the single [`CLUSTER_DOMAIN`] name, because workers dial
//! each other by IP and port taken from the directory, never by hostname:
//! trust rests on the CA plus the pinned cluster name, not per-host
//! identities.

use std::path::PathBuf;

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

/// DNS name every control-plane certificate is issued for.
pub const CLUSTER_DOMAIN: &str = "taskherd-cluster";

const CA_BUNDLE_FILE: &str = "ca.pem";
const CERT_BUNDLE_FILE: &str = "worker.pem";
const KEY_BUNDLE_FILE: &str = "worker.key";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS {0} not configured; set --tls-dir or the explicit path flag")]
    Missing(&'static str),

    #[error("failed to read TLS {kind} at {path}: {source}")]
    Unreadable {
        kind: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Loaded TLS materials ready for use with tonic.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

impl TlsIdentity {
    /// Load the worker's identity and the cluster CA, resolving each file
    /// through the explicit path first and the bundle directory second.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca_pem = read_material(config, "CA certificate", &config.ca_cert_path, CA_BUNDLE_FILE)
            .await?;
        let cert_pem =
            read_material(config, "worker certificate", &config.cert_path, CERT_BUNDLE_FILE)
                .await?;
        let key_pem =
            read_material(config, "private key", &config.key_path, KEY_BUNDLE_FILE).await?;

        Ok(Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
        })
    }

    /// Server side of the handshake: present this worker's certificate and
    /// require the peer to present one signed by the cluster CA.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    /// Client side: present this worker's certificate and verify the peer
    /// against the cluster CA under the pinned [`CLUSTER_DOMAIN`] name.
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(CLUSTER_DOMAIN)
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}

/// Resolve where one piece of TLS material lives. The explicit flag wins;
/// otherwise the conventional file name inside the bundle directory.
fn material_path(
    config: &TlsConfig,
    explicit: &Option<PathBuf>,
    bundle_file: &str,
) -> Option<PathBuf> {
    explicit.clone().or_else(|| {
        config
            .bundle_dir
            .as_ref()
            .map(|dir: &PathBuf| dir.join(bundle_file))
    })
}

async fn read_material(
    config: &TlsConfig,
    kind: &'static str,
    explicit: &Option<PathBuf>,
    bundle_file: &str,
) -> Result<Vec<u8>, TlsError> {
    let path = material_path(config, explicit, bundle_file).ok_or(TlsError::Missing(kind))?;
    fs::read(&path).await.map_err(|source| TlsError::Unreadable {
        kind,
        path,
        source,
    })
}
