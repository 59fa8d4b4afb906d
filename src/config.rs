use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;

use crate::error::{Result, TaskherdError};

/// Static per-process configuration. Tunables that may change at runtime
/// (tick periods, TTLs, assignment knobs) live in the settings resolver
/// instead; this struct only carries identity and endpoints.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable host identity (one per machine; the sub-leader lease is keyed
    /// by node id so leader and sub-leader prefer different hosts).
    pub node_id: String,
    pub redis_url: String,
    pub database_url: String,
    pub rpc_host: String,
    /// Fixed RPC port, or 0 to probe `rpc_port_range`.
    pub rpc_port: u16,
    pub rpc_port_range: PortRange,
    /// HTTP ingestion/status API; disabled when None.
    pub http_addr: Option<SocketAddr>,
    pub tls: TlsConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_url: "sqlite://taskherd.db".to_string(),
            rpc_host: "127.0.0.1".to_string(),
            rpc_port: 0,
            rpc_port_range: PortRange::default(),
            http_addr: None,
            tls: TlsConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Resolve the RPC bind port: the explicit port if given, otherwise the
    /// first free port in the configured range.
    pub fn resolve_rpc_port(&self) -> Result<u16> {
        if self.rpc_port > 0 {
            return Ok(self.rpc_port);
        }
        self.rpc_port_range.find_available(&self.rpc_host)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 50051,
            end: 50150,
        }
    }
}

impl PortRange {
    /// Find a free TCP port by attempting to bind within [start, end].
    /// Best-effort: the port is released again and re-bound by the caller,
    /// so a race with another process remains possible.
    pub fn find_available(&self, host: &str) -> Result<u16> {
        if self.end < self.start {
            return Err(TaskherdError::Internal(format!(
                "invalid port range {}-{}",
                self.start, self.end
            )));
        }
        let bind_host = if host.is_empty() { "127.0.0.1" } else { host };
        for port in self.start..=self.end {
            if TcpListener::bind((bind_host, port)).is_ok() {
                return Ok(port);
            }
        }
        Err(TaskherdError::Internal(format!(
            "no available port in range {}-{} for host {}",
            self.start, self.end, bind_host
        )))
    }
}

/// TLS material locations for mutually authenticated RPC. Deployments
/// usually mount one bundle directory (`ca.pem`, `worker.pem`,
/// `worker.key`) on every host; the explicit per-file paths exist for
/// setups that cannot follow the convention and override it file by file.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub bundle_dir: Option<PathBuf>,
    pub ca_cert_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    /// Whether every piece of material has somewhere to come from: the
    /// bundle directory covers anything not explicitly overridden.
    pub fn is_complete(&self) -> bool {
        if !self.enabled {
            return false;
        }
        self.bundle_dir.is_some()
            || (self.ca_cert_path.is_some() && self.cert_path.is_some() && self.key_path.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_available_port_in_range() {
        let range = PortRange {
            start: 51800,
            end: 51900,
        };
        let port = range.find_available("127.0.0.1").unwrap();
        assert!((51800..=51900).contains(&port));
    }

    #[test]
    fn invalid_range_rejected() {
        let range = PortRange {
            start: 100,
            end: 50,
        };
        assert!(range.find_available("127.0.0.1").is_err());
    }

    #[test]
    fn tls_bundle_dir_alone_is_complete() {
        let mut config = TlsConfig::default();
        assert!(!config.is_complete());

        config.enabled = true;
        assert!(!config.is_complete());

        config.bundle_dir = Some(PathBuf::from("/etc/taskherd/tls"));
        assert!(config.is_complete());
    }

    #[test]
    fn tls_explicit_paths_need_all_three() {
        let mut config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/tmp/ca.pem")),
            cert_path: Some(PathBuf::from("/tmp/worker.pem")),
            ..Default::default()
        };
        assert!(!config.is_complete());

        config.key_path = Some(PathBuf::from("/tmp/worker.key"));
        assert!(config.is_complete());
    }
}
