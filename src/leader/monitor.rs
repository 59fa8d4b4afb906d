//! Sub-leader liveness monitor.
//!
//! While this worker holds the sub-leader role it watches the leader's
//! `last_seen` marker. A stale marker triggers a direct Ping with a short
//! deadline; repeated probe failures set the degrade flag on the leader's
//! directory entry and attempt the leader lease. The epoch bump on
//! promotion happens inside the coordinator's acquisition path, so a
//! promoted sub-leader can never issue commands under the old epoch.

use std::sync::Arc;

use crate::coord::{keys, CoordinationStore, Role};
use crate::error::Result;
use crate::rpc::ControlPlane;
use crate::settings::EngineSettings;

/// Probe failures tolerated before the leader is declared degraded.
const PROBE_FAILURE_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    LeaderHealthy,
    LeaderStaleButResponsive,
    ProbeFailed(u32),
    LeaderDegraded,
}

pub struct SubLeaderMonitor {
    coord: Arc<dyn CoordinationStore>,
    control: Arc<dyn ControlPlane>,
    probe_failures: u32,
}

impl SubLeaderMonitor {
    pub fn new(coord: Arc<dyn CoordinationStore>, control: Arc<dyn ControlPlane>) -> Self {
        Self {
            coord,
            control,
            probe_failures: 0,
        }
    }

    /// One monitoring pass. `observed_epoch` is this worker's latest view of
    /// the cluster epoch, carried on the probe for the leader's own fencing.
    pub async fn check(
        &mut self,
        settings: &EngineSettings,
        observed_epoch: i64,
        now_unix_ms: i64,
    ) -> Result<MonitorOutcome> {
        let last_seen: Option<i64> = self
            .coord
            .get(&keys::leader_last_seen())
            .await?
            .and_then(|raw| raw.parse().ok());

        let stale = match last_seen {
            Some(ts) => now_unix_ms - ts > settings.leader_stale_seconds * 1000,
            // No marker yet: a brand-new cluster, not a stalled leader.
            None => false,
        };
        if !stale {
            self.probe_failures = 0;
            return Ok(MonitorOutcome::LeaderHealthy);
        }

        let Some(leader_id) = self.coord.get(&keys::leader_lock()).await? else {
            // Lease already expired; the election tick will take it.
            self.probe_failures = 0;
            return Ok(MonitorOutcome::LeaderHealthy);
        };
        let leader_entry = self
            .coord
            .scan_workers()
            .await?
            .into_iter()
            .find(|w| w.worker_id == leader_id);

        let reachable = match leader_entry {
            Some(entry) => self
                .control
                .ping(&entry.rpc_target(), Role::SubLeader, observed_epoch)
                .await
                .is_ok(),
            None => false,
        };

        if reachable {
            self.probe_failures = 0;
            return Ok(MonitorOutcome::LeaderStaleButResponsive);
        }

        self.probe_failures += 1;
        if self.probe_failures < PROBE_FAILURE_THRESHOLD {
            return Ok(MonitorOutcome::ProbeFailed(self.probe_failures));
        }

        tracing::warn!(
            leader_id = %leader_id,
            failures = self.probe_failures,
            "Leader unreachable; setting degrade flag"
        );
        self.coord.set_flag(&keys::degrade(&leader_id)).await?;
        self.probe_failures = 0;
        Ok(MonitorOutcome::LeaderDegraded)
    }
}
