//! Scheduled push trigger, guarded by the advisory lock.

use crate::core::error::FleetError;
use crate::core::journal::Journal;
use crate::core::lock::{self, LockState};
use crate::core::registry::Registry;
use crate::core::topology::TopologyConfig;
use crate::plugins::provision;
use crate::platform::{Connector, require_id};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PushOutcome {
    Triggered { servers: usize },
    /// Another trigger holds the lock.
    Skipped { holder_pid: u32 },
}

/// Trigger a full push on every server registration of every instance.
///
/// Contention on the lock is not an error: the run is skipped.
pub fn trigger_push_all(
    registry: &Registry,
    connector: &dyn Connector,
    topology: &TopologyConfig,
    journal: &Journal,
) -> Result<PushOutcome, FleetError> {
    let lock_path = topology.lock_path(&registry.root);
    let _guard = match lock::acquire(&lock_path, topology.lock.max_age_secs) {
        Ok(guard) => guard,
        Err(FleetError::LockContention { pid, .. }) => {
            warn!(pid, path = %lock_path.display(), "push already running, skipping");
            journal.record("push.trigger", "fleet", "skipped", json!({ "holder_pid": pid }))?;
            return Ok(PushOutcome::Skipped { holder_pid: pid });
        }
        Err(e) => return Err(e),
    };

    let mut servers = 0;
    for instance in registry.all() {
        let api = provision::bootstrap_session(instance, connector)?;
        for server in api.servers()? {
            api.push_server(require_id(server.id, &server.name)?)?;
            servers += 1;
        }
        info!(instance = %instance.name, "push triggered");
    }
    journal.record("push.trigger", "fleet", "success", json!({ "servers": servers }))?;
    Ok(PushOutcome::Triggered { servers })
}

/// Current lock state, reclaiming a stale lock.
pub fn lock_status(path: &Path, max_age_secs: u64) -> Result<LockState, FleetError> {
    lock::inspect(path, max_age_secs)
}
