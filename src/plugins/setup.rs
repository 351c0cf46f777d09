//! End-to-end topology setup: identities, tag catalogs, then every sync link.
//!
//! Central is provisioned first since every link involves it. A failure on
//! one instance (or one pair) is recorded and the run moves on; only errors
//! that make the whole fleet unusable (config, I/O) abort.

use crate::core::error::FleetError;
use crate::core::journal::Journal;
use crate::core::registry::{Instance, Registry};
use crate::core::topology::TopologyConfig;
use crate::plugins::provision::{self, InstanceHandle, ProvisionOptions};
use crate::plugins::tags;
use crate::plugins::trust::{self, Direction, LinkReport, NegotiateOptions};
use crate::platform::Connector;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, Default)]
pub struct SetupOptions {
    pub provision: ProvisionOptions,
    pub negotiate: NegotiateOptions,
    /// Link every client pair directly as well.
    pub mesh: bool,
    /// Stop after identities and tags.
    pub skip_links: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub scope: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SetupReport {
    pub provisioned: Vec<String>,
    pub links: Vec<LinkReport>,
    pub failures: Vec<Failure>,
}

impl SetupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, journal: &Journal, scope: &str, err: &FleetError) -> Result<(), FleetError> {
        error!(scope, error = %err, "setup step failed");
        journal.record("setup.failure", scope, "error", json!({ "error": err.to_string() }))?;
        self.failures.push(Failure {
            scope: scope.to_string(),
            error: err.to_string(),
        });
        Ok(())
    }
}

/// Planned links as `(local, remote, direction)`.
pub fn plan_links(registry: &Registry, mesh: bool) -> Vec<(String, String, Direction)> {
    let central = &registry.central.name;
    let mut links = Vec::new();
    for client in &registry.clients {
        links.push((client.name.clone(), central.clone(), Direction::CentralToNode));
        links.push((central.clone(), client.name.clone(), Direction::NodeToCentral));
    }
    if mesh {
        for a in &registry.clients {
            for b in &registry.clients {
                if a.name != b.name {
                    links.push((a.name.clone(), b.name.clone(), Direction::Mesh));
                }
            }
        }
    }
    links
}

fn provision_one(
    instance: &mut Instance,
    connector: &dyn Connector,
    topology: &TopologyConfig,
    journal: &Journal,
    opts: ProvisionOptions,
) -> Result<InstanceHandle, FleetError> {
    let handle = provision::ensure_identity(instance, connector, topology, journal, opts)?;
    tags::ensure_tags(&handle, &topology.tags)?;
    Ok(handle)
}

/// Provision every instance and converge every planned link.
pub fn run_setup(
    registry: &mut Registry,
    connector: &dyn Connector,
    topology: &TopologyConfig,
    journal: &Journal,
    opts: SetupOptions,
) -> Result<SetupReport, FleetError> {
    let mut report = SetupReport::default();
    let mut handles: BTreeMap<String, InstanceHandle> = BTreeMap::new();

    for instance in registry.all_mut() {
        match provision_one(instance, connector, topology, journal, opts.provision) {
            Ok(handle) => {
                report.provisioned.push(handle.name.clone());
                handles.insert(handle.name.clone(), handle);
            }
            Err(e) if e.is_scoped() => report.fail(journal, &instance.name, &e)?,
            Err(e) => return Err(e),
        }
    }
    if opts.skip_links {
        return Ok(report);
    }

    for (local, remote, direction) in plan_links(registry, opts.mesh) {
        let scope = format!("{}->{}", local, remote);
        let (Some(l), Some(r)) = (handles.get(&local), handles.get(&remote)) else {
            let skipped = FleetError::NotFound(format!("{} skipped: peer not provisioned", scope));
            report.fail(journal, &scope, &skipped)?;
            continue;
        };
        match trust::negotiate(l, r, direction, connector, topology, journal, opts.negotiate) {
            Ok(link) => report.links.push(link),
            Err(e) if e.is_scoped() => report.fail(journal, &scope, &e)?,
            Err(e) => return Err(e),
        }
    }

    info!(
        provisioned = report.provisioned.len(),
        links = report.links.len(),
        failures = report.failures.len(),
        "setup finished"
    );
    Ok(report)
}
