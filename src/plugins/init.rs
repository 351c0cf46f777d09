//! Fleet initialisation: one directory and config record per instance.

use crate::core::error::FleetError;
use crate::core::journal::Journal;
use crate::core::registry::{self, Instance, InstanceConfig, NodeRole};
use crate::core::secrets;
use crate::core::topology::TopologyConfig;
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub created: Vec<String>,
    /// Instances whose config record already existed and was left alone.
    pub kept: Vec<String>,
    pub hosts: Vec<String>,
}

/// `/etc/hosts` line for an instance.
pub fn hosts_entry(hostname: &str) -> String {
    format!("127.0.0.1\t{}", hostname)
}

/// Write config records for central plus `clients` clients under `root`.
/// Existing records are never overwritten.
pub fn init_fleet(
    root: &Path,
    topology: &TopologyConfig,
    journal: &Journal,
    clients: u32,
) -> Result<InitReport, FleetError> {
    topology.validate()?;
    let mut report = InitReport {
        created: Vec::new(),
        kept: Vec::new(),
        hosts: Vec::new(),
    };
    for id in 0..=clients {
        let identity = topology.derive_identity(id, clients);
        report.hosts.push(hosts_entry(&identity.hostname));
        let dir = root.join(&identity.dir_name);
        let instance = Instance {
            instance_id: id,
            name: identity.dir_name.clone(),
            role: if id == 0 {
                NodeRole::Central
            } else {
                NodeRole::Client
            },
            config: InstanceConfig::from_identity(&identity, secrets::random_admin_key()),
            dir,
        };
        if instance.config_path().exists() {
            report.kept.push(instance.name);
            continue;
        }
        registry::persist(&instance)?;
        journal.record("init.instance", &instance.name, "created", json!({ "hostname": identity.hostname }))?;
        report.created.push(instance.name);
    }
    info!(created = report.created.len(), kept = report.kept.len(), "fleet initialised");
    Ok(report)
}
