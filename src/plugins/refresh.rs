//! Runtime address refresh.
//!
//! Containers get new addresses when they are recreated. This records each
//! instance's current address as its `external_baseurl` and repoints every
//! peer's server registration at it. Only `Server.url` is touched; authkeys
//! and sharing groups stay as they are.

use crate::core::error::FleetError;
use crate::core::journal::Journal;
use crate::core::registry::{self, Registry};
use crate::core::topology::TopologyConfig;
use crate::plugins::container::ContainerRuntime;
use crate::plugins::provision;
use crate::plugins::trust;
use crate::platform::{Connector, Server};
use serde::Serialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct Moved {
    pub instance: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Repointed {
    /// Instance holding the registration.
    pub on: String,
    pub server: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub moved: Vec<Moved>,
    pub repointed: Vec<Repointed>,
}

/// Record every instance's current runtime address.
pub fn refresh_external_baseurls(
    registry: &mut Registry,
    runtime: &dyn ContainerRuntime,
    connector: &dyn Connector,
    topology: &TopologyConfig,
    journal: &Journal,
) -> Result<Vec<Moved>, FleetError> {
    let mut moved = Vec::new();
    for instance in registry.all_mut() {
        let address = runtime.address(instance, &topology.internal_network_name)?;
        let url = topology.url_for_address(&address);
        if instance.config.external_baseurl == url {
            continue;
        }
        let from = std::mem::replace(&mut instance.config.external_baseurl, url.clone());
        registry::persist(instance)?;
        let api = provision::admin_session(instance, connector)?;
        api.set_server_setting("MISP.external_baseurl", &json!(url))?;
        journal.record(
            "refresh.address",
            &instance.name,
            "moved",
            json!({ "from": from, "to": url }),
        )?;
        info!(instance = %instance.name, %from, to = %url, "external baseurl changed");
        moved.push(Moved {
            instance: instance.name.clone(),
            from,
            to: url,
        });
    }
    Ok(moved)
}

/// Point every server registration at its peer's recorded address.
///
/// Registrations are matched to peers by name; ones that name no known
/// instance are left alone.
pub fn repoint_servers(
    registry: &Registry,
    connector: &dyn Connector,
    journal: &Journal,
) -> Result<Vec<Repointed>, FleetError> {
    let mut repointed = Vec::new();
    for instance in registry.all() {
        let api = provision::admin_session(instance, connector)?;
        for server in api.servers()? {
            let Some(peer) = trust::peer_orgname(&server.name).and_then(|org| registry.find(org))
            else {
                continue;
            };
            let url = peer.config.peer_url().to_string();
            if server.url == url {
                continue;
            }
            api.update_server(&Server {
                url: url.clone(),
                authkey: None,
                ..server.clone()
            })?;
            journal.record(
                "refresh.server",
                &instance.name,
                "repointed",
                json!({ "server": server.name, "from": server.url, "to": url }),
            )?;
            repointed.push(Repointed {
                on: instance.name.clone(),
                server: server.name,
                url,
            });
        }
    }
    Ok(repointed)
}

pub fn refresh(
    registry: &mut Registry,
    runtime: &dyn ContainerRuntime,
    connector: &dyn Connector,
    topology: &TopologyConfig,
    journal: &Journal,
) -> Result<RefreshReport, FleetError> {
    let moved = refresh_external_baseurls(registry, runtime, connector, topology, journal)?;
    let repointed = repoint_servers(registry, connector, journal)?;
    Ok(RefreshReport { moved, repointed })
}
