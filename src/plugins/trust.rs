//! Trust negotiation between two provisioned instances.
//!
//! `negotiate(local, remote, direction)` makes `local` hold a working server
//! registration for `remote`: a proxy organisation and a sync user are set up
//! on the remote side, the remote's connection parameters are imported on the
//! local side, and replication rules plus a sharing group are put in place.
//!
//! Each pair walks through [`NegotiationState`] in order; every transition is
//! journaled so a failed run shows how far the pair got.

use crate::core::error::FleetError;
use crate::core::journal::Journal;
use crate::core::topology::{TagCatalog, TopologyConfig};
use crate::plugins::provision::{self, InstanceHandle};
use crate::platform::{
    Connector, Organisation, Role, Server, ServerTestStatus, SharingGroup, SyncConfig, Tag,
};
use crate::platform::require_id;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use tracing::{info, instrument, warn};

/// Which way events flow into `local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// `local` is a client and pulls from central as well as pushing to it.
    CentralToNode,
    /// `local` is central and pushes down to a client.
    NodeToCentral,
    /// Client to client, push only.
    Mesh,
}

impl Direction {
    pub fn pull_enabled(self) -> bool {
        self == Direction::CentralToNode
    }

    /// Tags whose events `local` pushes to the remote.
    pub fn push_tags(self, catalog: &TagCatalog) -> &[String] {
        match self {
            Direction::CentralToNode | Direction::Mesh => &catalog.nodes_to_central,
            Direction::NodeToCentral => &catalog.central_to_nodes,
        }
    }

    /// Tags whose events `local` pulls from the remote.
    pub fn pull_tags(self, catalog: &TagCatalog) -> &[String] {
        match self {
            Direction::CentralToNode => &catalog.central_to_nodes,
            Direction::NodeToCentral | Direction::Mesh => &catalog.nodes_to_central,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::CentralToNode => "central_to_node",
            Direction::NodeToCentral => "node_to_central",
            Direction::Mesh => "mesh",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NegotiationState {
    Uninitialized,
    ProxyOrgReady,
    SyncUserReady,
    ServerRegistered,
    ConnectivityVerified,
    RulesApplied,
    SharingGroupBound,
}

impl NegotiationState {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Uninitialized => "uninitialized",
            NegotiationState::ProxyOrgReady => "proxy_org_ready",
            NegotiationState::SyncUserReady => "sync_user_ready",
            NegotiationState::ServerRegistered => "server_registered",
            NegotiationState::ConnectivityVerified => "connectivity_verified",
            NegotiationState::RulesApplied => "rules_applied",
            NegotiationState::SharingGroupBound => "sharing_group_bound",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == NegotiationState::SharingGroupBound
    }
}

/// OR/NOT filter over one dimension of a rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter<T> {
    #[serde(rename = "OR")]
    pub or: Vec<T>,
    #[serde(rename = "NOT")]
    pub not: Vec<T>,
}

impl<T> Filter<T> {
    pub fn any_of(or: Vec<T>) -> Self {
        Self { or, not: Vec::new() }
    }

    pub fn empty() -> Self {
        Self::any_of(Vec::new())
    }
}

/// Push filter: tags are referenced by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRules {
    pub tags: Filter<u64>,
    pub orgs: Filter<u64>,
}

/// Pull filter: tags are referenced by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRules {
    pub tags: Filter<String>,
    pub orgs: Filter<u64>,
    pub url_params: String,
}

impl PushRules {
    pub fn for_tags(tag_ids: Vec<u64>) -> Self {
        Self {
            tags: Filter::any_of(tag_ids),
            orgs: Filter::empty(),
        }
    }
}

impl PullRules {
    pub fn for_tags(tag_names: Vec<String>) -> Self {
        Self {
            tags: Filter::any_of(tag_names),
            orgs: Filter::empty(),
            url_params: String::new(),
        }
    }
}

pub fn server_name(remote_orgname: &str) -> String {
    format!("Sync with {}", remote_orgname)
}

/// Inverse of [`server_name`].
pub fn peer_orgname(server_name: &str) -> Option<&str> {
    server_name.strip_prefix("Sync with ")
}

pub fn sharing_group_name(remote_orgname: &str) -> String {
    format!("{} exchange", remote_orgname)
}

pub fn sync_user_email(local_hostname: &str) -> String {
    format!("sync_user@{}", local_hostname)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiateOptions {
    /// Mint a fresh sync key even when a registration already exists.
    pub rotate_sync_keys: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub local: String,
    pub remote: String,
    pub direction: Direction,
    pub state: NegotiationState,
    pub server_id: u64,
    pub sharing_group_id: u64,
    pub minted_sync_key: bool,
    pub sharing_group_created: bool,
    /// Server fields changed on this run.
    pub changed: Vec<String>,
}

struct Negotiation<'a> {
    local: &'a InstanceHandle,
    remote: &'a InstanceHandle,
    direction: Direction,
    journal: &'a Journal,
    state: NegotiationState,
}

impl Negotiation<'_> {
    fn subject(&self) -> String {
        format!("{}->{}", self.local.name, self.remote.name)
    }

    fn advance(&mut self, next: NegotiationState) -> Result<(), FleetError> {
        self.state = next;
        self.journal.record(
            "negotiate.transition",
            &self.subject(),
            next.as_str(),
            json!({ "direction": self.direction }),
        )
    }
}

fn tags_by_name<'t>(
    instance: &str,
    tags: &'t [Tag],
    names: &[String],
) -> Result<Vec<&'t Tag>, FleetError> {
    names
        .iter()
        .map(|name| {
            tags.iter()
                .find(|t| &t.name == name)
                .ok_or_else(|| FleetError::NotFound(format!("tag '{}' on {}", name, instance)))
        })
        .collect()
}

fn diff_fields(current: &Server, desired: &Server) -> Vec<String> {
    let mut changed = Vec::new();
    if current.url != desired.url {
        changed.push("url".to_string());
    }
    if desired.authkey.is_some() && current.authkey != desired.authkey {
        changed.push("authkey".to_string());
    }
    if current.push != desired.push {
        changed.push("push".to_string());
    }
    if current.pull != desired.pull {
        changed.push("pull".to_string());
    }
    if current.push_rules != desired.push_rules {
        changed.push("push_rules".to_string());
    }
    if current.pull_rules != desired.pull_rules {
        changed.push("pull_rules".to_string());
    }
    if current.unpublish_event != desired.unpublish_event {
        changed.push("unpublish_event".to_string());
    }
    if current.self_signed != desired.self_signed {
        changed.push("self_signed".to_string());
    }
    changed
}

struct SyncAccount<'a> {
    email: &'a str,
    user_id: u64,
}

/// Import or converge `local`'s registration of `remote`. With `mint`, a
/// fresh sync key is issued on the remote and stored in the registration.
fn register_server(
    n: &Negotiation<'_>,
    connector: &dyn Connector,
    topology: &TopologyConfig,
    sync: &SyncAccount<'_>,
    existing: Option<Server>,
    mint: bool,
) -> Result<(Server, Vec<String>), FleetError> {
    let (local, remote) = (n.local, n.remote);
    let name = server_name(&remote.orgname);
    let mut config = if mint {
        let key = remote.api.new_authkey(sync.user_id)?;
        n.journal
            .record("negotiate.sync_key", &n.subject(), "minted", json!({ "email": sync.email }))?;
        let session = connector.connect(&remote.baseurl, &key)?;
        let mut config = session.sync_config()?;
        config.authkey = Some(key);
        config
    } else {
        SyncConfig {
            name: name.clone(),
            url: remote.peer_url.clone(),
            uuid: None,
            authkey: None,
            remote_org: remote.org.clone(),
        }
    };
    config.name = name;
    config.url = remote.peer_url.clone();
    config.remote_org = Organisation {
        id: None,
        ..remote.org.clone()
    };

    let current = match existing {
        Some(server) => server,
        None => local.api.import_server(&config)?,
    };
    let registered = Server {
        url: config.url.clone(),
        authkey: config.authkey.clone(),
        push: true,
        pull: n.direction.pull_enabled(),
        unpublish_event: topology.unpublish_event,
        self_signed: !topology.secure_connection,
        ..current.clone()
    };
    let changed = diff_fields(&current, &registered);
    if changed.is_empty() {
        Ok((current, changed))
    } else {
        Ok((local.api.update_server(&registered)?, changed))
    }
}

/// Add whichever of the local org, the remote org and the server are not yet
/// members of `group`. Returns whether anything was added.
fn bind_members(
    n: &Negotiation<'_>,
    group: &SharingGroup,
    remote_org_id: u64,
    server_id: u64,
) -> Result<bool, FleetError> {
    let group_id = require_id(group.id, &group.name)?;
    let api = n.local.api.as_ref();
    let mut bound = false;
    for org_id in [n.local.org_id()?, remote_org_id] {
        if !group.org_ids.contains(&org_id) {
            api.add_org_to_sharing_group(group_id, org_id)?;
            bound = true;
        }
    }
    if !group.server_ids.contains(&server_id) {
        api.add_server_to_sharing_group(group_id, server_id)?;
        bound = true;
    }
    if bound {
        n.journal.record(
            "negotiate.sharing_group",
            &n.subject(),
            "bound",
            json!({ "group": group.name, "server_id": server_id }),
        )?;
    }
    Ok(bound)
}

/// Establish (or re-converge) `local`'s registration of `remote`.
#[instrument(skip_all, fields(local = %local.name, remote = %remote.name, %direction))]
pub fn negotiate(
    local: &InstanceHandle,
    remote: &InstanceHandle,
    direction: Direction,
    connector: &dyn Connector,
    topology: &TopologyConfig,
    journal: &Journal,
    opts: NegotiateOptions,
) -> Result<LinkReport, FleetError> {
    let mut n = Negotiation {
        local,
        remote,
        direction,
        journal,
        state: NegotiationState::Uninitialized,
    };
    let name = server_name(&remote.orgname);
    let existing = local.api.servers()?.into_iter().find(|s| s.name == name);

    let proxy = provision::ensure_organisation(
        remote.api.as_ref(),
        &remote.name,
        &Organisation::named(&local.orgname).with_uuid(local.org.uuid.clone()),
    )?;
    let proxy_id = require_id(proxy.id, &proxy.name)?;
    n.advance(NegotiationState::ProxyOrgReady)?;

    let sync_email = sync_user_email(&local.hostname);
    let sync_user = provision::ensure_user(
        remote.api.as_ref(),
        &remote.name,
        &sync_email,
        proxy_id,
        Role::SyncUser,
    )?;
    let sync_user_id = require_id(sync_user.id, &sync_email)?;
    n.advance(NegotiationState::SyncUserReady)?;

    let sync = SyncAccount {
        email: &sync_email,
        user_id: sync_user_id,
    };
    let mut minted_sync_key = existing.is_none() || opts.rotate_sync_keys;
    let (mut current, mut changed) =
        register_server(&n, connector, topology, &sync, existing, minted_sync_key)?;
    let server_id = require_id(current.id, &name)?;
    n.advance(NegotiationState::ServerRegistered)?;

    let mut status = local.api.test_server(server_id)?;
    if status == ServerTestStatus::AuthFailed && !minted_sync_key {
        // The remote no longer knows the stored key, e.g. after a rebuild.
        warn!("sync key rejected by remote, minting a new one");
        let (reminted, more) = register_server(&n, connector, topology, &sync, Some(current), true)?;
        current = reminted;
        for field in more {
            if !changed.contains(&field) {
                changed.push(field);
            }
        }
        minted_sync_key = true;
        status = local.api.test_server(server_id)?;
    }
    if !status.is_ok() {
        warn!(%status, "connectivity test failed");
        journal.record(
            "negotiate.test",
            &n.subject(),
            "failed",
            json!({ "status": status.to_string() }),
        )?;
        return Err(FleetError::SyncTestFailed {
            local: local.name.clone(),
            remote: remote.name.clone(),
            status: status.to_string(),
        });
    }
    n.advance(NegotiationState::ConnectivityVerified)?;

    let tags = local.api.tags()?;
    let push_ids = tags_by_name(&local.name, &tags, direction.push_tags(&topology.tags))?
        .into_iter()
        .map(|t| require_id(t.id, &t.name))
        .collect::<Result<Vec<_>, _>>()?;
    let pull_names = tags_by_name(&local.name, &tags, direction.pull_tags(&topology.tags))?
        .into_iter()
        .map(|t| t.name.clone())
        .collect();
    let ruled = Server {
        authkey: None,
        push_rules: serde_json::to_string(&PushRules::for_tags(push_ids))?,
        pull_rules: serde_json::to_string(&PullRules::for_tags(pull_names))?,
        ..current.clone()
    };
    let rule_changes = diff_fields(&current, &ruled);
    if !rule_changes.is_empty() {
        local.api.update_server(&ruled)?;
        changed.extend(rule_changes);
    }
    n.advance(NegotiationState::RulesApplied)?;

    let group_name = sharing_group_name(&remote.orgname);
    let found = local
        .api
        .sharing_groups()?
        .into_iter()
        .find(|g| g.name == group_name);
    let sharing_group_created = found.is_none();
    let group = match found {
        Some(group) => group,
        None => local.api.add_sharing_group(&SharingGroup {
            name: group_name.clone(),
            releasability: format!("{} and {}", local.orgname, remote.orgname),
            description: format!("Events exchanged between {} and {}", local.orgname, remote.orgname),
            ..SharingGroup::default()
        })?,
    };
    let bound = bind_members(&n, &group, current.remote_org_id, server_id)?;
    if bound && !sharing_group_created {
        changed.push("sharing_group".to_string());
    }
    let sharing_group_id = require_id(group.id, &group_name)?;
    n.advance(NegotiationState::SharingGroupBound)?;

    info!(server_id, sharing_group_id, changed = ?changed, "link converged");
    Ok(LinkReport {
        local: local.name.clone(),
        remote: remote.name.clone(),
        direction,
        state: n.state,
        server_id,
        sharing_group_id,
        minted_sync_key,
        sharing_group_created,
        changed,
    })
}
