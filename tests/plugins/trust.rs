use mispfleet::core::error::FleetError;
use mispfleet::core::journal::Journal;
use mispfleet::core::topology::TopologyConfig;
use mispfleet::platform::memory::MemoryFleet;
use mispfleet::platform::{Role, Server};
use mispfleet::plugins::provision::{InstanceHandle, ProvisionOptions, ensure_identity};
use mispfleet::plugins::tags::ensure_tags;
use mispfleet::plugins::trust::{
    Direction, LinkReport, NegotiateOptions, NegotiationState, PullRules, PushRules, negotiate,
    server_name, sharing_group_name, sync_user_email,
};
use tempfile::tempdir;

const CENTRAL: &str = "http://misp-central.local";
const CLIENT: &str = "http://misp-1.local";

struct Pair {
    _tmp: tempfile::TempDir,
    topology: TopologyConfig,
    fleet: MemoryFleet,
    journal: Journal,
    central: InstanceHandle,
    client: InstanceHandle,
}

fn provisioned_pair(with_tags: bool) -> Pair {
    let tmp = tempdir().unwrap();
    let topology = TopologyConfig::default();
    let (fleet, mut registry) = MemoryFleet::seeded(tmp.path(), &topology, 1).unwrap();
    let journal = Journal::new(tmp.path());
    let opts = ProvisionOptions::default();
    let central = ensure_identity(&mut registry.central, &fleet, &topology, &journal, opts).unwrap();
    let client =
        ensure_identity(&mut registry.clients[0], &fleet, &topology, &journal, opts).unwrap();
    if with_tags {
        ensure_tags(&central, &topology.tags).unwrap();
        ensure_tags(&client, &topology.tags).unwrap();
    }
    Pair {
        _tmp: tmp,
        topology,
        fleet,
        journal,
        central,
        client,
    }
}

impl Pair {
    fn client_to_central(&self) -> Result<LinkReport, FleetError> {
        negotiate(
            &self.client,
            &self.central,
            Direction::CentralToNode,
            &self.fleet,
            &self.topology,
            &self.journal,
            NegotiateOptions::default(),
        )
    }

    fn central_to_client(&self) -> Result<LinkReport, FleetError> {
        negotiate(
            &self.central,
            &self.client,
            Direction::NodeToCentral,
            &self.fleet,
            &self.topology,
            &self.journal,
            NegotiateOptions::default(),
        )
    }
}

fn server_on(fleet: &MemoryFleet, url: &str, name: &str) -> Server {
    fleet
        .snapshot(url)
        .unwrap()
        .server_named(name)
        .cloned()
        .unwrap_or_else(|| panic!("no server '{}' on {}", name, url))
}

#[test]
fn test_negotiate_reaches_sharing_group_bound() {
    let pair = provisioned_pair(true);
    let link = pair.client_to_central().unwrap();
    assert_eq!(link.state, NegotiationState::SharingGroupBound);
    assert!(link.minted_sync_key);
    assert!(link.sharing_group_created);

    let central = pair.fleet.snapshot(CENTRAL).unwrap();
    let proxy = central.org_named("Node 1").unwrap();
    assert_eq!(proxy.uuid, pair.client.org.uuid);
    let sync_user = central.user_by_email(&sync_user_email("misp-1.local")).unwrap();
    assert_eq!(sync_user.role_id, Role::SyncUser.role_id());
    assert_eq!(Some(sync_user.org_id), proxy.id);

    let server = server_on(&pair.fleet, CLIENT, &server_name("Central Node"));
    assert_eq!(server.url, CENTRAL);
    assert!(server.push);
    assert!(server.pull);
    assert_eq!(server.id, Some(link.server_id));

    let client = pair.fleet.snapshot(CLIENT).unwrap();
    let group = client.sharing_group_named(&sharing_group_name("Central Node")).unwrap();
    assert!(group.org_ids.contains(&pair.client.org.id.unwrap()));
    assert!(group.org_ids.contains(&server.remote_org_id));
    assert_eq!(group.server_ids, vec![link.server_id]);

    let transitions: Vec<String> = pair
        .journal
        .read_all()
        .unwrap()
        .into_iter()
        .filter(|e| e.op == "negotiate.transition")
        .map(|e| e.status)
        .collect();
    assert_eq!(
        transitions,
        vec![
            "proxy_org_ready",
            "sync_user_ready",
            "server_registered",
            "connectivity_verified",
            "rules_applied",
            "sharing_group_bound"
        ]
    );
}

#[test]
fn test_push_rules_use_ids_and_pull_rules_use_names() {
    let pair = provisioned_pair(true);
    pair.client_to_central().unwrap();
    let client = pair.fleet.snapshot(CLIENT).unwrap();
    let server = server_on(&pair.fleet, CLIENT, &server_name("Central Node"));

    let up = client.tag_named(&pair.topology.tags.nodes_to_central[0]).unwrap();
    let push: PushRules = serde_json::from_str(&server.push_rules).unwrap();
    assert_eq!(push.tags.or, vec![up.id.unwrap()]);
    assert!(push.tags.not.is_empty());

    let pull: PullRules = serde_json::from_str(&server.pull_rules).unwrap();
    assert_eq!(pull.tags.or, pair.topology.tags.central_to_nodes);
    assert_eq!(pull.url_params, "");
}

#[test]
fn test_central_side_pushes_down_without_pulling() {
    let pair = provisioned_pair(true);
    pair.client_to_central().unwrap();
    let link = pair.central_to_client().unwrap();
    assert_eq!(link.state, NegotiationState::SharingGroupBound);

    let server = server_on(&pair.fleet, CENTRAL, &server_name("Node 1"));
    assert!(server.push);
    assert!(!server.pull);
    let central = pair.fleet.snapshot(CENTRAL).unwrap();
    let down = central.tag_named(&pair.topology.tags.central_to_nodes[0]).unwrap();
    let push: PushRules = serde_json::from_str(&server.push_rules).unwrap();
    assert_eq!(push.tags.or, vec![down.id.unwrap()]);

    // Central's import matched the proxy org by uuid instead of adding one.
    assert_eq!(
        central.organisations.iter().filter(|o| o.name == "Node 1").count(),
        1
    );
}

#[test]
fn test_negotiate_is_idempotent() {
    let pair = provisioned_pair(true);
    let first = pair.client_to_central().unwrap();
    let before_client = pair.fleet.snapshot(CLIENT).unwrap();
    let before_central = pair.fleet.snapshot(CENTRAL).unwrap();

    let second = pair.client_to_central().unwrap();
    assert!(!second.minted_sync_key);
    assert!(!second.sharing_group_created);
    assert!(second.changed.is_empty());
    assert_eq!(second.server_id, first.server_id);
    assert_eq!(second.sharing_group_id, first.sharing_group_id);

    let after_client = pair.fleet.snapshot(CLIENT).unwrap();
    let after_central = pair.fleet.snapshot(CENTRAL).unwrap();
    assert_eq!(before_client.servers, after_client.servers);
    assert_eq!(before_client.sharing_groups, after_client.sharing_groups);
    assert_eq!(before_central.users, after_central.users);
    assert_eq!(before_central.authkeys.len(), after_central.authkeys.len());
}

#[test]
fn test_rotate_sync_keys_replaces_the_registered_key() {
    let pair = provisioned_pair(true);
    pair.client_to_central().unwrap();
    let before = server_on(&pair.fleet, CLIENT, &server_name("Central Node"));

    let link = negotiate(
        &pair.client,
        &pair.central,
        Direction::CentralToNode,
        &pair.fleet,
        &pair.topology,
        &pair.journal,
        NegotiateOptions {
            rotate_sync_keys: true,
        },
    )
    .unwrap();
    assert!(link.minted_sync_key);
    assert!(link.changed.contains(&"authkey".to_string()));
    let after = server_on(&pair.fleet, CLIENT, &server_name("Central Node"));
    assert_ne!(before.authkey, after.authkey);
    assert_eq!(before.id, after.id);
}

#[test]
fn test_unreachable_remote_fails_the_sync_test() {
    let pair = provisioned_pair(true);
    pair.fleet.set_reachable(CENTRAL, false);

    let err = pair.client_to_central().unwrap_err();
    match &err {
        FleetError::SyncTestFailed { local, remote, .. } => {
            assert_eq!(local, "misp-1");
            assert_eq!(remote, "misp-central");
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(err.is_scoped());
    let client = pair.fleet.snapshot(CLIENT).unwrap();
    assert!(client.sharing_groups.is_empty());
}

#[test]
fn test_missing_catalog_tag_is_reported() {
    let pair = provisioned_pair(false);
    let err = pair.client_to_central().unwrap_err();
    assert!(matches!(err, FleetError::NotFound(ref what) if what.contains("misp-1")));
}

#[test]
fn test_partially_bound_sharing_group_is_completed() {
    let pair = provisioned_pair(true);
    pair.client_to_central().unwrap();
    pair.fleet.deny(CENTRAL, "add_server_to_sharing_group");
    let err = pair.central_to_client().unwrap_err();
    assert!(err.is_scoped());

    pair.fleet.allow(CENTRAL, "add_server_to_sharing_group");
    let link = pair.central_to_client().unwrap();
    assert_eq!(link.state, NegotiationState::SharingGroupBound);
    assert!(!link.sharing_group_created);
    assert_eq!(link.changed, vec!["sharing_group"]);

    let central = pair.fleet.snapshot(CENTRAL).unwrap();
    let group = central.sharing_group_named(&sharing_group_name("Node 1")).unwrap();
    assert_eq!(group.server_ids, vec![link.server_id]);
    assert_eq!(group.org_ids.len(), 2);
    assert!(group.org_ids.contains(&pair.central.org.id.unwrap()));

    let again = pair.central_to_client().unwrap();
    assert!(again.changed.is_empty());
    assert_eq!(pair.fleet.snapshot(CENTRAL).unwrap().sharing_groups, central.sharing_groups);
}

#[test]
fn test_rejected_sync_key_is_reminted_once() {
    let pair = provisioned_pair(true);
    let first = pair.client_to_central().unwrap();
    let before = server_on(&pair.fleet, CLIENT, &server_name("Central Node"));
    pair.fleet.revoke_keys(CENTRAL, &sync_user_email("misp-1.local"));

    let link = pair.client_to_central().unwrap();
    assert!(link.minted_sync_key);
    assert_eq!(link.changed, vec!["authkey"]);
    assert_eq!(link.server_id, first.server_id);
    let after = server_on(&pair.fleet, CLIENT, &server_name("Central Node"));
    assert_ne!(before.authkey, after.authkey);

    let settled = pair.client_to_central().unwrap();
    assert!(!settled.minted_sync_key);
    assert!(settled.changed.is_empty());
}
