use mispfleet::core::journal::Journal;
use mispfleet::core::registry::Registry;
use mispfleet::core::topology::TopologyConfig;
use mispfleet::platform::Tag;
use mispfleet::platform::memory::MemoryFleet;
use mispfleet::plugins::provision::{InstanceHandle, ProvisionOptions, ensure_identity};
use mispfleet::plugins::tags::ensure_tags;
use tempfile::tempdir;

const CENTRAL: &str = "http://misp-central.local";
const CLIENT: &str = "http://misp-1.local";

struct Harness {
    _tmp: tempfile::TempDir,
    topology: TopologyConfig,
    fleet: MemoryFleet,
    central: InstanceHandle,
    client: InstanceHandle,
}

fn harness() -> Harness {
    let tmp = tempdir().unwrap();
    let topology = TopologyConfig::default();
    let (fleet, mut registry): (MemoryFleet, Registry) =
        MemoryFleet::seeded(tmp.path(), &topology, 1).unwrap();
    let journal = Journal::new(tmp.path());
    let opts = ProvisionOptions::default();
    let central = ensure_identity(&mut registry.central, &fleet, &topology, &journal, opts).unwrap();
    let client =
        ensure_identity(&mut registry.clients[0], &fleet, &topology, &journal, opts).unwrap();
    Harness {
        _tmp: tmp,
        topology,
        fleet,
        central,
        client,
    }
}

fn tag<'a>(tags: &'a [Tag], name: &str) -> &'a Tag {
    tags.iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("missing tag {}", name))
}

#[test]
fn test_central_tags_are_scoped_by_class() {
    let h = harness();
    ensure_tags(&h.central, &h.topology.tags).unwrap();
    let tags = h.fleet.snapshot(CENTRAL).unwrap().tags;
    let central_org = h.central.org.id.unwrap();
    let catalog = &h.topology.tags;

    let local = tag(&tags, &catalog.local_central[0]);
    assert!(!local.exportable);
    assert_eq!(local.org_id, central_org);

    let reserved = tag(&tags, &catalog.reserved_central[0]);
    assert!(reserved.exportable);
    assert_eq!(reserved.org_id, central_org);

    let down = tag(&tags, &catalog.central_to_nodes[0]);
    assert!(down.exportable);
    assert_eq!(down.org_id, 0);

    let up = tag(&tags, &catalog.nodes_to_central[0]);
    assert!(!up.exportable);
    assert_eq!(up.org_id, 0);

    assert!(tags.iter().all(|t| t.name != catalog.local_clients[0]));
}

#[test]
fn test_client_mirrors_central_tags_read_only() {
    let h = harness();
    ensure_tags(&h.client, &h.topology.tags).unwrap();
    let tags = h.fleet.snapshot(CLIENT).unwrap().tags;
    let catalog = &h.topology.tags;

    assert!(!tag(&tags, &catalog.central_to_nodes[0]).exportable);
    assert!(tag(&tags, &catalog.nodes_to_central[0]).exportable);
    let local = tag(&tags, &catalog.local_clients[0]);
    assert!(!local.exportable);
    assert_eq!(local.org_id, h.client.org.id.unwrap());
    assert!(tags.iter().all(|t| t.name != catalog.local_central[0]));
    assert!(tags.iter().all(|t| t.name != catalog.reserved_central[0]));
}

#[test]
fn test_ensure_tags_is_idempotent() {
    let h = harness();
    let first = ensure_tags(&h.central, &h.topology.tags).unwrap();
    let before = h.fleet.snapshot(CENTRAL).unwrap().tags;
    let second = ensure_tags(&h.central, &h.topology.tags).unwrap();
    let after = h.fleet.snapshot(CENTRAL).unwrap().tags;
    assert_eq!(first, second);
    assert_eq!(before, after);
}

#[test]
fn test_drifted_tag_is_converged_in_place() {
    let h = harness();
    let name = h.topology.tags.central_to_nodes[0].clone();
    let drifted = h.central.api.add_tag(&Tag::new(&name, false, None)).unwrap();

    ensure_tags(&h.central, &h.topology.tags).unwrap();
    let tags = h.fleet.snapshot(CENTRAL).unwrap().tags;
    let fixed = tag(&tags, &name);
    assert_eq!(fixed.id, drifted.id);
    assert!(fixed.exportable);
    assert_eq!(tags.iter().filter(|t| t.name == name).count(), 1);
}
