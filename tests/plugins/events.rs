use mispfleet::core::journal::Journal;
use mispfleet::core::registry::Registry;
use mispfleet::core::topology::TopologyConfig;
use mispfleet::platform::memory::MemoryFleet;
use mispfleet::plugins::events::{
    Deletion, HASHES_FILE, MANIFEST_FILE, cleanup_blocklisted, dump_all_feeds,
};
use mispfleet::plugins::setup::{SetupOptions, run_setup};
use serde_json::{Value, json};
use std::fs;
use tempfile::tempdir;

const CENTRAL: &str = "http://misp-central.local";
const CLIENT_1: &str = "http://misp-1.local";

fn converged() -> (tempfile::TempDir, MemoryFleet, Registry, Journal) {
    let tmp = tempdir().unwrap();
    let topology = TopologyConfig::default();
    let (fleet, mut registry) = MemoryFleet::seeded(tmp.path(), &topology, 1).unwrap();
    let journal = Journal::new(tmp.path());
    let opts = SetupOptions {
        skip_links: true,
        ..SetupOptions::default()
    };
    run_setup(&mut registry, &fleet, &topology, &journal, opts).unwrap();
    (tmp, fleet, registry, journal)
}

fn event(uuid: &str, info: &str, attributes: Value) -> Value {
    json!({
        "id": "1",
        "uuid": uuid,
        "info": info,
        "date": "2024-03-01",
        "analysis": "2",
        "threat_level_id": "3",
        "timestamp": "1709251200",
        "Orgc": {"name": "Node 1", "uuid": "org-1"},
        "Attribute": attributes
    })
}

fn uuids(fleet: &MemoryFleet, url: &str) -> Vec<String> {
    fleet
        .snapshot(url)
        .unwrap()
        .events
        .iter()
        .map(|e| e["uuid"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn test_feed_dump_writes_events_manifest_and_hashes() {
    let (tmp, fleet, registry, journal) = converged();
    fleet.add_event(
        CENTRAL,
        event(
            "e-100",
            "phishing wave",
            json!([
                {"type": "domain", "value": "evil.example"},
                {"type": "ip-dst|port", "value": "198.51.100.7|443"}
            ]),
        ),
    );
    fleet.add_event(CENTRAL, event("e-101", "c2 beacon", json!([])));

    let dest = tmp.path().join("feeds");
    let feeds = dump_all_feeds(&registry, &fleet, &journal, &dest).unwrap();
    assert_eq!(feeds.len(), 2);
    assert_eq!((feeds[0].events, feeds[0].hashes), (2, 3));
    assert_eq!((feeds[1].events, feeds[1].hashes), (0, 0));

    let dir = dest.join(&registry.central.config.admin_orgname);
    let stored: Value = serde_json::from_slice(&fs::read(dir.join("e-100.json")).unwrap()).unwrap();
    assert_eq!(stored["Event"]["info"], "phishing wave");

    let manifest: Value = serde_json::from_slice(&fs::read(dir.join(MANIFEST_FILE)).unwrap()).unwrap();
    assert_eq!(manifest["e-101"]["info"], "c2 beacon");
    assert_eq!(manifest["e-100"]["Orgc"]["name"], "Node 1");
    assert!(manifest["e-100"].get("Attribute").is_none());

    let hashes = fs::read_to_string(dir.join(HASHES_FILE)).unwrap();
    let rows: Vec<&str> = hashes.lines().collect();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.ends_with(",e-100")));
    assert_eq!(rows[0].split(',').next().unwrap().len(), 32);

    let client_dir = dest.join(&registry.clients[0].config.admin_orgname);
    assert_eq!(fs::read_to_string(client_dir.join(HASHES_FILE)).unwrap(), "");
}

#[test]
fn test_blocklisted_events_are_removed_across_the_link() {
    let (_tmp, fleet, registry, journal) = converged();
    fleet.add_event(CENTRAL, event("e-1", "kept on central", json!([])));
    fleet.add_event(CENTRAL, event("e-2", "blocked by the client", json!([])));
    fleet.add_event(CLIENT_1, event("e-3", "blocked by central", json!([])));
    fleet.add_event(CLIENT_1, event("e-4", "kept on the client", json!([])));
    fleet.block_event(CLIENT_1, "e-2");
    fleet.block_event(CLIENT_1, "e-9");
    fleet.block_event(CENTRAL, "e-3");

    let deleted = cleanup_blocklisted(&registry, &fleet, &journal).unwrap();
    assert_eq!(
        deleted,
        vec![
            Deletion {
                instance: "misp-central".to_string(),
                uuid: "e-2".to_string(),
            },
            Deletion {
                instance: "misp-1".to_string(),
                uuid: "e-3".to_string(),
            },
        ]
    );
    assert_eq!(uuids(&fleet, CENTRAL), vec!["e-1"]);
    assert_eq!(uuids(&fleet, CLIENT_1), vec!["e-4"]);

    assert!(cleanup_blocklisted(&registry, &fleet, &journal).unwrap().is_empty());
}
