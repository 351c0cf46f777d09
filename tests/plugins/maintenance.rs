use mispfleet::core::error::FleetError;
use mispfleet::core::journal::Journal;
use mispfleet::core::registry::{Registry, list_instances};
use mispfleet::core::topology::TopologyConfig;
use mispfleet::platform::memory::{DEFAULT_ORG, MemoryFleet};
use mispfleet::platform::{Definitions, Role};
use mispfleet::plugins::maintenance::{
    CLIENT_STATS_FILE, COOKIE_TIMEOUT, SESSION_TIMEOUT, add_user_everywhere,
    change_session_timeout, direct_call_everywhere, dump_statistics, move_site_admins,
    reset_password, update_definitions_everywhere, update_platform_everywhere,
};
use mispfleet::plugins::setup::{SetupOptions, run_setup};
use serde_json::{Value, json};
use std::fs;
use tempfile::tempdir;

const URLS: [&str; 2] = ["http://misp-central.local", "http://misp-1.local"];

fn converged() -> (tempfile::TempDir, TopologyConfig, MemoryFleet, Registry, Journal) {
    let tmp = tempdir().unwrap();
    let topology = TopologyConfig::default();
    let (fleet, mut registry) = MemoryFleet::seeded(tmp.path(), &topology, 1).unwrap();
    let journal = Journal::new(tmp.path());
    let opts = SetupOptions {
        skip_links: true,
        ..SetupOptions::default()
    };
    run_setup(&mut registry, &fleet, &topology, &journal, opts).unwrap();
    (tmp, topology, fleet, registry, journal)
}

#[test]
fn test_session_timeout_sets_cookie_to_ten_times() {
    let (_tmp, _topology, fleet, registry, journal) = converged();
    let count = change_session_timeout(&registry, &fleet, &journal, 3600).unwrap();
    assert_eq!(count, 2);
    for url in URLS {
        let settings = fleet.snapshot(url).unwrap().settings;
        assert_eq!(settings.get(SESSION_TIMEOUT), Some(&json!(3600)));
        assert_eq!(settings.get(COOKIE_TIMEOUT), Some(&json!(36000)));
    }
}

#[test]
fn test_zero_or_overflowing_timeout_is_rejected() {
    let (_tmp, _topology, fleet, registry, journal) = converged();
    let err = change_session_timeout(&registry, &fleet, &journal, 0).unwrap_err();
    assert!(matches!(err, FleetError::ValidationError(_)));
    let err = change_session_timeout(&registry, &fleet, &journal, u64::MAX).unwrap_err();
    assert!(matches!(err, FleetError::ValidationError(_)));
    assert!(fleet.snapshot(URLS[0]).unwrap().settings.is_empty());
}

#[test]
fn test_reset_password_updates_the_config_record() {
    let (tmp, topology, fleet, mut registry, journal) = converged();
    let reset = reset_password(
        &mut registry,
        &fleet,
        &topology,
        &journal,
        "misp-1",
        "admin@misp-1.local",
        Some("Correct-Horse-1"),
    )
    .unwrap();
    assert_eq!(reset.instance, "misp-1");
    assert_eq!(reset.password, "Correct-Horse-1");

    let on_disk = list_instances(tmp.path(), &topology).unwrap();
    assert_eq!(
        on_disk.clients[0].config.site_admin_password.as_deref(),
        Some("Correct-Horse-1")
    );
    let user = fleet
        .snapshot(URLS[1])
        .unwrap()
        .user_by_email("admin@misp-1.local")
        .cloned()
        .unwrap();
    assert!(user.change_pw);
}

#[test]
fn test_reset_password_of_unknown_user() {
    let (_tmp, topology, fleet, mut registry, journal) = converged();
    let err = reset_password(
        &mut registry,
        &fleet,
        &topology,
        &journal,
        "misp-central",
        "nobody@misp-central.local",
        None,
    )
    .unwrap_err();
    assert!(matches!(err, FleetError::NotFound(ref what) if what.contains("nobody")));
}

#[test]
fn test_add_user_everywhere_is_idempotent() {
    let (_tmp, _topology, fleet, registry, journal) = converged();
    let first =
        add_user_everywhere(&registry, &fleet, &journal, "analyst@training.test", Role::User).unwrap();
    let second =
        add_user_everywhere(&registry, &fleet, &journal, "analyst@training.test", Role::User).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first, second);

    for (url, instance) in URLS.iter().zip(registry.all()) {
        let snapshot = fleet.snapshot(url).unwrap();
        let user = snapshot.user_by_email("analyst@training.test").unwrap();
        let org = snapshot.org_named(&instance.config.admin_orgname).unwrap();
        assert_eq!(Some(user.org_id), org.id);
        assert_eq!(user.role_id, Role::User.role_id());
    }
}

#[test]
fn test_definitions_refresh_on_every_instance() {
    let (_tmp, _topology, fleet, registry, journal) = converged();
    let count =
        update_definitions_everywhere(&registry, &fleet, &journal, &Definitions::ALL).unwrap();
    assert_eq!(count, 2);
    for url in URLS {
        assert_eq!(fleet.snapshot(url).unwrap().definition_updates, Definitions::ALL.to_vec());
    }
    let ops: Vec<String> = journal.read_all().unwrap().into_iter().map(|e| e.op).collect();
    assert_eq!(ops.iter().filter(|op| *op == "maintenance.definitions").count(), 10);
}

#[test]
fn test_platform_update_stops_at_a_refusing_instance() {
    let (_tmp, _topology, fleet, registry, journal) = converged();
    fleet.deny(URLS[0], "update_platform");
    let err = update_platform_everywhere(&registry, &fleet, &journal).unwrap_err();
    assert!(err.is_rejection());
    assert_eq!(fleet.snapshot(URLS[1]).unwrap().platform_updates, 0);

    fleet.allow(URLS[0], "update_platform");
    assert_eq!(update_platform_everywhere(&registry, &fleet, &journal).unwrap(), 2);
}

#[test]
fn test_raw_call_reaches_every_instance() {
    let (_tmp, _topology, fleet, registry, journal) = converged();
    let body = json!({"value": 1});
    let answers =
        direct_call_everywhere(&registry, &fleet, &journal, "/servers/getVersion", Some(&body))
            .unwrap();
    assert_eq!(answers.keys().collect::<Vec<_>>(), vec!["misp-1", "misp-central"]);
    for url in URLS {
        let calls = fleet.snapshot(url).unwrap().calls;
        assert_eq!(calls, vec![("/servers/getVersion".to_string(), Some(body.clone()))]);
    }

    let err = direct_call_everywhere(&registry, &fleet, &journal, "/", None).unwrap_err();
    assert!(matches!(err, FleetError::ValidationError(_)));
}

#[test]
fn test_statistics_split_central_from_clients() {
    let (tmp, _topology, fleet, registry, _journal) = converged();
    let dest = tmp.path().join("stats");
    let dump = dump_statistics(&registry, &fleet, &dest, "data").unwrap();
    assert_eq!(
        dump.central,
        dest.join(format!("{}.json", registry.central.config.admin_orgname))
    );
    assert_eq!(dump.clients, dest.join(CLIENT_STATS_FILE));

    let central: Value = serde_json::from_slice(&fs::read(&dump.central).unwrap()).unwrap();
    assert_eq!(central["context"], "data");
    let clients: Value = serde_json::from_slice(&fs::read(&dump.clients).unwrap()).unwrap();
    let names: Vec<&String> = clients.as_object().unwrap().keys().collect();
    assert_eq!(names, vec!["misp-1"]);
    assert!(clients["misp-1"]["stats"]["user_count"].as_u64().unwrap() >= 3);
}

#[test]
fn test_site_admins_move_into_the_given_org() {
    let (_tmp, _topology, fleet, registry, journal) = converged();
    let target = fleet.snapshot(URLS[0]).unwrap().org_named(DEFAULT_ORG).unwrap().id.unwrap();
    for url in URLS {
        assert_eq!(fleet.snapshot(url).unwrap().org_named(DEFAULT_ORG).unwrap().id, Some(target));
    }

    let moved = move_site_admins(&registry, &fleet, &journal, target).unwrap();
    assert_eq!(moved, vec!["misp-central", "misp-1"]);
    for (url, instance) in URLS.iter().zip(registry.all()) {
        let snapshot = fleet.snapshot(url).unwrap();
        let admin = snapshot.user_by_email(&instance.config.email_site_admin).unwrap();
        assert_eq!(admin.org_id, target);
        assert_eq!(admin.role_id, Role::SiteAdmin.role_id());
    }

    let err = move_site_admins(&registry, &fleet, &journal, 999).unwrap_err();
    assert!(matches!(err, FleetError::NotFound(ref what) if what.contains("999")));
}
