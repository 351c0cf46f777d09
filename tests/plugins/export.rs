use mispfleet::core::journal::Journal;
use mispfleet::core::registry::{Registry, list_instances};
use mispfleet::core::secrets::{PASSWORD_SENTINEL, UNKNOWN_VALUE};
use mispfleet::core::topology::TopologyConfig;
use mispfleet::platform::memory::MemoryFleet;
use mispfleet::plugins::export::{
    AUTH_CSV, AUTH_JSON, AuthRow, BOOTSTRAP_LOGIN, dump_all, from_configs, write_report,
};
use mispfleet::plugins::setup::{SetupOptions, run_setup};
use std::fs;
use tempfile::tempdir;

const CENTRAL: &str = "http://misp-central.local";

fn set_up_fleet() -> (tempfile::TempDir, TopologyConfig, MemoryFleet, Registry, Journal) {
    let tmp = tempdir().unwrap();
    let topology = TopologyConfig::default();
    let (fleet, mut registry) = MemoryFleet::seeded(tmp.path(), &topology, 1).unwrap();
    let journal = Journal::new(tmp.path());
    let report = run_setup(&mut registry, &fleet, &topology, &journal, SetupOptions::default()).unwrap();
    assert!(report.is_clean(), "{:?}", report.failures);
    (tmp, topology, fleet, registry, journal)
}

fn row<'a>(rows: &'a [AuthRow], url: &str, login: &str) -> &'a AuthRow {
    rows.iter()
        .find(|r| r.url == url && r.login == login)
        .unwrap_or_else(|| panic!("no row for {} on {}", login, url))
}

#[test]
fn test_dump_all_lists_every_user_on_every_instance() {
    let (_tmp, topology, fleet, mut registry, journal) = set_up_fleet();
    let report = dump_all(&mut registry, &fleet, &topology, &journal).unwrap();

    let central_users = fleet.snapshot(CENTRAL).unwrap().users.len();
    let client_users = fleet.snapshot("http://misp-1.local").unwrap().users.len();
    assert_eq!(report.rows.len(), central_users + client_users);

    let site_admin = row(&report.rows, CENTRAL, "admin@misp-central.local");
    assert_eq!(
        Some(site_admin.authkey.as_str()),
        registry.central.config.site_admin_authkey.as_deref()
    );
    let sync = row(&report.rows, CENTRAL, "sync_user@misp-1.local");
    assert_eq!(sync.authkey, UNKNOWN_VALUE);
    let bootstrap = row(&report.rows, CENTRAL, BOOTSTRAP_LOGIN);
    assert_eq!(bootstrap.authkey, registry.central.config.admin_key);
}

#[test]
fn test_passwords_regenerate_until_the_owner_changes_them() {
    let (tmp, topology, fleet, mut registry, journal) = set_up_fleet();
    fleet.complete_first_login(CENTRAL, "orgadmin@misp-central.local");
    let stored_orgadmin = registry.central.config.orgadmin_password.clone();

    let first = dump_all(&mut registry, &fleet, &topology, &journal).unwrap();
    let second = dump_all(&mut registry, &fleet, &topology, &journal).unwrap();

    let a = row(&first.rows, CENTRAL, "admin@misp-central.local");
    let b = row(&second.rows, CENTRAL, "admin@misp-central.local");
    assert_ne!(a.password, PASSWORD_SENTINEL);
    assert_ne!(a.password, b.password);

    let on_disk = list_instances(tmp.path(), &topology).unwrap();
    assert_eq!(
        on_disk.central.config.site_admin_password.as_deref(),
        Some(b.password.as_str())
    );

    let orgadmin = row(&second.rows, CENTRAL, "orgadmin@misp-central.local");
    assert_eq!(orgadmin.password, PASSWORD_SENTINEL);
    assert_eq!(on_disk.central.config.orgadmin_password, stored_orgadmin);
}

#[test]
fn test_write_report_emits_json_and_csv() {
    let (tmp, topology, _fleet, registry, _journal) = set_up_fleet();
    let report = from_configs(&registry, &topology);
    write_report(tmp.path(), &report).unwrap();

    let json: Vec<AuthRow> =
        serde_json::from_str(&fs::read_to_string(tmp.path().join(AUTH_JSON)).unwrap()).unwrap();
    assert_eq!(json, report.rows);

    let csv = fs::read_to_string(tmp.path().join(AUTH_CSV)).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("url,login,authkey,password"));
    assert_eq!(lines.count(), report.rows.len());
}

#[test]
fn test_from_configs_needs_no_platform() {
    let tmp = tempdir().unwrap();
    let topology = TopologyConfig::default();
    let (_fleet, registry) = MemoryFleet::seeded(tmp.path(), &topology, 2).unwrap();

    let report = from_configs(&registry, &topology);
    assert_eq!(report.rows.len(), 3 * 3);
    let orgadmin = row(&report.rows, "http://misp-2.local", "orgadmin@misp-2.local");
    assert_eq!(orgadmin.authkey, UNKNOWN_VALUE);
    assert_eq!(orgadmin.password, UNKNOWN_VALUE);
    assert_eq!(report.for_login(BOOTSTRAP_LOGIN).len(), 3);
}

#[test]
fn test_refusing_instance_does_not_drop_the_others() {
    let tmp = tempdir().unwrap();
    let topology = TopologyConfig::default();
    let (fleet, mut registry) = MemoryFleet::seeded(tmp.path(), &topology, 2).unwrap();
    let journal = Journal::new(tmp.path());
    run_setup(&mut registry, &fleet, &topology, &journal, SetupOptions::default()).unwrap();
    fleet.deny("http://misp-2.local", "users");

    let report = dump_all(&mut registry, &fleet, &topology, &journal).unwrap();
    assert!(!report.is_complete());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].scope, "misp-2");
    assert!(report.rows.iter().any(|r| r.url == CENTRAL));
    assert!(report.rows.iter().any(|r| r.url == "http://misp-1.local"));
    assert!(report.rows.iter().all(|r| r.url != "http://misp-2.local"));

    let regenerated = row(&report.rows, CENTRAL, "admin@misp-central.local");
    let on_disk = list_instances(tmp.path(), &topology).unwrap();
    assert_eq!(
        on_disk.central.config.site_admin_password.as_deref(),
        Some(regenerated.password.as_str())
    );

    write_report(tmp.path(), &report).unwrap();
    let csv = fs::read_to_string(tmp.path().join(AUTH_CSV)).unwrap();
    assert_eq!(csv.lines().count(), report.rows.len() + 1);
}
