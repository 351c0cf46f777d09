use mispfleet::core::journal::Journal;
use mispfleet::core::lock::{self, LockRecord, LockState};
use mispfleet::core::time;
use mispfleet::core::topology::TopologyConfig;
use mispfleet::platform::memory::MemoryFleet;
use mispfleet::plugins::push::{PushOutcome, lock_status, trigger_push_all};
use mispfleet::plugins::setup::{SetupOptions, run_setup};
use std::fs;
use tempfile::tempdir;

fn write_lock(path: &std::path::Path, pid: u32, ts: u64) {
    fs::write(path, serde_json::to_string(&LockRecord { pid, ts }).unwrap()).unwrap();
}

#[test]
fn test_push_triggers_every_registration() {
    let tmp = tempdir().unwrap();
    let topology = TopologyConfig::default();
    let (fleet, mut registry) = MemoryFleet::seeded(tmp.path(), &topology, 2).unwrap();
    let journal = Journal::new(tmp.path());
    run_setup(&mut registry, &fleet, &topology, &journal, SetupOptions::default()).unwrap();

    let outcome = trigger_push_all(&registry, &fleet, &topology, &journal).unwrap();
    assert_eq!(outcome, PushOutcome::Triggered { servers: 4 });

    let central = fleet.snapshot("http://misp-central.local").unwrap();
    assert_eq!(central.pushes.len(), 2);
    let client = fleet.snapshot("http://misp-2.local").unwrap();
    assert_eq!(client.pushes.len(), 1);
    assert!(!topology.lock_path(tmp.path()).exists());
}

#[test]
fn test_held_lock_skips_the_run() {
    let tmp = tempdir().unwrap();
    let topology = TopologyConfig::default();
    let (fleet, registry) = MemoryFleet::seeded(tmp.path(), &topology, 1).unwrap();
    let journal = Journal::new(tmp.path());
    let path = topology.lock_path(tmp.path());
    let _held = lock::acquire(&path, topology.lock.max_age_secs).unwrap();

    let outcome = trigger_push_all(&registry, &fleet, &topology, &journal).unwrap();
    assert_eq!(
        outcome,
        PushOutcome::Skipped {
            holder_pid: std::process::id()
        }
    );
    assert!(path.exists());
    let skipped = journal
        .read_all()
        .unwrap()
        .into_iter()
        .any(|e| e.op == "push.trigger" && e.status == "skipped");
    assert!(skipped);
}

#[test]
fn test_lock_of_a_dead_process_is_reclaimed() {
    let tmp = tempdir().unwrap();
    let topology = TopologyConfig::default();
    let path = topology.lock_path(tmp.path());
    write_lock(&path, 999_999_999, time::epoch_secs());

    assert!(!lock::is_locked(&path, topology.lock.max_age_secs).unwrap());
    assert!(!path.exists());
}

#[test]
fn test_stale_lock_does_not_block_the_push() {
    let tmp = tempdir().unwrap();
    let topology = TopologyConfig::default();
    let (fleet, registry) = MemoryFleet::seeded(tmp.path(), &topology, 1).unwrap();
    let journal = Journal::new(tmp.path());
    let path = topology.lock_path(tmp.path());
    write_lock(&path, 999_999_999, time::epoch_secs());

    let outcome = trigger_push_all(&registry, &fleet, &topology, &journal).unwrap();
    assert_eq!(outcome, PushOutcome::Triggered { servers: 0 });
    assert!(!path.exists());
}

#[test]
fn test_lock_status_reports_holder() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("push.lock");
    assert_eq!(lock_status(&path, 3600).unwrap(), LockState::Free);

    let guard = lock::acquire(&path, 3600).unwrap();
    assert_eq!(lock_status(&path, 3600).unwrap(), LockState::Held(guard.record()));
}

#[test]
fn test_lock_being_written_skips_the_run() {
    let tmp = tempdir().unwrap();
    let topology = TopologyConfig::default();
    let (fleet, registry) = MemoryFleet::seeded(tmp.path(), &topology, 1).unwrap();
    let journal = Journal::new(tmp.path());
    let path = topology.lock_path(tmp.path());
    fs::write(&path, "").unwrap();

    let outcome = trigger_push_all(&registry, &fleet, &topology, &journal).unwrap();
    assert_eq!(outcome, PushOutcome::Skipped { holder_pid: 0 });
    assert!(path.exists());
}
