//! Event housekeeping across the fleet: feed dumps and blocklist cleanup.
//!
//! A feed directory holds one `<uuid>.json` per event, a `manifest.json`
//! indexing them by uuid and a `hashes.csv` of `md5,event_uuid` rows, the
//! layout the platform's feed importer reads.

use crate::core::error::FleetError;
use crate::core::journal::Journal;
use crate::core::registry::{self, Instance, Registry};
use crate::plugins::provision;
use crate::platform::{Connector, MispApi};
use md5::{Digest, Md5};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

pub const FEEDS_DIR: &str = "feeds";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const HASHES_FILE: &str = "hashes.csv";

const MANIFEST_KEYS: [&str; 7] = [
    "Orgc",
    "Tag",
    "info",
    "date",
    "analysis",
    "threat_level_id",
    "timestamp",
];

#[derive(Debug, Clone, Serialize)]
pub struct FeedSummary {
    pub instance: String,
    pub dir: PathBuf,
    pub events: usize,
    pub hashes: usize,
}

/// md5 of every attribute value; composite values (`ip-dst|port`,
/// malware samples) contribute one hash per part.
pub fn attribute_hashes(event: &Value) -> Vec<String> {
    let direct = event.get("Attribute").and_then(Value::as_array);
    let in_objects = event
        .get("Object")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|o| o.get("Attribute").and_then(Value::as_array));

    direct
        .into_iter()
        .chain(in_objects)
        .flatten()
        .flat_map(|attr| {
            let kind = attr.get("type").and_then(Value::as_str).unwrap_or("");
            let value = attr.get("value").and_then(Value::as_str).unwrap_or("");
            let parts: Vec<&str> = if kind.contains('|') || kind == "malware-sample" {
                value.split('|').collect()
            } else {
                vec![value]
            };
            parts
                .into_iter()
                .map(|p| format!("{:x}", Md5::digest(p.as_bytes())))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn manifest_entry(event: &Value) -> Value {
    let mut entry = Map::new();
    for key in MANIFEST_KEYS {
        if let Some(v) = event.get(key) {
            entry.insert(key.to_string(), v.clone());
        }
    }
    Value::Object(entry)
}

/// Dump every event of one instance into `<dest>/<orgname>/`.
pub fn dump_feed(
    instance: &Instance,
    api: &dyn MispApi,
    dest: &Path,
) -> Result<FeedSummary, FleetError> {
    let dir = dest.join(&instance.config.admin_orgname);
    std::fs::create_dir_all(&dir)?;

    let mut manifest = Map::new();
    let mut hashes = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    let mut rows = 0;
    let uuids = api.event_uuids()?;
    for uuid in &uuids {
        let event = api.event(uuid)?;
        for hash in attribute_hashes(&event) {
            hashes.write_record([hash.as_str(), uuid.as_str()])?;
            rows += 1;
        }
        manifest.insert(uuid.clone(), manifest_entry(&event));
        let body = serde_json::to_vec_pretty(&json!({ "Event": event }))?;
        registry::write_atomic(&dir.join(format!("{}.json", uuid)), &body)?;
    }
    let hashes = hashes
        .into_inner()
        .map_err(|e| FleetError::IoError(e.into_error()))?;
    registry::write_atomic(&dir.join(HASHES_FILE), &hashes)?;
    registry::write_atomic(
        &dir.join(MANIFEST_FILE),
        &serde_json::to_vec_pretty(&Value::Object(manifest))?,
    )?;

    Ok(FeedSummary {
        instance: instance.name.clone(),
        dir,
        events: uuids.len(),
        hashes: rows,
    })
}

/// Dump a feed per instance, central first.
#[instrument(skip_all, fields(dest = %dest.display()))]
pub fn dump_all_feeds(
    registry: &Registry,
    connector: &dyn Connector,
    journal: &Journal,
    dest: &Path,
) -> Result<Vec<FeedSummary>, FleetError> {
    let mut feeds = Vec::new();
    for instance in registry.all() {
        let api = provision::admin_session(instance, connector)?;
        let summary = dump_feed(instance, api.as_ref(), dest)?;
        journal.record(
            "events.feed",
            &instance.name,
            "written",
            json!({ "events": summary.events, "hashes": summary.hashes }),
        )?;
        info!(instance = %instance.name, events = summary.events, "feed written");
        feeds.push(summary);
    }
    Ok(feeds)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deletion {
    pub instance: String,
    pub uuid: String,
}

/// Delete from `instance` every listed event it still holds.
fn purge(
    instance: &Instance,
    api: &dyn MispApi,
    journal: &Journal,
    blocked: &BTreeSet<String>,
) -> Result<Vec<Deletion>, FleetError> {
    let mut deleted = Vec::new();
    for uuid in api.event_uuids()? {
        if !blocked.contains(&uuid) {
            continue;
        }
        api.delete_event(&uuid)?;
        journal.record("events.purge", &instance.name, "deleted", json!({ "uuid": uuid }))?;
        deleted.push(Deletion {
            instance: instance.name.clone(),
            uuid,
        });
    }
    Ok(deleted)
}

/// Events a client has blocklisted are deleted on central, and events
/// central has blocklisted are deleted on every client.
pub fn cleanup_blocklisted(
    registry: &Registry,
    connector: &dyn Connector,
    journal: &Journal,
) -> Result<Vec<Deletion>, FleetError> {
    let central_api = provision::admin_session(&registry.central, connector)?;
    let mut client_apis = Vec::with_capacity(registry.clients.len());
    let mut blocked_on_clients = BTreeSet::new();
    for instance in &registry.clients {
        let api = provision::admin_session(instance, connector)?;
        blocked_on_clients.extend(api.event_blocklist()?);
        client_apis.push((instance, api));
    }

    let mut deleted = purge(
        &registry.central,
        central_api.as_ref(),
        journal,
        &blocked_on_clients,
    )?;
    let blocked_on_central: BTreeSet<String> = central_api.event_blocklist()?.into_iter().collect();
    for (instance, api) in &client_apis {
        deleted.extend(purge(instance, api.as_ref(), journal, &blocked_on_central)?);
    }
    info!(deleted = deleted.len(), "blocklisted events removed");
    Ok(deleted)
}
