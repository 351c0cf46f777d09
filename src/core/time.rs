//! Clock and identifiers for journal entries and `--format json` output.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Journal timestamp: epoch seconds with a `Z` suffix.
pub fn stamp() -> String {
    format!("{}Z", epoch_secs())
}

pub fn event_id() -> String {
    Ulid::new().to_string()
}

/// What `mispfleet --format json <cmd>` prints: the command, its outcome,
/// and the command's payload fields inlined next to them.
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    pub cmd: &'a str,
    pub status: &'a str,
    pub version: &'static str,
    pub ts: String,
    pub event_id: String,
    #[serde(flatten)]
    pub payload: &'a T,
}

impl<'a, T: Serialize> Envelope<'a, T> {
    pub fn new(cmd: &'a str, status: &'a str, payload: &'a T) -> Self {
        Self {
            cmd,
            status,
            version: env!("CARGO_PKG_VERSION"),
            ts: stamp(),
            event_id: event_id(),
            payload,
        }
    }
}
