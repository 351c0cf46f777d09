//! Credential generation and memoization.

use crate::core::error::FleetError;
use rand::Rng;

/// Recorded instead of a password the account owner already replaced.
pub const PASSWORD_SENTINEL: &str = "Already changed by the user";

/// Recorded by the config-only exporter when a value was never provisioned.
pub const UNKNOWN_VALUE: &str = "n/a";

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub const PASSWORD_LEN: usize = 16;
pub const ADMIN_KEY_LEN: usize = 40;

fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

pub fn random_password() -> String {
    random_token(PASSWORD_LEN)
}

pub fn random_admin_key() -> String {
    random_token(ADMIN_KEY_LEN)
}

/// Fill `slot` with `provision()` unless it already holds a value (or
/// `force` is set). Returns whether the slot changed.
///
/// This is the only place stored credentials are created, so every caller
/// must persist the owning record when it returns `true`.
pub fn resolve_or_provision<F>(
    slot: &mut Option<String>,
    force: bool,
    provision: F,
) -> Result<bool, FleetError>
where
    F: FnOnce() -> Result<String, FleetError>,
{
    let present = slot.as_deref().is_some_and(|v| !v.is_empty());
    if present && !force {
        return Ok(false);
    }
    let value = provision()?;
    let changed = slot.as_deref() != Some(value.as_str());
    *slot = Some(value);
    Ok(changed)
}
