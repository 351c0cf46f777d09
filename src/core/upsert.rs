//! Create-or-update by natural key.
//!
//! The platform rejects duplicates (same email, same org name, same tag
//! name) instead of returning the existing record, so every idempotent
//! create follows the same path: try to create, and on rejection find the
//! existing record by its key and update it in place.

use crate::core::error::FleetError;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Organisation,
    User,
    Tag,
    Server,
    SharingGroup,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Organisation => "organisation",
            EntityKind::User => "user",
            EntityKind::Tag => "tag",
            EntityKind::Server => "server",
            EntityKind::SharingGroup => "sharing group",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
pub struct Upserted<T> {
    pub entity: T,
    pub outcome: Outcome,
}

impl<T> Upserted<T> {
    pub fn created(&self) -> bool {
        self.outcome == Outcome::Created
    }
}

/// Identifies what is being upserted, for error reporting.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub instance: &'a str,
    pub kind: EntityKind,
    pub key: &'a str,
}

/// Create the entity, or find it by key and update it.
///
/// `update` receives the existing record and returns the stored result.
/// Transport failures on `create` propagate as-is; only platform rejections
/// fall through to the lookup branch. If the lookup finds nothing, or the
/// update is rejected too, the result is a `Provisioning` error naming the
/// entity and the platform's reason.
pub fn upsert_by_key<T, C, L, K, U>(
    target: Target<'_>,
    create: C,
    list: L,
    key_of: K,
    update: U,
) -> Result<Upserted<T>, FleetError>
where
    C: FnOnce() -> Result<T, FleetError>,
    L: FnOnce() -> Result<Vec<T>, FleetError>,
    K: Fn(&T) -> String,
    U: FnOnce(T) -> Result<T, FleetError>,
{
    let create_err = match create() {
        Ok(entity) => {
            debug!(instance = target.instance, entity = %target.kind, name = target.key, "created");
            return Ok(Upserted {
                entity,
                outcome: Outcome::Created,
            });
        }
        Err(e) if e.is_rejection() => e,
        Err(e) => return Err(e),
    };

    let existing = list()?
        .into_iter()
        .find(|candidate| key_of(candidate) == target.key)
        .ok_or_else(|| {
            FleetError::provisioning(target.instance, target.kind, target.key, &create_err)
        })?;

    match update(existing) {
        Ok(entity) => {
            debug!(instance = target.instance, entity = %target.kind, name = target.key, "updated in place");
            Ok(Upserted {
                entity,
                outcome: Outcome::Updated,
            })
        }
        Err(e) if e.is_rejection() => Err(FleetError::provisioning(
            target.instance,
            target.kind,
            target.key,
            format!("create: {}; update: {}", create_err, e),
        )),
        Err(e) => Err(e),
    }
}
