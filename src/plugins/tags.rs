//! Tag catalog reconciliation.
//!
//! Central hosts the authoritative catalog. Clients mirror the tags that flow
//! down to them as read-only, export the tags that flow up, and keep their
//! own local-only set.

use crate::core::error::FleetError;
use crate::core::registry::NodeRole;
use crate::core::topology::TagCatalog;
use crate::core::upsert::{EntityKind, Target, upsert_by_key};
use crate::plugins::provision::InstanceHandle;
use crate::platform::Tag;
use tracing::{debug, instrument};

/// Desired state of one tag on one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSpec {
    pub name: String,
    pub exportable: bool,
    /// Restricted to the host organisation when set.
    pub org_id: Option<u64>,
}

impl TagSpec {
    fn new(name: &str, exportable: bool, org_id: Option<u64>) -> Self {
        Self {
            name: name.to_string(),
            exportable,
            org_id,
        }
    }

    fn matches(&self, tag: &Tag) -> bool {
        tag.exportable == self.exportable && tag.org_id == self.org_id.unwrap_or(0)
    }
}

/// The tags `role` must carry. A name listed in several classes keeps the
/// first class it appears in.
pub fn plan_tags(role: NodeRole, catalog: &TagCatalog, org_id: u64) -> Vec<TagSpec> {
    let mut plan: Vec<TagSpec> = Vec::new();
    let mut push = |spec: TagSpec| {
        if !plan.iter().any(|p| p.name == spec.name) {
            plan.push(spec);
        }
    };
    match role {
        NodeRole::Central => {
            for name in &catalog.local_central {
                push(TagSpec::new(name, false, Some(org_id)));
            }
            for name in &catalog.reserved_central {
                push(TagSpec::new(name, true, Some(org_id)));
            }
            for name in &catalog.central_to_nodes {
                push(TagSpec::new(name, true, None));
            }
            for name in &catalog.nodes_to_central {
                push(TagSpec::new(name, false, None));
            }
        }
        NodeRole::Client => {
            for name in &catalog.central_to_nodes {
                push(TagSpec::new(name, false, None));
            }
            for name in &catalog.nodes_to_central {
                push(TagSpec::new(name, true, None));
            }
            for name in &catalog.local_clients {
                push(TagSpec::new(name, false, Some(org_id)));
            }
        }
    }
    plan
}

fn ensure_tag(handle: &InstanceHandle, spec: &TagSpec) -> Result<Tag, FleetError> {
    let desired = Tag::new(&spec.name, spec.exportable, spec.org_id);
    let upserted = upsert_by_key(
        Target {
            instance: &handle.name,
            kind: EntityKind::Tag,
            key: &spec.name,
        },
        || handle.api.add_tag(&desired),
        || handle.api.tags(),
        |t| t.name.clone(),
        |existing| {
            if spec.matches(&existing) {
                return Ok(existing);
            }
            handle.api.update_tag(&Tag {
                exportable: spec.exportable,
                org_id: spec.org_id.unwrap_or(0),
                ..existing
            })
        },
    )?;
    Ok(upserted.entity)
}

/// Converge the instance's tags to its role's plan.
#[instrument(skip_all, fields(instance = %handle.name))]
pub fn ensure_tags(
    handle: &InstanceHandle,
    catalog: &TagCatalog,
) -> Result<Vec<Tag>, FleetError> {
    let plan = plan_tags(handle.role, catalog, handle.org_id()?);
    let mut tags = Vec::with_capacity(plan.len());
    for spec in &plan {
        let tag = ensure_tag(handle, spec)?;
        debug!(tag = %tag.name, exportable = tag.exportable, "tag in place");
        tags.push(tag);
    }
    Ok(tags)
}
