//! The platform admin API, consumed as a capability interface.
//!
//! [`MispApi`] is one authenticated session against one instance. The
//! provisioning code only ever talks to this trait; [`client::HttpConnector`]
//! backs it with the REST API and `memory::MemoryFleet` (feature `memory`)
//! backs it with an in-process model of a fleet.

pub mod client;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod model;

use crate::core::error::FleetError;
pub use model::{
    Definitions, Organisation, Role, Server, ServerTestStatus, SharingGroup, SyncConfig, Tag,
    User,
};

pub trait MispApi {
    fn organisations(&self) -> Result<Vec<Organisation>, FleetError>;
    fn add_organisation(&self, org: &Organisation) -> Result<Organisation, FleetError>;
    fn update_organisation(&self, org: &Organisation) -> Result<Organisation, FleetError>;

    fn users(&self) -> Result<Vec<User>, FleetError>;
    fn add_user(&self, user: &User) -> Result<User, FleetError>;
    fn update_user(&self, user: &User) -> Result<User, FleetError>;
    /// Mint an additional authkey for the user and return it in clear.
    fn new_authkey(&self, user_id: u64) -> Result<String, FleetError>;
    fn set_password(&self, user_id: u64, password: &str) -> Result<(), FleetError>;

    fn tags(&self) -> Result<Vec<Tag>, FleetError>;
    fn add_tag(&self, tag: &Tag) -> Result<Tag, FleetError>;
    fn update_tag(&self, tag: &Tag) -> Result<Tag, FleetError>;

    /// Connection parameters of this instance, bound to the calling user.
    fn sync_config(&self) -> Result<SyncConfig, FleetError>;
    fn servers(&self) -> Result<Vec<Server>, FleetError>;
    fn import_server(&self, config: &SyncConfig) -> Result<Server, FleetError>;
    fn update_server(&self, server: &Server) -> Result<Server, FleetError>;
    fn test_server(&self, server_id: u64) -> Result<ServerTestStatus, FleetError>;
    /// Fire-and-forget push of everything the server's rules allow.
    fn push_server(&self, server_id: u64) -> Result<(), FleetError>;

    fn sharing_groups(&self) -> Result<Vec<SharingGroup>, FleetError>;
    fn add_sharing_group(&self, group: &SharingGroup) -> Result<SharingGroup, FleetError>;
    fn add_org_to_sharing_group(&self, group_id: u64, org_id: u64) -> Result<(), FleetError>;
    fn add_server_to_sharing_group(&self, group_id: u64, server_id: u64)
    -> Result<(), FleetError>;

    fn set_server_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), FleetError>;

    /// Pull the platform's own code update.
    fn update_platform(&self) -> Result<(), FleetError>;
    fn update_definitions(&self, set: Definitions) -> Result<(), FleetError>;
    /// Usage statistics; `context` is one of `data`, `orgs`, `users`, ...
    fn user_statistics(&self, context: &str) -> Result<serde_json::Value, FleetError>;

    /// Uuids of every event visible to the session.
    fn event_uuids(&self) -> Result<Vec<String>, FleetError>;
    /// Full event, soft-deleted attributes included, without the `Event` wrapper.
    fn event(&self, uuid: &str) -> Result<serde_json::Value, FleetError>;
    fn delete_event(&self, uuid: &str) -> Result<(), FleetError>;
    /// Uuids on the event blocklist.
    fn event_blocklist(&self) -> Result<Vec<String>, FleetError>;

    /// Raw call: GET without a payload, POST with one.
    fn direct_call(
        &self,
        path: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, FleetError>;
}

/// Opens authenticated sessions.
pub trait Connector {
    fn connect(&self, baseurl: &str, key: &str) -> Result<Box<dyn MispApi>, FleetError>;
}

/// Look up a record's id, failing with the entity it belongs to.
pub fn require_id(id: Option<u64>, what: &str) -> Result<u64, FleetError> {
    id.ok_or_else(|| FleetError::ValidationError(format!("{} has no id", what)))
}
