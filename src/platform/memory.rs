//! In-process model of a fleet of platform instances.
//!
//! Mirrors the parts of the platform's behavior the provisioning code relies
//! on: duplicate rejection by natural key, authkey authentication, the
//! "must change password" flag, server imports that always create a new
//! record, and connectivity tests that resolve peer URLs across the fleet.

use crate::core::error::FleetError;
use crate::core::journal::Journal;
use crate::core::registry::{self, Registry};
use crate::core::secrets;
use crate::core::topology::TopologyConfig;
use crate::platform::model::{
    Definitions, Organisation, Role, Server, ServerTestStatus, SharingGroup, SyncConfig, Tag,
    User,
};
use crate::platform::{Connector, MispApi};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::rc::Rc;
use ulid::Ulid;

pub const BOOTSTRAP_EMAIL: &str = "admin@admin.test";
pub const DEFAULT_ORG: &str = "ORGNAME";

#[derive(Debug, Clone, Default)]
pub struct MemoryInstance {
    pub baseurl: String,
    pub external_url: String,
    pub uuid: String,
    pub reachable: bool,
    pub organisations: Vec<Organisation>,
    pub users: Vec<User>,
    pub authkeys: Vec<(String, u64)>,
    pub passwords: BTreeMap<u64, String>,
    pub tags: Vec<Tag>,
    pub servers: Vec<Server>,
    pub sharing_groups: Vec<SharingGroup>,
    pub settings: BTreeMap<String, serde_json::Value>,
    pub pushes: Vec<u64>,
    /// Events as the platform renders them, without the `Event` wrapper.
    pub events: Vec<serde_json::Value>,
    pub event_blocklist: Vec<String>,
    pub definition_updates: Vec<Definitions>,
    pub platform_updates: u32,
    pub calls: Vec<(String, Option<serde_json::Value>)>,
    /// Operations that are rejected on this instance, e.g. `add_user`.
    pub denied: BTreeSet<String>,
    next_id: u64,
}

impl MemoryInstance {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn answers_to(&self, url: &str) -> bool {
        let url = url.trim_end_matches('/');
        self.baseurl == url || self.external_url == url
    }

    pub fn org_named(&self, name: &str) -> Option<&Organisation> {
        self.organisations.iter().find(|o| o.name == name)
    }

    pub fn user_by_email(&self, email: &str) -> Option<&User> {
        self.users.iter().find(|u| u.email.eq_ignore_ascii_case(email))
    }

    pub fn tag_named(&self, name: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.name == name)
    }

    pub fn server_named(&self, name: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn sharing_group_named(&self, name: &str) -> Option<&SharingGroup> {
        self.sharing_groups.iter().find(|g| g.name == name)
    }

    pub fn event_by_uuid(&self, uuid: &str) -> Option<&serde_json::Value> {
        self.events
            .iter()
            .find(|e| e.get("uuid").and_then(serde_json::Value::as_str) == Some(uuid))
    }

    pub fn keys_for(&self, user_id: u64) -> Vec<String> {
        self.authkeys
            .iter()
            .filter(|(_, id)| *id == user_id)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn user_for_key(&self, key: &str) -> Option<&User> {
        let (_, id) = self.authkeys.iter().find(|(k, _)| k == key)?;
        self.users.iter().find(|u| u.id == Some(*id) && !u.disabled)
    }
}

#[derive(Debug, Default)]
struct FleetState {
    instances: Vec<MemoryInstance>,
}

/// A shared, single-threaded fleet; clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryFleet {
    state: Rc<RefCell<FleetState>>,
}

fn rejected(endpoint: &str, message: impl Into<String>) -> FleetError {
    FleetError::Api {
        status: 403,
        endpoint: endpoint.to_string(),
        message: message.into(),
    }
}

fn missing(endpoint: &str, what: &str) -> FleetError {
    FleetError::Api {
        status: 404,
        endpoint: endpoint.to_string(),
        message: format!("Invalid {}", what),
    }
}

impl MemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly initialised instance: one default organisation and the
    /// bootstrap admin authenticated by `admin_key`.
    pub fn add_instance(&self, baseurl: &str, external_url: &str, admin_key: &str) {
        let mut inst = MemoryInstance {
            baseurl: baseurl.trim_end_matches('/').to_string(),
            external_url: external_url.trim_end_matches('/').to_string(),
            uuid: Ulid::new().to_string(),
            reachable: true,
            ..MemoryInstance::default()
        };
        let org_id = inst.next_id();
        inst.organisations.push(Organisation {
            id: Some(org_id),
            name: DEFAULT_ORG.to_string(),
            uuid: Some(Ulid::new().to_string()),
            local: true,
        });
        let user_id = inst.next_id();
        inst.users.push(User {
            id: Some(user_id),
            email: BOOTSTRAP_EMAIL.to_string(),
            org_id,
            role_id: Role::SiteAdmin.role_id(),
            change_pw: true,
            disabled: false,
        });
        inst.authkeys.push((admin_key.to_string(), user_id));
        self.state.borrow_mut().instances.push(inst);
    }

    /// Write config records for central plus `clients` clients under `root`
    /// and stand up a matching fresh instance for each.
    pub fn seeded(
        root: &Path,
        topology: &TopologyConfig,
        clients: u32,
    ) -> Result<(Self, Registry), FleetError> {
        crate::plugins::init::init_fleet(root, topology, &Journal::new(root), clients)?;
        let registry = registry::list_instances(root, topology)?;
        let fleet = Self::new();
        for instance in registry.all() {
            let c = &instance.config;
            fleet.add_instance(&c.baseurl, c.peer_url(), &c.admin_key);
        }
        Ok((fleet, registry))
    }

    fn index_of(&self, url: &str) -> Option<usize> {
        self.state
            .borrow()
            .instances
            .iter()
            .position(|i| i.answers_to(url))
    }

    fn with_instance<R>(&self, url: &str, f: impl FnOnce(&mut MemoryInstance) -> R) -> Option<R> {
        let idx = self.index_of(url)?;
        let mut state = self.state.borrow_mut();
        Some(f(&mut state.instances[idx]))
    }

    /// Copy of the instance answering to `url`.
    pub fn snapshot(&self, url: &str) -> Option<MemoryInstance> {
        self.with_instance(url, |i| i.clone())
    }

    pub fn set_external_url(&self, url: &str, external_url: &str) {
        self.with_instance(url, |i| {
            i.external_url = external_url.trim_end_matches('/').to_string()
        });
    }

    pub fn set_reachable(&self, url: &str, reachable: bool) {
        self.with_instance(url, |i| i.reachable = reachable);
    }

    pub fn deny(&self, url: &str, op: &str) {
        self.with_instance(url, |i| {
            i.denied.insert(op.to_string());
        });
    }

    pub fn allow(&self, url: &str, op: &str) {
        self.with_instance(url, |i| {
            i.denied.remove(op);
        });
    }

    /// Drop every authkey of `email`, as a rebuilt instance would.
    pub fn revoke_keys(&self, url: &str, email: &str) {
        self.with_instance(url, |i| {
            if let Some(id) = i.user_by_email(email).and_then(|u| u.id) {
                i.authkeys.retain(|(_, owner)| *owner != id);
            }
        });
    }

    /// Simulate the account owner logging in and choosing a password.
    /// Store an event; `event` must carry a `uuid`.
    pub fn add_event(&self, url: &str, event: serde_json::Value) {
        self.with_instance(url, |i| i.events.push(event));
    }

    pub fn block_event(&self, url: &str, uuid: &str) {
        self.with_instance(url, |i| i.event_blocklist.push(uuid.to_string()));
    }

    pub fn complete_first_login(&self, url: &str, email: &str) {
        self.with_instance(url, |i| {
            if let Some(u) = i.users.iter_mut().find(|u| u.email.eq_ignore_ascii_case(email)) {
                u.change_pw = false;
            }
        });
    }
}

impl Connector for MemoryFleet {
    fn connect(&self, baseurl: &str, key: &str) -> Result<Box<dyn MispApi>, FleetError> {
        let index = self
            .index_of(baseurl)
            .ok_or_else(|| FleetError::external("connect", format!("no route to {}", baseurl)))?;
        let user_id = {
            let state = self.state.borrow();
            state.instances[index]
                .user_for_key(key)
                .and_then(|u| u.id)
                .ok_or_else(|| FleetError::Api {
                    status: 401,
                    endpoint: "/users/view/me".to_string(),
                    message: "Authentication failed".to_string(),
                })?
        };
        Ok(Box::new(MemoryApi {
            state: Rc::clone(&self.state),
            index,
            user_id,
            key: key.to_string(),
        }))
    }
}

/// One authenticated session on one in-memory instance.
pub struct MemoryApi {
    state: Rc<RefCell<FleetState>>,
    index: usize,
    user_id: u64,
    key: String,
}

impl MemoryApi {
    fn with<R>(
        &self,
        endpoint: &str,
        require_admin: bool,
        f: impl FnOnce(&mut MemoryInstance) -> Result<R, FleetError>,
    ) -> Result<R, FleetError> {
        let mut state = self.state.borrow_mut();
        let inst = &mut state.instances[self.index];
        let caller = inst
            .users
            .iter()
            .find(|u| u.id == Some(self.user_id) && !u.disabled)
            .ok_or_else(|| rejected(endpoint, "Authentication failed"))?;
        if require_admin && caller.role_id != Role::SiteAdmin.role_id() {
            return Err(rejected(endpoint, "You do not have permission to use this functionality"));
        }
        let op = endpoint.trim_start_matches('/').to_string();
        if inst.denied.contains(&op) {
            return Err(rejected(endpoint, format!("{} is disabled on this instance", op)));
        }
        f(inst)
    }
}

impl MispApi for MemoryApi {
    fn organisations(&self) -> Result<Vec<Organisation>, FleetError> {
        self.with("/organisations", true, |i| Ok(i.organisations.clone()))
    }

    fn add_organisation(&self, org: &Organisation) -> Result<Organisation, FleetError> {
        self.with("/add_organisation", true, |i| {
            if i.org_named(&org.name).is_some() {
                return Err(rejected("/admin/organisations/add", "Organisation name already in use"));
            }
            if org.uuid.is_some() && i.organisations.iter().any(|o| o.uuid == org.uuid) {
                return Err(rejected("/admin/organisations/add", "An organisation with this uuid already exists"));
            }
            let mut created = org.clone();
            created.id = Some(i.next_id());
            created.uuid = org.uuid.clone().or_else(|| Some(Ulid::new().to_string()));
            i.organisations.push(created.clone());
            Ok(created)
        })
    }

    fn update_organisation(&self, org: &Organisation) -> Result<Organisation, FleetError> {
        self.with("/update_organisation", true, |i| {
            let id = org.id.ok_or_else(|| missing("/admin/organisations/edit", "organisation"))?;
            if i.organisations.iter().any(|o| o.name == org.name && o.id != Some(id)) {
                return Err(rejected("/admin/organisations/edit", "Organisation name already in use"));
            }
            let stored = i
                .organisations
                .iter_mut()
                .find(|o| o.id == Some(id))
                .ok_or_else(|| missing("/admin/organisations/edit", "organisation"))?;
            stored.name = org.name.clone();
            stored.local = org.local;
            if org.uuid.is_some() {
                stored.uuid = org.uuid.clone();
            }
            Ok(stored.clone())
        })
    }

    fn users(&self) -> Result<Vec<User>, FleetError> {
        self.with("/users", true, |i| Ok(i.users.clone()))
    }

    fn add_user(&self, user: &User) -> Result<User, FleetError> {
        self.with("/add_user", true, |i| {
            if i.user_by_email(&user.email).is_some() {
                return Err(rejected("/admin/users/add", "An account with this email already exists."));
            }
            if !i.organisations.iter().any(|o| o.id == Some(user.org_id)) {
                return Err(rejected("/admin/users/add", "Invalid organisation"));
            }
            let mut created = user.clone();
            created.id = Some(i.next_id());
            created.change_pw = true;
            i.users.push(created.clone());
            Ok(created)
        })
    }

    fn update_user(&self, user: &User) -> Result<User, FleetError> {
        self.with("/update_user", true, |i| {
            let id = user.id.ok_or_else(|| missing("/admin/users/edit", "user"))?;
            if i
                .users
                .iter()
                .any(|u| u.email.eq_ignore_ascii_case(&user.email) && u.id != Some(id))
            {
                return Err(rejected("/admin/users/edit", "An account with this email already exists."));
            }
            let stored = i
                .users
                .iter_mut()
                .find(|u| u.id == Some(id))
                .ok_or_else(|| missing("/admin/users/edit", "user"))?;
            stored.email = user.email.clone();
            stored.org_id = user.org_id;
            stored.role_id = user.role_id;
            stored.disabled = user.disabled;
            Ok(stored.clone())
        })
    }

    fn new_authkey(&self, user_id: u64) -> Result<String, FleetError> {
        self.with("/new_authkey", true, |i| {
            if !i.users.iter().any(|u| u.id == Some(user_id)) {
                return Err(missing("/auth_keys/add", "user"));
            }
            let key = secrets::random_admin_key();
            i.authkeys.push((key.clone(), user_id));
            Ok(key)
        })
    }

    fn set_password(&self, user_id: u64, password: &str) -> Result<(), FleetError> {
        self.with("/set_password", true, |i| {
            let stored = i
                .users
                .iter_mut()
                .find(|u| u.id == Some(user_id))
                .ok_or_else(|| missing("/admin/users/edit", "user"))?;
            // Passwords set by an admin are temporary.
            stored.change_pw = true;
            i.passwords.insert(user_id, password.to_string());
            Ok(())
        })
    }

    fn tags(&self) -> Result<Vec<Tag>, FleetError> {
        self.with("/tags", true, |i| Ok(i.tags.clone()))
    }

    fn add_tag(&self, tag: &Tag) -> Result<Tag, FleetError> {
        self.with("/add_tag", true, |i| {
            if i.tag_named(&tag.name).is_some() {
                return Err(rejected("/tags/add", "A tag with this name already exists"));
            }
            let mut created = tag.clone();
            created.id = Some(i.next_id());
            i.tags.push(created.clone());
            Ok(created)
        })
    }

    fn update_tag(&self, tag: &Tag) -> Result<Tag, FleetError> {
        self.with("/update_tag", true, |i| {
            let id = tag.id.ok_or_else(|| missing("/tags/edit", "tag"))?;
            let stored = i
                .tags
                .iter_mut()
                .find(|t| t.id == Some(id))
                .ok_or_else(|| missing("/tags/edit", "tag"))?;
            stored.name = tag.name.clone();
            stored.exportable = tag.exportable;
            stored.org_id = tag.org_id;
            Ok(stored.clone())
        })
    }

    fn sync_config(&self) -> Result<SyncConfig, FleetError> {
        let key = self.key.clone();
        self.with("/sync_config", false, |i| {
            let host = i
                .organisations
                .first()
                .cloned()
                .ok_or_else(|| missing("/servers/createSync", "host organisation"))?;
            Ok(SyncConfig {
                name: format!("{} sync", host.name),
                url: i.external_url.clone(),
                uuid: Some(i.uuid.clone()),
                authkey: Some(key),
                remote_org: host,
            })
        })
    }

    fn servers(&self) -> Result<Vec<Server>, FleetError> {
        self.with("/servers", true, |i| Ok(i.servers.clone()))
    }

    fn import_server(&self, config: &SyncConfig) -> Result<Server, FleetError> {
        self.with("/import_server", true, |i| {
            let authkey = config
                .authkey
                .clone()
                .ok_or_else(|| rejected("/servers/import", "Missing authkey"))?;
            let existing_org = i
                .organisations
                .iter()
                .find(|o| config.remote_org.uuid.is_some() && o.uuid == config.remote_org.uuid)
                .or_else(|| i.org_named(&config.remote_org.name))
                .and_then(|o| o.id);
            let remote_org_id = match existing_org {
                Some(id) => id,
                None => {
                    let id = i.next_id();
                    i.organisations.push(Organisation {
                        id: Some(id),
                        name: config.remote_org.name.clone(),
                        uuid: config.remote_org.uuid.clone(),
                        local: false,
                    });
                    id
                }
            };
            let server = Server {
                id: Some(i.next_id()),
                name: config.name.clone(),
                url: config.url.clone(),
                authkey: Some(authkey),
                remote_org_id,
                ..Server::default()
            };
            i.servers.push(server.clone());
            Ok(server)
        })
    }

    fn update_server(&self, server: &Server) -> Result<Server, FleetError> {
        self.with("/update_server", true, |i| {
            let id = server.id.ok_or_else(|| missing("/servers/edit", "server"))?;
            let stored = i
                .servers
                .iter_mut()
                .find(|s| s.id == Some(id))
                .ok_or_else(|| missing("/servers/edit", "server"))?;
            let authkey = server.authkey.clone().or_else(|| stored.authkey.clone());
            let remote_org_id = if server.remote_org_id == 0 {
                stored.remote_org_id
            } else {
                server.remote_org_id
            };
            *stored = Server {
                authkey,
                remote_org_id,
                ..server.clone()
            };
            Ok(stored.clone())
        })
    }

    fn test_server(&self, server_id: u64) -> Result<ServerTestStatus, FleetError> {
        let (url, authkey) = self.with("/test_server", true, |i| {
            let s = i
                .servers
                .iter()
                .find(|s| s.id == Some(server_id))
                .ok_or_else(|| missing("/servers/testConnection", "server"))?;
            Ok((s.url.clone(), s.authkey.clone().unwrap_or_default()))
        })?;
        let state = self.state.borrow();
        let Some(target) = state
            .instances
            .iter()
            .find(|i| i.answers_to(&url) && i.reachable)
        else {
            return Ok(ServerTestStatus::Unreachable);
        };
        Ok(match target.user_for_key(&authkey) {
            Some(_) => ServerTestStatus::Ok,
            None => ServerTestStatus::AuthFailed,
        })
    }

    fn push_server(&self, server_id: u64) -> Result<(), FleetError> {
        self.with("/push_server", true, |i| {
            if !i.servers.iter().any(|s| s.id == Some(server_id)) {
                return Err(missing("/servers/push", "server"));
            }
            i.pushes.push(server_id);
            Ok(())
        })
    }

    fn sharing_groups(&self) -> Result<Vec<SharingGroup>, FleetError> {
        self.with("/sharing_groups", true, |i| Ok(i.sharing_groups.clone()))
    }

    fn add_sharing_group(&self, group: &SharingGroup) -> Result<SharingGroup, FleetError> {
        self.with("/add_sharing_group", true, |i| {
            if i.sharing_group_named(&group.name).is_some() {
                return Err(rejected("/sharing_groups/add", "Sharing group name already in use"));
            }
            let mut created = group.clone();
            created.id = Some(i.next_id());
            created.org_ids.clear();
            created.server_ids.clear();
            i.sharing_groups.push(created.clone());
            Ok(created)
        })
    }

    fn add_org_to_sharing_group(&self, group_id: u64, org_id: u64) -> Result<(), FleetError> {
        self.with("/add_org_to_sharing_group", true, |i| {
            if !i.organisations.iter().any(|o| o.id == Some(org_id)) {
                return Err(missing("/sharing_groups/addOrg", "organisation"));
            }
            let group = i
                .sharing_groups
                .iter_mut()
                .find(|g| g.id == Some(group_id))
                .ok_or_else(|| missing("/sharing_groups/addOrg", "sharing group"))?;
            if !group.org_ids.contains(&org_id) {
                group.org_ids.push(org_id);
            }
            Ok(())
        })
    }

    fn add_server_to_sharing_group(
        &self,
        group_id: u64,
        server_id: u64,
    ) -> Result<(), FleetError> {
        self.with("/add_server_to_sharing_group", true, |i| {
            if !i.servers.iter().any(|s| s.id == Some(server_id)) {
                return Err(missing("/sharing_groups/addServer", "server"));
            }
            let group = i
                .sharing_groups
                .iter_mut()
                .find(|g| g.id == Some(group_id))
                .ok_or_else(|| missing("/sharing_groups/addServer", "sharing group"))?;
            if !group.server_ids.contains(&server_id) {
                group.server_ids.push(server_id);
            }
            Ok(())
        })
    }

    fn set_server_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), FleetError> {
        self.with("/set_server_setting", true, |i| {
            i.settings.insert(key.to_string(), value.clone());
            Ok(())
        })
    }

    fn update_platform(&self) -> Result<(), FleetError> {
        self.with("/update_platform", true, |i| {
            i.platform_updates += 1;
            Ok(())
        })
    }

    fn update_definitions(&self, set: Definitions) -> Result<(), FleetError> {
        self.with("/update_definitions", true, |i| {
            i.definition_updates.push(set);
            Ok(())
        })
    }

    fn user_statistics(&self, context: &str) -> Result<serde_json::Value, FleetError> {
        self.with("/user_statistics", true, |i| {
            Ok(serde_json::json!({
                "context": context,
                "stats": {
                    "org_count": i.organisations.len(),
                    "user_count": i.users.len(),
                    "event_count": i.events.len(),
                }
            }))
        })
    }

    fn event_uuids(&self) -> Result<Vec<String>, FleetError> {
        self.with("/event_uuids", true, |i| {
            Ok(i.events
                .iter()
                .filter_map(|e| e.get("uuid").and_then(serde_json::Value::as_str))
                .map(str::to_string)
                .collect())
        })
    }

    fn event(&self, uuid: &str) -> Result<serde_json::Value, FleetError> {
        self.with("/event", true, |i| {
            i.event_by_uuid(uuid)
                .cloned()
                .ok_or_else(|| missing("/events/view", "event"))
        })
    }

    fn delete_event(&self, uuid: &str) -> Result<(), FleetError> {
        self.with("/delete_event", true, |i| {
            let before = i.events.len();
            i.events
                .retain(|e| e.get("uuid").and_then(serde_json::Value::as_str) != Some(uuid));
            if i.events.len() == before {
                return Err(missing("/events/delete", "event"));
            }
            Ok(())
        })
    }

    fn event_blocklist(&self) -> Result<Vec<String>, FleetError> {
        self.with("/event_blocklist", true, |i| Ok(i.event_blocklist.clone()))
    }

    fn direct_call(
        &self,
        path: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, FleetError> {
        self.with("/direct_call", true, |i| {
            i.calls.push((path.to_string(), payload.cloned()));
            Ok(serde_json::json!({ "path": path, "received": payload }))
        })
    }
}
