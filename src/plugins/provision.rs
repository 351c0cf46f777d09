//! Identity provisioning: the host organisation, the site admin and the org
//! admin of one instance.
//!
//! Runs against the bootstrap admin key from the config record. Every
//! credential created on the platform is written back to the record before
//! the next call, so an interrupted run never loses a key.

use crate::core::error::FleetError;
use crate::core::journal::Journal;
use crate::core::registry::{self, Instance, InstanceConfig, NodeRole};
use crate::core::secrets::{self, PASSWORD_SENTINEL};
use crate::core::topology::TopologyConfig;
use crate::core::upsert::{EntityKind, Target, upsert_by_key};
use crate::platform::{Connector, MispApi, Organisation, Role, User, require_id};
use serde_json::json;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisionOptions {
    /// Reset stored passwords even when the record already holds one.
    pub force_reset_passwords: bool,
    /// Mint fresh authkeys even when the record already holds one.
    pub rotate_authkeys: bool,
}

/// A provisioned instance, with a session authenticated as its site admin.
pub struct InstanceHandle {
    pub name: String,
    pub role: NodeRole,
    pub orgname: String,
    pub hostname: String,
    pub baseurl: String,
    /// Address peers use to reach this instance.
    pub peer_url: String,
    /// The host organisation as stored on this instance.
    pub org: Organisation,
    pub api: Box<dyn MispApi>,
}

impl InstanceHandle {
    pub fn org_id(&self) -> Result<u64, FleetError> {
        require_id(self.org.id, &self.orgname)
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("orgname", &self.orgname)
            .field("peer_url", &self.peer_url)
            .finish_non_exhaustive()
    }
}

/// Session as the bootstrap admin.
pub fn bootstrap_session(
    instance: &Instance,
    connector: &dyn Connector,
) -> Result<Box<dyn MispApi>, FleetError> {
    connector.connect(&instance.config.baseurl, &instance.config.admin_key)
}

/// Session as the site admin, falling back to the bootstrap admin on
/// instances that were never provisioned.
pub fn admin_session(
    instance: &Instance,
    connector: &dyn Connector,
) -> Result<Box<dyn MispApi>, FleetError> {
    let key = instance
        .config
        .site_admin_authkey
        .as_deref()
        .filter(|k| !k.is_empty())
        .unwrap_or(&instance.config.admin_key);
    connector.connect(&instance.config.baseurl, key)
}

/// Find or create `email` in `org_id` with `role`, converging org and role
/// of an existing account.
pub fn ensure_user(
    api: &dyn MispApi,
    instance: &str,
    email: &str,
    org_id: u64,
    role: Role,
) -> Result<User, FleetError> {
    let desired = User::new(email, org_id, role);
    let upserted = upsert_by_key(
        Target {
            instance,
            kind: EntityKind::User,
            key: &email.to_ascii_lowercase(),
        },
        || api.add_user(&desired),
        || api.users(),
        |u| u.email.to_ascii_lowercase(),
        |existing| {
            if existing.org_id == org_id && existing.role_id == role.role_id() && !existing.disabled
            {
                return Ok(existing);
            }
            api.update_user(&User {
                org_id,
                role_id: role.role_id(),
                disabled: false,
                ..existing
            })
        },
    )?;
    Ok(upserted.entity)
}

/// Find or create an organisation by name, converging its uuid when one is
/// given.
pub fn ensure_organisation(
    api: &dyn MispApi,
    instance: &str,
    desired: &Organisation,
) -> Result<Organisation, FleetError> {
    let upserted = upsert_by_key(
        Target {
            instance,
            kind: EntityKind::Organisation,
            key: &desired.name,
        },
        || api.add_organisation(desired),
        || api.organisations(),
        |o| o.name.clone(),
        |existing| {
            let uuid_matches = desired.uuid.is_none() || existing.uuid == desired.uuid;
            if existing.local == desired.local && uuid_matches {
                return Ok(existing);
            }
            api.update_organisation(&Organisation {
                local: desired.local,
                uuid: desired.uuid.clone().or(existing.uuid.clone()),
                ..existing
            })
        },
    )?;
    Ok(upserted.entity)
}

#[derive(Debug, Clone, Copy)]
enum Account {
    SiteAdmin,
    OrgAdmin,
}

impl Account {
    fn role(self) -> Role {
        match self {
            Account::SiteAdmin => Role::SiteAdmin,
            Account::OrgAdmin => Role::OrgAdmin,
        }
    }

    fn email(self, instance: &Instance, topology: &TopologyConfig) -> String {
        match self {
            Account::SiteAdmin => instance.config.email_site_admin.clone(),
            Account::OrgAdmin => instance.config.orgadmin_email(topology),
        }
    }

    fn authkey(self, config: &mut InstanceConfig) -> &mut Option<String> {
        match self {
            Account::SiteAdmin => &mut config.site_admin_authkey,
            Account::OrgAdmin => &mut config.orgadmin_authkey,
        }
    }

    fn password(self, config: &mut InstanceConfig) -> &mut Option<String> {
        match self {
            Account::SiteAdmin => &mut config.site_admin_password,
            Account::OrgAdmin => &mut config.orgadmin_password,
        }
    }
}

/// Write the record right after a credential was created on the platform.
fn checkpoint(instance: &Instance, journal: &Journal) -> Result<(), FleetError> {
    if registry::persist(instance)? {
        journal.record("config.persist", &instance.name, "written", json!({}))?;
    }
    Ok(())
}

fn provision_account(
    api: &dyn MispApi,
    instance: &mut Instance,
    topology: &TopologyConfig,
    org_id: u64,
    account: Account,
    opts: ProvisionOptions,
    journal: &Journal,
) -> Result<bool, FleetError> {
    let name = instance.name.clone();
    let email = account.email(instance, topology);
    let user = ensure_user(api, &name, &email, org_id, account.role())?;
    let user_id = require_id(user.id, &email)?;

    let key_minted = secrets::resolve_or_provision(
        account.authkey(&mut instance.config),
        opts.rotate_authkeys,
        || api.new_authkey(user_id),
    )?;
    if key_minted {
        journal.record("identity.authkey", &name, "minted", json!({ "email": email }))?;
        checkpoint(instance, journal)?;
    }

    let force = opts.force_reset_passwords;
    let password_set = secrets::resolve_or_provision(
        account.password(&mut instance.config),
        force,
        || {
            if user.change_pw || force {
                let password = secrets::random_password();
                api.set_password(user_id, &password)?;
                Ok(password)
            } else {
                Ok(PASSWORD_SENTINEL.to_string())
            }
        },
    )?;
    if password_set {
        journal.record("identity.password", &name, "set", json!({ "email": email }))?;
        checkpoint(instance, journal)?;
    }
    Ok(key_minted || password_set)
}

/// Converge the identity of one instance and return a site admin session on
/// it.
#[instrument(skip_all, fields(instance = %instance.name))]
pub fn ensure_identity(
    instance: &mut Instance,
    connector: &dyn Connector,
    topology: &TopologyConfig,
    journal: &Journal,
    opts: ProvisionOptions,
) -> Result<InstanceHandle, FleetError> {
    let name = instance.name.clone();
    let bootstrap = bootstrap_session(instance, connector)?;

    let org = ensure_organisation(
        bootstrap.as_ref(),
        &name,
        &Organisation::named(&instance.config.admin_orgname),
    )?;
    let org_id = require_id(org.id, &instance.config.admin_orgname)?;

    let mut changed = false;
    if instance.config.email_orgadmin.is_none() {
        instance.config.email_orgadmin = Some(instance.config.orgadmin_email(topology));
        changed = true;
    }

    if changed {
        checkpoint(instance, journal)?;
    }
    for account in [Account::SiteAdmin, Account::OrgAdmin] {
        changed |= provision_account(
            bootstrap.as_ref(),
            instance,
            topology,
            org_id,
            account,
            opts,
            journal,
        )?;
    }

    let api = admin_session(instance, connector)?;
    info!(org = %org.name, "identity converged");
    journal.record(
        "identity.ensure",
        &name,
        "success",
        json!({ "org": org.name, "changed": changed }),
    )?;
    Ok(InstanceHandle {
        name,
        role: instance.role,
        orgname: instance.config.admin_orgname.clone(),
        hostname: instance.config.hostname.clone(),
        baseurl: instance.config.baseurl.clone(),
        peer_url: instance.config.peer_url().to_string(),
        org,
        api,
    })
}
