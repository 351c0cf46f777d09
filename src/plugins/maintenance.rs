//! Fleet-wide maintenance: session timeouts, password resets, extra users,
//! platform and definition updates, usage statistics and raw API calls.

use crate::core::error::FleetError;
use crate::core::journal::Journal;
use crate::core::registry::{self, Registry};
use crate::core::secrets;
use crate::core::topology::TopologyConfig;
use crate::plugins::export::BOOTSTRAP_LOGIN;
use crate::plugins::provision;
use crate::platform::{Connector, Definitions, Organisation, Role, User, require_id};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

pub const SESSION_TIMEOUT: &str = "Session.timeout";
pub const COOKIE_TIMEOUT: &str = "Session.cookieTimeout";

/// Set the session timeout on every instance; the cookie lives ten times
/// longer.
pub fn change_session_timeout(
    registry: &Registry,
    connector: &dyn Connector,
    journal: &Journal,
    seconds: u64,
) -> Result<usize, FleetError> {
    if seconds == 0 {
        return Err(FleetError::ValidationError(
            "session timeout must be positive".to_string(),
        ));
    }
    let cookie = seconds.checked_mul(10).ok_or_else(|| {
        FleetError::ValidationError(format!("session timeout {}s is too large", seconds))
    })?;
    let mut count = 0;
    for instance in registry.all() {
        let api = provision::admin_session(instance, connector)?;
        api.set_server_setting(SESSION_TIMEOUT, &json!(seconds))?;
        api.set_server_setting(COOKIE_TIMEOUT, &json!(cookie))?;
        journal.record("maintenance.timeout", &instance.name, "set", json!({ "seconds": seconds }))?;
        count += 1;
    }
    info!(instances = count, seconds, "session timeout updated");
    Ok(count)
}

#[derive(Debug, Clone, Serialize)]
pub struct PasswordReset {
    pub instance: String,
    pub login: String,
    pub password: String,
}

/// Reset one user's password, generating one when none is given. The new
/// password is written to the config record when it belongs to a managed
/// account.
pub fn reset_password(
    registry: &mut Registry,
    connector: &dyn Connector,
    topology: &TopologyConfig,
    journal: &Journal,
    instance_name: &str,
    login: &str,
    password: Option<&str>,
) -> Result<PasswordReset, FleetError> {
    let instance = registry
        .find_mut(instance_name)
        .ok_or_else(|| FleetError::NotFound(format!("instance '{}'", instance_name)))?;
    let api = provision::admin_session(instance, connector)?;
    let user = api
        .users()?
        .into_iter()
        .find(|u| u.email.eq_ignore_ascii_case(login))
        .ok_or_else(|| {
            FleetError::NotFound(format!("user '{}' on {}", login, instance.name))
        })?;
    let password = password
        .map(str::to_string)
        .unwrap_or_else(secrets::random_password);
    api.set_password(require_id(user.id, login)?, &password)?;

    let config = &mut instance.config;
    let slot = if login.eq_ignore_ascii_case(BOOTSTRAP_LOGIN) {
        Some(&mut config.admin_password)
    } else if login.eq_ignore_ascii_case(&config.email_site_admin) {
        Some(&mut config.site_admin_password)
    } else if login.eq_ignore_ascii_case(&config.orgadmin_email(topology)) {
        Some(&mut config.orgadmin_password)
    } else {
        None
    };
    if let Some(slot) = slot {
        *slot = Some(password.clone());
        registry::persist(instance)?;
    }
    journal.record("maintenance.password", &instance.name, "reset", json!({ "email": user.email }))?;
    Ok(PasswordReset {
        instance: instance.name.clone(),
        login: user.email,
        password,
    })
}

/// Create `email` with `role` on every instance, in each instance's host
/// organisation.
pub fn add_user_everywhere(
    registry: &Registry,
    connector: &dyn Connector,
    journal: &Journal,
    email: &str,
    role: Role,
) -> Result<Vec<(String, User)>, FleetError> {
    let mut created = Vec::new();
    for instance in registry.all() {
        let api = provision::admin_session(instance, connector)?;
        let org = provision::ensure_organisation(
            api.as_ref(),
            &instance.name,
            &Organisation::named(&instance.config.admin_orgname),
        )?;
        let org_id = require_id(org.id, &org.name)?;
        let user = provision::ensure_user(api.as_ref(), &instance.name, email, org_id, role)?;
        journal.record("maintenance.user", &instance.name, "ensured", json!({ "email": email }))?;
        created.push((instance.name.clone(), user));
    }
    Ok(created)
}

/// Refresh the given definition sets on every instance, central first.
#[instrument(skip_all)]
pub fn update_definitions_everywhere(
    registry: &Registry,
    connector: &dyn Connector,
    journal: &Journal,
    sets: &[Definitions],
) -> Result<usize, FleetError> {
    let mut count = 0;
    for instance in registry.all() {
        let api = provision::admin_session(instance, connector)?;
        for set in sets {
            journal.track("maintenance.definitions", &instance.name, || {
                api.update_definitions(*set)
            })?;
        }
        count += 1;
    }
    info!(instances = count, sets = sets.len(), "definitions updated");
    Ok(count)
}

/// Ask every instance to update its own code.
pub fn update_platform_everywhere(
    registry: &Registry,
    connector: &dyn Connector,
    journal: &Journal,
) -> Result<usize, FleetError> {
    let mut count = 0;
    for instance in registry.all() {
        let api = provision::admin_session(instance, connector)?;
        journal.track("maintenance.update", &instance.name, || api.update_platform())?;
        count += 1;
    }
    Ok(count)
}

/// Send the same raw call to every instance and collect the answers by
/// instance name.
pub fn direct_call_everywhere(
    registry: &Registry,
    connector: &dyn Connector,
    journal: &Journal,
    path: &str,
    payload: Option<&Value>,
) -> Result<BTreeMap<String, Value>, FleetError> {
    if path.trim_matches('/').is_empty() {
        return Err(FleetError::ValidationError("call path is empty".to_string()));
    }
    let mut answers = BTreeMap::new();
    for instance in registry.all() {
        let api = provision::admin_session(instance, connector)?;
        let answer = journal.track("maintenance.call", &instance.name, || {
            api.direct_call(path, payload)
        })?;
        answers.insert(instance.name.clone(), answer);
    }
    Ok(answers)
}

pub const CLIENT_STATS_FILE: &str = "clients.json";

#[derive(Debug, Clone, Serialize)]
pub struct StatsDump {
    pub central: PathBuf,
    pub clients: PathBuf,
}

/// Write central's statistics to `<central orgname>.json` and every
/// client's, keyed by instance name, to `clients.json`.
pub fn dump_statistics(
    registry: &Registry,
    connector: &dyn Connector,
    dest: &Path,
    context: &str,
) -> Result<StatsDump, FleetError> {
    fs::create_dir_all(dest)?;
    let central = &registry.central;
    let stats = provision::admin_session(central, connector)?.user_statistics(context)?;
    let central_path = dest.join(format!("{}.json", central.config.admin_orgname));
    registry::write_atomic(&central_path, &serde_json::to_vec_pretty(&stats)?)?;

    let mut clients = BTreeMap::new();
    for instance in &registry.clients {
        let api = provision::admin_session(instance, connector)?;
        clients.insert(instance.name.clone(), api.user_statistics(context)?);
    }
    let clients_path = dest.join(CLIENT_STATS_FILE);
    registry::write_atomic(&clients_path, &serde_json::to_vec_pretty(&clients)?)?;
    info!(dest = %dest.display(), clients = clients.len(), "statistics written");
    Ok(StatsDump {
        central: central_path,
        clients: clients_path,
    })
}

/// Move every instance's site admin into organisation `org_id`.
///
/// The next `setup` puts them back into the host organisation.
pub fn move_site_admins(
    registry: &Registry,
    connector: &dyn Connector,
    journal: &Journal,
    org_id: u64,
) -> Result<Vec<String>, FleetError> {
    let mut moved = Vec::new();
    for instance in registry.all() {
        let api = provision::admin_session(instance, connector)?;
        if !api.organisations()?.iter().any(|o| o.id == Some(org_id)) {
            return Err(FleetError::NotFound(format!(
                "organisation {} on {}",
                org_id, instance.name
            )));
        }
        let email = &instance.config.email_site_admin;
        provision::ensure_user(api.as_ref(), &instance.name, email, org_id, Role::SiteAdmin)?;
        journal.record(
            "maintenance.admin_org",
            &instance.name,
            "moved",
            json!({ "email": email, "org_id": org_id }),
        )?;
        moved.push(instance.name.clone());
    }
    Ok(moved)
}
