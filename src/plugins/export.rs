//! Credential export: one row per user per instance, written to `auth.json`
//! and `auth.csv` at the fleet root.

use crate::core::error::FleetError;
use crate::core::journal::Journal;
use crate::core::registry::{self, Instance, Registry};
use crate::core::secrets::{self, PASSWORD_SENTINEL, UNKNOWN_VALUE};
use crate::core::topology::TopologyConfig;
use crate::plugins::provision;
use crate::plugins::setup::Failure;
use crate::platform::{Connector, require_id};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use tracing::{error, info, instrument};

pub const AUTH_JSON: &str = "auth.json";
pub const AUTH_CSV: &str = "auth.csv";
/// Login of the admin account every fresh instance ships with.
pub const BOOTSTRAP_LOGIN: &str = "admin@admin.test";

const CSV_HEADER: [&str; 4] = ["url", "login", "authkey", "password"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRow {
    pub url: String,
    pub login: String,
    pub authkey: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthReport {
    pub rows: Vec<AuthRow>,
    /// Instances whose users could not be listed; their rows are missing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<Failure>,
}

impl AuthReport {
    pub fn for_login(&self, login: &str) -> Vec<&AuthRow> {
        self.rows.iter().filter(|r| r.login == login).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Which config slots hold the credentials of `login`, if any.
fn known_slots<'a>(
    instance: &'a mut Instance,
    login: &str,
    topology: &TopologyConfig,
) -> Option<(Option<&'a str>, &'a mut Option<String>)> {
    let orgadmin = instance.config.orgadmin_email(topology);
    let config = &mut instance.config;
    if login.eq_ignore_ascii_case(BOOTSTRAP_LOGIN) {
        Some((Some(config.admin_key.as_str()), &mut config.admin_password))
    } else if login.eq_ignore_ascii_case(&config.email_site_admin) {
        Some((config.site_admin_authkey.as_deref(), &mut config.site_admin_password))
    } else if login.eq_ignore_ascii_case(&orgadmin) {
        Some((config.orgadmin_authkey.as_deref(), &mut config.orgadmin_password))
    } else {
        None
    }
}

fn dump_instance(
    instance: &mut Instance,
    connector: &dyn Connector,
    topology: &TopologyConfig,
    journal: &Journal,
) -> Result<Vec<AuthRow>, FleetError> {
    let api = provision::admin_session(instance, connector)?;
    let url = instance.config.baseurl.clone();
    let mut rows = Vec::new();

    for user in api.users()? {
        let password = if user.change_pw {
            let password = secrets::random_password();
            api.set_password(require_id(user.id, &user.email)?, &password)?;
            journal.record("export.password", &instance.name, "regenerated", json!({ "email": user.email }))?;
            password
        } else {
            PASSWORD_SENTINEL.to_string()
        };

        let mut stored = false;
        let authkey = match known_slots(instance, &user.email, topology) {
            Some((authkey, password_slot)) => {
                let authkey = authkey.unwrap_or(UNKNOWN_VALUE).to_string();
                if user.change_pw {
                    *password_slot = Some(password.clone());
                    stored = true;
                }
                authkey
            }
            None => UNKNOWN_VALUE.to_string(),
        };
        if stored {
            registry::persist(instance)?;
        }

        rows.push(AuthRow {
            url: url.clone(),
            login: user.email,
            authkey,
            password,
        });
    }

    Ok(rows)
}

/// Collect credentials from every instance, regenerating the password of
/// every account that still has to change it.
///
/// An instance that refuses or cannot be reached is recorded in
/// `failures` and the others are still collected.
#[instrument(skip_all)]
pub fn dump_all(
    registry: &mut Registry,
    connector: &dyn Connector,
    topology: &TopologyConfig,
    journal: &Journal,
) -> Result<AuthReport, FleetError> {
    let mut report = AuthReport::default();
    for instance in registry.all_mut() {
        match dump_instance(instance, connector, topology, journal) {
            Ok(rows) => report.rows.extend(rows),
            Err(e) if e.is_scoped() => {
                error!(instance = %instance.name, error = %e, "credential export failed");
                journal.record(
                    "export.failure",
                    &instance.name,
                    "error",
                    json!({ "error": e.to_string() }),
                )?;
                report.failures.push(Failure {
                    scope: instance.name.clone(),
                    error: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
    info!(
        rows = report.rows.len(),
        failures = report.failures.len(),
        "credentials collected"
    );
    Ok(report)
}

/// Rows built from the config records alone, without touching any instance.
pub fn from_configs(registry: &Registry, topology: &TopologyConfig) -> AuthReport {
    let known = |v: &Option<String>| v.clone().unwrap_or_else(|| UNKNOWN_VALUE.to_string());
    let mut report = AuthReport::default();
    for instance in registry.all() {
        let c = &instance.config;
        report.rows.push(AuthRow {
            url: c.baseurl.clone(),
            login: BOOTSTRAP_LOGIN.to_string(),
            authkey: c.admin_key.clone(),
            password: known(&c.admin_password),
        });
        report.rows.push(AuthRow {
            url: c.baseurl.clone(),
            login: c.email_site_admin.clone(),
            authkey: known(&c.site_admin_authkey),
            password: known(&c.site_admin_password),
        });
        report.rows.push(AuthRow {
            url: c.baseurl.clone(),
            login: c.orgadmin_email(topology),
            authkey: known(&c.orgadmin_authkey),
            password: known(&c.orgadmin_password),
        });
    }
    report
}

fn render_csv(report: &AuthReport) -> Result<Vec<u8>, FleetError> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    wtr.write_record(CSV_HEADER)?;
    for row in &report.rows {
        wtr.serialize(row)?;
    }
    wtr.into_inner()
        .map_err(|e| FleetError::IoError(e.into_error()))
}

/// Write `auth.json` and `auth.csv` under `root`.
pub fn write_report(root: &Path, report: &AuthReport) -> Result<(), FleetError> {
    let mut json = serde_json::to_string_pretty(&report.rows)?;
    json.push('\n');
    registry::write_atomic(&root.join(AUTH_JSON), json.as_bytes())?;
    registry::write_atomic(&root.join(AUTH_CSV), &render_csv(report)?)?;
    Ok(())
}
