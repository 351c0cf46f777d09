//! Fleet-wide topology constants.
//!
//! Everything that names, counts, or scopes the fleet lives in
//! [`TopologyConfig`]; it is loaded once per run from `fleet.toml` and passed
//! explicitly to the registry, the provisioner and the negotiator.

use crate::core::error::FleetError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const TOPOLOGY_FILE: &str = "fleet.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopologyConfig {
    pub central_node_name: String,
    pub prefix_client_node: String,
    pub hostname_suffix: String,
    pub url_scheme: String,
    pub internal_network_name: String,
    pub central_node_org_name: String,
    pub client_node_org_name_prefix: String,
    pub admin_email_name: String,
    pub orgadmin_email_name: String,
    /// Verify TLS certificates of the instances (and of peers, for sync).
    pub secure_connection: bool,
    /// Also link every client with every other client.
    pub mesh: bool,
    pub unpublish_event: bool,
    pub session_timeout: u64,
    pub lock: LockSettings,
    pub tags: TagCatalog,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockSettings {
    /// Relative paths are resolved against the fleet root.
    pub path: PathBuf,
    pub max_age_secs: u64,
}

/// The fixed control-tag catalog. Names only; ids are per instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TagCatalog {
    pub local_central: Vec<String>,
    pub reserved_central: Vec<String>,
    pub central_to_nodes: Vec<String>,
    pub nodes_to_central: Vec<String>,
    pub local_clients: Vec<String>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            central_node_name: "misp-central".to_string(),
            prefix_client_node: "misp-".to_string(),
            hostname_suffix: ".local".to_string(),
            url_scheme: "http".to_string(),
            internal_network_name: "custom_misp_training_environment".to_string(),
            central_node_org_name: "Central Node".to_string(),
            client_node_org_name_prefix: "Node ".to_string(),
            admin_email_name: "admin".to_string(),
            orgadmin_email_name: "orgadmin".to_string(),
            secure_connection: false,
            mesh: false,
            unpublish_event: false,
            session_timeout: 300,
            lock: LockSettings::default(),
            tags: TagCatalog::default(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("push.lock"),
            max_age_secs: 3600,
        }
    }
}

impl Default for TagCatalog {
    fn default() -> Self {
        Self {
            local_central: vec!["exercise:scope=\"central-only\"".to_string()],
            reserved_central: vec!["exercise:scope=\"central-reserved\"".to_string()],
            central_to_nodes: vec!["exercise:sync=\"central-to-nodes\"".to_string()],
            nodes_to_central: vec!["exercise:sync=\"nodes-to-central\"".to_string()],
            local_clients: vec!["exercise:scope=\"node-only\"".to_string()],
        }
    }
}

/// Identity fields derived purely from the numbering scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedIdentity {
    pub instance_id: u32,
    pub dir_name: String,
    pub hostname: String,
    pub baseurl: String,
    pub admin_orgname: String,
    pub email_site_admin: String,
    pub email_orgadmin: String,
    pub http_port: String,
    pub https_port: String,
}

impl TopologyConfig {
    /// Load `path` if given, else `<root>/fleet.toml` if present, else defaults.
    pub fn load(root: &Path, path: Option<&Path>) -> Result<Self, FleetError> {
        let candidate = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(FleetError::NotFound(format!(
                        "topology file {}",
                        p.display()
                    )));
                }
                p.to_path_buf()
            }
            None => root.join(TOPOLOGY_FILE),
        };
        if !candidate.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&candidate)?;
        let config: TopologyConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.prefix_client_node.is_empty() {
            return Err(FleetError::ValidationError(
                "prefix_client_node must not be empty".into(),
            ));
        }
        if !matches!(self.url_scheme.as_str(), "http" | "https") {
            return Err(FleetError::ValidationError(format!(
                "unsupported url_scheme '{}'",
                self.url_scheme
            )));
        }
        Ok(())
    }

    pub fn lock_path(&self, root: &Path) -> PathBuf {
        if self.lock.path.is_absolute() {
            self.lock.path.clone()
        } else {
            root.join(&self.lock.path)
        }
    }

    /// Derive the identity of instance `instance_id` in a fleet of
    /// `client_count` clients. Client numbers are zero-padded to the width of
    /// `client_count`.
    pub fn derive_identity(&self, instance_id: u32, client_count: u32) -> DerivedIdentity {
        let width = client_count.max(1).to_string().len();
        let (dir_name, admin_orgname) = if instance_id == 0 {
            (
                self.central_node_name.clone(),
                self.central_node_org_name.clone(),
            )
        } else {
            (
                format!("{}{:0width$}", self.prefix_client_node, instance_id),
                format!(
                    "{}{:0width$}",
                    self.client_node_org_name_prefix, instance_id
                ),
            )
        };
        let hostname = format!("{}{}", dir_name, self.hostname_suffix);
        DerivedIdentity {
            instance_id,
            baseurl: format!("{}://{}", self.url_scheme, hostname),
            email_site_admin: format!("{}@{}", self.admin_email_name, hostname),
            email_orgadmin: format!("{}@{}", self.orgadmin_email_name, hostname),
            http_port: format!("80{}", instance_id),
            https_port: format!("443{}", instance_id),
            dir_name,
            hostname,
            admin_orgname,
        }
    }

    /// Base URL for an address discovered on the internal network.
    pub fn url_for_address(&self, address: &str) -> String {
        format!("{}://{}", self.url_scheme, address)
    }
}
