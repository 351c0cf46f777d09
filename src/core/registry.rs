//! Instance registry: discovery and persistence of per-instance config
//! records.
//!
//! Layout under the fleet root:
//!
//! ```text
//! <root>/misp-central/config.json   central node (instance 0)
//! <root>/misp-01/config.json        client 1
//! <root>/misp-02/config.json        client 2
//! ```
//!
//! `config.json` is the single source of truth for an instance's identity and
//! credentials. Writes go through [`persist`], which replaces the file whole.

use crate::core::error::FleetError;
use crate::core::topology::{DerivedIdentity, TopologyConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InstanceConfig {
    #[serde(default)]
    pub http_port: String,
    #[serde(default)]
    pub https_port: String,
    pub admin_key: String,
    pub baseurl: String,
    pub hostname: String,
    pub email_site_admin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_orgadmin: Option<String>,
    pub admin_orgname: String,
    #[serde(default)]
    pub external_baseurl: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_admin_authkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_admin_password: Option<String>,
    #[serde(
        default,
        alias = "org_admin_authkey",
        skip_serializing_if = "Option::is_none"
    )]
    pub orgadmin_authkey: Option<String>,
    #[serde(
        default,
        alias = "org_admin_password",
        skip_serializing_if = "Option::is_none"
    )]
    pub orgadmin_password: Option<String>,
    /// Fields this crate does not manage are carried through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl InstanceConfig {
    pub fn from_identity(identity: &DerivedIdentity, admin_key: String) -> Self {
        Self {
            http_port: identity.http_port.clone(),
            https_port: identity.https_port.clone(),
            admin_key,
            baseurl: identity.baseurl.clone(),
            hostname: identity.hostname.clone(),
            email_site_admin: identity.email_site_admin.clone(),
            email_orgadmin: Some(identity.email_orgadmin.clone()),
            admin_orgname: identity.admin_orgname.clone(),
            external_baseurl: identity.baseurl.clone(),
            ..Self::default()
        }
    }

    /// Org admin email; older records predate the field.
    pub fn orgadmin_email(&self, topology: &TopologyConfig) -> String {
        self.email_orgadmin
            .clone()
            .unwrap_or_else(|| format!("{}@{}", topology.orgadmin_email_name, self.hostname))
    }

    /// Address peers use to reach this instance.
    pub fn peer_url(&self) -> &str {
        if self.external_baseurl.is_empty() {
            &self.baseurl
        } else {
            &self.external_baseurl
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Central,
    Client,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub instance_id: u32,
    /// Directory name, e.g. `misp-03`.
    pub name: String,
    pub dir: PathBuf,
    pub role: NodeRole,
    pub config: InstanceConfig,
}

impl Instance {
    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn load(dir: &Path, instance_id: u32, role: NodeRole) -> Result<Self, FleetError> {
        let name = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Err(FleetError::ConfigMissing {
                instance: name,
                path,
            });
        }
        let content = fs::read_to_string(&path)?;
        let config: InstanceConfig = serde_json::from_str(&content)?;
        Ok(Self {
            instance_id,
            name,
            dir: dir.to_path_buf(),
            role,
            config,
        })
    }

    pub fn is_central(&self) -> bool {
        self.role == NodeRole::Central
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    pub root: PathBuf,
    pub central: Instance,
    pub clients: Vec<Instance>,
}

impl Registry {
    pub fn all(&self) -> impl Iterator<Item = &Instance> {
        std::iter::once(&self.central).chain(self.clients.iter())
    }

    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut Instance> {
        std::iter::once(&mut self.central).chain(self.clients.iter_mut())
    }

    pub fn len(&self) -> usize {
        1 + self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn find(&self, name: &str) -> Option<&Instance> {
        self.all()
            .find(|i| i.name == name || i.config.admin_orgname == name || i.config.hostname == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Instance> {
        self.all_mut()
            .find(|i| i.name == name || i.config.admin_orgname == name || i.config.hostname == name)
    }
}

/// Discover the central node and every `<prefix><digits>` client directory
/// under `root`.
pub fn list_instances(root: &Path, topology: &TopologyConfig) -> Result<Registry, FleetError> {
    let central_dir = root.join(&topology.central_node_name);
    let central = Instance::load(&central_dir, 0, NodeRole::Central)?;

    let pattern = format!(r"^{}(\d+)$", regex::escape(&topology.prefix_client_node));
    let client_re = Regex::new(&pattern)
        .map_err(|e| FleetError::ValidationError(format!("client prefix pattern: {}", e)))?;

    let mut clients = Vec::new();
    if root.is_dir() {
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            if dir_name == topology.central_node_name {
                continue;
            }
            let Some(caps) = client_re.captures(&dir_name) else {
                if dir_name.starts_with(&topology.prefix_client_node) {
                    warn!(dir = %dir_name, "skipping directory without a client number");
                }
                continue;
            };
            let instance_id: u32 = caps[1].parse().map_err(|_| {
                FleetError::ValidationError(format!("client number out of range: {}", dir_name))
            })?;
            if instance_id == 0 {
                return Err(FleetError::ValidationError(format!(
                    "client directory {} uses the central node id 0",
                    dir_name
                )));
            }
            clients.push(Instance::load(&entry.path(), instance_id, NodeRole::Client)?);
        }
    }
    clients.sort_by_key(|i| i.instance_id);
    debug!(clients = clients.len(), root = %root.display(), "loaded instance registry");

    Ok(Registry {
        root: root.to_path_buf(),
        central,
        clients,
    })
}

fn render_config(config: &InstanceConfig) -> Result<String, FleetError> {
    let mut out = serde_json::to_string_pretty(config)?;
    out.push('\n');
    Ok(out)
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Write the instance's config record back to disk.
///
/// The record is written to a sibling temp file and renamed over
/// `config.json`. Returns `false` when the file already held identical
/// content and nothing was written.
pub fn persist(instance: &Instance) -> Result<bool, FleetError> {
    let path = instance.config_path();
    let rendered = render_config(&instance.config)?;
    if let Ok(existing) = fs::read(&path)
        && digest(&existing) == digest(rendered.as_bytes())
    {
        return Ok(false);
    }
    write_atomic(&path, rendered.as_bytes())?;
    debug!(instance = %instance.name, "persisted config record");
    Ok(true)
}

/// Replace `path` whole: write a hidden sibling, then rename over it.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FleetError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp", file_name));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
