//! Platform entities as this crate sees them.
//!
//! The platform serializes ids as strings and flags as `"0"`/`"1"` in some
//! endpoints and as numbers/bools in others; the `lenient` helpers accept
//! every form.

use serde::{Deserialize, Serialize};

pub(crate) mod lenient {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
        Bool(bool),
        Null,
    }

    pub fn id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Ok(match Raw::deserialize(d)? {
            Raw::Num(n) => Some(n),
            Raw::Str(s) => s.trim().parse().ok(),
            Raw::Bool(_) | Raw::Null => None,
        })
    }

    pub fn num<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        Ok(id(d)?.unwrap_or(0))
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(match Raw::deserialize(d)? {
            Raw::Bool(b) => b,
            Raw::Num(n) => n != 0,
            Raw::Str(s) => matches!(s.as_str(), "1" | "true" | "True"),
            Raw::Null => false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Organisation {
    #[serde(default, deserialize_with = "lenient::id", skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default = "default_true", deserialize_with = "lenient::flag")]
    pub local: bool,
}

fn default_true() -> bool {
    true
}

impl Organisation {
    pub fn named(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            uuid: None,
            local: true,
        }
    }

    pub fn with_uuid(mut self, uuid: Option<String>) -> Self {
        self.uuid = uuid;
        self
    }
}

/// Default platform role ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SiteAdmin,
    OrgAdmin,
    User,
    SyncUser,
}

impl Role {
    pub fn role_id(self) -> u64 {
        match self {
            Role::SiteAdmin => 1,
            Role::OrgAdmin => 2,
            Role::User => 3,
            Role::SyncUser => 5,
        }
    }

    pub fn from_role_id(id: u64) -> Option<Self> {
        match id {
            1 => Some(Role::SiteAdmin),
            2 => Some(Role::OrgAdmin),
            3 => Some(Role::User),
            5 => Some(Role::SyncUser),
            _ => None,
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "site_admin" | "admin" => Ok(Role::SiteAdmin),
            "org_admin" | "orgadmin" => Ok(Role::OrgAdmin),
            "user" | "normal" => Ok(Role::User),
            "sync_user" | "sync" => Ok(Role::SyncUser),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct User {
    #[serde(default, deserialize_with = "lenient::id", skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub email: String,
    #[serde(default, deserialize_with = "lenient::num")]
    pub org_id: u64,
    #[serde(default, deserialize_with = "lenient::num")]
    pub role_id: u64,
    /// The platform's "must change password" flag: set until the owner logs
    /// in and picks a password of their own.
    #[serde(default, deserialize_with = "lenient::flag")]
    pub change_pw: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub disabled: bool,
}

impl User {
    pub fn new(email: &str, org_id: u64, role: Role) -> Self {
        Self {
            id: None,
            email: email.to_string(),
            org_id,
            role_id: role.role_id(),
            change_pw: false,
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Tag {
    #[serde(default, deserialize_with = "lenient::id", skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub exportable: bool,
    /// Owning organisation; 0 means usable by every organisation.
    #[serde(default, deserialize_with = "lenient::num")]
    pub org_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colour: Option<String>,
}

impl Tag {
    pub fn new(name: &str, exportable: bool, org_id: Option<u64>) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            exportable,
            org_id: org_id.unwrap_or(0),
            colour: None,
        }
    }
}

/// Connection parameters a peer needs to register a sync server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// `None` keeps whatever key an existing registration already holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authkey: Option<String>,
    #[serde(rename = "Organisation")]
    pub remote_org: Organisation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Server {
    #[serde(default, deserialize_with = "lenient::id", skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authkey: Option<String>,
    #[serde(default, deserialize_with = "lenient::num")]
    pub remote_org_id: u64,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub push: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub pull: bool,
    #[serde(default)]
    pub push_rules: String,
    #[serde(default)]
    pub pull_rules: String,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub unpublish_event: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub self_signed: bool,
}

/// Result of a server connectivity test, by platform status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTestStatus {
    Ok,
    Unreachable,
    UnexpectedResponse,
    AuthFailed,
    Other(u64, String),
}

impl ServerTestStatus {
    pub fn from_code(code: u64, message: Option<String>) -> Self {
        match code {
            1 => ServerTestStatus::Ok,
            2 => ServerTestStatus::Unreachable,
            3 => ServerTestStatus::UnexpectedResponse,
            4 => ServerTestStatus::AuthFailed,
            other => ServerTestStatus::Other(other, message.unwrap_or_default()),
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == ServerTestStatus::Ok
    }
}

impl std::fmt::Display for ServerTestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerTestStatus::Ok => write!(f, "ok"),
            ServerTestStatus::Unreachable => write!(f, "remote unreachable"),
            ServerTestStatus::UnexpectedResponse => write!(f, "unexpected response"),
            ServerTestStatus::AuthFailed => write!(f, "authentication rejected"),
            ServerTestStatus::Other(code, msg) => write!(f, "status {} {}", code, msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SharingGroup {
    #[serde(default, deserialize_with = "lenient::id", skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    #[serde(default)]
    pub releasability: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing)]
    pub org_ids: Vec<u64>,
    #[serde(default, skip_serializing)]
    pub server_ids: Vec<u64>,
}

/// Bundled JSON definition sets the platform can refresh from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Definitions {
    ObjectTemplates,
    Galaxies,
    Taxonomies,
    Warninglists,
    Noticelists,
}

impl Definitions {
    pub const ALL: [Definitions; 5] = [
        Definitions::ObjectTemplates,
        Definitions::Galaxies,
        Definitions::Taxonomies,
        Definitions::Warninglists,
        Definitions::Noticelists,
    ];

    pub fn endpoint(self) -> &'static str {
        match self {
            Definitions::ObjectTemplates => "/objectTemplates/update",
            Definitions::Galaxies => "/galaxies/update",
            Definitions::Taxonomies => "/taxonomies/update",
            Definitions::Warninglists => "/warninglists/update",
            Definitions::Noticelists => "/noticelists/update",
        }
    }
}

impl std::fmt::Display for Definitions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Definitions::ObjectTemplates => "object_templates",
            Definitions::Galaxies => "galaxies",
            Definitions::Taxonomies => "taxonomies",
            Definitions::Warninglists => "warninglists",
            Definitions::Noticelists => "noticelists",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Definitions {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase().replace('-', "_");
        Definitions::ALL
            .into_iter()
            .find(|d| d.to_string() == wanted)
            .ok_or_else(|| format!("unknown definition set '{}'", s))
    }
}
