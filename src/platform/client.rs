//! REST client for the platform admin API.

use crate::core::error::FleetError;
use crate::platform::model::{
    Definitions, Organisation, Server, ServerTestStatus, SharingGroup, SyncConfig, Tag, User,
};
use crate::platform::{Connector, MispApi};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, instrument};

/// Default request timeout; server tests against an unreachable peer can
/// take a while on the platform side.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct HttpConnector {
    verify_tls: bool,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(verify_tls: bool) -> Self {
        Self {
            verify_tls,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Connector for HttpConnector {
    fn connect(&self, baseurl: &str, key: &str) -> Result<Box<dyn MispApi>, FleetError> {
        Ok(Box::new(MispClient::new(
            baseurl,
            key,
            self.verify_tls,
            self.timeout,
        )?))
    }
}

#[derive(Debug)]
pub struct MispClient {
    client: Client,
    base_url: String,
    key: String,
}

impl MispClient {
    pub fn new(
        base_url: &str,
        key: &str,
        verify_tls: bool,
        timeout: Duration,
    ) -> Result<Self, FleetError> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
        })
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Authorization", &self.key)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
    }

    fn get(&self, endpoint: &str) -> Result<Value, FleetError> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(%url, "GET");
        let response = self.authed(self.client.get(&url)).send()?;
        handle_response(endpoint, response)
    }

    fn post(&self, endpoint: &str, body: &Value) -> Result<Value, FleetError> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(%url, "POST");
        let response = self.authed(self.client.post(&url)).json(body).send()?;
        handle_response(endpoint, response)
    }
}

fn handle_response(
    endpoint: &str,
    response: reqwest::blocking::Response,
) -> Result<Value, FleetError> {
    let status = response.status();
    let bytes = response.bytes()?;
    let body: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };

    if !status.is_success() {
        return Err(api_error(status, endpoint, &body));
    }
    // Some endpoints report validation failures with a 200 and an `errors` key.
    if body.get("errors").is_some_and(|e| !e.is_null()) {
        return Err(api_error(StatusCode::FORBIDDEN, endpoint, &body));
    }
    Ok(body)
}

fn api_error(status: StatusCode, endpoint: &str, body: &Value) -> FleetError {
    let message = match body {
        Value::String(s) => s.clone(),
        Value::Null => status.canonical_reason().unwrap_or("no body").to_string(),
        other => {
            let msg = other.get("message").and_then(Value::as_str).unwrap_or("");
            match other.get("errors") {
                Some(errors) if !errors.is_null() => format!("{} {}", msg, errors).trim().to_string(),
                _ => msg.to_string(),
            }
        }
    };
    FleetError::Api {
        status: status.as_u16(),
        endpoint: endpoint.to_string(),
        message,
    }
}

/// Take `value[key]` when present (the platform wraps most records in their
/// model name), else the value itself.
fn unwrap_as<T: DeserializeOwned>(value: Value, key: &str) -> Result<T, FleetError> {
    let inner = match value {
        Value::Object(mut map) if map.contains_key(key) => map.remove(key).unwrap_or(Value::Null),
        other => other,
    };
    Ok(serde_json::from_value(inner)?)
}

fn unwrap_list<T: DeserializeOwned>(value: Value, key: &str) -> Result<Vec<T>, FleetError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(key).or_else(|| map.remove("response")) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    items.into_iter().map(|item| unwrap_as(item, key)).collect()
}

#[derive(Deserialize)]
struct EventRef {
    uuid: String,
}

#[derive(Deserialize)]
struct BlocklistRow {
    event_uuid: String,
}

#[derive(Deserialize)]
struct SharingGroupOrgRow {
    #[serde(deserialize_with = "crate::platform::model::lenient::num")]
    org_id: u64,
}

#[derive(Deserialize)]
struct SharingGroupServerRow {
    #[serde(deserialize_with = "crate::platform::model::lenient::num")]
    server_id: u64,
}

fn parse_sharing_group(item: Value) -> Result<SharingGroup, FleetError> {
    let org_rows: Vec<SharingGroupOrgRow> = item
        .get("SharingGroupOrg")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    let server_rows: Vec<SharingGroupServerRow> = item
        .get("SharingGroupServer")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    let mut group: SharingGroup = unwrap_as(item, "SharingGroup")?;
    group.org_ids = org_rows.into_iter().map(|r| r.org_id).collect();
    group.server_ids = server_rows.into_iter().map(|r| r.server_id).collect();
    Ok(group)
}

impl MispApi for MispClient {
    fn organisations(&self) -> Result<Vec<Organisation>, FleetError> {
        unwrap_list(self.get("/organisations/index/scope:all")?, "Organisation")
    }

    fn add_organisation(&self, org: &Organisation) -> Result<Organisation, FleetError> {
        unwrap_as(
            self.post("/admin/organisations/add", &serde_json::to_value(org)?)?,
            "Organisation",
        )
    }

    fn update_organisation(&self, org: &Organisation) -> Result<Organisation, FleetError> {
        let id = crate::platform::require_id(org.id, "organisation")?;
        unwrap_as(
            self.post(
                &format!("/admin/organisations/edit/{}", id),
                &serde_json::to_value(org)?,
            )?,
            "Organisation",
        )
    }

    fn users(&self) -> Result<Vec<User>, FleetError> {
        unwrap_list(self.get("/admin/users/index")?, "User")
    }

    fn add_user(&self, user: &User) -> Result<User, FleetError> {
        unwrap_as(
            self.post("/admin/users/add", &serde_json::to_value(user)?)?,
            "User",
        )
    }

    fn update_user(&self, user: &User) -> Result<User, FleetError> {
        let id = crate::platform::require_id(user.id, "user")?;
        unwrap_as(
            self.post(
                &format!("/admin/users/edit/{}", id),
                &serde_json::to_value(user)?,
            )?,
            "User",
        )
    }

    #[instrument(skip(self))]
    fn new_authkey(&self, user_id: u64) -> Result<String, FleetError> {
        let body = self.post(&format!("/auth_keys/add/{}", user_id), &json!({}))?;
        body.pointer("/AuthKey/authkey_raw")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| FleetError::Api {
                status: 200,
                endpoint: format!("/auth_keys/add/{}", user_id),
                message: "response carries no authkey".to_string(),
            })
    }

    fn set_password(&self, user_id: u64, password: &str) -> Result<(), FleetError> {
        self.post(
            &format!("/admin/users/edit/{}", user_id),
            &json!({ "password": password }),
        )?;
        Ok(())
    }

    fn tags(&self) -> Result<Vec<Tag>, FleetError> {
        unwrap_list(self.get("/tags/index")?, "Tag")
    }

    fn add_tag(&self, tag: &Tag) -> Result<Tag, FleetError> {
        unwrap_as(self.post("/tags/add", &serde_json::to_value(tag)?)?, "Tag")
    }

    fn update_tag(&self, tag: &Tag) -> Result<Tag, FleetError> {
        let id = crate::platform::require_id(tag.id, "tag")?;
        unwrap_as(
            self.post(&format!("/tags/edit/{}", id), &serde_json::to_value(tag)?)?,
            "Tag",
        )
    }

    fn sync_config(&self) -> Result<SyncConfig, FleetError> {
        unwrap_as(self.get("/servers/createSync")?, "Server")
    }

    fn servers(&self) -> Result<Vec<Server>, FleetError> {
        unwrap_list(self.get("/servers/index")?, "Server")
    }

    fn import_server(&self, config: &SyncConfig) -> Result<Server, FleetError> {
        unwrap_as(
            self.post("/servers/import", &serde_json::to_value(config)?)?,
            "Server",
        )
    }

    fn update_server(&self, server: &Server) -> Result<Server, FleetError> {
        let id = crate::platform::require_id(server.id, "server")?;
        unwrap_as(
            self.post(
                &format!("/servers/edit/{}", id),
                &serde_json::to_value(server)?,
            )?,
            "Server",
        )
    }

    #[instrument(skip(self))]
    fn test_server(&self, server_id: u64) -> Result<ServerTestStatus, FleetError> {
        let body = self.post(&format!("/servers/testConnection/{}", server_id), &json!({}))?;
        let code = body
            .get("status")
            .and_then(|s| s.as_u64().or_else(|| s.as_str().and_then(|v| v.parse().ok())))
            .unwrap_or(0);
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(ServerTestStatus::from_code(code, message))
    }

    fn push_server(&self, server_id: u64) -> Result<(), FleetError> {
        self.get(&format!("/servers/push/{}/full", server_id))?;
        Ok(())
    }

    fn sharing_groups(&self) -> Result<Vec<SharingGroup>, FleetError> {
        let body = self.get("/sharing_groups/index")?;
        let items = match body {
            Value::Object(mut map) => match map.remove("response") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        items.into_iter().map(parse_sharing_group).collect()
    }

    fn add_sharing_group(&self, group: &SharingGroup) -> Result<SharingGroup, FleetError> {
        parse_sharing_group(self.post("/sharing_groups/add", &serde_json::to_value(group)?)?)
    }

    fn add_org_to_sharing_group(&self, group_id: u64, org_id: u64) -> Result<(), FleetError> {
        self.post(
            &format!("/sharing_groups/addOrg/{}/{}", group_id, org_id),
            &json!({}),
        )?;
        Ok(())
    }

    fn add_server_to_sharing_group(
        &self,
        group_id: u64,
        server_id: u64,
    ) -> Result<(), FleetError> {
        self.post(
            &format!("/sharing_groups/addServer/{}/{}", group_id, server_id),
            &json!({}),
        )?;
        Ok(())
    }

    fn set_server_setting(&self, key: &str, value: &Value) -> Result<(), FleetError> {
        self.post(
            &format!("/servers/serverSettingsEdit/{}", key),
            &json!({ "value": value }),
        )?;
        Ok(())
    }

    fn update_platform(&self) -> Result<(), FleetError> {
        self.post("/servers/update", &json!({}))?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn update_definitions(&self, set: Definitions) -> Result<(), FleetError> {
        self.post(set.endpoint(), &json!({}))?;
        Ok(())
    }

    fn user_statistics(&self, context: &str) -> Result<Value, FleetError> {
        self.get(&format!("/users/statistics/{}", context))
    }

    fn event_uuids(&self) -> Result<Vec<String>, FleetError> {
        let refs: Vec<EventRef> =
            unwrap_list(self.post("/events/restSearch", &json!({ "metadata": true }))?, "Event")?;
        Ok(refs.into_iter().map(|r| r.uuid).collect())
    }

    fn event(&self, uuid: &str) -> Result<Value, FleetError> {
        let body = self.get(&format!("/events/view/{}/deleted:1", uuid))?;
        unwrap_as(body, "Event")
    }

    fn delete_event(&self, uuid: &str) -> Result<(), FleetError> {
        self.post(&format!("/events/delete/{}", uuid), &json!({}))?;
        Ok(())
    }

    fn event_blocklist(&self) -> Result<Vec<String>, FleetError> {
        let rows: Vec<BlocklistRow> =
            unwrap_list(self.get("/eventBlocklists/index")?, "EventBlocklist")?;
        Ok(rows.into_iter().map(|r| r.event_uuid).collect())
    }

    fn direct_call(&self, path: &str, payload: Option<&Value>) -> Result<Value, FleetError> {
        let endpoint = format!("/{}", path.trim_start_matches('/'));
        match payload {
            Some(body) => self.post(&endpoint, body),
            None => self.get(&endpoint),
        }
    }
}
