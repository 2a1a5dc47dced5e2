//! Typed client for the OpenStack REST APIs.
//!
//! The rest of the crate talks to [`CloudApi`] only; `OpenStackApi` is the
//! production implementation on top of Keystone v3 token auth and the
//! public service catalog (compute, image, network, block storage).

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Response, StatusCode};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{AuthMethod, OpenStackAuth};
use crate::error::{ClientError, Result};
use crate::openstack::types::*;

#[async_trait]
pub trait CloudApi: Send + Sync {
    // Images
    async fn find_image(&self, name_or_id: &str) -> Result<Option<Image>>;
    async fn list_images(&self, visibility: Option<&str>) -> Result<Vec<Image>>;
    async fn delete_image(&self, image_id: &str) -> Result<()>;
    async fn add_image_tag(&self, image_id: &str, tag: &str) -> Result<()>;
    async fn create_server_snapshot(
        &self,
        server_id: &str,
        name: &str,
        description: &str,
    ) -> Result<String>;

    // Flavors
    async fn find_flavor(&self, name_or_id: &str) -> Result<Option<Flavor>>;
    async fn list_flavors(&self) -> Result<Vec<Flavor>>;

    // Network
    async fn find_network(&self, name: &str) -> Result<Option<Network>>;

    // Volumes
    async fn find_volume(&self, name_or_id: &str) -> Result<Option<Volume>>;
    async fn create_volume(&self, new: NewVolume) -> Result<Volume>;
    async fn extend_volume(&self, volume_id: &str, size_gb: u64) -> Result<()>;
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;
    async fn attach_volume(&self, server_id: &str, volume_id: &str) -> Result<String>;
    async fn detach_volume(&self, server_id: &str, volume_id: &str) -> Result<()>;
    async fn create_volume_snapshot(
        &self,
        volume_id: &str,
        name: &str,
        description: &str,
    ) -> Result<String>;
    async fn find_volume_snapshot(&self, name_or_id: &str) -> Result<Option<VolumeSnapshot>>;
    async fn delete_volume_snapshot(&self, snapshot_id: &str) -> Result<()>;

    // Servers
    async fn create_server(&self, new: NewServer) -> Result<Server>;
    async fn get_server(&self, server_id: &str) -> Result<Option<Server>>;
    async fn find_server_by_name(&self, name: &str) -> Result<Option<Server>>;
    async fn list_servers(&self) -> Result<Vec<Server>>;
    async fn delete_server(&self, server_id: &str, force: bool) -> Result<()>;
    async fn server_action(&self, server_id: &str, action: ServerAction<'_>) -> Result<()>;
    async fn get_server_console(&self, server_id: &str) -> Result<String>;
    async fn replace_server_metadata(
        &self,
        server_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()>;
    async fn merge_server_metadata(
        &self,
        server_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()>;

    // Keypairs
    async fn find_keypair(&self, name: &str) -> Result<Option<Keypair>>;
    async fn create_keypair(&self, name: &str, public_key: Option<&str>) -> Result<Keypair>;
    async fn delete_keypair(&self, name: &str) -> Result<()>;

    // Security groups
    async fn find_security_group(&self, name_or_id: &str) -> Result<Option<SecurityGroup>>;
    async fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup>;
    async fn delete_security_group(&self, security_group_id: &str) -> Result<()>;
    async fn create_security_group_rule(&self, rule: NewRule) -> Result<String>;
    async fn delete_security_group_rule(&self, rule_id: &str) -> Result<()>;
    async fn server_security_groups(&self, server_id: &str) -> Result<Vec<SecurityGroup>>;
    async fn add_security_group_to_server(&self, server_id: &str, sg_name: &str) -> Result<()>;
    async fn remove_security_group_from_server(&self, server_id: &str, sg_name: &str)
    -> Result<()>;
    async fn security_group_in_use(&self, security_group_id: &str) -> Result<bool>;

    // Limits
    async fn compute_limits(&self) -> Result<ComputeLimits>;
    async fn volume_limits(&self) -> Result<VolumeLimits>;
}

#[derive(Debug, Clone)]
struct Endpoints {
    compute: String,
    image: String,
    network: String,
    volume: String,
}

#[derive(Debug, Clone)]
struct Token {
    value: String,
    expires_at: DateTime<Utc>,
    endpoints: Endpoints,
}

pub struct OpenStackApi {
    http: reqwest::Client,
    auth: OpenStackAuth,
    compute_api_version: Option<String>,
    token: RwLock<Option<Token>>,
}

impl OpenStackApi {
    pub fn new(
        auth: OpenStackAuth,
        compute_api_version: Option<String>,
        verify_tls: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;
        Ok(Self {
            http,
            auth,
            compute_api_version,
            token: RwLock::new(None),
        })
    }

    /// Authenticate once upfront so a misconfigured tenancy fails at startup.
    pub async fn authorize(&self) -> Result<()> {
        self.ensure_token().await?;
        info!("Connected to OpenStack");
        Ok(())
    }

    async fn ensure_token(&self) -> Result<Token> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.expires_at - Utc::now() > ChronoDuration::seconds(60) {
                return Ok(token.clone());
            }
        }

        let mut guard = self.token.write().await;
        // Another worker may have refreshed while we waited for the lock.
        if let Some(token) = guard.as_ref() {
            if token.expires_at - Utc::now() > ChronoDuration::seconds(60) {
                return Ok(token.clone());
            }
        }
        let token = self.authenticate().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn authenticate(&self) -> Result<Token> {
        let identity = match &self.auth.method {
            AuthMethod::ApplicationCredential { id, secret } => {
                info!("Authenticating at Keystone with application credentials");
                json!({
                    "identity": {
                        "methods": ["application_credential"],
                        "application_credential": {"id": id, "secret": secret}
                    }
                })
            }
            AuthMethod::Password {
                username,
                password,
                project_id,
                user_domain_name,
                project_domain_id,
                ..
            } => {
                info!("Authenticating at Keystone with user credentials");
                json!({
                    "identity": {
                        "methods": ["password"],
                        "password": {
                            "user": {
                                "name": username,
                                "domain": {"name": user_domain_name},
                                "password": password
                            }
                        }
                    },
                    "scope": {
                        "project": {"id": project_id, "domain": {"id": project_domain_id}}
                    }
                })
            }
        };

        let url = format!("{}/auth/tokens", self.auth.auth_url.trim_end_matches('/'));
        let resp = self.http.post(&url).json(&json!({"auth": identity})).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Internal(format!(
                "Keystone authentication failed: {status} {body}"
            )));
        }

        let value = resp
            .headers()
            .get("x-subject-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ClientError::Internal("Keystone returned no subject token".into()))?;

        let body: Value = resp.json().await?;
        let expires_at = body["token"]["expires_at"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| Utc::now() + ChronoDuration::minutes(30));
        let endpoints = Endpoints::from_catalog(&body["token"]["catalog"])?;

        debug!(expires_at = %expires_at, "Keystone token issued");
        Ok(Token {
            value,
            expires_at,
            endpoints,
        })
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: String,
        body: Option<Value>,
    ) -> Result<Response> {
        let token = self.ensure_token().await?;
        let mut req = self.http.request(method, &url).header("X-Auth-Token", &token.value);
        if url.starts_with(&token.endpoints.compute) {
            if let Some(version) = &self.compute_api_version {
                req = req.header("OpenStack-API-Version", format!("compute {version}"));
            }
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        Ok(req.send().await?)
    }

    async fn endpoints(&self) -> Result<Endpoints> {
        Ok(self.ensure_token().await?.endpoints)
    }

    async fn get(&self, url: String) -> Result<Response> {
        self.request(reqwest::Method::GET, url, None).await
    }

    async fn get_json(&self, url: String, ctx: &str) -> Result<Value> {
        let resp = self.get(url).await?;
        Ok(check(resp, ctx).await?.json().await?)
    }

    async fn post_json(&self, url: String, body: Value, ctx: &str) -> Result<Value> {
        let resp = self.request(reqwest::Method::POST, url, Some(body)).await?;
        Ok(check(resp, ctx).await?.json().await?)
    }

    /// POST where the interesting part of the answer is the response object,
    /// not the body (202 actions, image snapshots).
    async fn post(&self, url: String, body: Value, ctx: &str) -> Result<Response> {
        let resp = self.request(reqwest::Method::POST, url, Some(body)).await?;
        check(resp, ctx).await
    }

    async fn delete(&self, url: String, ctx: &str) -> Result<()> {
        let resp = self.request(reqwest::Method::DELETE, url, None).await?;
        check(resp, ctx).await?;
        Ok(())
    }
}

/// Maps backend status codes to the error kinds the facade understands.
/// 404 is not handled here; lookups translate it to `Ok(None)` themselves.
async fn check(resp: Response, ctx: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::CONFLICT => Err(ClientError::Conflict(format!("{ctx}: {body}"))),
        StatusCode::FORBIDDEN | StatusCode::PAYLOAD_TOO_LARGE => {
            Err(ClientError::ResourceNotAvailable(format!("{ctx}: {body}")))
        }
        _ => Err(ClientError::Internal(format!("{ctx}: {status} {body}"))),
    }
}

fn is_not_found(resp: &Response) -> bool {
    resp.status() == StatusCode::NOT_FOUND
}

impl Endpoints {
    fn from_catalog(catalog: &Value) -> Result<Self> {
        let lookup = |service_types: &[&str]| -> Option<String> {
            catalog.as_array()?.iter().find_map(|entry| {
                let service_type = entry["type"].as_str()?;
                if !service_types.contains(&service_type) {
                    return None;
                }
                entry["endpoints"].as_array()?.iter().find_map(|ep| {
                    if ep["interface"].as_str()? == "public" {
                        Some(ep["url"].as_str()?.trim_end_matches('/').to_string())
                    } else {
                        None
                    }
                })
            })
        };

        let missing =
            |kind: &str| ClientError::Internal(format!("no public {kind} endpoint in catalog"));

        let image = lookup(&["image"]).ok_or_else(|| missing("image"))?;
        let network = lookup(&["network"]).ok_or_else(|| missing("network"))?;
        Ok(Self {
            compute: lookup(&["compute"]).ok_or_else(|| missing("compute"))?,
            image: if image.ends_with("/v2") { image } else { format!("{image}/v2") },
            network: if network.ends_with("/v2.0") {
                network
            } else {
                format!("{network}/v2.0")
            },
            volume: lookup(&["volumev3", "block-storage", "volume"])
                .ok_or_else(|| missing("block storage"))?,
        })
    }
}

// ---------------------------------------------------------------------------
// JSON -> typed resource parsing

fn text(v: &Value, key: &str) -> String {
    v[key].as_str().unwrap_or_default().to_string()
}

fn opt_text(v: &Value, key: &str) -> Option<String> {
    v[key].as_str().map(str::to_string)
}

fn uint(v: &Value, key: &str) -> u64 {
    v[key].as_u64().unwrap_or_default()
}

fn int(v: &Value, key: &str) -> i64 {
    v[key].as_i64().unwrap_or_default()
}

fn parse_image(v: &Value) -> Image {
    Image {
        id: text(v, "id"),
        name: text(v, "name"),
        status: text(v, "status"),
        visibility: text(v, "visibility"),
        min_disk: uint(v, "min_disk"),
        min_ram: uint(v, "min_ram"),
        created_at: text(v, "created_at"),
        tags: v["tags"]
            .as_array()
            .map(|a| a.iter().filter_map(|t| t.as_str()).map(str::to_string).collect())
            .unwrap_or_default(),
        os_version: opt_text(v, "os_version"),
        os_distro: opt_text(v, "os_distro"),
        slurm_version: opt_text(v, "slurm_version"),
        base_image_ref: opt_text(v, "base_image_ref"),
        description: opt_text(v, "description"),
    }
}

fn parse_flavor(v: &Value) -> Flavor {
    Flavor {
        id: text(v, "id"),
        name: text(v, "name"),
        vcpus: uint(v, "vcpus") as u32,
        ram_mb: uint(v, "ram"),
        disk_gb: uint(v, "disk"),
        ephemeral_gb: v["OS-FLV-EXT-DATA:ephemeral"].as_u64().unwrap_or_default(),
        description: opt_text(v, "description"),
    }
}

fn parse_server(v: &Value) -> Server {
    let mut private_v4 = None;
    let mut floating_v4 = None;
    if let Some(networks) = v["addresses"].as_object() {
        for addrs in networks.values() {
            for addr in addrs.as_array().into_iter().flatten() {
                if addr["version"].as_u64() != Some(4) {
                    continue;
                }
                let ip = addr["addr"].as_str().map(str::to_string);
                match addr["OS-EXT-IPS:type"].as_str() {
                    Some("floating") => floating_v4 = floating_v4.or(ip),
                    _ => private_v4 = private_v4.or(ip),
                }
            }
        }
    }

    Server {
        id: text(v, "id"),
        name: text(v, "name"),
        flavor_id: text(&v["flavor"], "id"),
        image_id: v["image"]["id"].as_str().map(str::to_string),
        vm_state: text(v, "OS-EXT-STS:vm_state"),
        task_state: opt_text(v, "OS-EXT-STS:task_state"),
        created_at: text(v, "created"),
        private_v4,
        floating_v4,
        project_id: text(v, "tenant_id"),
        key_name: opt_text(v, "key_name"),
        metadata: parse_string_map(&v["metadata"]),
        security_group_names: v["security_groups"]
            .as_array()
            .map(|groups| groups.iter().map(|g| text(g, "name")).collect())
            .unwrap_or_default(),
    }
}

fn parse_string_map(v: &Value) -> HashMap<String, String> {
    v.as_object()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_volume(v: &Value) -> Volume {
    Volume {
        id: text(v, "id"),
        name: text(v, "name"),
        description: opt_text(v, "description"),
        status: text(v, "status"),
        size_gb: uint(v, "size"),
        created_at: text(v, "created_at"),
        metadata: parse_string_map(&v["metadata"]),
        attachments: v["attachments"]
            .as_array()
            .map(|list| {
                list.iter()
                    .map(|a| VolumeAttachment {
                        server_id: text(a, "server_id"),
                        device: text(a, "device"),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn parse_snapshot(v: &Value) -> VolumeSnapshot {
    VolumeSnapshot {
        id: text(v, "id"),
        name: text(v, "name"),
        description: opt_text(v, "description"),
        status: text(v, "status"),
        size_gb: uint(v, "size"),
        created_at: text(v, "created_at"),
        volume_id: text(v, "volume_id"),
    }
}

fn parse_security_group(v: &Value) -> SecurityGroup {
    SecurityGroup {
        id: text(v, "id"),
        name: text(v, "name"),
        description: text(v, "description"),
    }
}

fn looks_like_uuid(s: &str) -> bool {
    uuid::Uuid::parse_str(s).is_ok()
}

#[async_trait]
impl CloudApi for OpenStackApi {
    async fn find_image(&self, name_or_id: &str) -> Result<Option<Image>> {
        let ep = self.endpoints().await?;
        if looks_like_uuid(name_or_id) {
            let resp = self.get(format!("{}/images/{}", ep.image, name_or_id)).await?;
            if is_not_found(&resp) {
                return Ok(None);
            }
            let body: Value = check(resp, "get image").await?.json().await?;
            return Ok(Some(parse_image(&body)));
        }
        let body = self
            .get_json(
                format!("{}/images?name={}", ep.image, urlencode(name_or_id)),
                "list images by name",
            )
            .await?;
        Ok(body["images"].as_array().and_then(|list| list.first()).map(parse_image))
    }

    async fn list_images(&self, visibility: Option<&str>) -> Result<Vec<Image>> {
        let ep = self.endpoints().await?;
        let url = match visibility {
            Some(visibility) => format!("{}/images?limit=1000&visibility={visibility}", ep.image),
            None => format!("{}/images?limit=1000", ep.image),
        };
        let body = self.get_json(url, "list images").await?;
        Ok(body["images"]
            .as_array()
            .map(|list| list.iter().map(parse_image).collect())
            .unwrap_or_default())
    }

    async fn delete_image(&self, image_id: &str) -> Result<()> {
        let ep = self.endpoints().await?;
        self.delete(format!("{}/images/{}", ep.image, image_id), "delete image")
            .await
    }

    async fn add_image_tag(&self, image_id: &str, tag: &str) -> Result<()> {
        let ep = self.endpoints().await?;
        let url = format!("{}/images/{}/tags/{}", ep.image, image_id, urlencode(tag));
        let resp = self.request(reqwest::Method::PUT, url, None).await?;
        check(resp, "add image tag").await?;
        Ok(())
    }

    async fn create_server_snapshot(
        &self,
        server_id: &str,
        name: &str,
        description: &str,
    ) -> Result<String> {
        let ep = self.endpoints().await?;
        let body = json!({
            "createImage": {
                "name": name,
                "metadata": {"description": description}
            }
        });
        let resp = self
            .post(
                format!("{}/servers/{}/action", ep.compute, server_id),
                body,
                "create server snapshot",
            )
            .await?;

        // Newer compute microversions return the id in the body, older ones
        // only in the Location header.
        if let Some(location) = resp
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        {
            if let Some(id) = location.rsplit('/').next() {
                if !id.is_empty() {
                    return Ok(id.to_string());
                }
            }
        }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        body["image_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ClientError::Internal("snapshot created but no image id returned".into()))
    }

    async fn find_flavor(&self, name_or_id: &str) -> Result<Option<Flavor>> {
        Ok(self
            .list_flavors()
            .await?
            .into_iter()
            .find(|f| f.id == name_or_id || f.name == name_or_id))
    }

    async fn list_flavors(&self) -> Result<Vec<Flavor>> {
        let ep = self.endpoints().await?;
        let body = self
            .get_json(format!("{}/flavors/detail", ep.compute), "list flavors")
            .await?;
        Ok(body["flavors"]
            .as_array()
            .map(|list| list.iter().map(parse_flavor).collect())
            .unwrap_or_default())
    }

    async fn find_network(&self, name: &str) -> Result<Option<Network>> {
        let ep = self.endpoints().await?;
        let body = self
            .get_json(
                format!("{}/networks?name={}", ep.network, urlencode(name)),
                "find network",
            )
            .await?;
        Ok(body["networks"].as_array().and_then(|list| list.first()).map(|n| Network {
            id: text(n, "id"),
            name: text(n, "name"),
        }))
    }

    async fn find_volume(&self, name_or_id: &str) -> Result<Option<Volume>> {
        let ep = self.endpoints().await?;
        if looks_like_uuid(name_or_id) {
            let resp = self.get(format!("{}/volumes/{}", ep.volume, name_or_id)).await?;
            if is_not_found(&resp) {
                return Ok(None);
            }
            let body: Value = check(resp, "get volume").await?.json().await?;
            return Ok(Some(parse_volume(&body["volume"])));
        }
        let body = self
            .get_json(
                format!("{}/volumes/detail?name={}", ep.volume, urlencode(name_or_id)),
                "list volumes by name",
            )
            .await?;
        Ok(body["volumes"].as_array().and_then(|list| list.first()).map(parse_volume))
    }

    async fn create_volume(&self, new: NewVolume) -> Result<Volume> {
        let ep = self.endpoints().await?;
        let mut volume = json!({
            "name": new.name,
            "metadata": new.metadata,
        });
        if let Some(size) = new.size_gb {
            volume["size"] = json!(size);
        }
        if let Some(source) = &new.source_volume_id {
            volume["source_volid"] = json!(source);
        }
        if let Some(snapshot) = &new.snapshot_id {
            volume["snapshot_id"] = json!(snapshot);
        }
        let resp = self
            .request(
                reqwest::Method::POST,
                format!("{}/volumes", ep.volume),
                Some(json!({"volume": volume})),
            )
            .await?;
        // Cinder signals exhausted quota with 413.
        let body: Value = check(resp, "create volume").await?.json().await?;
        Ok(parse_volume(&body["volume"]))
    }

    async fn extend_volume(&self, volume_id: &str, size_gb: u64) -> Result<()> {
        let ep = self.endpoints().await?;
        let resp = self
            .request(
                reqwest::Method::POST,
                format!("{}/volumes/{}/action", ep.volume, volume_id),
                Some(json!({"os-extend": {"new_size": size_gb}})),
            )
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::VolumeNotFound(volume_id.to_string()));
        }
        check(resp, "extend volume").await?;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let ep = self.endpoints().await?;
        let resp = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/volumes/{}", ep.volume, volume_id),
                None,
            )
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::VolumeNotFound(volume_id.to_string()));
        }
        check(resp, "delete volume").await?;
        Ok(())
    }

    async fn attach_volume(&self, server_id: &str, volume_id: &str) -> Result<String> {
        let ep = self.endpoints().await?;
        let body = self
            .post_json(
                format!("{}/servers/{}/os-volume_attachments", ep.compute, server_id),
                json!({"volumeAttachment": {"volumeId": volume_id}}),
                "attach volume",
            )
            .await?;
        Ok(text(&body["volumeAttachment"], "device"))
    }

    async fn detach_volume(&self, server_id: &str, volume_id: &str) -> Result<()> {
        let ep = self.endpoints().await?;
        self.delete(
            format!(
                "{}/servers/{}/os-volume_attachments/{}",
                ep.compute, server_id, volume_id
            ),
            "detach volume",
        )
        .await
    }

    async fn create_volume_snapshot(
        &self,
        volume_id: &str,
        name: &str,
        description: &str,
    ) -> Result<String> {
        let ep = self.endpoints().await?;
        let resp = self
            .request(
                reqwest::Method::POST,
                format!("{}/snapshots", ep.volume),
                Some(json!({
                    "snapshot": {
                        "volume_id": volume_id,
                        "name": name,
                        "description": description,
                        "force": false
                    }
                })),
            )
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::VolumeNotFound(volume_id.to_string()));
        }
        let body: Value = check(resp, "create volume snapshot").await?.json().await?;
        Ok(text(&body["snapshot"], "id"))
    }

    async fn find_volume_snapshot(&self, name_or_id: &str) -> Result<Option<VolumeSnapshot>> {
        let ep = self.endpoints().await?;
        if looks_like_uuid(name_or_id) {
            let resp = self.get(format!("{}/snapshots/{}", ep.volume, name_or_id)).await?;
            if is_not_found(&resp) {
                return Ok(None);
            }
            let body: Value = check(resp, "get volume snapshot").await?.json().await?;
            return Ok(Some(parse_snapshot(&body["snapshot"])));
        }
        let body = self
            .get_json(
                format!("{}/snapshots/detail?name={}", ep.volume, urlencode(name_or_id)),
                "list volume snapshots by name",
            )
            .await?;
        Ok(body["snapshots"].as_array().and_then(|list| list.first()).map(parse_snapshot))
    }

    async fn delete_volume_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let ep = self.endpoints().await?;
        let resp = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/snapshots/{}", ep.volume, snapshot_id),
                None,
            )
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::SnapshotNotFound(snapshot_id.to_string()));
        }
        check(resp, "delete volume snapshot").await?;
        Ok(())
    }

    async fn create_server(&self, new: NewServer) -> Result<Server> {
        let ep = self.endpoints().await?;

        let mut server = json!({
            "name": new.name,
            "imageRef": new.image_id,
            "flavorRef": new.flavor_id,
            "networks": [{"uuid": new.network_id}],
            "metadata": new.metadata,
            "security_groups": new.security_groups.iter()
                .map(|sg| json!({"name": sg}))
                .collect::<Vec<_>>(),
        });
        if let Some(key_name) = &new.key_name {
            server["key_name"] = json!(key_name);
        }
        if !new.userdata.is_empty() {
            server["user_data"] =
                json!(base64::engine::general_purpose::STANDARD.encode(&new.userdata));
        }
        if !new.volume_ids.is_empty() {
            server["block_device_mapping_v2"] = json!(
                new.volume_ids
                    .iter()
                    .map(|id| json!({
                        "source_type": "volume",
                        "destination_type": "volume",
                        "uuid": id,
                        "boot_index": -1,
                        "delete_on_termination": false
                    }))
                    .collect::<Vec<_>>()
            );
        }

        let body = self
            .post_json(
                format!("{}/servers", ep.compute),
                json!({"server": server}),
                "create server",
            )
            .await?;
        let server_id = text(&body["server"], "id");

        // The create answer is a stub; fetch the full representation.
        match self.get_server(&server_id).await? {
            Some(server) => Ok(server),
            None => Err(ClientError::Internal(format!(
                "server {server_id} vanished right after creation"
            ))),
        }
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<Server>> {
        let ep = self.endpoints().await?;
        let resp = self.get(format!("{}/servers/{}", ep.compute, server_id)).await?;
        if is_not_found(&resp) {
            return Ok(None);
        }
        let body: Value = check(resp, "get server").await?.json().await?;
        Ok(Some(parse_server(&body["server"])))
    }

    async fn find_server_by_name(&self, name: &str) -> Result<Option<Server>> {
        let ep = self.endpoints().await?;
        let body = self
            .get_json(
                format!("{}/servers/detail?name={}", ep.compute, urlencode(name)),
                "find server by name",
            )
            .await?;
        // The nova name filter is a regex; keep exact matches only.
        Ok(body["servers"]
            .as_array()
            .into_iter()
            .flatten()
            .map(parse_server)
            .find(|s| s.name == name))
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        let ep = self.endpoints().await?;
        let body = self
            .get_json(format!("{}/servers/detail", ep.compute), "list servers")
            .await?;
        Ok(body["servers"]
            .as_array()
            .map(|list| list.iter().map(parse_server).collect())
            .unwrap_or_default())
    }

    async fn delete_server(&self, server_id: &str, force: bool) -> Result<()> {
        let ep = self.endpoints().await?;
        if force {
            let resp = self
                .request(
                    reqwest::Method::POST,
                    format!("{}/servers/{}/action", ep.compute, server_id),
                    Some(json!({"forceDelete": null})),
                )
                .await?;
            if is_not_found(&resp) {
                return Err(ClientError::ServerNotFound(server_id.to_string()));
            }
            check(resp, "force delete server").await?;
            return Ok(());
        }
        let resp = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/servers/{}", ep.compute, server_id),
                None,
            )
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::ServerNotFound(server_id.to_string()));
        }
        check(resp, "delete server").await?;
        Ok(())
    }

    async fn server_action(&self, server_id: &str, action: ServerAction<'_>) -> Result<()> {
        let body = match action {
            ServerAction::Start => json!({"os-start": null}),
            ServerAction::Stop => json!({"os-stop": null}),
            ServerAction::RebootSoft => json!({"reboot": {"type": "SOFT"}}),
            ServerAction::RebootHard => json!({"reboot": {"type": "HARD"}}),
            ServerAction::Rescue {
                admin_pass,
                image_ref,
            } => {
                let mut rescue = serde_json::Map::new();
                if let Some(admin_pass) = admin_pass {
                    rescue.insert("adminPass".into(), json!(admin_pass));
                }
                if let Some(image_ref) = image_ref {
                    rescue.insert("rescue_image_ref".into(), json!(image_ref));
                }
                json!({"rescue": rescue})
            }
            ServerAction::Unrescue => json!({"unrescue": null}),
        };
        let ep = self.endpoints().await?;
        let resp = self
            .request(
                reqwest::Method::POST,
                format!("{}/servers/{}/action", ep.compute, server_id),
                Some(body),
            )
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::ServerNotFound(server_id.to_string()));
        }
        check(resp, "server action").await?;
        Ok(())
    }

    async fn get_server_console(&self, server_id: &str) -> Result<String> {
        let ep = self.endpoints().await?;
        let resp = self
            .request(
                reqwest::Method::POST,
                format!("{}/servers/{}/action", ep.compute, server_id),
                Some(json!({"os-getConsoleOutput": {}})),
            )
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::ServerNotFound(server_id.to_string()));
        }
        let body: Value = check(resp, "get console output").await?.json().await?;
        Ok(text(&body, "output"))
    }

    async fn replace_server_metadata(
        &self,
        server_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let ep = self.endpoints().await?;
        let resp = self
            .request(
                reqwest::Method::PUT,
                format!("{}/servers/{}/metadata", ep.compute, server_id),
                Some(json!({"metadata": metadata})),
            )
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::ServerNotFound(server_id.to_string()));
        }
        check(resp, "replace server metadata").await?;
        Ok(())
    }

    async fn merge_server_metadata(
        &self,
        server_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let ep = self.endpoints().await?;
        let resp = self
            .request(
                reqwest::Method::POST,
                format!("{}/servers/{}/metadata", ep.compute, server_id),
                Some(json!({"metadata": metadata})),
            )
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::ServerNotFound(server_id.to_string()));
        }
        check(resp, "merge server metadata").await?;
        Ok(())
    }

    async fn find_keypair(&self, name: &str) -> Result<Option<Keypair>> {
        let ep = self.endpoints().await?;
        let resp = self
            .get(format!("{}/os-keypairs/{}", ep.compute, urlencode(name)))
            .await?;
        if is_not_found(&resp) {
            return Ok(None);
        }
        let body: Value = check(resp, "get keypair").await?.json().await?;
        Ok(Some(Keypair {
            name: text(&body["keypair"], "name"),
            public_key: text(&body["keypair"], "public_key"),
            private_key: None,
        }))
    }

    async fn create_keypair(&self, name: &str, public_key: Option<&str>) -> Result<Keypair> {
        let ep = self.endpoints().await?;
        let mut keypair = json!({"name": name});
        if let Some(public_key) = public_key {
            keypair["public_key"] = json!(public_key);
        }
        let body = self
            .post_json(
                format!("{}/os-keypairs", ep.compute),
                json!({"keypair": keypair}),
                "create keypair",
            )
            .await?;
        Ok(Keypair {
            name: text(&body["keypair"], "name"),
            public_key: text(&body["keypair"], "public_key"),
            private_key: opt_text(&body["keypair"], "private_key"),
        })
    }

    async fn delete_keypair(&self, name: &str) -> Result<()> {
        let ep = self.endpoints().await?;
        let resp = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/os-keypairs/{}", ep.compute, urlencode(name)),
                None,
            )
            .await?;
        // Deleting an already absent keypair is fine.
        if is_not_found(&resp) {
            return Ok(());
        }
        check(resp, "delete keypair").await?;
        Ok(())
    }

    async fn find_security_group(&self, name_or_id: &str) -> Result<Option<SecurityGroup>> {
        let ep = self.endpoints().await?;
        let body = self
            .get_json(
                format!("{}/security-groups?name={}", ep.network, urlencode(name_or_id)),
                "find security group by name",
            )
            .await?;
        if let Some(sg) = body["security_groups"].as_array().and_then(|list| list.first()) {
            return Ok(Some(parse_security_group(sg)));
        }
        if !looks_like_uuid(name_or_id) {
            return Ok(None);
        }
        let resp = self
            .get(format!("{}/security-groups/{}", ep.network, name_or_id))
            .await?;
        if is_not_found(&resp) {
            return Ok(None);
        }
        let body: Value = check(resp, "get security group").await?.json().await?;
        Ok(Some(parse_security_group(&body["security_group"])))
    }

    async fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup> {
        let ep = self.endpoints().await?;
        let body = self
            .post_json(
                format!("{}/security-groups", ep.network),
                json!({"security_group": {"name": name, "description": description}}),
                "create security group",
            )
            .await?;
        Ok(parse_security_group(&body["security_group"]))
    }

    async fn delete_security_group(&self, security_group_id: &str) -> Result<()> {
        let ep = self.endpoints().await?;
        let resp = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/security-groups/{}", ep.network, security_group_id),
                None,
            )
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::SecurityGroupNotFound(security_group_id.to_string()));
        }
        check(resp, "delete security group").await?;
        Ok(())
    }

    async fn create_security_group_rule(&self, rule: NewRule) -> Result<String> {
        let ep = self.endpoints().await?;
        let mut body = json!({
            "security_group_id": rule.security_group_id,
            "direction": rule.direction,
            "ethertype": rule.ethertype,
        });
        if let Some(protocol) = &rule.protocol {
            body["protocol"] = json!(protocol);
        }
        if let Some(min) = rule.port_range_min {
            body["port_range_min"] = json!(min);
        }
        if let Some(max) = rule.port_range_max {
            body["port_range_max"] = json!(max);
        }
        if let Some(remote) = &rule.remote_group_id {
            body["remote_group_id"] = json!(remote);
        }
        let body = self
            .post_json(
                format!("{}/security-group-rules", ep.network),
                json!({"security_group_rule": body}),
                "create security group rule",
            )
            .await?;
        Ok(text(&body["security_group_rule"], "id"))
    }

    async fn delete_security_group_rule(&self, rule_id: &str) -> Result<()> {
        let ep = self.endpoints().await?;
        let resp = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/security-group-rules/{}", ep.network, rule_id),
                None,
            )
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::SecurityGroupNotFound(rule_id.to_string()));
        }
        check(resp, "delete security group rule").await?;
        Ok(())
    }

    async fn server_security_groups(&self, server_id: &str) -> Result<Vec<SecurityGroup>> {
        let ep = self.endpoints().await?;
        let resp = self
            .get(format!("{}/servers/{}/os-security-groups", ep.compute, server_id))
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::ServerNotFound(server_id.to_string()));
        }
        let body: Value = check(resp, "list server security groups").await?.json().await?;
        Ok(body["security_groups"]
            .as_array()
            .map(|list| list.iter().map(parse_security_group).collect())
            .unwrap_or_default())
    }

    async fn add_security_group_to_server(&self, server_id: &str, sg_name: &str) -> Result<()> {
        let ep = self.endpoints().await?;
        let resp = self
            .request(
                reqwest::Method::POST,
                format!("{}/servers/{}/action", ep.compute, server_id),
                Some(json!({"addSecurityGroup": {"name": sg_name}})),
            )
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::ServerNotFound(server_id.to_string()));
        }
        check(resp, "add security group to server").await?;
        Ok(())
    }

    async fn remove_security_group_from_server(
        &self,
        server_id: &str,
        sg_name: &str,
    ) -> Result<()> {
        let ep = self.endpoints().await?;
        let resp = self
            .request(
                reqwest::Method::POST,
                format!("{}/servers/{}/action", ep.compute, server_id),
                Some(json!({"removeSecurityGroup": {"name": sg_name}})),
            )
            .await?;
        if is_not_found(&resp) {
            return Err(ClientError::ServerNotFound(server_id.to_string()));
        }
        check(resp, "remove security group from server").await?;
        Ok(())
    }

    /// In use when any server, port or load balancer still references the
    /// group; each class is checked on its own.
    async fn security_group_in_use(&self, security_group_id: &str) -> Result<bool> {
        let ep = self.endpoints().await?;

        // Servers referencing the group through their security-group
        // attribute.
        let body = self
            .get_json(
                format!(
                    "{}/servers/detail?security_group={}&all_tenants=true",
                    ep.compute, security_group_id
                ),
                "list servers by security group",
            )
            .await?;
        if body["servers"].as_array().is_some_and(|servers| !servers.is_empty()) {
            return Ok(true);
        }

        // Ports carrying the group.
        let body = self
            .get_json(
                format!("{}/ports?security_groups={}", ep.network, security_group_id),
                "list ports by security group",
            )
            .await?;
        if body["ports"].as_array().is_some_and(|ports| !ports.is_empty()) {
            return Ok(true);
        }

        // Load balancers, where the deployment has them.
        let resp = self
            .get(format!(
                "{}/lbaas/loadbalancers?security_group_id={}",
                ep.network, security_group_id
            ))
            .await?;
        if resp.status().is_success() {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            if body["loadbalancers"].as_array().is_some_and(|lbs| !lbs.is_empty()) {
                return Ok(true);
            }
        } else {
            debug!(
                status = %resp.status(),
                "load balancer listing unavailable, skipping check"
            );
        }

        Ok(false)
    }

    async fn compute_limits(&self) -> Result<ComputeLimits> {
        let ep = self.endpoints().await?;
        let body = self
            .get_json(format!("{}/limits", ep.compute), "compute limits")
            .await?;
        let absolute = &body["limits"]["absolute"];
        Ok(ComputeLimits {
            max_total_cores: int(absolute, "maxTotalCores"),
            max_total_instances: int(absolute, "maxTotalInstances"),
            max_total_ram_mb: int(absolute, "maxTotalRAMSize"),
            total_cores_used: int(absolute, "totalCoresUsed"),
            total_instances_used: int(absolute, "totalInstancesUsed"),
            total_ram_used_mb: int(absolute, "totalRAMUsed"),
        })
    }

    async fn volume_limits(&self) -> Result<VolumeLimits> {
        let ep = self.endpoints().await?;
        let body = self
            .get_json(format!("{}/limits", ep.volume), "volume limits")
            .await?;
        let absolute = &body["limits"]["absolute"];
        Ok(VolumeLimits {
            max_total_volumes: int(absolute, "maxTotalVolumes"),
            max_total_volume_gigabytes: int(absolute, "maxTotalVolumeGigabytes"),
            total_volumes_used: int(absolute, "totalVolumesUsed"),
            total_gigabytes_used: int(absolute, "totalGigabytesUsed"),
        })
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_from_catalog() {
        let catalog = json!([
            {
                "type": "compute",
                "endpoints": [
                    {"interface": "internal", "url": "http://internal:8774/v2.1"},
                    {"interface": "public", "url": "https://cloud:8774/v2.1/"}
                ]
            },
            {
                "type": "image",
                "endpoints": [{"interface": "public", "url": "https://cloud:9292"}]
            },
            {
                "type": "network",
                "endpoints": [{"interface": "public", "url": "https://cloud:9696"}]
            },
            {
                "type": "volumev3",
                "endpoints": [{"interface": "public", "url": "https://cloud:8776/v3/abc"}]
            }
        ]);
        let ep = Endpoints::from_catalog(&catalog).unwrap();
        assert_eq!(ep.compute, "https://cloud:8774/v2.1");
        assert_eq!(ep.image, "https://cloud:9292/v2");
        assert_eq!(ep.network, "https://cloud:9696/v2.0");
        assert_eq!(ep.volume, "https://cloud:8776/v3/abc");
    }

    #[test]
    fn test_endpoints_missing_service() {
        let catalog = json!([
            {"type": "compute", "endpoints": [{"interface": "public", "url": "http://c"}]}
        ]);
        assert!(Endpoints::from_catalog(&catalog).is_err());
    }

    #[test]
    fn test_parse_server_addresses() {
        let raw = json!({
            "id": "s-1",
            "name": "alice-01",
            "flavor": {"id": "f-1"},
            "image": {"id": "i-1"},
            "OS-EXT-STS:vm_state": "active",
            "OS-EXT-STS:task_state": null,
            "created": "2024-05-01T10:00:00Z",
            "tenant_id": "p-1",
            "key_name": "abc_alice-01_proj",
            "metadata": {"project_name": "proj", "project_id": "p1"},
            "security_groups": [{"name": "defaultSimpleVM"}, {"name": "proj_p1"}],
            "addresses": {
                "portalexternalnetwork": [
                    {"addr": "10.0.2.15", "version": 4, "OS-EXT-IPS:type": "fixed"},
                    {"addr": "129.70.51.99", "version": 4, "OS-EXT-IPS:type": "floating"}
                ]
            }
        });
        let server = parse_server(&raw);
        assert_eq!(server.private_v4.as_deref(), Some("10.0.2.15"));
        assert_eq!(server.floating_v4.as_deref(), Some("129.70.51.99"));
        assert_eq!(server.task_state, None);
        assert_eq!(server.metadata["project_name"], "proj");
        assert_eq!(server.security_group_names.len(), 2);
    }

    #[test]
    fn test_parse_image_properties() {
        let raw = json!({
            "id": "i-1",
            "name": "ubuntu-22.04",
            "status": "active",
            "visibility": "public",
            "min_disk": 20,
            "min_ram": 0,
            "created_at": "2024-01-01T00:00:00Z",
            "tags": ["portalclient"],
            "os_version": "22.04",
            "os_distro": "ubuntu"
        });
        let image = parse_image(&raw);
        assert!(image.is_active());
        assert_eq!(image.os_version.as_deref(), Some("22.04"));
        assert_eq!(image.tags, vec!["portalclient"]);
        assert!(image.slurm_version.is_none());
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("proj p1+x"), "proj%20p1%2Bx");
        assert_eq!(urlencode("simple-name_1.0~x"), "simple-name_1.0~x");
    }

    // ------------------------------------------------------------------
    // HTTP behavior against a mocked tenancy

    fn auth_for(url: &str) -> OpenStackAuth {
        OpenStackAuth {
            auth_url: url.to_string(),
            method: AuthMethod::Password {
                username: "portal-svc".to_string(),
                password: "secret".to_string(),
                project_name: "proj".to_string(),
                project_id: "p1".to_string(),
                user_domain_name: "default".to_string(),
                project_domain_id: "default".to_string(),
            },
        }
    }

    /// Keystone token body whose catalog points every service back at the
    /// mock server.
    fn token_body(base: &str, expires_at: DateTime<Utc>) -> String {
        json!({
            "token": {
                "expires_at": expires_at.to_rfc3339(),
                "catalog": [
                    {
                        "type": "compute",
                        "endpoints": [{"interface": "public", "url": format!("{base}/compute")}]
                    },
                    {
                        "type": "image",
                        "endpoints": [{"interface": "public", "url": format!("{base}/image")}]
                    },
                    {
                        "type": "network",
                        "endpoints": [{"interface": "public", "url": format!("{base}/network")}]
                    },
                    {
                        "type": "volumev3",
                        "endpoints": [{"interface": "public", "url": format!("{base}/volume")}]
                    }
                ]
            }
        })
        .to_string()
    }

    async fn mock_keystone(
        server: &mut mockito::ServerGuard,
        expires_in: ChronoDuration,
        hits: usize,
    ) -> mockito::Mock {
        let base = server.url();
        server
            .mock("POST", "/auth/tokens")
            .with_status(201)
            .with_header("x-subject-token", "tok-test")
            .with_body(token_body(&base, Utc::now() + expires_in))
            .expect(hits)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_token_reused_while_valid() {
        let mut server = mockito::Server::new_async().await;
        let keystone = mock_keystone(&mut server, ChronoDuration::hours(2), 1).await;
        let flavors = server
            .mock("GET", "/compute/flavors/detail")
            .match_header("x-auth-token", "tok-test")
            .with_body(r#"{"flavors": []}"#)
            .expect(2)
            .create_async()
            .await;

        let api = OpenStackApi::new(auth_for(&server.url()), None, true).unwrap();
        api.list_flavors().await.unwrap();
        api.list_flavors().await.unwrap();

        // One authentication serves both calls.
        keystone.assert_async().await;
        flavors.assert_async().await;
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed() {
        let mut server = mockito::Server::new_async().await;
        // Expiry inside the 60 second renewal window: the next request must
        // authenticate again.
        let keystone = mock_keystone(&mut server, ChronoDuration::seconds(30), 2).await;
        let flavors = server
            .mock("GET", "/compute/flavors/detail")
            .with_body(r#"{"flavors": []}"#)
            .create_async()
            .await;

        let api = OpenStackApi::new(auth_for(&server.url()), None, true).unwrap();
        api.authorize().await.unwrap();
        api.list_flavors().await.unwrap();

        keystone.assert_async().await;
        flavors.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_server_missing_maps_to_none() {
        let mut server = mockito::Server::new_async().await;
        mock_keystone(&mut server, ChronoDuration::hours(2), 1).await;
        server
            .mock("GET", "/compute/servers/gone")
            .with_status(404)
            .with_body(r#"{"itemNotFound": {"code": 404}}"#)
            .create_async()
            .await;

        let api = OpenStackApi::new(auth_for(&server.url()), None, true).unwrap();
        assert!(api.get_server("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_security_group_in_use_by_server() {
        let mut server = mockito::Server::new_async().await;
        mock_keystone(&mut server, ChronoDuration::hours(2), 1).await;
        let servers = server
            .mock(
                "GET",
                "/compute/servers/detail?security_group=sg-1&all_tenants=true",
            )
            .with_body(r#"{"servers": [{"id": "s-1", "name": "alice-01"}]}"#)
            .create_async()
            .await;

        let api = OpenStackApi::new(auth_for(&server.url()), None, true).unwrap();
        // Short-circuits on the server hit; ports and load balancers are
        // never queried.
        assert!(api.security_group_in_use("sg-1").await.unwrap());
        servers.assert_async().await;
    }

    #[tokio::test]
    async fn test_security_group_in_use_by_port() {
        let mut server = mockito::Server::new_async().await;
        mock_keystone(&mut server, ChronoDuration::hours(2), 1).await;
        server
            .mock(
                "GET",
                "/compute/servers/detail?security_group=sg-1&all_tenants=true",
            )
            .with_body(r#"{"servers": []}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/network/v2.0/ports?security_groups=sg-1")
            .with_body(r#"{"ports": [{"id": "port-1"}]}"#)
            .create_async()
            .await;

        let api = OpenStackApi::new(auth_for(&server.url()), None, true).unwrap();
        assert!(api.security_group_in_use("sg-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_security_group_in_use_by_load_balancer() {
        let mut server = mockito::Server::new_async().await;
        mock_keystone(&mut server, ChronoDuration::hours(2), 1).await;
        server
            .mock(
                "GET",
                "/compute/servers/detail?security_group=sg-1&all_tenants=true",
            )
            .with_body(r#"{"servers": []}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/network/v2.0/ports?security_groups=sg-1")
            .with_body(r#"{"ports": []}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/network/v2.0/lbaas/loadbalancers?security_group_id=sg-1")
            .with_body(r#"{"loadbalancers": [{"id": "lb-1"}]}"#)
            .create_async()
            .await;

        let api = OpenStackApi::new(auth_for(&server.url()), None, true).unwrap();
        assert!(api.security_group_in_use("sg-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_security_group_not_in_use() {
        let mut server = mockito::Server::new_async().await;
        mock_keystone(&mut server, ChronoDuration::hours(2), 1).await;
        server
            .mock(
                "GET",
                "/compute/servers/detail?security_group=sg-1&all_tenants=true",
            )
            .with_body(r#"{"servers": []}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/network/v2.0/ports?security_groups=sg-1")
            .with_body(r#"{"ports": []}"#)
            .create_async()
            .await;
        // Deployments without the LBaaS extension answer 404 here.
        server
            .mock("GET", "/network/v2.0/lbaas/loadbalancers?security_group_id=sg-1")
            .with_status(404)
            .create_async()
            .await;

        let api = OpenStackApi::new(auth_for(&server.url()), None, true).unwrap();
        assert!(!api.security_group_in_use("sg-1").await.unwrap());
    }
}
