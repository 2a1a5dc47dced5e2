//! OpenStack connector: VM lifecycle orchestration on top of the typed
//! backend client.

pub mod api;
pub mod images;
#[cfg(test)]
pub mod mock;
pub mod security_groups;
pub mod types;
pub mod volumes;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OpenStackSettings;
use crate::error::{ClientError, Result};
use crate::forc::template::ResearchEnvironmentMetadata;
use crate::ports::PortCalculator;
use crate::proto::VolumePath;
use crate::userdata::{UserdataParams, compose_userdata};

use api::CloudApi;
use images::GetImageOptions;
use types::*;

pub const DEFAULT_SECURITY_GROUP_NAME: &str = "defaultSimpleVM";

const DEACTIVATE_UPGRADES_SCRIPT: &str = include_str!("../../scripts/deactivate_upgrades.sh");

/// Probe timeout for the gateway port forwardings.
const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct OpenStackConnector {
    api: Arc<dyn CloudApi>,
    settings: OpenStackSettings,
    ports: PortCalculator,
    /// Per-name locks serializing project security group creation. The coarse
    /// mutex only guards lock-object allocation.
    project_sg_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// A server with its image and flavor resolved into full snapshots.
#[derive(Debug, Clone)]
pub struct ResolvedServer {
    pub server: Server,
    pub image: Option<Image>,
    pub flavor: Option<Flavor>,
}

impl ResolvedServer {
    pub fn to_proto(&self) -> crate::proto::Vm {
        self.server.to_proto(
            self.image.as_ref().map(Image::to_proto),
            self.flavor.as_ref().map(Flavor::to_proto),
        )
    }
}

/// Everything `start_server` and `start_server_with_playbook` need.
#[derive(Debug, Default)]
pub struct StartServerParams {
    pub flavor_name: String,
    pub image_name: String,
    pub servername: String,
    pub metadata: HashMap<String, String>,
    /// `Some` imports the caller's key; `None` makes the backend generate a
    /// keypair whose private part is handed to the playbook pipeline.
    pub public_key: Option<String>,
    pub research_environment_metadata: Option<ResearchEnvironmentMetadata>,
    pub volume_ids_path_new: Vec<VolumePath>,
    pub volume_ids_path_attach: Vec<VolumePath>,
    pub additional_owner_keys: Vec<String>,
    pub additional_user_keys: Vec<String>,
    pub additional_security_group_ids: Vec<String>,
    pub slurm_version: Option<String>,
    pub metadata_token: Option<String>,
    pub metadata_endpoint: Option<String>,
    pub additional_script: Option<String>,
}

impl OpenStackConnector {
    pub fn new(api: Arc<dyn CloudApi>, settings: OpenStackSettings) -> Result<Self> {
        let ports = PortCalculator::new(
            &settings.ssh_port_calculation,
            &settings.udp_port_calculation,
        )?;
        Ok(Self {
            api,
            settings,
            ports,
            project_sg_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &OpenStackSettings {
        &self.settings
    }

    pub fn port_calculator(&self) -> &PortCalculator {
        &self.ports
    }

    pub fn gateway_ip(&self) -> &str {
        &self.settings.gateway_ip
    }

    /// The address playbook runners use to reach VMs; falls back to the
    /// public gateway when no internal one is configured.
    pub fn playbook_gateway_ip(&self) -> &str {
        self.settings
            .internal_gateway_ip
            .as_deref()
            .unwrap_or(&self.settings.gateway_ip)
    }

    pub fn cloud_site(&self) -> &str {
        &self.settings.cloud_site
    }

    /// TCP connect probe through the gateway, 5 second timeout, no retry.
    pub async fn netcat(&self, host: &str, port: u16) -> bool {
        let reachable = matches!(
            tokio::time::timeout(SSH_PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        );
        info!(host = %host, port = port, reachable = reachable, "Checked SSH connection");
        reachable
    }

    pub async fn get_vm_ports(&self, openstack_id: &str) -> Result<(u16, u16)> {
        let server = self
            .api
            .get_server(openstack_id)
            .await?
            .ok_or_else(|| ClientError::ServerNotFound(openstack_id.to_string()))?;
        let fixed_ip = server.private_v4.as_deref().ok_or_else(|| {
            ClientError::Validation(format!("server {openstack_id} has no fixed IPv4 yet"))
        })?;
        self.ports.calculate(fixed_ip)
    }

    fn keypair_name(servername: &str, project_name: &str) -> String {
        let prefix: String = Uuid::new_v4().to_string().chars().take(3).collect();
        let short_name: String = servername.chars().take(10).collect();
        format!("{prefix}_{short_name}_{project_name}")
    }

    /// Security group set for a new server: default SSH, research environment
    /// (when requested), per-project, plus caller extras.
    async fn assemble_security_groups(&self, params: &StartServerParams) -> Result<Vec<String>> {
        let mut groups = vec![DEFAULT_SECURITY_GROUP_NAME.to_string()];

        if let Some(meta) = &params.research_environment_metadata {
            if let Some(sg) = self
                .get_or_create_research_environment_security_group(meta)
                .await?
            {
                groups.push(sg.name);
            }
        }

        let project_name = params.metadata.get("project_name");
        let project_id = params.metadata.get("project_id");
        if let (Some(project_name), Some(project_id)) = (project_name, project_id) {
            let sg = self
                .get_or_create_project_security_group(project_name, project_id)
                .await?;
            groups.push(sg.name);
        }

        for sg_id in &params.additional_security_group_ids {
            match self.api.find_security_group(sg_id).await? {
                Some(sg) => groups.push(sg.name),
                None => warn!(security_group = %sg_id, "Additional security group not found, skipping"),
            }
        }

        Ok(groups)
    }

    /// Volume ids to pass to the server create call. Missing volumes are
    /// logged and skipped so one stale id does not block the whole boot.
    async fn existing_volume_ids(&self, params: &StartServerParams) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for pair in params
            .volume_ids_path_new
            .iter()
            .chain(params.volume_ids_path_attach.iter())
        {
            match self.api.find_volume(&pair.openstack_id).await? {
                Some(volume) => ids.push(volume.id),
                None => error!(
                    volume = %pair.openstack_id,
                    "Volume not found, it will not be attached"
                ),
            }
        }
        Ok(ids)
    }

    fn userdata_for(&self, params: &StartServerParams) -> Vec<u8> {
        let mut additional_keys = params.additional_owner_keys.clone();
        additional_keys.extend(params.additional_user_keys.iter().cloned());
        compose_userdata(&UserdataParams {
            additional_keys: &additional_keys,
            new_volumes: &params.volume_ids_path_new,
            attach_volumes: &params.volume_ids_path_attach,
            metadata_token: params.metadata_token.as_deref(),
            metadata_endpoint: params.metadata_endpoint.as_deref(),
            additional_script: params.additional_script.as_deref(),
        })
    }

    async fn resolve_boot_image(&self, params: &StartServerParams) -> Result<Image> {
        self.get_image(
            &params.image_name,
            GetImageOptions {
                replace_inactive: true,
                replace_not_found: true,
                ignore_not_found: true,
                slurm_version: params.slurm_version.clone(),
                ..Default::default()
            },
        )
        .await?
        .ok_or_else(|| ClientError::ImageNotFound(params.image_name.clone()))
    }

    pub async fn start_server(&self, params: StartServerParams) -> Result<String> {
        info!(servername = %params.servername, "Start server");
        let public_key = params
            .public_key
            .clone()
            .ok_or_else(|| ClientError::Validation("start_server requires a public key".into()))?;

        let image = self.resolve_boot_image(&params).await?;
        let flavor = self
            .api
            .find_flavor(&params.flavor_name)
            .await?
            .ok_or_else(|| ClientError::FlavorNotFound(params.flavor_name.clone()))?;
        let network = self.get_network().await?;
        let security_groups = self.assemble_security_groups(&params).await?;

        let project_name = params
            .metadata
            .get("project_name")
            .cloned()
            .unwrap_or_default();
        let key_name = Self::keypair_name(&params.servername, &project_name);
        self.import_keypair(&key_name, &public_key).await?;

        let volume_ids = self.existing_volume_ids(&params).await?;
        let userdata = self.userdata_for(&params);

        let result = self
            .api
            .create_server(NewServer {
                name: params.servername.clone(),
                image_id: image.id,
                flavor_id: flavor.id,
                network_id: network.id,
                key_name: Some(key_name.clone()),
                metadata: params.metadata.clone(),
                security_groups,
                userdata,
                volume_ids,
            })
            .await;

        // The public key lives in authorized_keys now; the keypair is
        // transient and goes away on both the success and the failure path.
        if let Err(e) = self.api.delete_keypair(&key_name).await {
            warn!(key_name = %key_name, error = %e, "Failed to delete transient keypair");
        }

        let server = result?;
        info!(openstack_id = %server.id, servername = %params.servername, "Server created");
        Ok(server.id)
    }

    /// Start path for playbook VMs: the backend generates the keypair and the
    /// private key is returned to the caller exactly once.
    pub async fn start_server_with_playbook(
        &self,
        params: StartServerParams,
    ) -> Result<(String, String)> {
        info!(servername = %params.servername, "Start server with generated key");

        let image = self.resolve_boot_image(&params).await?;
        let flavor = self
            .api
            .find_flavor(&params.flavor_name)
            .await?
            .ok_or_else(|| ClientError::FlavorNotFound(params.flavor_name.clone()))?;
        let network = self.get_network().await?;
        let security_groups = self.assemble_security_groups(&params).await?;

        let keypair = self.api.create_keypair(&params.servername, None).await?;
        let private_key = match keypair.private_key {
            Some(private_key) => private_key,
            None => {
                let _ = self.api.delete_keypair(&keypair.name).await;
                return Err(ClientError::Internal(
                    "backend did not return a generated private key".into(),
                ));
            }
        };

        let volume_ids = self.existing_volume_ids(&params).await?;
        let userdata = self.userdata_for(&params);

        let result = self
            .api
            .create_server(NewServer {
                name: params.servername.clone(),
                image_id: image.id,
                flavor_id: flavor.id,
                network_id: network.id,
                key_name: Some(keypair.name.clone()),
                metadata: params.metadata.clone(),
                security_groups,
                userdata,
                volume_ids,
            })
            .await;

        if let Err(e) = self.api.delete_keypair(&keypair.name).await {
            warn!(key_name = %keypair.name, error = %e, "Failed to delete transient keypair");
        }

        let server = result?;
        info!(openstack_id = %server.id, "Playbook server created");
        Ok((server.id, private_key))
    }

    pub async fn delete_server(&self, openstack_id: &str) -> Result<()> {
        info!(openstack_id = %openstack_id, "Delete server");
        let server = self
            .api
            .get_server(openstack_id)
            .await?
            .ok_or_else(|| ClientError::ServerNotFound(openstack_id.to_string()))?;

        if let Some(task_state) = &server.task_state {
            if task_states::IMAGE_SNAPSHOT_STATES.contains(&task_state.as_str()) {
                return Err(ClientError::Conflict(format!(
                    "server {openstack_id} task_state is {task_state}, image creation in progress"
                )));
            }
        }

        self.detach_and_clean_security_groups(&server).await?;
        self.api.delete_server(openstack_id, true).await
    }

    /// `get_server` never raises for a missing VM: pollers need to tell
    /// "not there yet" apart from "call failed".
    pub async fn get_server(&self, openstack_id: &str) -> Result<ResolvedServer> {
        let Some(server) = self.api.get_server(openstack_id).await? else {
            warn!(openstack_id = %openstack_id, "Server not found, returning placeholder");
            return Ok(ResolvedServer {
                server: Server::not_found(openstack_id),
                image: None,
                flavor: None,
            });
        };
        self.resolve_server(server).await
    }

    pub async fn get_server_by_unique_name(&self, unique_name: &str) -> Result<ResolvedServer> {
        let Some(server) = self.api.find_server_by_name(unique_name).await? else {
            return Ok(ResolvedServer {
                server: Server::not_found(unique_name),
                image: None,
                flavor: None,
            });
        };
        self.resolve_server(server).await
    }

    async fn resolve_server(&self, mut server: Server) -> Result<ResolvedServer> {
        if server.is_active() {
            if let Some(fixed_ip) = server.private_v4.clone() {
                let ssh_port = self.ports.ssh_port(&fixed_ip)?;
                if !self.netcat(&self.settings.gateway_ip, ssh_port).await {
                    server.task_state = Some(task_states::CHECKING_SSH_CONNECTION.to_string());
                }
            }
        }

        let image = match server.image_id.as_deref() {
            Some(image_id) if !image_id.is_empty() => {
                self.get_image(
                    image_id,
                    GetImageOptions {
                        ignore_not_active: true,
                        ignore_not_found: true,
                        ..Default::default()
                    },
                )
                .await?
            }
            _ => None,
        };
        let flavor = self.api.find_flavor(&server.flavor_id).await?;
        Ok(ResolvedServer {
            server,
            image,
            flavor,
        })
    }

    pub async fn get_flavors(&self) -> Result<Vec<Flavor>> {
        self.api.list_flavors().await
    }

    pub async fn get_servers(&self) -> Result<Vec<ResolvedServer>> {
        let servers = self.api.list_servers().await?;
        self.resolve_servers(servers).await
    }

    pub async fn get_servers_by_ids(&self, ids: &[String]) -> Result<Vec<ResolvedServer>> {
        let mut servers = Vec::new();
        for id in ids {
            match self.api.get_server(id).await? {
                Some(server) => servers.push(server),
                None => warn!(openstack_id = %id, "Requested VM not found"),
            }
        }
        self.resolve_servers(servers).await
    }

    pub async fn get_servers_by_bibigrid_id(&self, bibigrid_id: &str) -> Result<Vec<ResolvedServer>> {
        let servers = self
            .api
            .list_servers()
            .await?
            .into_iter()
            .filter(|server| {
                server
                    .metadata
                    .get("bibigrid_id")
                    .or_else(|| server.metadata.get("bibigrid-id"))
                    .is_some_and(|id| id == bibigrid_id)
                    || server.name.contains(bibigrid_id)
            })
            .collect();
        self.resolve_servers(servers).await
    }

    /// Batch resolution against one image and one flavor listing, so a list
    /// of N servers does not turn into 2N backend calls.
    async fn resolve_servers(&self, servers: Vec<Server>) -> Result<Vec<ResolvedServer>> {
        let images: HashMap<String, Image> = self
            .api
            .list_images(None)
            .await?
            .into_iter()
            .map(|image| (image.id.clone(), image))
            .collect();
        let flavors: HashMap<String, Flavor> = self
            .api
            .list_flavors()
            .await?
            .into_iter()
            .map(|flavor| (flavor.id.clone(), flavor))
            .collect();

        Ok(servers
            .into_iter()
            .map(|server| {
                let image = server
                    .image_id
                    .as_deref()
                    .and_then(|id| images.get(id).cloned());
                let flavor = flavors.get(&server.flavor_id).cloned();
                ResolvedServer {
                    server,
                    image,
                    flavor,
                }
            })
            .collect())
    }

    pub async fn exist_server(&self, name: &str) -> Result<bool> {
        Ok(self.api.find_server_by_name(name).await?.is_some())
    }

    pub async fn stop_server(&self, openstack_id: &str) -> Result<()> {
        info!(openstack_id = %openstack_id, "Stop server");
        self.api.server_action(openstack_id, ServerAction::Stop).await
    }

    pub async fn resume_server(&self, openstack_id: &str) -> Result<()> {
        info!(openstack_id = %openstack_id, "Resume server");
        self.api.server_action(openstack_id, ServerAction::Start).await
    }

    pub async fn reboot_soft_server(&self, openstack_id: &str) -> Result<()> {
        info!(openstack_id = %openstack_id, "Soft reboot server");
        self.api
            .server_action(openstack_id, ServerAction::RebootSoft)
            .await
    }

    pub async fn reboot_hard_server(&self, openstack_id: &str) -> Result<()> {
        info!(openstack_id = %openstack_id, "Hard reboot server");
        self.api
            .server_action(openstack_id, ServerAction::RebootHard)
            .await
    }

    pub async fn rescue_server(
        &self,
        openstack_id: &str,
        admin_pass: Option<&str>,
        image_ref: Option<&str>,
    ) -> Result<()> {
        info!(openstack_id = %openstack_id, "Rescue server");
        self.api
            .server_action(
                openstack_id,
                ServerAction::Rescue {
                    admin_pass,
                    image_ref,
                },
            )
            .await
    }

    pub async fn unrescue_server(&self, openstack_id: &str) -> Result<()> {
        info!(openstack_id = %openstack_id, "Unrescue server");
        self.api
            .server_action(openstack_id, ServerAction::Unrescue)
            .await
    }

    pub async fn get_server_console(&self, openstack_id: &str) -> Result<String> {
        self.api.get_server_console(openstack_id).await
    }

    pub async fn set_server_metadata(
        &self,
        openstack_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        info!(openstack_id = %openstack_id, "Set server metadata");
        self.api.replace_server_metadata(openstack_id, metadata).await
    }

    pub async fn add_metadata_to_server(
        &self,
        openstack_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        info!(openstack_id = %openstack_id, "Add server metadata");
        self.api.merge_server_metadata(openstack_id, metadata).await
    }

    pub async fn get_limits(&self) -> Result<crate::proto::Limits> {
        info!("Get limits");
        let compute = self.api.compute_limits().await?;
        let volume = self.api.volume_limits().await?;
        Ok(limits_to_proto(compute, volume))
    }

    async fn get_network(&self) -> Result<Network> {
        self.api
            .find_network(&self.settings.network)
            .await?
            .ok_or_else(|| {
                ClientError::Internal(format!("network {} not found", self.settings.network))
            })
    }

    // Keypairs

    /// Idempotent by name; a changed public key replaces the stored keypair.
    pub async fn import_keypair(&self, keyname: &str, public_key: &str) -> Result<Keypair> {
        match self.api.find_keypair(keyname).await? {
            None => {
                info!(keyname = %keyname, "Create keypair");
                self.api.create_keypair(keyname, Some(public_key)).await
            }
            Some(existing) if existing.public_key != public_key => {
                info!(keyname = %keyname, "Key changed, replacing keypair");
                self.api.delete_keypair(keyname).await?;
                self.api.create_keypair(keyname, Some(public_key)).await
            }
            Some(existing) => Ok(existing),
        }
    }

    pub async fn get_keypair_public_key_by_name(&self, key_name: &str) -> Result<String> {
        Ok(self
            .api
            .find_keypair(key_name)
            .await?
            .map(|keypair| keypair.public_key)
            .unwrap_or_default())
    }

    pub async fn delete_keypair(&self, key_name: &str) -> Result<()> {
        info!(key_name = %key_name, "Delete keypair");
        self.api.delete_keypair(key_name).await
    }

    // Images

    pub async fn create_snapshot(
        &self,
        openstack_id: &str,
        name: &str,
        username: &str,
        base_tags: &[String],
        description: &str,
    ) -> Result<String> {
        info!(openstack_id = %openstack_id, name = %name, username = %username, "Create snapshot");
        let snapshot_id = self
            .api
            .create_server_snapshot(openstack_id, name, description)
            .await?;
        for tag in base_tags {
            self.api.add_image_tag(&snapshot_id, tag).await?;
        }
        Ok(snapshot_id)
    }

    pub async fn delete_image(&self, image_id: &str) -> Result<()> {
        info!(image_id = %image_id, "Delete image");
        if self.api.find_image(image_id).await?.is_none() {
            return Err(ClientError::ImageNotFound(image_id.to_string()));
        }
        self.api.delete_image(image_id).await
    }

    // Cluster support

    #[allow(clippy::too_many_arguments)]
    pub async fn add_cluster_machine(
        &self,
        cluster_id: &str,
        cluster_user: &str,
        cluster_group_names: &[String],
        image_name: &str,
        flavor_name: &str,
        name: &str,
        key_name: &str,
        batch_idx: u32,
        worker_idx: u32,
    ) -> Result<String> {
        info!(cluster_id = %cluster_id, name = %name, "Add cluster machine");
        let image = self
            .get_image(
                image_name,
                GetImageOptions {
                    replace_inactive: true,
                    ..Default::default()
                },
            )
            .await?
            .ok_or_else(|| ClientError::ImageNotFound(image_name.to_string()))?;
        let flavor = self
            .api
            .find_flavor(flavor_name)
            .await?
            .ok_or_else(|| ClientError::FlavorNotFound(flavor_name.to_string()))?;
        let network = self.get_network().await?;

        let metadata = HashMap::from([
            ("bibigrid-id".to_string(), cluster_id.to_string()),
            ("user".to_string(), cluster_user.to_string()),
            ("worker-batch".to_string(), batch_idx.to_string()),
            ("name".to_string(), name.to_string()),
            ("worker-index".to_string(), worker_idx.to_string()),
        ]);

        let server = self
            .api
            .create_server(NewServer {
                name: name.to_string(),
                image_id: image.id,
                flavor_id: flavor.id,
                network_id: network.id,
                key_name: Some(key_name.to_string()),
                metadata,
                security_groups: cluster_group_names.to_vec(),
                userdata: DEACTIVATE_UPGRADES_SCRIPT.as_bytes().to_vec(),
                volume_ids: Vec::new(),
            })
            .await?;
        info!(openstack_id = %server.id, "Cluster machine created");
        Ok(server.id)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockCloud;
    use super::*;

    fn settings() -> OpenStackSettings {
        OpenStackSettings {
            gateway_ip: "127.0.0.1".to_string(),
            internal_gateway_ip: None,
            network: "portalnetwork".to_string(),
            cloud_site: "bielefeld".to_string(),
            ssh_port_calculation: "30000 + x + y * 256".to_string(),
            udp_port_calculation: "30000 + x + y * 256".to_string(),
            gateway_security_group_id: "gw-sg-id".to_string(),
            forc_security_group_id: Some("forc-sg-id".to_string()),
            compute_api_version: None,
        }
    }

    fn active_image(id: &str, name: &str) -> Image {
        Image {
            id: id.to_string(),
            name: name.to_string(),
            status: "active".to_string(),
            visibility: "public".to_string(),
            tags: vec!["portalclient".to_string()],
            os_version: Some("22.04".to_string()),
            os_distro: Some("ubuntu".to_string()),
            ..Default::default()
        }
    }

    fn flavor(name: &str) -> Flavor {
        Flavor {
            id: format!("id-{name}"),
            name: name.to_string(),
            vcpus: 2,
            ram_mb: 4096,
            disk_gb: 20,
            ..Default::default()
        }
    }

    fn start_params(servername: &str) -> StartServerParams {
        StartServerParams {
            flavor_name: "m1.small".to_string(),
            image_name: "ubuntu-22.04".to_string(),
            servername: servername.to_string(),
            metadata: HashMap::from([
                ("project_name".to_string(), "proj".to_string()),
                ("project_id".to_string(), "p1".to_string()),
            ]),
            public_key: Some("ssh-rsa AAA".to_string()),
            ..Default::default()
        }
    }

    fn connector(mock: MockCloud) -> (Arc<MockCloud>, OpenStackConnector) {
        let api = Arc::new(mock);
        let connector = OpenStackConnector::new(api.clone(), settings()).unwrap();
        (api, connector)
    }

    #[tokio::test]
    async fn test_start_server_deletes_transient_keypair() {
        let mock = MockCloud::default()
            .with_image(active_image("img-1", "ubuntu-22.04"))
            .with_flavor(flavor("m1.small"))
            .with_network("portalnetwork");
        let (api, connector) = connector(mock);

        let vm_id = connector.start_server(start_params("alice-01")).await.unwrap();

        let server = api.get_server(&vm_id).await.unwrap().unwrap();
        let key_name = server.key_name.unwrap();
        assert!(key_name.ends_with("_alice-01_proj"));
        // The keypair itself is gone again.
        assert!(api.find_keypair(&key_name).await.unwrap().is_none());
        assert_eq!(
            api.keypair_delete_count.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        // default + project security groups attached
        assert!(server
            .security_group_names
            .contains(&DEFAULT_SECURITY_GROUP_NAME.to_string()));
        assert!(server.security_group_names.contains(&"proj_p1".to_string()));
    }

    #[tokio::test]
    async fn test_start_server_failure_still_deletes_keypair() {
        let mock = MockCloud::default()
            .with_image(active_image("img-1", "ubuntu-22.04"))
            .with_flavor(flavor("m1.small"))
            .with_network("portalnetwork");
        *mock.fail_create_server.lock().unwrap() =
            Some(ClientError::ResourceNotAvailable("quota".into()));
        let (api, connector) = connector(mock);

        let err = connector.start_server(start_params("bob-01")).await.unwrap_err();
        assert!(matches!(err, ClientError::ResourceNotAvailable(_)));
        assert!(api.keypairs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_server_with_playbook_returns_private_key() {
        let mock = MockCloud::default()
            .with_image(active_image("img-1", "ubuntu-22.04"))
            .with_flavor(flavor("m1.small"))
            .with_network("portalnetwork");
        let (api, connector) = connector(mock);

        let mut params = start_params("carol-01");
        params.public_key = None;
        let (vm_id, private_key) = connector.start_server_with_playbook(params).await.unwrap();
        assert!(private_key.contains("PRIVATE KEY"));
        assert!(api.get_server(&vm_id).await.unwrap().is_some());
        assert!(api.keypairs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_server_refused_during_image_upload() {
        let server = Server {
            id: "vm-1".to_string(),
            name: "alice-01".to_string(),
            task_state: Some("image_uploading".to_string()),
            vm_state: "active".to_string(),
            ..Default::default()
        };
        let (_, connector) = connector(MockCloud::default().with_server(server));

        let err = connector.delete_server("vm-1").await.unwrap_err();
        assert!(matches!(err, ClientError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_get_server_missing_returns_not_found_placeholder() {
        let (_, connector) = connector(MockCloud::default());
        let resolved = connector.get_server("missing-vm").await.unwrap();
        assert_eq!(resolved.server.vm_state, vm_states::NOT_FOUND);
        assert_eq!(resolved.server.id, "missing-vm");
    }

    #[tokio::test]
    async fn test_import_keypair_replaces_changed_key() {
        let (api, connector) = connector(MockCloud::default());
        connector.import_keypair("key-1", "ssh-rsa AAA").await.unwrap();
        connector.import_keypair("key-1", "ssh-rsa BBB").await.unwrap();
        let keypair = api.find_keypair("key-1").await.unwrap().unwrap();
        assert_eq!(keypair.public_key, "ssh-rsa BBB");
        assert_eq!(
            api.keypair_create_count.load(std::sync::atomic::Ordering::SeqCst),
            2
        );

        // Same key again is a no-op.
        connector.import_keypair("key-1", "ssh-rsa BBB").await.unwrap();
        assert_eq!(
            api.keypair_create_count.load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }

    #[tokio::test]
    async fn test_get_vm_ports() {
        let server = Server {
            id: "vm-1".to_string(),
            private_v4: Some("10.0.2.15".to_string()),
            vm_state: "active".to_string(),
            ..Default::default()
        };
        let (_, connector) = connector(MockCloud::default().with_server(server));
        let (ssh, udp) = connector.get_vm_ports("vm-1").await.unwrap();
        assert_eq!(ssh, 30527);
        assert_eq!(udp, 30527);
    }

    #[tokio::test]
    async fn test_keypair_name_shape() {
        let name = OpenStackConnector::keypair_name("a-very-long-servername", "proj");
        let parts: Vec<&str> = name.splitn(3, '_').collect();
        assert_eq!(parts[0].len(), 3);
        assert_eq!(parts[1], "a-very-lon");
        assert_eq!(parts[2], "proj");
    }
}
