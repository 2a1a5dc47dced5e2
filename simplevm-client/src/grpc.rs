//! The portal-facing RPC facade.
//!
//! Handlers stay thin: argument shuffling, delegation to the connectors and
//! the `ClientError` to status translation. The one place with real logic is
//! the playbook path, where the reachability gate lives.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::bibigrid::BibigridConnector;
use crate::forc::ForcConnector;
use crate::metadata::MetadataConnector;
use crate::openstack::images::GetImageOptions;
use crate::openstack::{OpenStackConnector, ResolvedServer, StartServerParams};
use crate::proto::virtual_machine_service_server::VirtualMachineService;
use crate::proto::*;

#[derive(Clone)]
pub struct VirtualMachineServiceImpl {
    openstack: Arc<OpenStackConnector>,
    forc: Arc<ForcConnector>,
    bibigrid: Arc<BibigridConnector>,
    metadata: Arc<MetadataConnector>,
}

fn none_if_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

impl VirtualMachineServiceImpl {
    pub fn new(
        openstack: Arc<OpenStackConnector>,
        forc: Arc<ForcConnector>,
        bibigrid: Arc<BibigridConnector>,
        metadata: Arc<MetadataConnector>,
    ) -> Self {
        Self {
            openstack,
            forc,
            bibigrid,
            metadata,
        }
    }

    async fn vm_response(&self, resolved: ResolvedServer) -> Result<Vm, Status> {
        let mut resolved = resolved;
        self.forc
            .overlay_playbook_status(&mut resolved.server)
            .await
            .map_err(Status::from)?;
        Ok(resolved.to_proto())
    }

    async fn vm_list_response(&self, resolved: Vec<ResolvedServer>) -> Result<VmList, Status> {
        let mut vms = Vec::with_capacity(resolved.len());
        for server in resolved {
            vms.push(self.vm_response(server).await?);
        }
        Ok(VmList { vms })
    }

    #[allow(clippy::too_many_arguments)]
    fn start_params(
        &self,
        flavor_name: String,
        image_name: String,
        servername: String,
        metadata: std::collections::HashMap<String, String>,
        public_key: Option<String>,
        research_environment: String,
        volume_ids_path_new: Vec<VolumePath>,
        volume_ids_path_attach: Vec<VolumePath>,
        additional_owner_keys: Vec<String>,
        additional_user_keys: Vec<String>,
        additional_security_group_ids: Vec<String>,
        slurm_version: String,
        metadata_token: String,
        metadata_endpoint: String,
        additional_script: String,
    ) -> StartServerParams {
        let research_environment_metadata = none_if_empty(research_environment)
            .and_then(|env| self.forc.get_metadata_by_research_environment(&env));
        StartServerParams {
            flavor_name,
            image_name,
            servername,
            metadata,
            public_key,
            research_environment_metadata,
            volume_ids_path_new,
            volume_ids_path_attach,
            additional_owner_keys,
            additional_user_keys,
            additional_security_group_ids,
            slurm_version: none_if_empty(slurm_version),
            metadata_token: none_if_empty(metadata_token),
            metadata_endpoint: none_if_empty(metadata_endpoint),
            additional_script: none_if_empty(additional_script),
        }
    }

    /// SIGTERM hook: tear down every VM still waiting on its playbook, then
    /// let main exit. Individual failures are logged and skipped so one stuck
    /// VM does not keep the traces of the others around.
    pub async fn shutdown(&self) {
        for openstack_id in self.forc.active_playbook_ids().await {
            info!(openstack_id = %openstack_id, "Clearing traces of playbook VM");
            match self.forc.store().get_name(&openstack_id).await {
                Ok(Some(key_name)) => {
                    if let Err(e) = self.openstack.delete_keypair(&key_name).await {
                        error!(openstack_id = %openstack_id, error = %e, "Failed to delete keypair");
                    }
                }
                Ok(None) => warn!(openstack_id = %openstack_id, "No keypair name recorded"),
                Err(e) => error!(openstack_id = %openstack_id, error = %e, "Failed to read keypair name"),
            }
            if let Err(e) = self.openstack.delete_server(&openstack_id).await {
                error!(openstack_id = %openstack_id, error = %e, "Failed to delete server");
            }
            if let Err(e) = self.forc.stop_playbook(&openstack_id).await {
                error!(openstack_id = %openstack_id, error = %e, "Failed to stop playbook");
            }
        }
    }
}

#[tonic::async_trait]
impl VirtualMachineService for VirtualMachineServiceImpl {
    // Images / flavors

    async fn get_images(
        &self,
        _request: Request<GetImagesRequest>,
    ) -> Result<Response<ImageList>, Status> {
        let images = self.openstack.get_images().await.map_err(Status::from)?;
        Ok(Response::new(ImageList {
            images: images.iter().map(|i| i.to_proto()).collect(),
        }))
    }

    async fn get_image(&self, request: Request<GetImageRequest>) -> Result<Response<Image>, Status> {
        let req = request.into_inner();
        let image = self
            .openstack
            .get_image(
                &req.name_or_id,
                GetImageOptions {
                    ignore_not_active: req.ignore_not_active,
                    ..Default::default()
                },
            )
            .await
            .map_err(Status::from)?
            .ok_or_else(|| Status::not_found(format!("Image {} not found", req.name_or_id)))?;
        Ok(Response::new(image.to_proto()))
    }

    async fn get_public_images(
        &self,
        _request: Request<GetPublicImagesRequest>,
    ) -> Result<Response<ImageList>, Status> {
        let images = self.openstack.get_public_images().await.map_err(Status::from)?;
        Ok(Response::new(ImageList {
            images: images.iter().map(|i| i.to_proto()).collect(),
        }))
    }

    async fn get_private_images(
        &self,
        _request: Request<GetPrivateImagesRequest>,
    ) -> Result<Response<ImageList>, Status> {
        let images = self.openstack.get_private_images().await.map_err(Status::from)?;
        Ok(Response::new(ImageList {
            images: images.iter().map(|i| i.to_proto()).collect(),
        }))
    }

    async fn delete_image(
        &self,
        request: Request<DeleteImageRequest>,
    ) -> Result<Response<DeleteImageResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .delete_image(&req.image_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(DeleteImageResponse {}))
    }

    async fn create_snapshot(
        &self,
        request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        let snapshot_id = self
            .openstack
            .create_snapshot(
                &req.openstack_id,
                &req.name,
                &req.username,
                &req.base_tags,
                &req.description,
            )
            .await
            .map_err(Status::from)?;
        Ok(Response::new(CreateSnapshotResponse { snapshot_id }))
    }

    async fn get_flavors(
        &self,
        _request: Request<GetFlavorsRequest>,
    ) -> Result<Response<FlavorList>, Status> {
        let flavors = self.openstack.get_flavors().await.map_err(Status::from)?;
        Ok(Response::new(FlavorList {
            flavors: flavors.iter().map(|f| f.to_proto()).collect(),
        }))
    }

    // Volumes

    async fn get_volume(&self, request: Request<GetVolumeRequest>) -> Result<Response<Volume>, Status> {
        let req = request.into_inner();
        let volume = self
            .openstack
            .get_volume(&req.name_or_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(volume.to_proto()))
    }

    async fn get_volumes_by_ids(
        &self,
        request: Request<GetVolumesByIdsRequest>,
    ) -> Result<Response<VolumeList>, Status> {
        let req = request.into_inner();
        let volumes = self
            .openstack
            .get_volumes_by_ids(&req.volume_ids)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(VolumeList {
            volumes: volumes.iter().map(|v| v.to_proto()).collect(),
        }))
    }

    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<Volume>, Status> {
        let req = request.into_inner();
        let volume = self
            .openstack
            .create_volume(&req.volume_name, req.volume_storage_gb, req.metadata)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(volume.to_proto()))
    }

    async fn create_volume_by_source_volume(
        &self,
        request: Request<CreateVolumeBySourceVolumeRequest>,
    ) -> Result<Response<Volume>, Status> {
        let req = request.into_inner();
        let volume = self
            .openstack
            .create_volume_by_source_volume(&req.volume_name, req.metadata, &req.source_volume_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(volume.to_proto()))
    }

    async fn create_volume_by_volume_snap(
        &self,
        request: Request<CreateVolumeByVolumeSnapRequest>,
    ) -> Result<Response<Volume>, Status> {
        let req = request.into_inner();
        let volume = self
            .openstack
            .create_volume_by_volume_snap(&req.volume_name, req.metadata, &req.volume_snap_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(volume.to_proto()))
    }

    async fn resize_volume(
        &self,
        request: Request<ResizeVolumeRequest>,
    ) -> Result<Response<ResizeVolumeResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .resize_volume(&req.volume_id, req.size_gb)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(ResizeVolumeResponse {}))
    }

    async fn attach_volume_to_server(
        &self,
        request: Request<AttachVolumeToServerRequest>,
    ) -> Result<Response<AttachVolumeToServerResponse>, Status> {
        let req = request.into_inner();
        let device = self
            .openstack
            .attach_volume_to_server(&req.openstack_id, &req.volume_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(AttachVolumeToServerResponse { device }))
    }

    async fn detach_volume(
        &self,
        request: Request<DetachVolumeRequest>,
    ) -> Result<Response<DetachVolumeResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .detach_volume(&req.volume_id, &req.server_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(DetachVolumeResponse {}))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .delete_volume(&req.volume_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn create_volume_snapshot(
        &self,
        request: Request<CreateVolumeSnapshotRequest>,
    ) -> Result<Response<CreateVolumeSnapshotResponse>, Status> {
        let req = request.into_inner();
        let snapshot_id = self
            .openstack
            .create_volume_snapshot(&req.volume_id, &req.name, &req.description)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(CreateVolumeSnapshotResponse { snapshot_id }))
    }

    async fn get_volume_snapshot(
        &self,
        request: Request<GetVolumeSnapshotRequest>,
    ) -> Result<Response<VolumeSnapshot>, Status> {
        let req = request.into_inner();
        let snapshot = self
            .openstack
            .get_volume_snapshot(&req.snapshot_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(snapshot.to_proto()))
    }

    async fn delete_volume_snapshot(
        &self,
        request: Request<DeleteVolumeSnapshotRequest>,
    ) -> Result<Response<DeleteVolumeSnapshotResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .delete_volume_snapshot(&req.snapshot_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(DeleteVolumeSnapshotResponse {}))
    }

    // Virtual machines

    async fn start_server(
        &self,
        request: Request<StartServerRequest>,
    ) -> Result<Response<StartServerResponse>, Status> {
        let req = request.into_inner();
        let params = self.start_params(
            req.flavor_name,
            req.image_name,
            req.servername,
            req.metadata,
            Some(req.public_key),
            req.research_environment,
            req.volume_ids_path_new,
            req.volume_ids_path_attach,
            req.additional_owner_keys,
            req.additional_user_keys,
            req.additional_security_group_ids,
            req.slurm_version,
            req.metadata_token,
            req.metadata_endpoint,
            req.additional_script,
        );
        let openstack_id = self.openstack.start_server(params).await.map_err(Status::from)?;
        Ok(Response::new(StartServerResponse { openstack_id }))
    }

    async fn start_server_with_custom_key(
        &self,
        request: Request<StartServerWithCustomKeyRequest>,
    ) -> Result<Response<StartServerWithCustomKeyResponse>, Status> {
        let req = request.into_inner();
        let servername = req.servername.clone();
        let params = self.start_params(
            req.flavor_name,
            req.image_name,
            req.servername,
            req.metadata,
            None,
            req.research_environment,
            req.volume_ids_path_new,
            req.volume_ids_path_attach,
            req.additional_owner_keys,
            req.additional_user_keys,
            req.additional_security_group_ids,
            String::new(),
            req.metadata_token,
            req.metadata_endpoint,
            req.additional_script,
        );
        let (openstack_id, private_key) = self
            .openstack
            .start_server_with_playbook(params)
            .await
            .map_err(Status::from)?;
        self.forc
            .set_vm_wait_for_playbook(&openstack_id, &private_key, &servername)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(StartServerWithCustomKeyResponse {
            openstack_id,
            private_key,
        }))
    }

    async fn get_server(&self, request: Request<GetServerRequest>) -> Result<Response<Vm>, Status> {
        let req = request.into_inner();
        let resolved = self
            .openstack
            .get_server(&req.openstack_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(self.vm_response(resolved).await?))
    }

    async fn get_server_by_unique_name(
        &self,
        request: Request<GetServerByUniqueNameRequest>,
    ) -> Result<Response<Vm>, Status> {
        let req = request.into_inner();
        let resolved = self
            .openstack
            .get_server_by_unique_name(&req.unique_name)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(self.vm_response(resolved).await?))
    }

    async fn get_servers(
        &self,
        _request: Request<GetServersRequest>,
    ) -> Result<Response<VmList>, Status> {
        let resolved = self.openstack.get_servers().await.map_err(Status::from)?;
        Ok(Response::new(self.vm_list_response(resolved).await?))
    }

    async fn get_servers_by_ids(
        &self,
        request: Request<GetServersByIdsRequest>,
    ) -> Result<Response<VmList>, Status> {
        let req = request.into_inner();
        let resolved = self
            .openstack
            .get_servers_by_ids(&req.server_ids)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(self.vm_list_response(resolved).await?))
    }

    async fn get_servers_by_bibigrid_id(
        &self,
        request: Request<GetServersByBibigridIdRequest>,
    ) -> Result<Response<VmList>, Status> {
        let req = request.into_inner();
        let resolved = self
            .openstack
            .get_servers_by_bibigrid_id(&req.bibigrid_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(self.vm_list_response(resolved).await?))
    }

    async fn get_server_console(
        &self,
        request: Request<GetServerConsoleRequest>,
    ) -> Result<Response<GetServerConsoleResponse>, Status> {
        let req = request.into_inner();
        let console = self
            .openstack
            .get_server_console(&req.openstack_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(GetServerConsoleResponse { console }))
    }

    async fn stop_server(
        &self,
        request: Request<StopServerRequest>,
    ) -> Result<Response<StopServerResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .stop_server(&req.openstack_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(StopServerResponse {}))
    }

    async fn reboot_soft_server(
        &self,
        request: Request<RebootServerRequest>,
    ) -> Result<Response<RebootServerResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .reboot_soft_server(&req.openstack_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(RebootServerResponse {}))
    }

    async fn reboot_hard_server(
        &self,
        request: Request<RebootServerRequest>,
    ) -> Result<Response<RebootServerResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .reboot_hard_server(&req.openstack_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(RebootServerResponse {}))
    }

    async fn resume_server(
        &self,
        request: Request<ResumeServerRequest>,
    ) -> Result<Response<ResumeServerResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .resume_server(&req.openstack_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(ResumeServerResponse {}))
    }

    async fn rescue_server(
        &self,
        request: Request<RescueServerRequest>,
    ) -> Result<Response<RescueServerResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .rescue_server(
                &req.openstack_id,
                none_if_empty(req.admin_pass).as_deref(),
                none_if_empty(req.image_ref).as_deref(),
            )
            .await
            .map_err(Status::from)?;
        Ok(Response::new(RescueServerResponse {}))
    }

    async fn unrescue_server(
        &self,
        request: Request<UnrescueServerRequest>,
    ) -> Result<Response<UnrescueServerResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .unrescue_server(&req.openstack_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(UnrescueServerResponse {}))
    }

    async fn delete_server(
        &self,
        request: Request<DeleteServerRequest>,
    ) -> Result<Response<DeleteServerResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .delete_server(&req.openstack_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(DeleteServerResponse {}))
    }

    async fn exist_server(
        &self,
        request: Request<ExistServerRequest>,
    ) -> Result<Response<ExistServerResponse>, Status> {
        let req = request.into_inner();
        let exists = self.openstack.exist_server(&req.name).await.map_err(Status::from)?;
        Ok(Response::new(ExistServerResponse { exists }))
    }

    async fn get_vm_ports(
        &self,
        request: Request<GetVmPortsRequest>,
    ) -> Result<Response<GetVmPortsResponse>, Status> {
        let req = request.into_inner();
        let (port, udp) = self
            .openstack
            .get_vm_ports(&req.openstack_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(GetVmPortsResponse {
            port: port as u32,
            udp: udp as u32,
        }))
    }

    async fn set_server_metadata(
        &self,
        request: Request<SetServerMetadataRequest>,
    ) -> Result<Response<SetServerMetadataResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .set_server_metadata(&req.openstack_id, &req.metadata)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(SetServerMetadataResponse {}))
    }

    async fn add_metadata_to_server(
        &self,
        request: Request<AddMetadataToServerRequest>,
    ) -> Result<Response<AddMetadataToServerResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .add_metadata_to_server(&req.openstack_id, &req.metadata)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(AddMetadataToServerResponse {}))
    }

    // Security groups

    async fn delete_security_group_rule(
        &self,
        request: Request<DeleteSecurityGroupRuleRequest>,
    ) -> Result<Response<DeleteSecurityGroupRuleResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .delete_security_group_rule(&req.rule_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(DeleteSecurityGroupRuleResponse {}))
    }

    async fn remove_security_groups_from_server(
        &self,
        request: Request<RemoveSecurityGroupsFromServerRequest>,
    ) -> Result<Response<RemoveSecurityGroupsFromServerResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .remove_security_groups_from_server(&req.openstack_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(RemoveSecurityGroupsFromServerResponse {}))
    }

    async fn add_default_security_groups_to_server(
        &self,
        request: Request<AddDefaultSecurityGroupsToServerRequest>,
    ) -> Result<Response<AddDefaultSecurityGroupsToServerResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .add_default_security_groups_to_server(&req.openstack_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(AddDefaultSecurityGroupsToServerResponse {}))
    }

    async fn open_port_range_for_vm_in_project(
        &self,
        request: Request<OpenPortRangeForVmInProjectRequest>,
    ) -> Result<Response<OpenPortRangeForVmInProjectResponse>, Status> {
        let req = request.into_inner();
        let rule_id = self
            .openstack
            .open_port_range_for_vm_in_project(
                req.range_start,
                req.range_stop,
                &req.openstack_id,
                &req.ethertype,
                &req.protocol,
            )
            .await
            .map_err(Status::from)?;
        Ok(Response::new(OpenPortRangeForVmInProjectResponse { rule_id }))
    }

    async fn add_research_environment_security_group(
        &self,
        request: Request<AddResearchEnvironmentSecurityGroupRequest>,
    ) -> Result<Response<AddResearchEnvironmentSecurityGroupResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .add_research_environment_security_group(&req.server_id, &req.security_group_name)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(AddResearchEnvironmentSecurityGroupResponse {}))
    }

    async fn add_project_security_group_to_server(
        &self,
        request: Request<AddProjectSecurityGroupToServerRequest>,
    ) -> Result<Response<AddProjectSecurityGroupToServerResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .add_project_security_group_to_server(&req.server_id, &req.project_name, &req.project_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(AddProjectSecurityGroupToServerResponse {}))
    }

    async fn add_udp_security_group(
        &self,
        request: Request<AddUdpSecurityGroupRequest>,
    ) -> Result<Response<AddUdpSecurityGroupResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .add_udp_security_group(&req.server_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(AddUdpSecurityGroupResponse {}))
    }

    async fn get_security_group_id_by_name(
        &self,
        request: Request<GetSecurityGroupIdByNameRequest>,
    ) -> Result<Response<GetSecurityGroupIdByNameResponse>, Status> {
        let req = request.into_inner();
        let security_group_id = self
            .openstack
            .get_security_group_id_by_name(&req.name)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(GetSecurityGroupIdByNameResponse {
            security_group_id,
        }))
    }

    // Keypairs

    async fn import_keypair(
        &self,
        request: Request<ImportKeypairRequest>,
    ) -> Result<Response<Keypair>, Status> {
        let req = request.into_inner();
        let keypair = self
            .openstack
            .import_keypair(&req.keyname, &req.public_key)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(keypair.to_proto()))
    }

    async fn get_keypair_public_key_by_name(
        &self,
        request: Request<GetKeypairPublicKeyByNameRequest>,
    ) -> Result<Response<GetKeypairPublicKeyByNameResponse>, Status> {
        let req = request.into_inner();
        let public_key = self
            .openstack
            .get_keypair_public_key_by_name(&req.key_name)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(GetKeypairPublicKeyByNameResponse { public_key }))
    }

    async fn delete_keypair(
        &self,
        request: Request<DeleteKeypairRequest>,
    ) -> Result<Response<DeleteKeypairResponse>, Status> {
        let req = request.into_inner();
        self.openstack
            .delete_keypair(&req.key_name)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(DeleteKeypairResponse {}))
    }

    // Playbooks / Forc

    async fn create_and_deploy_playbook(
        &self,
        request: Request<CreateAndDeployPlaybookRequest>,
    ) -> Result<Response<CreateAndDeployPlaybookResponse>, Status> {
        let req = request.into_inner();
        let (ssh_port, _) = self
            .openstack
            .get_vm_ports(&req.openstack_id)
            .await
            .map_err(Status::from)?;

        // The deployment opens an SSH session straight away; without a
        // reachable port there is nothing to deploy to.
        let gateway = self.openstack.gateway_ip().to_string();
        if !self.openstack.netcat(&gateway, ssh_port).await {
            return Err(Status::failed_precondition(format!(
                "VM {} is not reachable on port {ssh_port}",
                req.openstack_id
            )));
        }

        let ip = self.openstack.playbook_gateway_ip().to_string();
        let cloud_site = self.openstack.cloud_site().to_string();
        let status = self
            .forc
            .create_and_deploy_playbook(
                &req.openstack_id,
                &req.public_key,
                &req.research_environment_template,
                req.create_only_backend,
                req.conda_packages,
                req.apt_packages,
                &ip,
                ssh_port,
                &cloud_site,
                &req.base_url,
            )
            .await
            .map_err(Status::from)?;
        Ok(Response::new(CreateAndDeployPlaybookResponse { status }))
    }

    async fn get_playbook_logs(
        &self,
        request: Request<GetPlaybookLogsRequest>,
    ) -> Result<Response<PlaybookResult>, Status> {
        let req = request.into_inner();
        let result = self
            .forc
            .get_playbook_logs(&req.openstack_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(result))
    }

    async fn has_forc(&self, _request: Request<HasForcRequest>) -> Result<Response<HasForcResponse>, Status> {
        Ok(Response::new(HasForcResponse {
            has_forc: self.forc.has_forc(),
        }))
    }

    async fn get_forc_access_url(
        &self,
        _request: Request<GetForcAccessUrlRequest>,
    ) -> Result<Response<GetForcAccessUrlResponse>, Status> {
        Ok(Response::new(GetForcAccessUrlResponse {
            url: self.forc.forc_access_url(),
        }))
    }

    async fn get_forc_backend_url(
        &self,
        _request: Request<GetForcBackendUrlRequest>,
    ) -> Result<Response<GetForcBackendUrlResponse>, Status> {
        Ok(Response::new(GetForcBackendUrlResponse {
            url: self.forc.forc_backend_url(),
        }))
    }

    async fn get_allowed_templates(
        &self,
        _request: Request<GetAllowedTemplatesRequest>,
    ) -> Result<Response<ResearchEnvironmentTemplateList>, Status> {
        Ok(Response::new(ResearchEnvironmentTemplateList {
            templates: self.forc.template.get_allowed_templates(),
        }))
    }

    async fn create_backend(
        &self,
        request: Request<CreateBackendRequest>,
    ) -> Result<Response<Backend>, Status> {
        let req = request.into_inner();
        let backend = self
            .forc
            .create_backend(&req.owner, &req.user_key_url, &req.template, &req.upstream_url)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(backend))
    }

    async fn get_backends(
        &self,
        _request: Request<GetBackendsRequest>,
    ) -> Result<Response<BackendList>, Status> {
        let client = self.forc.client().map_err(Status::from)?;
        let backends = client.get_backends().await.map_err(Status::from)?;
        Ok(Response::new(BackendList { backends }))
    }

    async fn get_backend_by_id(
        &self,
        request: Request<GetBackendByIdRequest>,
    ) -> Result<Response<Backend>, Status> {
        let req = request.into_inner();
        let client = self.forc.client().map_err(Status::from)?;
        let backend = client.get_backend_by_id(req.id).await.map_err(Status::from)?;
        Ok(Response::new(backend))
    }

    async fn get_backends_by_owner(
        &self,
        request: Request<GetBackendsByOwnerRequest>,
    ) -> Result<Response<BackendList>, Status> {
        let req = request.into_inner();
        let client = self.forc.client().map_err(Status::from)?;
        let backends = client
            .get_backends_by_owner(&req.owner)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(BackendList { backends }))
    }

    async fn get_backends_by_template(
        &self,
        request: Request<GetBackendsByTemplateRequest>,
    ) -> Result<Response<BackendList>, Status> {
        let req = request.into_inner();
        let client = self.forc.client().map_err(Status::from)?;
        let backends = client
            .get_backends_by_template(&req.template)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(BackendList { backends }))
    }

    async fn delete_backend(
        &self,
        request: Request<DeleteBackendRequest>,
    ) -> Result<Response<DeleteBackendResponse>, Status> {
        let req = request.into_inner();
        let client = self.forc.client().map_err(Status::from)?;
        client.delete_backend(req.id).await.map_err(Status::from)?;
        Ok(Response::new(DeleteBackendResponse {}))
    }

    async fn add_user_to_backend(
        &self,
        request: Request<BackendUserRequest>,
    ) -> Result<Response<BackendUserResponse>, Status> {
        let req = request.into_inner();
        let client = self.forc.client().map_err(Status::from)?;
        let data = client
            .add_user_to_backend(req.backend_id, &req.user_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(BackendUserResponse { data }))
    }

    async fn get_users_from_backend(
        &self,
        request: Request<GetUsersFromBackendRequest>,
    ) -> Result<Response<GetUsersFromBackendResponse>, Status> {
        let req = request.into_inner();
        let client = self.forc.client().map_err(Status::from)?;
        let users = client
            .get_users_from_backend(req.backend_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(GetUsersFromBackendResponse { users }))
    }

    async fn delete_user_from_backend(
        &self,
        request: Request<BackendUserRequest>,
    ) -> Result<Response<BackendUserResponse>, Status> {
        let req = request.into_inner();
        let client = self.forc.client().map_err(Status::from)?;
        let data = client
            .delete_user_from_backend(req.backend_id, &req.user_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(BackendUserResponse { data }))
    }

    // Clusters

    async fn is_bibigrid_available(
        &self,
        _request: Request<IsBibigridAvailableRequest>,
    ) -> Result<Response<IsBibigridAvailableResponse>, Status> {
        Ok(Response::new(IsBibigridAvailableResponse {
            available: self.bibigrid.is_available().await,
        }))
    }

    async fn get_cluster_supported_ubuntu_os_versions(
        &self,
        _request: Request<GetClusterSupportedUbuntuOsVersionsRequest>,
    ) -> Result<Response<GetClusterSupportedUbuntuOsVersionsResponse>, Status> {
        let os_versions = self
            .bibigrid
            .get_cluster_supported_ubuntu_os_versions()
            .await
            .map_err(Status::from)?;
        Ok(Response::new(GetClusterSupportedUbuntuOsVersionsResponse {
            os_versions,
        }))
    }

    async fn get_cluster_info(
        &self,
        request: Request<GetClusterInfoRequest>,
    ) -> Result<Response<ClusterInfo>, Status> {
        let req = request.into_inner();
        let info = self
            .bibigrid
            .get_cluster_info(&req.cluster_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(info))
    }

    async fn get_cluster_log(
        &self,
        request: Request<GetClusterLogRequest>,
    ) -> Result<Response<ClusterLog>, Status> {
        let req = request.into_inner();
        let log = self
            .bibigrid
            .get_cluster_log(&req.cluster_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(log))
    }

    async fn get_cluster_state(
        &self,
        request: Request<GetClusterStateRequest>,
    ) -> Result<Response<ClusterState>, Status> {
        let req = request.into_inner();
        let state = self
            .bibigrid
            .get_cluster_state(&req.cluster_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(state))
    }

    async fn start_cluster(
        &self,
        request: Request<StartClusterRequest>,
    ) -> Result<Response<ClusterMessage>, Status> {
        let req = request.into_inner();
        let master = req
            .master_instance
            .ok_or_else(|| Status::invalid_argument("master_instance is required"))?;
        let metadata = req.metadata.unwrap_or_default();
        let message = self
            .bibigrid
            .start_cluster(
                &req.public_keys,
                &master,
                &req.worker_instances,
                &metadata,
                req.shared_volume.as_ref(),
            )
            .await
            .map_err(Status::from)?;
        Ok(Response::new(message))
    }

    async fn terminate_cluster(
        &self,
        request: Request<TerminateClusterRequest>,
    ) -> Result<Response<ClusterMessage>, Status> {
        let req = request.into_inner();
        let message = self
            .bibigrid
            .terminate_cluster(&req.cluster_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(message))
    }

    async fn add_cluster_machine(
        &self,
        request: Request<AddClusterMachineRequest>,
    ) -> Result<Response<AddClusterMachineResponse>, Status> {
        let req = request.into_inner();
        let server_id = self
            .openstack
            .add_cluster_machine(
                &req.cluster_id,
                &req.cluster_user,
                &req.cluster_group_ids,
                &req.image_name,
                &req.flavor_name,
                &req.name,
                &req.key_name,
                req.batch_idx,
                req.worker_idx,
            )
            .await
            .map_err(Status::from)?;
        Ok(Response::new(AddClusterMachineResponse { server_id }))
    }

    // Metadata sidecar

    async fn is_metadata_server_available(
        &self,
        _request: Request<IsMetadataServerAvailableRequest>,
    ) -> Result<Response<IsMetadataServerAvailableResponse>, Status> {
        Ok(Response::new(IsMetadataServerAvailableResponse {
            available: self.metadata.is_available().await,
        }))
    }

    async fn set_metadata_server_data(
        &self,
        request: Request<SetMetadataServerDataRequest>,
    ) -> Result<Response<SetMetadataServerDataResponse>, Status> {
        let req = request.into_inner();
        let metadata = req.metadata.unwrap_or_default();
        self.metadata
            .set_metadata(&req.ip, &metadata)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(SetMetadataServerDataResponse {}))
    }

    async fn remove_metadata_server_data(
        &self,
        request: Request<RemoveMetadataServerDataRequest>,
    ) -> Result<Response<RemoveMetadataServerDataResponse>, Status> {
        let req = request.into_inner();
        self.metadata
            .remove_metadata(&req.ip)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(RemoveMetadataServerDataResponse {}))
    }

    // Misc

    async fn get_gateway_ip(
        &self,
        _request: Request<GetGatewayIpRequest>,
    ) -> Result<Response<GetGatewayIpResponse>, Status> {
        Ok(Response::new(GetGatewayIpResponse {
            gateway_ip: self.openstack.gateway_ip().to_string(),
        }))
    }

    async fn get_calculation_values(
        &self,
        _request: Request<GetCalculationValuesRequest>,
    ) -> Result<Response<GetCalculationValuesResponse>, Status> {
        let calculator = self.openstack.port_calculator();
        Ok(Response::new(GetCalculationValuesResponse {
            ssh_port_calculation: calculator.ssh_expression().to_string(),
            udp_port_calculation: calculator.udp_expression().to_string(),
        }))
    }

    async fn get_limits(&self, _request: Request<GetLimitsRequest>) -> Result<Response<Limits>, Status> {
        let limits = self.openstack.get_limits().await.map_err(Status::from)?;
        Ok(Response::new(limits))
    }
}
