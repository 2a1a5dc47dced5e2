//! Typed views of the cloud resources the control plane touches.
//!
//! The backend client returns these structs instead of raw JSON, and the
//! facade converts them into wire messages with the `to_proto` adapters.

use std::collections::HashMap;

use crate::proto;

pub mod vm_states {
    pub const ACTIVE: &str = "active";
    pub const NOT_FOUND: &str = "not_found";
}

pub mod task_states {
    pub const PREPARE_PLAYBOOK_BUILD: &str = "prepare_playbook_build";
    pub const BUILD_PLAYBOOK: &str = "building_playbook";
    pub const PLAYBOOK_SUCCESSFUL: &str = "playbook_successful";
    pub const PLAYBOOK_FAILED: &str = "playbook_failed";
    pub const CHECKING_SSH_CONNECTION: &str = "checking_ssh_connection";

    /// While one of these is set the server must not be deleted.
    pub const IMAGE_SNAPSHOT_STATES: [&str; 3] =
        ["image_snapshot", "image_pending_upload", "image_uploading"];
}

#[derive(Debug, Clone, Default)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub status: String,
    pub visibility: String,
    pub min_disk: u64,
    pub min_ram: u64,
    pub created_at: String,
    pub tags: Vec<String>,
    pub os_version: Option<String>,
    pub os_distro: Option<String>,
    pub slurm_version: Option<String>,
    pub base_image_ref: Option<String>,
    pub description: Option<String>,
}

impl Image {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn to_proto(&self) -> proto::Image {
        proto::Image {
            openstack_id: self.id.clone(),
            name: self.name.clone(),
            min_disk: self.min_disk,
            min_ram: self.min_ram,
            status: self.status.clone(),
            created_at: self.created_at.clone(),
            tags: self.tags.clone(),
            os_version: self.os_version.clone().unwrap_or_default(),
            os_distro: self.os_distro.clone().unwrap_or_default(),
            description: self.description.clone().unwrap_or_default(),
            slurm_version: self.slurm_version.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Flavor {
    pub id: String,
    pub name: String,
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
    pub ephemeral_gb: u64,
    pub description: Option<String>,
}

impl Flavor {
    pub fn to_proto(&self) -> proto::Flavor {
        proto::Flavor {
            openstack_id: self.id.clone(),
            name: self.name.clone(),
            vcpus: self.vcpus,
            ram_mb: self.ram_mb,
            disk_gb: self.disk_gb,
            ephemeral_disk_gb: self.ephemeral_gb,
            description: self.description.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VolumeAttachment {
    pub server_id: String,
    pub device: String,
}

#[derive(Debug, Clone, Default)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub size_gb: u64,
    pub created_at: String,
    pub metadata: HashMap<String, String>,
    pub attachments: Vec<VolumeAttachment>,
}

impl Volume {
    pub fn to_proto(&self) -> proto::Volume {
        let attachment = self.attachments.first();
        proto::Volume {
            openstack_id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone().unwrap_or_default(),
            status: self.status.clone(),
            size_gb: self.size_gb,
            created_at: self.created_at.clone(),
            device: attachment.map(|a| a.device.clone()).unwrap_or_default(),
            server_id: attachment.map(|a| a.server_id.clone()).unwrap_or_default(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VolumeSnapshot {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub size_gb: u64,
    pub created_at: String,
    pub volume_id: String,
}

impl VolumeSnapshot {
    pub fn to_proto(&self) -> proto::VolumeSnapshot {
        proto::VolumeSnapshot {
            openstack_id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone().unwrap_or_default(),
            status: self.status.clone(),
            size_gb: self.size_gb,
            created_at: self.created_at.clone(),
            volume_id: self.volume_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub flavor_id: String,
    pub image_id: Option<String>,
    pub vm_state: String,
    pub task_state: Option<String>,
    pub created_at: String,
    pub private_v4: Option<String>,
    pub floating_v4: Option<String>,
    pub project_id: String,
    pub key_name: Option<String>,
    pub metadata: HashMap<String, String>,
    pub security_group_names: Vec<String>,
}

impl Server {
    /// A placeholder for polling callers: the VM does not (or no longer)
    /// exist on the backend.
    pub fn not_found(openstack_id: &str) -> Self {
        Self {
            id: openstack_id.to_string(),
            vm_state: vm_states::NOT_FOUND.to_string(),
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.vm_state == vm_states::ACTIVE
    }

    pub fn to_proto(&self, image: Option<proto::Image>, flavor: Option<proto::Flavor>) -> proto::Vm {
        proto::Vm {
            openstack_id: self.id.clone(),
            name: self.name.clone(),
            flavor,
            image,
            vm_state: self.vm_state.clone(),
            task_state: self.task_state.clone().unwrap_or_default(),
            created_at: self.created_at.clone(),
            fixed_ip: self.private_v4.clone().unwrap_or_default(),
            floating_ip: self.floating_v4.clone().unwrap_or_default(),
            project_id: self.project_id.clone(),
            keypair_name: self.key_name.clone().unwrap_or_default(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Keypair {
    pub name: String,
    pub public_key: String,
    /// Only present directly after a backend-side generation.
    pub private_key: Option<String>,
}

impl Keypair {
    pub fn to_proto(&self) -> proto::Keypair {
        proto::Keypair {
            name: self.name.clone(),
            public_key: self.public_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Network {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// Parameters of a new security group rule.
#[derive(Debug, Clone, Default)]
pub struct NewRule {
    pub security_group_id: String,
    pub direction: String,
    pub ethertype: String,
    pub protocol: Option<String>,
    pub port_range_min: Option<u32>,
    pub port_range_max: Option<u32>,
    pub remote_group_id: Option<String>,
}

impl NewRule {
    pub fn ingress(security_group_id: &str) -> Self {
        Self {
            security_group_id: security_group_id.to_string(),
            direction: "ingress".to_string(),
            ethertype: "IPv4".to_string(),
            ..Default::default()
        }
    }

    pub fn ethertype(mut self, ethertype: &str) -> Self {
        self.ethertype = ethertype.to_string();
        self
    }

    pub fn protocol(mut self, protocol: &str) -> Self {
        self.protocol = Some(protocol.to_string());
        self
    }

    pub fn port(mut self, port: u32) -> Self {
        self.port_range_min = Some(port);
        self.port_range_max = Some(port);
        self
    }

    pub fn port_range(mut self, min: u32, max: u32) -> Self {
        self.port_range_min = Some(min);
        self.port_range_max = Some(max);
        self
    }

    pub fn remote_group(mut self, group_id: &str) -> Self {
        self.remote_group_id = Some(group_id.to_string());
        self
    }
}

/// Parameters of a new server.
#[derive(Debug, Clone, Default)]
pub struct NewServer {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
    pub network_id: String,
    pub key_name: Option<String>,
    pub metadata: HashMap<String, String>,
    pub security_groups: Vec<String>,
    pub userdata: Vec<u8>,
    pub volume_ids: Vec<String>,
}

/// Parameters of a new volume; exactly one of `size_gb`, `source_volume_id`
/// or `snapshot_id` drives the creation mode.
#[derive(Debug, Clone, Default)]
pub struct NewVolume {
    pub name: String,
    pub size_gb: Option<u64>,
    pub metadata: HashMap<String, String>,
    pub source_volume_id: Option<String>,
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum ServerAction<'a> {
    Start,
    Stop,
    RebootSoft,
    RebootHard,
    Rescue {
        admin_pass: Option<&'a str>,
        image_ref: Option<&'a str>,
    },
    Unrescue,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ComputeLimits {
    pub max_total_cores: i64,
    pub max_total_instances: i64,
    pub max_total_ram_mb: i64,
    pub total_cores_used: i64,
    pub total_instances_used: i64,
    pub total_ram_used_mb: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeLimits {
    pub max_total_volumes: i64,
    pub max_total_volume_gigabytes: i64,
    pub total_volumes_used: i64,
    pub total_gigabytes_used: i64,
}

fn mb_to_gb_ceil(mb: i64) -> i64 {
    (mb + 1023) / 1024
}

pub fn limits_to_proto(compute: ComputeLimits, volume: VolumeLimits) -> proto::Limits {
    proto::Limits {
        cores_limit: compute.max_total_cores.to_string(),
        vms_limit: compute.max_total_instances.to_string(),
        ram_limit: mb_to_gb_ceil(compute.max_total_ram_mb).to_string(),
        current_used_cores: compute.total_cores_used.to_string(),
        current_used_vms: compute.total_instances_used.to_string(),
        current_used_ram: mb_to_gb_ceil(compute.total_ram_used_mb).to_string(),
        volume_counter_limit: volume.max_total_volumes.to_string(),
        volume_storage_limit: volume.max_total_volume_gigabytes.to_string(),
        current_used_volumes: volume.total_volumes_used.to_string(),
        current_used_volume_storage: volume.total_gigabytes_used.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_ram_rounds_up_to_gb() {
        let compute = ComputeLimits {
            max_total_cores: 100,
            max_total_instances: 50,
            max_total_ram_mb: 1025,
            total_cores_used: 3,
            total_instances_used: 2,
            total_ram_used_mb: 2048,
        };
        let limits = limits_to_proto(compute, VolumeLimits::default());
        assert_eq!(limits.ram_limit, "2");
        assert_eq!(limits.current_used_ram, "2");
        assert_eq!(limits.cores_limit, "100");
    }

    #[test]
    fn test_not_found_server_placeholder() {
        let server = Server::not_found("abc-123");
        assert_eq!(server.id, "abc-123");
        assert_eq!(server.vm_state, vm_states::NOT_FOUND);
        assert!(!server.is_active());
    }

    #[test]
    fn test_volume_proto_carries_first_attachment() {
        let volume = Volume {
            id: "v1".into(),
            attachments: vec![VolumeAttachment {
                server_id: "s1".into(),
                device: "/dev/vdb".into(),
            }],
            ..Default::default()
        };
        let proto = volume.to_proto();
        assert_eq!(proto.server_id, "s1");
        assert_eq!(proto.device, "/dev/vdb");

        let detached = Volume::default().to_proto();
        assert!(detached.server_id.is_empty());
    }
}
