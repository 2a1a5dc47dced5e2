//! Volume and volume snapshot operations.
//!
//! Lookups raise for missing volumes (unlike `get_server`, which returns a
//! placeholder); the portal polls volumes through their status field instead.

use std::collections::HashMap;

use tracing::info;

use crate::error::{ClientError, Result};
use crate::openstack::OpenStackConnector;
use crate::openstack::api::CloudApi;
use crate::openstack::types::{NewVolume, Volume, VolumeSnapshot};

impl OpenStackConnector {
    pub async fn get_volume(&self, name_or_id: &str) -> Result<Volume> {
        info!(volume = %name_or_id, "Get volume");
        self.api
            .find_volume(name_or_id)
            .await?
            .ok_or_else(|| ClientError::VolumeNotFound(name_or_id.to_string()))
    }

    pub async fn get_volumes_by_ids(&self, volume_ids: &[String]) -> Result<Vec<Volume>> {
        let mut volumes = Vec::with_capacity(volume_ids.len());
        for id in volume_ids {
            volumes.push(self.get_volume(id).await?);
        }
        Ok(volumes)
    }

    pub async fn create_volume(
        &self,
        volume_name: &str,
        volume_storage_gb: u64,
        metadata: HashMap<String, String>,
    ) -> Result<Volume> {
        info!(name = %volume_name, size_gb = volume_storage_gb, "Creating volume");
        self.api
            .create_volume(NewVolume {
                name: volume_name.to_string(),
                size_gb: Some(volume_storage_gb),
                metadata,
                ..Default::default()
            })
            .await
    }

    pub async fn create_volume_by_source_volume(
        &self,
        volume_name: &str,
        metadata: HashMap<String, String>,
        source_volume_id: &str,
    ) -> Result<Volume> {
        info!(source = %source_volume_id, "Creating volume from source volume");
        self.api
            .create_volume(NewVolume {
                name: volume_name.to_string(),
                metadata,
                source_volume_id: Some(source_volume_id.to_string()),
                ..Default::default()
            })
            .await
    }

    pub async fn create_volume_by_volume_snap(
        &self,
        volume_name: &str,
        metadata: HashMap<String, String>,
        volume_snap_id: &str,
    ) -> Result<Volume> {
        info!(snapshot = %volume_snap_id, "Creating volume from volume snapshot");
        self.api
            .create_volume(NewVolume {
                name: volume_name.to_string(),
                metadata,
                snapshot_id: Some(volume_snap_id.to_string()),
                ..Default::default()
            })
            .await
    }

    pub async fn resize_volume(&self, volume_id: &str, size_gb: u64) -> Result<()> {
        info!(volume = %volume_id, size_gb = size_gb, "Extend volume");
        self.api.extend_volume(volume_id, size_gb).await
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        info!(volume = %volume_id, "Delete volume");
        self.api.delete_volume(volume_id).await
    }

    pub async fn attach_volume_to_server(
        &self,
        openstack_id: &str,
        volume_id: &str,
    ) -> Result<String> {
        // Fail with the precise kind before asking the backend to attach.
        if self.api.get_server(openstack_id).await?.is_none() {
            return Err(ClientError::ServerNotFound(openstack_id.to_string()));
        }
        let volume = self.get_volume(volume_id).await?;
        info!(volume = %volume.id, openstack_id = %openstack_id, "Attaching volume");
        self.api.attach_volume(openstack_id, &volume.id).await
    }

    pub async fn detach_volume(&self, volume_id: &str, server_id: &str) -> Result<()> {
        let volume = self.get_volume(volume_id).await?;
        if self.api.get_server(server_id).await?.is_none() {
            return Err(ClientError::ServerNotFound(server_id.to_string()));
        }
        info!(volume = %volume.id, openstack_id = %server_id, "Detaching volume");
        self.api.detach_volume(server_id, &volume.id).await
    }

    pub async fn create_volume_snapshot(
        &self,
        volume_id: &str,
        name: &str,
        description: &str,
    ) -> Result<String> {
        info!(volume = %volume_id, name = %name, "Create volume snapshot");
        self.api
            .create_volume_snapshot(volume_id, name, description)
            .await
    }

    pub async fn get_volume_snapshot(&self, name_or_id: &str) -> Result<VolumeSnapshot> {
        info!(snapshot = %name_or_id, "Get volume snapshot");
        self.api
            .find_volume_snapshot(name_or_id)
            .await?
            .ok_or_else(|| ClientError::SnapshotNotFound(name_or_id.to_string()))
    }

    pub async fn delete_volume_snapshot(&self, snapshot_id: &str) -> Result<()> {
        info!(snapshot = %snapshot_id, "Delete volume snapshot");
        self.api.delete_volume_snapshot(snapshot_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::OpenStackSettings;
    use crate::openstack::mock::MockCloud;
    use crate::openstack::types::Server;

    fn settings() -> OpenStackSettings {
        OpenStackSettings {
            gateway_ip: "127.0.0.1".to_string(),
            internal_gateway_ip: None,
            network: "net".to_string(),
            cloud_site: "bielefeld".to_string(),
            ssh_port_calculation: "30000 + x + y * 256".to_string(),
            udp_port_calculation: "30000 + x + y * 256".to_string(),
            gateway_security_group_id: "gw".to_string(),
            forc_security_group_id: None,
            compute_api_version: None,
        }
    }

    fn connector(mock: MockCloud) -> (Arc<MockCloud>, OpenStackConnector) {
        let api = Arc::new(mock);
        (api.clone(), OpenStackConnector::new(api, settings()).unwrap())
    }

    #[tokio::test]
    async fn test_attach_and_detach_roundtrip() {
        let server = Server {
            id: "vm-1".to_string(),
            vm_state: "active".to_string(),
            ..Default::default()
        };
        let (_, connector) = connector(MockCloud::default().with_server(server));

        let volume = connector
            .create_volume("vol-1", 10, HashMap::new())
            .await
            .unwrap();
        let device = connector
            .attach_volume_to_server("vm-1", &volume.id)
            .await
            .unwrap();
        assert_eq!(device, "/dev/vdb");

        let attached = connector.get_volume(&volume.id).await.unwrap();
        assert_eq!(attached.attachments[0].server_id, "vm-1");

        connector.detach_volume(&volume.id, "vm-1").await.unwrap();
        let detached = connector.get_volume(&volume.id).await.unwrap();
        assert!(detached.attachments.is_empty());
    }

    #[tokio::test]
    async fn test_get_volume_missing_raises() {
        let (_, connector) = connector(MockCloud::default());
        let err = connector.get_volume("nope").await.unwrap_err();
        assert!(matches!(err, ClientError::VolumeNotFound(_)));
    }

    #[tokio::test]
    async fn test_attach_to_missing_server_raises_server_not_found() {
        let (_, connector) = connector(MockCloud::default());
        let volume = connector
            .create_volume("vol-1", 10, HashMap::new())
            .await
            .unwrap();
        let err = connector
            .attach_volume_to_server("ghost", &volume.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ServerNotFound(_)));
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let (_, connector) = connector(MockCloud::default());
        let volume = connector
            .create_volume("vol-1", 10, HashMap::new())
            .await
            .unwrap();
        let snapshot_id = connector
            .create_volume_snapshot(&volume.id, "snap-1", "before upgrade")
            .await
            .unwrap();
        let snapshot = connector.get_volume_snapshot(&snapshot_id).await.unwrap();
        assert_eq!(snapshot.volume_id, volume.id);

        connector.delete_volume_snapshot(&snapshot_id).await.unwrap();
        let err = connector.get_volume_snapshot(&snapshot_id).await.unwrap_err();
        assert!(matches!(err, ClientError::SnapshotNotFound(_)));
    }

    #[tokio::test]
    async fn test_resize_volume() {
        let (api, connector) = connector(MockCloud::default());
        let volume = connector
            .create_volume("vol-1", 10, HashMap::new())
            .await
            .unwrap();
        connector.resize_volume(&volume.id, 20).await.unwrap();
        assert_eq!(
            api.volumes.lock().unwrap().get(&volume.id).unwrap().size_gb,
            20
        );
    }
}
