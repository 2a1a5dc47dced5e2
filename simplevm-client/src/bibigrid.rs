//! HTTP client for the Bibigrid cluster provisioner.
//!
//! Only the current Bibigrid API shape is spoken here: path-parameter GETs
//! for state/info/log and a list-wrapped configuration POST for create.

use serde_json::{Value, json};
use tracing::info;

use crate::config::BibigridSettings;
use crate::error::{ClientError, Result};
use crate::proto;

pub struct BibigridConnector {
    settings: Option<BibigridSettings>,
    http: reqwest::Client,
    endpoint: String,
    gateway_ip: String,
    /// The ssh port expression, forwarded verbatim as Bibigrid's portFunction.
    port_function: String,
}

impl BibigridConnector {
    pub fn new(
        settings: Option<BibigridSettings>,
        gateway_ip: String,
        port_function: String,
        verify_tls: bool,
    ) -> Result<Self> {
        let settings = settings.filter(|s| s.activated);
        let endpoint = match &settings {
            Some(settings) => settings.endpoint(),
            None => {
                info!("Bibigrid configuration not found or deactivated, subsystem inert");
                String::new()
            }
        };
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;
        Ok(Self {
            settings,
            http,
            endpoint,
            gateway_ip,
            port_function,
        })
    }

    fn settings(&self) -> Result<&BibigridSettings> {
        self.settings
            .as_ref()
            .ok_or_else(|| ClientError::Config("Bibigrid is not configured".into()))
    }

    async fn requirements(&self) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}/bibigrid/requirements", self.endpoint))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ClientError::Internal(format!(
                "Bibigrid requirements returned {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    pub async fn is_available(&self) -> bool {
        if self.settings.is_none() {
            return false;
        }
        match self.requirements().await {
            Ok(_) => true,
            Err(e) => {
                info!(error = %e, "Bibigrid not available");
                false
            }
        }
    }

    pub async fn get_cluster_supported_ubuntu_os_versions(&self) -> Result<Vec<String>> {
        self.settings()?;
        let body = self.requirements().await?;
        Ok(
            body["cloud_node_requirements"]["os_distro"]["ubuntu"]["os_versions"]
                .as_array()
                .map(|versions| {
                    versions
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        )
    }

    pub async fn get_cluster_state(&self, cluster_id: &str) -> Result<proto::ClusterState> {
        self.settings()?;
        info!(cluster_id = %cluster_id, "Get cluster state");
        let resp = self
            .http
            .get(format!("{}/bibigrid/state/{cluster_id}", self.endpoint))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ClientError::ClusterNotFound(cluster_id.to_string()));
        }
        let body: Value = resp.json().await?;
        Ok(proto::ClusterState {
            cluster_id: cluster_id.to_string(),
            state: body["state"].as_str().unwrap_or_default().to_string(),
            message: body["message"].as_str().unwrap_or_default().to_string(),
        })
    }

    pub async fn get_cluster_info(&self, cluster_id: &str) -> Result<proto::ClusterInfo> {
        self.settings()?;
        info!(cluster_id = %cluster_id, "Get cluster info");
        let resp = self
            .http
            .get(format!("{}/bibigrid/info/{cluster_id}", self.endpoint))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ClientError::ClusterNotFound(cluster_id.to_string()));
        }
        let body: Value = resp.json().await?;
        Ok(proto::ClusterInfo {
            cluster_id: cluster_id.to_string(),
            message: body["message"].as_str().unwrap_or_default().to_string(),
            ready: body["ready"].as_bool().unwrap_or(false),
        })
    }

    pub async fn get_cluster_log(&self, cluster_id: &str) -> Result<proto::ClusterLog> {
        self.settings()?;
        info!(cluster_id = %cluster_id, "Get cluster log");
        let resp = self
            .http
            .get(format!("{}/bibigrid/log/{cluster_id}", self.endpoint))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ClientError::ClusterNotFound(cluster_id.to_string()));
        }
        let body: Value = resp.json().await?;
        Ok(proto::ClusterLog {
            cluster_id: cluster_id.to_string(),
            message: body["message"].as_str().unwrap_or_default().to_string(),
            log: body["log"].as_str().unwrap_or_default().to_string(),
        })
    }

    fn volume_json(volume: &proto::ClusterVolume) -> Value {
        json!({
            "openstackId": volume.openstack_id,
            "size": volume.size_gb,
            "mountPoint": volume.mount_path,
        })
    }

    pub async fn start_cluster(
        &self,
        public_keys: &[String],
        master_instance: &proto::ClusterInstance,
        worker_instances: &[proto::ClusterWorker],
        metadata: &proto::ClusterInstanceMetadata,
        shared_volume: Option<&proto::ClusterVolume>,
    ) -> Result<proto::ClusterMessage> {
        let settings = self.settings()?;
        info!(master = ?master_instance, workers = ?worker_instances, "Start cluster");

        let workers: Vec<Value> = worker_instances
            .iter()
            .map(|worker| {
                json!({
                    "type": worker.r#type,
                    "image": worker.image,
                    "count": worker.count,
                    "onDemand": false,
                    "volumes": worker.volumes.iter().map(Self::volume_json).collect::<Vec<_>>(),
                })
            })
            .collect();

        let mut configuration = json!({
            "infrastructure": "openstack",
            "cloud": "openstack",
            "sshTimeout": 10,
            "useMasterAsCompute": false,
            "useMasterWithPublicIP": settings.use_master_with_public_ip,
            "dontUploadCredentials": true,
            "localDnsLookup": settings.local_dns_lookup,
            "gateway": {
                "ip": self.gateway_ip,
                "portFunction": self.port_function,
            },
            "masterInstance": {
                "type": master_instance.r#type,
                "image": master_instance.image,
                "volumes": master_instance.volumes.iter().map(Self::volume_json).collect::<Vec<_>>(),
            },
            "workerInstances": workers,
            "sshUser": "ubuntu",
            "subnet": settings.sub_network,
            "sshPublicKeys": public_keys,
            "modes": settings.modes,
            "ansibleGalaxyRoles": settings.ansible_galaxy_roles,
            "user": metadata.user,
            "project": {
                "name": metadata.project_name,
                "id": metadata.project_id,
            },
        });
        if let Some(shared) = shared_volume {
            configuration["sharedVolume"] = Self::volume_json(shared);
        }

        let body = json!({"configurations": [configuration]});
        let resp = self
            .http
            .post(format!("{}/bibigrid/create", self.endpoint))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ClientError::Internal(format!(
                "Bibigrid create failed: {status} {text}"
            )));
        }
        let data: Value = resp.json().await?;
        info!(response = ?data, "Cluster creation submitted");
        Ok(proto::ClusterMessage {
            cluster_id: data["cluster_id"].as_str().unwrap_or_default().to_string(),
            message: data["message"].as_str().unwrap_or_default().to_string(),
        })
    }

    pub async fn terminate_cluster(&self, cluster_id: &str) -> Result<proto::ClusterMessage> {
        self.settings()?;
        info!(cluster_id = %cluster_id, "Terminate cluster");
        let resp = self
            .http
            .delete(format!("{}/bibigrid/terminate/{cluster_id}", self.endpoint))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ClientError::ClusterNotFound(cluster_id.to_string()));
        }
        let data: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(proto::ClusterMessage {
            cluster_id: cluster_id.to_string(),
            message: data["message"].as_str().unwrap_or_default().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(server: &mockito::ServerGuard) -> BibigridSettings {
        let url = server.url();
        let without_scheme = url.trim_start_matches("http://");
        let (host, port) = without_scheme.split_once(':').unwrap();
        BibigridSettings {
            activated: true,
            host: host.to_string(),
            port: port.parse().unwrap(),
            https: false,
            modes: vec!["slurm".to_string()],
            sub_network: "portalexternalsubnetwork".to_string(),
            use_master_with_public_ip: false,
            local_dns_lookup: false,
            ansible_galaxy_roles: vec![],
        }
    }

    fn connector(server: &mockito::ServerGuard) -> BibigridConnector {
        BibigridConnector::new(
            Some(settings(server)),
            "129.70.51.75".to_string(),
            "30000 + x + y * 256".to_string(),
            true,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_availability_and_os_versions_from_requirements() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/bibigrid/requirements")
            .with_status(200)
            .with_body(
                r#"{"cloud_node_requirements":
                    {"os_distro": {"ubuntu": {"os_versions": ["20.04", "22.04"]}}}}"#,
            )
            .expect(2)
            .create_async()
            .await;

        let connector = connector(&server);
        assert!(connector.is_available().await);
        let versions = connector
            .get_cluster_supported_ubuntu_os_versions()
            .await
            .unwrap();
        assert_eq!(versions, vec!["20.04", "22.04"]);
    }

    #[tokio::test]
    async fn test_inert_without_configuration() {
        let connector = BibigridConnector::new(
            None,
            "129.70.51.75".to_string(),
            "30000 + x".to_string(),
            true,
        )
        .unwrap();
        assert!(!connector.is_available().await);
        assert!(connector.get_cluster_state("abc").await.is_err());
    }

    #[tokio::test]
    async fn test_cluster_state_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/bibigrid/state/gone")
            .with_status(404)
            .create_async()
            .await;

        let err = connector(&server).get_cluster_state("gone").await.unwrap_err();
        assert!(matches!(err, ClientError::ClusterNotFound(_)));
    }

    #[tokio::test]
    async fn test_start_cluster_posts_list_wrapped_configuration() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/bibigrid/create")
            .match_body(mockito::Matcher::PartialJson(json!({
                "configurations": [{
                    "infrastructure": "openstack",
                    "gateway": {
                        "ip": "129.70.51.75",
                        "portFunction": "30000 + x + y * 256"
                    },
                    "masterInstance": {"type": "m1.large", "image": "ubuntu-22.04"},
                    "workerInstances": [{"type": "m1.small", "image": "ubuntu-22.04", "count": 3}],
                    "subnet": "portalexternalsubnetwork"
                }]
            })))
            .with_status(200)
            .with_body(r#"{"cluster_id": "xyz123", "message": "started"}"#)
            .create_async()
            .await;

        let master = proto::ClusterInstance {
            r#type: "m1.large".to_string(),
            image: "ubuntu-22.04".to_string(),
            volumes: vec![],
        };
        let workers = vec![proto::ClusterWorker {
            r#type: "m1.small".to_string(),
            image: "ubuntu-22.04".to_string(),
            count: 3,
            volumes: vec![],
        }];
        let metadata = proto::ClusterInstanceMetadata {
            user: "alice".to_string(),
            project_name: "proj".to_string(),
            project_id: "p1".to_string(),
        };

        let message = connector(&server)
            .start_cluster(
                &["ssh-rsa AAA".to_string()],
                &master,
                &workers,
                &metadata,
                None,
            )
            .await
            .unwrap();
        assert_eq!(message.cluster_id, "xyz123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_terminate_cluster() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/bibigrid/terminate/xyz123")
            .with_status(200)
            .with_body(r#"{"message": "terminating"}"#)
            .create_async()
            .await;

        let message = connector(&server).terminate_cluster("xyz123").await.unwrap();
        assert_eq!(message.cluster_id, "xyz123");
        assert_eq!(message.message, "terminating");
    }
}
