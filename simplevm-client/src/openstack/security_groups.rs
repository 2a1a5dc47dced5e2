//! Security group resolution and the cleanup policy.
//!
//! All get-or-create helpers are idempotent by semantic name:
//! `defaultSimpleVM`, `{projectName}_{projectId}`, `{vmId}`,
//! `{serverName}_udp` and the research environment's configured name.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{ClientError, Result};
use crate::forc::template::ResearchEnvironmentMetadata;
use crate::openstack::api::CloudApi;
use crate::openstack::types::{NewRule, SecurityGroup, Server};
use crate::openstack::{DEFAULT_SECURITY_GROUP_NAME, OpenStackConnector};

const SSH_PORT: u32 = 22;

impl OpenStackConnector {
    fn project_sg_name(project_name: &str, project_id: &str) -> String {
        format!("{project_name}_{project_id}")
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.project_sg_locks.lock().unwrap();
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Ingress from the gateway group on port 22, IPv4 and IPv6.
    async fn add_ssh_rules(&self, security_group_id: &str) -> Result<()> {
        for ethertype in ["IPv4", "IPv6"] {
            self.api
                .create_security_group_rule(
                    NewRule::ingress(security_group_id)
                        .ethertype(ethertype)
                        .protocol("tcp")
                        .port(SSH_PORT)
                        .remote_group(&self.settings.gateway_security_group_id),
                )
                .await?;
        }
        Ok(())
    }

    async fn add_udp_rules(&self, security_group_id: &str, udp_port: u32) -> Result<()> {
        for ethertype in ["IPv4", "IPv6"] {
            self.api
                .create_security_group_rule(
                    NewRule::ingress(security_group_id)
                        .ethertype(ethertype)
                        .protocol("udp")
                        .port(udp_port)
                        .remote_group(&self.settings.gateway_security_group_id),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn get_or_create_default_ssh_security_group(&self) -> Result<SecurityGroup> {
        if let Some(sg) = self
            .api
            .find_security_group(DEFAULT_SECURITY_GROUP_NAME)
            .await?
        {
            return Ok(sg);
        }
        info!("Default SimpleVM SSH security group not found, creating");
        let sg = self
            .api
            .create_security_group(
                DEFAULT_SECURITY_GROUP_NAME,
                "Default SSH SimpleVM Security Group",
            )
            .await?;
        self.add_ssh_rules(&sg.id).await?;
        Ok(sg)
    }

    /// Intra-project SSH. Serialized per name so two concurrent starts in the
    /// same project issue exactly one backend create.
    pub async fn get_or_create_project_security_group(
        &self,
        project_name: &str,
        project_id: &str,
    ) -> Result<SecurityGroup> {
        let name = Self::project_sg_name(project_name, project_id);
        let lock = self.lock_for(&name);
        let _guard = lock.lock().await;

        if let Some(sg) = self.api.find_security_group(&name).await? {
            return Ok(sg);
        }
        info!(security_group = %name, "Creating project security group");
        let sg = self
            .api
            .create_security_group(&name, &format!("{project_name} Security Group"))
            .await?;
        self.api
            .create_security_group_rule(
                NewRule::ingress(&sg.id)
                    .protocol("tcp")
                    .port(SSH_PORT)
                    .remote_group(&sg.id),
            )
            .await?;
        Ok(sg)
    }

    /// Per-VM group, named after the VM, no rules until ports are opened.
    pub async fn get_or_create_vm_security_group(&self, openstack_id: &str) -> Result<SecurityGroup> {
        if let Some(sg) = self.api.find_security_group(openstack_id).await? {
            return Ok(sg);
        }
        info!(openstack_id = %openstack_id, "Creating VM security group");
        self.api
            .create_security_group(openstack_id, &format!("Security group of VM {openstack_id}"))
            .await
    }

    pub async fn get_or_create_research_environment_security_group(
        &self,
        metadata: &ResearchEnvironmentMetadata,
    ) -> Result<Option<SecurityGroup>> {
        if !metadata.needs_forc_support {
            return Ok(None);
        }
        if let Some(sg) = self
            .api
            .find_security_group(&metadata.security_group_name)
            .await?
        {
            return Ok(Some(sg));
        }

        let forc_group = self.settings.forc_security_group_id.as_deref().ok_or_else(|| {
            ClientError::Config(
                "research environment requested but openstack.forc_security_group_id is unset"
                    .into(),
            )
        })?;
        info!(security_group = %metadata.security_group_name, "Creating research environment security group");
        let sg = self
            .api
            .create_security_group(&metadata.security_group_name, &metadata.name)
            .await?;
        self.api
            .create_security_group_rule(
                NewRule {
                    security_group_id: sg.id.clone(),
                    direction: metadata.direction.clone(),
                    ethertype: "IPv4".to_string(),
                    protocol: Some(metadata.protocol.clone()),
                    port_range_min: Some(metadata.port),
                    port_range_max: Some(metadata.port),
                    remote_group_id: Some(forc_group.to_string()),
                },
            )
            .await?;
        Ok(Some(sg))
    }

    pub async fn add_udp_security_group(&self, server_id: &str) -> Result<()> {
        info!(openstack_id = %server_id, "Setting up UDP security group");
        let server = self
            .api
            .get_server(server_id)
            .await?
            .ok_or_else(|| ClientError::ServerNotFound(server_id.to_string()))?;
        let sg_name = format!("{}_udp", server.name);

        if let Some(sg) = self.api.find_security_group(&sg_name).await? {
            let attached = self
                .api
                .server_security_groups(server_id)
                .await?
                .iter()
                .any(|attached| attached.name == sg.name);
            if attached {
                info!(security_group = %sg_name, "UDP security group already attached");
                return Ok(());
            }
            return self.api.add_security_group_to_server(server_id, &sg.name).await;
        }

        let (_, udp_port) = self.get_vm_ports(server_id).await?;
        let sg = self.api.create_security_group(&sg_name, "UDP").await?;
        self.add_udp_rules(&sg.id, udp_port as u32).await?;
        self.api.add_security_group_to_server(server_id, &sg.name).await
    }

    /// Opens `[range_start, range_stop]` on the per-VM group for project
    /// members. Attaches the VM and project groups on first use; every call
    /// adds a fresh rule.
    pub async fn open_port_range_for_vm_in_project(
        &self,
        range_start: u32,
        range_stop: u32,
        openstack_id: &str,
        ethertype: &str,
        protocol: &str,
    ) -> Result<String> {
        if !matches!(ethertype, "IPv4" | "IPv6") {
            return Err(ClientError::Validation(format!(
                "ethertype must be IPv4 or IPv6, got {ethertype}"
            )));
        }
        if range_start > range_stop || range_stop > u16::MAX as u32 {
            return Err(ClientError::Validation(format!(
                "invalid port range {range_start}-{range_stop}"
            )));
        }

        let server = self
            .api
            .get_server(openstack_id)
            .await?
            .ok_or_else(|| ClientError::ServerNotFound(openstack_id.to_string()))?;
        let project_name = server.metadata.get("project_name").ok_or_else(|| {
            ClientError::Validation(format!("server {openstack_id} carries no project metadata"))
        })?;
        let project_id = server.metadata.get("project_id").ok_or_else(|| {
            ClientError::Validation(format!("server {openstack_id} carries no project metadata"))
        })?;

        let vm_sg = self.get_or_create_vm_security_group(openstack_id).await?;
        let project_sg = self
            .get_or_create_project_security_group(project_name, project_id)
            .await?;

        let attached = self.api.server_security_groups(openstack_id).await?;
        for sg in [&vm_sg, &project_sg] {
            if !attached.iter().any(|a| a.name == sg.name) {
                self.api
                    .add_security_group_to_server(openstack_id, &sg.name)
                    .await?;
            }
        }

        self.api
            .create_security_group_rule(
                NewRule::ingress(&vm_sg.id)
                    .ethertype(ethertype)
                    .protocol(&protocol.to_lowercase())
                    .port_range(range_start, range_stop)
                    .remote_group(&project_sg.id),
            )
            .await
    }

    pub async fn add_research_environment_security_group(
        &self,
        server_id: &str,
        security_group_name: &str,
    ) -> Result<()> {
        let sg = self
            .api
            .find_security_group(security_group_name)
            .await?
            .ok_or_else(|| {
                ClientError::SecurityGroupNotFound(security_group_name.to_string())
            })?;
        let attached = self
            .api
            .server_security_groups(server_id)
            .await?
            .iter()
            .any(|a| a.name == sg.name);
        if attached {
            return Ok(());
        }
        self.api.add_security_group_to_server(server_id, &sg.name).await
    }

    pub async fn add_project_security_group_to_server(
        &self,
        server_id: &str,
        project_name: &str,
        project_id: &str,
    ) -> Result<()> {
        let sg = self
            .get_or_create_project_security_group(project_name, project_id)
            .await?;
        let attached = self
            .api
            .server_security_groups(server_id)
            .await?
            .iter()
            .any(|a| a.name == sg.name);
        if attached {
            return Ok(());
        }
        self.api.add_security_group_to_server(server_id, &sg.name).await
    }

    pub async fn add_default_security_groups_to_server(&self, server_id: &str) -> Result<()> {
        let server = self
            .api
            .get_server(server_id)
            .await?
            .ok_or_else(|| ClientError::ServerNotFound(server_id.to_string()))?;
        let default = self.get_or_create_default_ssh_security_group().await?;
        let attached = self.api.server_security_groups(server_id).await?;
        if !attached.iter().any(|a| a.name == default.name) {
            self.api
                .add_security_group_to_server(server_id, &default.name)
                .await?;
        }

        let project_name = server.metadata.get("project_name");
        let project_id = server.metadata.get("project_id");
        if let (Some(project_name), Some(project_id)) = (project_name, project_id) {
            self.add_project_security_group_to_server(server_id, project_name, project_id)
                .await?;
        }
        Ok(())
    }

    pub async fn remove_security_groups_from_server(&self, server_id: &str) -> Result<()> {
        let server = self
            .api
            .get_server(server_id)
            .await?
            .ok_or_else(|| ClientError::ServerNotFound(server_id.to_string()))?;
        self.detach_and_clean_security_groups(&server).await
    }

    /// Detaches every group from the server, then deletes the ones that are
    /// safe to delete: never the default group, never a Bibigrid group of a
    /// cluster master, never a group something else still references.
    pub(crate) async fn detach_and_clean_security_groups(&self, server: &Server) -> Result<()> {
        let groups = self.api.server_security_groups(&server.id).await?;
        for sg in groups {
            self.api
                .remove_security_group_from_server(&server.id, &sg.name)
                .await?;

            if sg.name == DEFAULT_SECURITY_GROUP_NAME {
                continue;
            }
            if sg.name.contains("bibigrid") && server.name.contains("master") {
                continue;
            }
            if self.api.security_group_in_use(&sg.id).await? {
                info!(security_group = %sg.name, "Security group still in use, keeping");
                continue;
            }
            if let Err(e) = self.api.delete_security_group(&sg.id).await {
                warn!(security_group = %sg.name, error = %e, "Failed to delete security group");
            }
        }
        Ok(())
    }

    pub async fn get_security_group_id_by_name(&self, name: &str) -> Result<String> {
        self.api
            .find_security_group(name)
            .await?
            .map(|sg| sg.id)
            .ok_or_else(|| ClientError::SecurityGroupNotFound(name.to_string()))
    }

    pub async fn delete_security_group_rule(&self, rule_id: &str) -> Result<()> {
        info!(rule_id = %rule_id, "Delete security group rule");
        self.api.delete_security_group_rule(rule_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::config::OpenStackSettings;
    use crate::openstack::mock::MockCloud;

    fn settings() -> OpenStackSettings {
        OpenStackSettings {
            gateway_ip: "127.0.0.1".to_string(),
            internal_gateway_ip: None,
            network: "net".to_string(),
            cloud_site: "bielefeld".to_string(),
            ssh_port_calculation: "30000 + x + y * 256".to_string(),
            udp_port_calculation: "32000 + x + y * 256".to_string(),
            gateway_security_group_id: "gw-sg-id".to_string(),
            forc_security_group_id: Some("forc-sg-id".to_string()),
            compute_api_version: None,
        }
    }

    fn connector_with(mock: MockCloud) -> (Arc<MockCloud>, Arc<OpenStackConnector>) {
        let api = Arc::new(mock);
        let connector = Arc::new(OpenStackConnector::new(api.clone(), settings()).unwrap());
        (api, connector)
    }

    fn project_server(id: &str, name: &str, sgs: Vec<String>) -> crate::openstack::types::Server {
        crate::openstack::types::Server {
            id: id.to_string(),
            name: name.to_string(),
            vm_state: "active".to_string(),
            private_v4: Some("10.0.2.15".to_string()),
            metadata: HashMap::from([
                ("project_name".to_string(), "proj".to_string()),
                ("project_id".to_string(), "p1".to_string()),
            ]),
            security_group_names: sgs,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_concurrent_project_sg_creation_issues_one_create() {
        let mock = MockCloud {
            sg_create_delay: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let (api, connector) = connector_with(mock);

        let a = {
            let connector = connector.clone();
            tokio::spawn(async move {
                connector
                    .get_or_create_project_security_group("proj", "p1")
                    .await
            })
        };
        let b = {
            let connector = connector.clone();
            tokio::spawn(async move {
                connector
                    .get_or_create_project_security_group("proj", "p1")
                    .await
            })
        };
        let sg_a = a.await.unwrap().unwrap();
        let sg_b = b.await.unwrap().unwrap();

        assert_eq!(sg_a.id, sg_b.id);
        assert_eq!(api.sg_create_count.load(Ordering::SeqCst), 1);
        assert_eq!(sg_a.name, "proj_p1");
    }

    #[tokio::test]
    async fn test_research_env_sg_skipped_without_forc_support() {
        let (api, connector) = connector_with(MockCloud::default());
        let metadata = ResearchEnvironmentMetadata {
            needs_forc_support: false,
            ..Default::default()
        };
        let sg = connector
            .get_or_create_research_environment_security_group(&metadata)
            .await
            .unwrap();
        assert!(sg.is_none());
        assert_eq!(api.sg_create_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_research_env_sg_idempotent() {
        let (api, connector) = connector_with(MockCloud::default());
        let metadata = ResearchEnvironmentMetadata {
            name: "vscode".to_string(),
            security_group_name: "vscode".to_string(),
            port: 80,
            direction: "ingress".to_string(),
            protocol: "tcp".to_string(),
            needs_forc_support: true,
            ..Default::default()
        };
        let first = connector
            .get_or_create_research_environment_security_group(&metadata)
            .await
            .unwrap()
            .unwrap();
        let second = connector
            .get_or_create_research_environment_security_group(&metadata)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(api.sg_create_count.load(Ordering::SeqCst), 1);
        assert_eq!(api.rule_count(), 1);
    }

    #[tokio::test]
    async fn test_open_port_range_validates_ethertype() {
        let (_, connector) = connector_with(MockCloud::default());
        let err = connector
            .open_port_range_for_vm_in_project(8000, 8010, "vm-1", "IPvX", "TCP")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[tokio::test]
    async fn test_open_port_range_attaches_groups_once_but_duplicates_rules() {
        let server = project_server("vm-1", "alice-01", vec![]);
        let (api, connector) = connector_with(MockCloud::default().with_server(server));

        let rule_a = connector
            .open_port_range_for_vm_in_project(8000, 8010, "vm-1", "IPv4", "TCP")
            .await
            .unwrap();
        let rule_b = connector
            .open_port_range_for_vm_in_project(8000, 8010, "vm-1", "IPv4", "TCP")
            .await
            .unwrap();

        assert_ne!(rule_a, rule_b);
        // project SSH rule + two identical range rules
        let rules = api.rules.lock().unwrap();
        let range_rules: Vec<_> = rules
            .iter()
            .filter(|(_, r)| r.port_range_min == Some(8000) && r.port_range_max == Some(8010))
            .collect();
        assert_eq!(range_rules.len(), 2);
        drop(rules);

        // VM SG and project SG attached exactly once each
        let attached = api.server_sgs.lock().unwrap().get("vm-1").cloned().unwrap();
        assert_eq!(attached.iter().filter(|n| n.as_str() == "vm-1").count(), 1);
        assert_eq!(attached.iter().filter(|n| n.as_str() == "proj_p1").count(), 1);

        // rule points at the VM SG with the project SG as remote group
        let vm_sg = api.sg_by_name("vm-1").unwrap();
        let project_sg = api.sg_by_name("proj_p1").unwrap();
        let rules = api.rules.lock().unwrap();
        let (_, rule) = rules.iter().find(|(id, _)| id == &rule_a).unwrap();
        assert_eq!(rule.security_group_id, vm_sg.id);
        assert_eq!(rule.remote_group_id.as_deref(), Some(project_sg.id.as_str()));
        assert_eq!(rule.protocol.as_deref(), Some("tcp"));
    }

    #[tokio::test]
    async fn test_cleanup_policy_keeps_default_and_master_bibigrid_groups() {
        let mock = MockCloud::default();
        let default_sg = mock
            .create_security_group(DEFAULT_SECURITY_GROUP_NAME, "default")
            .await
            .unwrap();
        let bibigrid_sg = mock.create_security_group("bibigrid-sec", "cluster").await.unwrap();
        let vm_sg = mock.create_security_group("vm-master-1", "vm").await.unwrap();
        let server = project_server(
            "vm-master-1",
            "cluster-master-1",
            vec![default_sg.name.clone(), bibigrid_sg.name.clone(), vm_sg.name.clone()],
        );
        let (api, connector) = connector_with(mock.with_server(server));

        connector.remove_security_groups_from_server("vm-master-1").await.unwrap();

        let deleted = api.deleted_security_groups.lock().unwrap().clone();
        assert!(!deleted.contains(&default_sg.id));
        assert!(!deleted.contains(&bibigrid_sg.id));
        assert!(deleted.contains(&vm_sg.id));
        // everything detached
        assert!(api.server_sgs.lock().unwrap().get("vm-master-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_policy_keeps_groups_still_in_use() {
        let mock = MockCloud::default();
        let shared_sg = mock.create_security_group("shared", "shared").await.unwrap();
        mock.sgs_in_use.lock().unwrap().insert(shared_sg.id.clone());
        let server = project_server("vm-1", "alice-01", vec![shared_sg.name.clone()]);
        let (api, connector) = connector_with(mock.with_server(server));

        connector.remove_security_groups_from_server("vm-1").await.unwrap();
        assert!(api.deleted_security_groups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_udp_group_created_with_calculated_port() {
        let server = project_server("vm-1", "alice-01", vec![]);
        let (api, connector) = connector_with(MockCloud::default().with_server(server));

        connector.add_udp_security_group("vm-1").await.unwrap();

        let sg = api.sg_by_name("alice-01_udp").unwrap();
        let rules = api.rules.lock().unwrap();
        let udp_rules: Vec<_> = rules
            .iter()
            .filter(|(_, r)| r.security_group_id == sg.id)
            .collect();
        // IPv4 + IPv6
        assert_eq!(udp_rules.len(), 2);
        // 32000 + 15 + 2 * 256
        assert!(udp_rules.iter().all(|(_, r)| r.port_range_min == Some(32527)));
        drop(rules);

        // second call only verifies attachment
        connector.add_udp_security_group("vm-1").await.unwrap();
        assert_eq!(api.sg_create_count.load(Ordering::SeqCst), 1);
    }
}
