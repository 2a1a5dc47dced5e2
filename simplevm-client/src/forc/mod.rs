//! Forc connector: playbook supervision and research environment plumbing.

pub mod client;
pub mod playbook;
pub mod template;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tracing::{error, info, warn};

use crate::config::ForcSettings;
use crate::error::{ClientError, Result};
use crate::openstack::types::{Server, task_states};
use crate::proto;
use crate::store::{PipelineRecord, PipelineStore};

use client::ForcClient;
use playbook::{Playbook, PlaybookSpec, RunState};
use template::TemplateCatalog;

/// In-progress sentinel returned by a status poll while the runner lives.
const PLAYBOOK_IN_PROGRESS: i32 = 3;

/// How long a deployment waits for a catalog update to finish.
const CATALOG_UNLOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const CATALOG_UNLOCK_POLL: Duration = Duration::from_secs(60);

/// Refresh deferral while playbooks are active.
const REFRESH_RETRY_SLEEP: Duration = Duration::from_secs(15 * 60);
const REFRESH_MAX_RETRIES: u32 = 5;

pub struct ForcConnector {
    settings: Option<ForcSettings>,
    client: Option<Arc<ForcClient>>,
    pub template: Arc<TemplateCatalog>,
    store: PipelineStore,
    /// Shared with the shutdown hook.
    active_playbooks: RwLock<HashMap<String, Playbook>>,
}

impl ForcConnector {
    pub fn new(
        settings: Option<ForcSettings>,
        store: PipelineStore,
        plays_dir: PathBuf,
        verify_tls: bool,
    ) -> Result<Self> {
        let settings = settings.filter(|s| s.activated);
        let client = match &settings {
            Some(settings) => Some(Arc::new(ForcClient::new(settings, verify_tls)?)),
            None => {
                info!("Forc configuration not found or deactivated, subsystem inert");
                None
            }
        };
        let template = Arc::new(TemplateCatalog::new(
            plays_dir,
            settings.as_ref().and_then(|s| s.github_playbooks_repo.clone()),
            client.clone(),
            verify_tls,
        )?);
        Ok(Self {
            settings,
            client,
            template,
            store,
            active_playbooks: RwLock::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    pub fn has_forc(&self) -> bool {
        self.client.is_some()
    }

    pub fn forc_backend_url(&self) -> String {
        self.client
            .as_ref()
            .map(|c| c.backend_url().to_string())
            .unwrap_or_default()
    }

    pub fn forc_access_url(&self) -> String {
        self.client
            .as_ref()
            .map(|c| c.access_url().to_string())
            .unwrap_or_default()
    }

    pub fn client(&self) -> Result<&Arc<ForcClient>> {
        self.client
            .as_ref()
            .ok_or_else(|| ClientError::Config("Forc is not configured".into()))
    }

    pub fn get_metadata_by_research_environment(
        &self,
        research_environment: &str,
    ) -> Option<template::ResearchEnvironmentMetadata> {
        let metadata = self.template.get_metadata(research_environment);
        if metadata.is_none() {
            warn!(
                research_environment = %research_environment,
                "No metadata loaded for research environment"
            );
        }
        metadata
    }

    /// Forc backend creation, with the version resolved from the published
    /// snapshot; an unknown template aborts before any HTTP request.
    pub async fn create_backend(
        &self,
        owner: &str,
        user_key_url: &str,
        template: &str,
        upstream_url: &str,
    ) -> Result<proto::Backend> {
        let template_version = self.template.get_template_version_for(template);
        if template_version.is_empty() {
            return Err(ClientError::TemplateNotFound(template.to_string()));
        }
        self.client()?
            .create_backend(owner, user_key_url, template, &template_version, upstream_url)
            .await
    }

    // ------------------------------------------------------------------
    // Pipeline state machine

    pub async fn set_vm_wait_for_playbook(
        &self,
        openstack_id: &str,
        private_key: &str,
        name: &str,
    ) -> Result<()> {
        info!(openstack_id = %openstack_id, status = task_states::PREPARE_PLAYBOOK_BUILD, "Set VM waiting for playbook");
        self.store
            .put(
                openstack_id,
                &PipelineRecord {
                    key: private_key.to_string(),
                    name: name.to_string(),
                    status: task_states::PREPARE_PLAYBOOK_BUILD.to_string(),
                },
            )
            .await
    }

    pub async fn is_playbook_active(&self, openstack_id: &str) -> Result<bool> {
        Ok(self.active_playbooks.read().await.contains_key(openstack_id)
            && self.store.exists(openstack_id).await?)
    }

    pub async fn is_any_playbook_active(&self) -> Result<bool> {
        let ids: Vec<String> = self.active_playbooks.read().await.keys().cloned().collect();
        for id in ids {
            if self.store.exists(&id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Build and launch the playbook for a VM that went through
    /// `set_vm_wait_for_playbook`. Returns 0 on launch, -1 when the catalog
    /// stayed locked for too long.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_and_deploy_playbook(
        &self,
        openstack_id: &str,
        public_key: &str,
        research_environment_template: &str,
        create_only_backend: bool,
        conda_packages: Vec<proto::CondaPackage>,
        apt_packages: Vec<String>,
        ip: &str,
        port: u16,
        cloud_site: &str,
        base_url: &str,
    ) -> Result<i32> {
        info!(openstack_id = %openstack_id, "Starting playbook");
        let private_key = self
            .store
            .get_private_key(openstack_id)
            .await?
            .ok_or_else(|| ClientError::PlaybookNotFound(openstack_id.to_string()))?;

        // A catalog refresh replaces the plays tree; wait for it to settle
        // before copying files out of it.
        let started = tokio::time::Instant::now();
        while self.template.is_update_locked() {
            if started.elapsed() > CATALOG_UNLOCK_TIMEOUT {
                error!("Template update is taking too long, cancelling playbook creation");
                self.store
                    .set_status(openstack_id, task_states::PLAYBOOK_FAILED)
                    .await?;
                return Ok(-1);
            }
            info!("Template catalog is updating, waiting");
            tokio::time::sleep(CATALOG_UNLOCK_POLL).await;
        }

        let spec = PlaybookSpec {
            openstack_id: openstack_id.to_string(),
            ip: ip.to_string(),
            port,
            research_environment_template: research_environment_template.to_string(),
            research_environment_template_version: self
                .template
                .get_template_version_for(research_environment_template),
            create_only_backend,
            conda_packages,
            apt_packages,
            private_key,
            public_key: public_key.to_string(),
            cloud_site: cloud_site.to_string(),
            base_url: base_url.to_string(),
        };
        let mut playbook = Playbook::new(&spec, self.template.plays_dir())?;
        playbook.run()?;

        self.store
            .set_status(openstack_id, task_states::BUILD_PLAYBOOK)
            .await?;
        self.active_playbooks
            .write()
            .await
            .insert(openstack_id.to_string(), playbook);
        info!(openstack_id = %openstack_id, "Playbook started");
        Ok(0)
    }

    /// Non-blocking poll; persists terminal transitions to the store.
    /// Returns 3 while the runner is alive, otherwise the exit code.
    pub async fn check_playbook_status(&self, openstack_id: &str) -> Result<i32> {
        let mut playbooks = self.active_playbooks.write().await;
        let Some(playbook) = playbooks.get_mut(openstack_id) else {
            return Err(ClientError::PlaybookNotFound(openstack_id.to_string()));
        };
        match playbook.check_status()? {
            RunState::Running => Ok(PLAYBOOK_IN_PROGRESS),
            RunState::Finished(0) => {
                self.store
                    .set_status(openstack_id, task_states::PLAYBOOK_SUCCESSFUL)
                    .await?;
                Ok(0)
            }
            RunState::Finished(rc) => {
                self.store
                    .set_status(openstack_id, task_states::PLAYBOOK_FAILED)
                    .await?;
                Ok(rc)
            }
        }
    }

    /// Overlay the pipeline status onto a server representation. PREPARE only
    /// shows while the backend reports no own task state; later pipeline
    /// states always win.
    pub async fn overlay_playbook_status(&self, server: &mut Server) -> Result<()> {
        if !self.store.exists(&server.id).await? {
            return Ok(());
        }
        if self.active_playbooks.read().await.contains_key(&server.id) {
            let _ = self.check_playbook_status(&server.id).await;
        }
        let Some(status) = self.store.get_status(&server.id).await? else {
            return Ok(());
        };
        info!(openstack_id = %server.id, status = %status, "VM playbook status");

        match status.as_str() {
            task_states::PREPARE_PLAYBOOK_BUILD if server.task_state.is_none() => {
                server.task_state = Some(status);
            }
            task_states::BUILD_PLAYBOOK
            | task_states::PLAYBOOK_FAILED
            | task_states::PLAYBOOK_SUCCESSFUL => {
                server.task_state = Some(status);
            }
            _ => {}
        }
        Ok(())
    }

    /// Destructive read: hands out the logs once and erases every trace of
    /// the playbook (scratch dir, store record, in-memory entry).
    pub async fn get_playbook_logs(&self, openstack_id: &str) -> Result<proto::PlaybookResult> {
        warn!(openstack_id = %openstack_id, "Get playbook logs");
        if !self.is_playbook_active(openstack_id).await? {
            return Err(ClientError::PlaybookNotFound(openstack_id.to_string()));
        }
        let mut playbooks = self.active_playbooks.write().await;
        let Some(mut playbook) = playbooks.remove(openstack_id) else {
            return Err(ClientError::PlaybookNotFound(openstack_id.to_string()));
        };
        drop(playbooks);

        let _ = playbook.check_status();
        let (status, stdout, stderr) = playbook.get_logs().await?;
        playbook.cleanup().await;
        self.store.delete(openstack_id).await?;

        Ok(proto::PlaybookResult {
            status,
            stdout,
            stderr,
        })
    }

    /// Terminate the runner, stash its logs under the `pb_logs_` namespace,
    /// then clean up.
    pub async fn stop_playbook(&self, openstack_id: &str) -> Result<()> {
        let mut playbooks = self.active_playbooks.write().await;
        let Some(mut playbook) = playbooks.remove(openstack_id) else {
            return Err(ClientError::PlaybookNotFound(openstack_id.to_string()));
        };
        drop(playbooks);

        playbook.stop().await?;
        let (rc, stdout, stderr) = playbook.get_logs().await?;
        self.store
            .stash_logs(openstack_id, rc, &stdout, &stderr)
            .await?;
        playbook.cleanup().await;
        self.store.delete(openstack_id).await?;
        Ok(())
    }

    pub async fn active_playbook_ids(&self) -> Vec<String> {
        self.active_playbooks.read().await.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Template refresh task

    /// Periodic catalog refresh, deferred while playbooks run. Returns the
    /// shutdown sender; dropping it or sending () stops the task.
    pub fn spawn_template_refresh(self: Arc<Self>) -> mpsc::Sender<()> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let Some(settings) = self.settings.clone() else {
            return shutdown_tx;
        };
        if settings.update_templates_schedule == 0 {
            info!("Template refresh schedule is 0, refresh disabled");
            return shutdown_tx;
        }
        let period = Duration::from_secs(settings.update_templates_schedule * 60 * 60);
        info!(
            hours = settings.update_templates_schedule,
            "Scheduling template catalog refresh"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The immediate first tick performs the startup refresh.
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Template refresh task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.refresh_when_idle().await;
                    }
                }
            }
        });

        shutdown_tx
    }

    /// One refresh attempt per tick: yield while any pipeline record is
    /// active, retry a bounded number of times, then skip this tick.
    async fn refresh_when_idle(&self) {
        for _ in 0..REFRESH_MAX_RETRIES {
            match self.is_any_playbook_active().await {
                Ok(false) => {
                    info!("No active playbook, starting template update");
                    if let Err(e) = self.template.update_playbooks().await {
                        error!(error = %e, "Template update failed");
                    }
                    return;
                }
                Ok(true) => {
                    info!("Active playbook running, delaying template update");
                    tokio::time::sleep(REFRESH_RETRY_SLEEP).await;
                }
                Err(e) => {
                    error!(error = %e, "Could not check active playbooks, skipping refresh");
                    return;
                }
            }
        }
        error!(
            retries = REFRESH_MAX_RETRIES,
            "Failed to update templates, playbooks stayed active"
        );
    }
}
