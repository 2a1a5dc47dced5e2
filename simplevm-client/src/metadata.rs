//! Client for the metadata sidecar service.
//!
//! The sidecar hands VM-local metadata to the guest; this side only pushes
//! and withdraws records. Write failures are logged, not propagated: the VM
//! lifecycle must not fail on a sidecar hiccup.

use std::time::Duration;

use serde_json::json;
use tracing::{error, info};

use crate::config::MetadataSettings;
use crate::error::Result;
use crate::proto;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct MetadataConnector {
    settings: Option<MetadataSettings>,
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl MetadataConnector {
    pub fn new(settings: Option<MetadataSettings>, verify_tls: bool) -> Result<Self> {
        let settings = settings.filter(|s| s.activated);
        let endpoint = match &settings {
            Some(settings) => settings.endpoint(),
            None => {
                info!("Metadata server configuration not found or deactivated, subsystem inert");
                String::new()
            }
        };
        let token = std::env::var("METADATA_WRITE_TOKEN").ok();
        if settings.is_some() && token.is_none() {
            error!("METADATA_WRITE_TOKEN not provided in env");
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;
        Ok(Self {
            settings,
            http,
            endpoint,
            token,
        })
    }

    pub fn is_activated(&self) -> bool {
        self.settings.is_some()
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}/{path}", self.endpoint));
        if let Some(token) = &self.token {
            req = req.header("X-Auth-Token", token);
        }
        req
    }

    pub async fn is_available(&self) -> bool {
        if self.settings.is_none() {
            return false;
        }
        match self.request(reqwest::Method::GET, "health").send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                error!(error = %e, "Metadata server health check failed");
                false
            }
        }
    }

    pub async fn set_metadata(
        &self,
        ip: &str,
        metadata: &proto::VirtualMachineServerMetadata,
    ) -> Result<()> {
        if self.settings.is_none() {
            info!("Metadata server not activated, skipping");
            return Ok(());
        }
        info!(ip = %ip, "Setting metadata");
        let body = json!({
            "project_name": metadata.project_name,
            "project_id": metadata.project_id,
            "user": metadata.user,
            "ssh_public_keys": metadata.ssh_public_keys,
            "metadata": metadata.metadata,
        });
        let result = self
            .request(reqwest::Method::POST, &format!("metadata/{ip}"))
            .json(&body)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        if let Err(e) = result {
            error!(ip = %ip, error = %e, "Failed to set metadata");
        }
        Ok(())
    }

    pub async fn remove_metadata(&self, ip: &str) -> Result<()> {
        if self.settings.is_none() {
            info!("Metadata server not activated, skipping");
            return Ok(());
        }
        info!(ip = %ip, "Removing metadata");
        let result = self
            .request(reqwest::Method::DELETE, &format!("metadata/{ip}"))
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        if let Err(e) = result {
            error!(ip = %ip, error = %e, "Failed to remove metadata");
        }
        Ok(())
    }
}
