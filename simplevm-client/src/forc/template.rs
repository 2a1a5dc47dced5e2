//! Research environment template catalog.
//!
//! The playbooks archive is fetched periodically, template metadata is
//! validated, the listed Forc versions are probed against the Forc catalog
//! and the surviving versions are published as one atomic snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::error::{ClientError, Result};
use crate::forc::client::ForcClient;
use crate::proto;

/// Directory entries in the plays tree that are not templates.
const NON_TEMPLATE_DIRS: [&str; 5] = ["packer", "optional", ".github", "cluster", "conda"];

/// Raw per-template metadata as shipped in `{template}/{template}_metadata.yml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateMetadata {
    pub template_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub logo_url: String,
    #[serde(default)]
    pub info_url: String,
    #[serde(default)]
    pub port: u32,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default, rename = "securitygroup_name")]
    pub security_group_name: String,
    #[serde(default, rename = "securitygroup_description")]
    pub security_group_description: String,
    #[serde(default, rename = "securitygroup_ssh")]
    pub security_group_ssh: bool,
    #[serde(default)]
    pub needs_forc_support: bool,
    #[serde(default)]
    pub forc_versions: Vec<String>,
    #[serde(default)]
    pub incompatible_versions: Vec<String>,
    #[serde(default)]
    pub is_maintained: bool,
    #[serde(default)]
    pub information_for_display: String,
    #[serde(default)]
    pub min_ram: u64,
    #[serde(default)]
    pub min_cores: u32,
}

impl TemplateMetadata {
    pub fn to_proto(&self) -> proto::ResearchEnvironmentTemplate {
        proto::ResearchEnvironmentTemplate {
            template_name: self.template_name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            logo_url: self.logo_url.clone(),
            info_url: self.info_url.clone(),
            port: self.port,
            incompatible_versions: self.incompatible_versions.clone(),
            is_maintained: self.is_maintained,
            information_for_display: self.information_for_display.clone(),
        }
    }
}

/// The slice of template metadata the security group resolver needs.
#[derive(Debug, Clone, Default)]
pub struct ResearchEnvironmentMetadata {
    pub name: String,
    pub port: u32,
    pub security_group_name: String,
    pub security_group_description: String,
    pub security_group_ssh: bool,
    pub direction: String,
    pub protocol: String,
    pub information_for_display: String,
    pub needs_forc_support: bool,
}

impl From<&TemplateMetadata> for ResearchEnvironmentMetadata {
    fn from(meta: &TemplateMetadata) -> Self {
        Self {
            name: meta.template_name.clone(),
            port: meta.port,
            security_group_name: meta.security_group_name.clone(),
            security_group_description: meta.security_group_description.clone(),
            security_group_ssh: meta.security_group_ssh,
            direction: meta.direction.clone(),
            protocol: meta.protocol.clone(),
            information_for_display: meta.information_for_display.clone(),
            needs_forc_support: meta.needs_forc_support,
        }
    }
}

pub struct TemplateCatalog {
    plays_dir: PathBuf,
    playbooks_repo: Option<String>,
    forc: Option<Arc<ForcClient>>,
    http: reqwest::Client,
    update_lock: AtomicBool,
    /// templateName -> acceptable versions, newest first. Replaced wholesale
    /// on refresh; readers always see a complete snapshot.
    allowed_versions: RwLock<HashMap<String, Vec<String>>>,
    loaded_metadata: RwLock<HashMap<String, ResearchEnvironmentMetadata>>,
    allowed_templates: RwLock<Vec<TemplateMetadata>>,
}

impl TemplateCatalog {
    pub fn new(
        plays_dir: PathBuf,
        playbooks_repo: Option<String>,
        forc: Option<Arc<ForcClient>>,
        verify_tls: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;
        Ok(Self {
            plays_dir,
            playbooks_repo,
            forc,
            http,
            update_lock: AtomicBool::new(false),
            allowed_versions: RwLock::new(HashMap::new()),
            loaded_metadata: RwLock::new(HashMap::new()),
            allowed_templates: RwLock::new(Vec::new()),
        })
    }

    pub fn plays_dir(&self) -> &Path {
        &self.plays_dir
    }

    pub fn is_update_locked(&self) -> bool {
        self.update_lock.load(Ordering::SeqCst)
    }

    /// Newest acceptable version for the template, empty when unknown.
    pub fn get_template_version_for(&self, template: &str) -> String {
        self.allowed_versions
            .read()
            .unwrap()
            .get(template)
            .and_then(|versions| versions.first())
            .cloned()
            .unwrap_or_default()
    }

    pub fn allowed_versions_snapshot(&self) -> HashMap<String, Vec<String>> {
        self.allowed_versions.read().unwrap().clone()
    }

    pub fn get_allowed_templates(&self) -> Vec<proto::ResearchEnvironmentTemplate> {
        self.allowed_templates
            .read()
            .unwrap()
            .iter()
            .map(TemplateMetadata::to_proto)
            .collect()
    }

    pub fn get_metadata(&self, research_environment: &str) -> Option<ResearchEnvironmentMetadata> {
        self.loaded_metadata
            .read()
            .unwrap()
            .get(research_environment)
            .cloned()
    }

    /// Full refresh: download, unpack, validate, probe Forc, publish.
    /// The update lock is held for the whole cycle; readers of the published
    /// snapshot never block on it.
    pub async fn update_playbooks(&self) -> Result<()> {
        let Some(repo) = self.playbooks_repo.clone() else {
            info!("Playbooks repo url is not configured, skipping playbook download");
            return Ok(());
        };

        self.update_lock.store(true, Ordering::SeqCst);
        let result = self.update_playbooks_inner(&repo).await;
        self.update_lock.store(false, Ordering::SeqCst);
        result
    }

    async fn update_playbooks_inner(&self, repo: &str) -> Result<()> {
        info!(repo = %repo, "Started update of playbooks");
        let response = self.http.get(repo).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Internal(format!(
                "playbook archive download failed: {}",
                response.status()
            )));
        }
        let archive = response.bytes().await?;
        info!(bytes = archive.len(), "Playbook archive downloaded");

        let plays_dir = self.plays_dir.clone();
        tokio::task::spawn_blocking(move || unpack_archive(&archive, &plays_dir))
            .await
            .map_err(|e| ClientError::Internal(format!("archive unpack task failed: {e}")))??;

        let templates = self.discover_templates()?;
        info!(templates = ?templates, "Loaded template names");

        let mut versions: HashMap<String, Vec<String>> = HashMap::new();
        let mut metadata_by_name: HashMap<String, ResearchEnvironmentMetadata> = HashMap::new();
        let mut allowed_templates: Vec<TemplateMetadata> = Vec::new();

        for template in &templates {
            let metadata_path = self
                .plays_dir
                .join(template)
                .join(format!("{template}_metadata.yml"));
            let raw = match std::fs::read_to_string(&metadata_path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(template = %template, error = %e, "No metadata file found for template");
                    continue;
                }
            };
            let metadata: TemplateMetadata = match serde_yaml::from_str(&raw) {
                Ok(metadata) => metadata,
                Err(e) => {
                    error!(template = %template, error = %e, "Failed to parse metadata yml");
                    continue;
                }
            };

            if metadata.needs_forc_support {
                let allowed = self.probe_forc_versions(&metadata).await;
                versions.insert(metadata.template_name.clone(), allowed);
                metadata_by_name
                    .insert(metadata.template_name.clone(), (&metadata).into());
                allowed_templates.push(metadata);
            }
        }

        // Publish the new snapshot wholesale.
        *self.allowed_versions.write().unwrap() = versions;
        *self.loaded_metadata.write().unwrap() = metadata_by_name;
        *self.allowed_templates.write().unwrap() = allowed_templates;

        self.install_galaxy_requirements().await;
        info!("Playbook update finished");
        Ok(())
    }

    /// Every version listed in the metadata that the Forc catalog actually
    /// serves, newest first.
    async fn probe_forc_versions(&self, metadata: &TemplateMetadata) -> Vec<String> {
        let Some(forc) = &self.forc else {
            return sorted_desc(metadata.forc_versions.clone());
        };
        let mut allowed = Vec::new();
        for version in &metadata.forc_versions {
            match forc.template_exists(&metadata.template_name, version).await {
                Ok(true) => allowed.push(version.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        template = %metadata.template_name,
                        version = %version,
                        error = %e,
                        "Checking template version failed"
                    );
                }
            }
        }
        sorted_desc(allowed)
    }

    fn discover_templates(&self) -> Result<Vec<String>> {
        let mut templates = Vec::new();
        for entry in std::fs::read_dir(&self.plays_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if NON_TEMPLATE_DIRS.contains(&name.as_str()) {
                continue;
            }
            templates.push(name);
        }
        templates.sort();
        Ok(templates)
    }

    /// Galaxy roles referenced by the packer subtree, installed one-shot.
    async fn install_galaxy_requirements(&self) {
        let requirements = self.plays_dir.join("packer").join("requirements.yml");
        if !requirements.exists() {
            return;
        }
        info!(requirements = %requirements.display(), "Installing galaxy role requirements");
        match Command::new("ansible-galaxy")
            .arg("install")
            .arg("-r")
            .arg(&requirements)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                error!(
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "ansible-galaxy install failed"
                );
            }
            Err(e) => error!(error = %e, "Failed to run ansible-galaxy"),
        }
    }
}

/// Unpack the gzipped tarball into the plays dir and merge a `resenvs/`
/// subtree (archives wrap their content in a top-level directory).
fn unpack_archive(archive: &[u8], plays_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(plays_dir)?;
    let decoder = flate2::read::GzDecoder::new(archive);
    let mut tar = tar::Archive::new(decoder);
    tar.unpack(plays_dir)?;

    let unpacked_resenvs: Vec<PathBuf> = std::fs::read_dir(plays_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                && entry.file_name().to_string_lossy().contains("resenvs")
        })
        .map(|entry| entry.path())
        .collect();

    for dir in unpacked_resenvs {
        copy_tree(&dir, plays_dir)?;
        let _ = std::fs::remove_dir_all(&dir);
    }
    Ok(())
}

pub(crate) fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Descending semantic-version order; non-semver tags sort lexicographically
/// after every valid version.
fn sorted_desc(mut versions: Vec<String>) -> Vec<String> {
    fn parse(version: &str) -> Option<semver::Version> {
        let trimmed = version.trim_start_matches('v');
        semver::Version::parse(trimmed)
            .ok()
            .or_else(|| semver::Version::parse(&format!("{trimmed}.0")).ok())
            .or_else(|| semver::Version::parse(&format!("{trimmed}.0.0")).ok())
    }
    versions.sort_by(|a, b| match (parse(a), parse(b)) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => b.cmp(a),
    });
    versions
}

#[cfg(test)]
mod tests {
    use super::*;

    const VSCODE_METADATA: &str = r#"
template_name: vscode
title: VS Code
description: Visual Studio Code research environment
logo_url: https://example.org/vscode.svg
info_url: https://example.org/vscode
port: 80
direction: ingress
protocol: tcp
securitygroup_name: vscode
securitygroup_description: VSCode research environment
securitygroup_ssh: true
needs_forc_support: true
forc_versions:
  - "v1.0.1"
  - "v1.2.0"
  - "v1.0.2"
incompatible_versions:
  - "v0.9.0"
is_maintained: true
information_for_display: Browser based VS Code
min_ram: 2
min_cores: 1
"#;

    #[test]
    fn test_metadata_parsing() {
        let metadata: TemplateMetadata = serde_yaml::from_str(VSCODE_METADATA).unwrap();
        assert_eq!(metadata.template_name, "vscode");
        assert_eq!(metadata.port, 80);
        assert!(metadata.needs_forc_support);
        assert_eq!(metadata.forc_versions.len(), 3);
        assert_eq!(metadata.security_group_name, "vscode");

        let resenv: ResearchEnvironmentMetadata = (&metadata).into();
        assert_eq!(resenv.name, "vscode");
        assert_eq!(resenv.port, 80);
        assert!(resenv.needs_forc_support);
    }

    #[test]
    fn test_version_sorting_descending() {
        let sorted = sorted_desc(vec![
            "v1.0.1".to_string(),
            "v1.2.0".to_string(),
            "v1.0.2".to_string(),
            "v1.10.0".to_string(),
        ]);
        assert_eq!(sorted, vec!["v1.10.0", "v1.2.0", "v1.0.2", "v1.0.1"]);
    }

    #[test]
    fn test_version_sorting_handles_short_versions() {
        let sorted = sorted_desc(vec!["1.2".to_string(), "1.10".to_string(), "1".to_string()]);
        assert_eq!(sorted, vec!["1.10", "1.2", "1"]);
    }

    #[test]
    fn test_non_semver_sorts_last() {
        let sorted = sorted_desc(vec!["latest".to_string(), "v2.0.0".to_string()]);
        assert_eq!(sorted, vec!["v2.0.0", "latest"]);
    }

    #[tokio::test]
    async fn test_snapshot_accessors_default_empty() {
        let catalog = TemplateCatalog::new(
            std::env::temp_dir().join("plays-test-empty"),
            None,
            None,
            true,
        )
        .unwrap();
        assert_eq!(catalog.get_template_version_for("vscode"), "");
        assert!(catalog.get_allowed_templates().is_empty());
        assert!(catalog.get_metadata("vscode").is_none());
        assert!(!catalog.is_update_locked());

        // No repo configured: refresh is a no-op that leaves the lock clear.
        catalog.update_playbooks().await.unwrap();
        assert!(!catalog.is_update_locked());
    }

    #[test]
    fn test_discover_templates_excludes_support_dirs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["vscode", "rstudio", "packer", "optional", "conda", ".github"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("generic_playbook.yml"), "---\n").unwrap();

        let catalog =
            TemplateCatalog::new(dir.path().to_path_buf(), None, None, true).unwrap();
        let templates = catalog.discover_templates().unwrap();
        assert_eq!(templates, vec!["rstudio", "vscode"]);
    }
}
