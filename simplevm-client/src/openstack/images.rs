//! Image lookup with substitution of deactivated or vanished images.
//!
//! Portal entries reference images by name. Site operators rotate images
//! (rebuilds, CVE respins) and deactivate the old ones, so a stored name is
//! allowed to resolve to the current active image of the same distro/version
//! instead of failing the boot.

use tracing::info;

use crate::error::{ClientError, Result};
use crate::openstack::OpenStackConnector;
use crate::openstack::api::CloudApi;
use crate::openstack::types::Image;

/// Ubuntu version tokens that may appear in stored image names; used to
/// recover a version when the named image is gone entirely.
const UBUNTU_VERSION_TOKENS: [(&str, &str); 4] = [
    ("20.04", "20.04"),
    ("22.04", "22.04"),
    ("2004", "20.04"),
    ("2204", "22.04"),
];

#[derive(Debug, Clone, Default)]
pub struct GetImageOptions {
    pub replace_inactive: bool,
    pub ignore_not_active: bool,
    pub replace_not_found: bool,
    pub ignore_not_found: bool,
    pub slurm_version: Option<String>,
}

fn ubuntu_version_in(name: &str) -> Option<&'static str> {
    UBUNTU_VERSION_TOKENS
        .iter()
        .find(|(token, _)| name.contains(token))
        .map(|(_, version)| *version)
}

impl OpenStackConnector {
    pub async fn get_image(
        &self,
        name_or_id: &str,
        options: GetImageOptions,
    ) -> Result<Option<Image>> {
        info!(image = %name_or_id, "Get image");
        match self.api.find_image(name_or_id).await? {
            Some(image) if image.is_active() => Ok(Some(image)),
            Some(image) => {
                if options.replace_inactive {
                    let replacement = self
                        .get_active_image_by_os_version(
                            image.os_version.as_deref(),
                            image.os_distro.as_deref(),
                            options.slurm_version.as_deref(),
                        )
                        .await;
                    if let Ok(replacement) = replacement {
                        info!(
                            requested = %name_or_id,
                            replacement = %replacement.name,
                            "Requested image is inactive, substituting active image"
                        );
                        return Ok(Some(replacement));
                    }
                }
                if options.ignore_not_active {
                    Ok(Some(image))
                } else {
                    Err(ClientError::ImageNotActive(name_or_id.to_string()))
                }
            }
            None => {
                if options.replace_not_found {
                    if let Some(version) = ubuntu_version_in(name_or_id) {
                        if let Ok(replacement) = self
                            .get_active_image_by_os_version(
                                Some(version),
                                Some("ubuntu"),
                                options.slurm_version.as_deref(),
                            )
                            .await
                        {
                            info!(
                                requested = %name_or_id,
                                replacement = %replacement.name,
                                "Requested image vanished, substituting by version token"
                            );
                            return Ok(Some(replacement));
                        }
                    }
                }
                if options.ignore_not_found {
                    Ok(None)
                } else {
                    Err(ClientError::ImageNotFound(name_or_id.to_string()))
                }
            }
        }
    }

    /// Newest active base image with matching os_version/os_distro. With a
    /// slurm version the candidate must also be a `worker` image carrying
    /// exactly that slurm version.
    pub async fn get_active_image_by_os_version(
        &self,
        os_version: Option<&str>,
        os_distro: Option<&str>,
        slurm_version: Option<&str>,
    ) -> Result<Image> {
        let Some(os_version) = os_version else {
            return Err(ClientError::ImageNotFound(
                "image without os_version cannot be substituted".to_string(),
            ));
        };
        info!(os_version = %os_version, "Get active image by os version");

        let images = self.api.list_images(None).await?;
        let found = images.into_iter().find(|image| {
            if !image.is_active()
                || image.base_image_ref.is_some()
                || image.os_version.as_deref() != Some(os_version)
            {
                return false;
            }
            if let Some(os_distro) = os_distro {
                if image.os_distro.as_deref() != Some(os_distro) {
                    return false;
                }
            }
            if let Some(slurm_version) = slurm_version {
                if image.slurm_version.as_deref() != Some(slurm_version)
                    || !image.tags.iter().any(|t| t == "worker")
                {
                    return false;
                }
            }
            true
        });

        found.ok_or_else(|| {
            ClientError::ImageNotFound(format!(
                "no active image with os_version {os_version} and os_distro {}",
                os_distro.unwrap_or("*")
            ))
        })
    }

    pub async fn get_images(&self) -> Result<Vec<Image>> {
        info!("Get images");
        Ok(filter_listed(self.api.list_images(None).await?))
    }

    pub async fn get_public_images(&self) -> Result<Vec<Image>> {
        info!("Get public images");
        Ok(filter_listed(self.api.list_images(Some("public")).await?))
    }

    pub async fn get_private_images(&self) -> Result<Vec<Image>> {
        info!("Get private images");
        Ok(filter_listed(self.api.list_images(Some("private")).await?))
    }
}

/// Listings only show active images that are tagged for the portal.
fn filter_listed(images: Vec<Image>) -> Vec<Image> {
    images
        .into_iter()
        .filter(|image| image.is_active() && !image.tags.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

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
            udp_port_calculation: "30000 + x + y * 256".to_string(),
            gateway_security_group_id: "gw".to_string(),
            forc_security_group_id: None,
            compute_api_version: None,
        }
    }

    fn image(id: &str, name: &str, status: &str) -> Image {
        Image {
            id: id.to_string(),
            name: name.to_string(),
            status: status.to_string(),
            visibility: "public".to_string(),
            tags: vec!["portalclient".to_string()],
            os_version: Some("22.04".to_string()),
            os_distro: Some("ubuntu".to_string()),
            ..Default::default()
        }
    }

    fn connector(mock: MockCloud) -> OpenStackConnector {
        OpenStackConnector::new(Arc::new(mock), settings()).unwrap()
    }

    #[tokio::test]
    async fn test_inactive_image_replaced_by_active_sibling() {
        let mock = MockCloud::default()
            .with_image(image("a", "ubuntu-22.04", "active"))
            .with_image(image("b", "ubuntu-22.04-old", "deactivated"));
        let connector = connector(mock);

        let resolved = connector
            .get_image(
                "ubuntu-22.04-old",
                GetImageOptions {
                    replace_inactive: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, "a");
    }

    #[tokio::test]
    async fn test_inactive_image_without_flags_fails() {
        let mock = MockCloud::default().with_image(image("b", "old", "deactivated"));
        let connector = connector(mock);

        let err = connector
            .get_image("old", GetImageOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ImageNotActive(_)));
    }

    #[tokio::test]
    async fn test_inactive_image_returned_when_ignored() {
        let mock = MockCloud::default().with_image(image("b", "old", "deactivated"));
        let connector = connector(mock);

        let resolved = connector
            .get_image(
                "old",
                GetImageOptions {
                    ignore_not_active: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, "b");
    }

    #[tokio::test]
    async fn test_missing_image_substituted_by_version_token() {
        let mock = MockCloud::default().with_image(image("a", "ubuntu-22.04-new", "active"));
        let connector = connector(mock);

        let resolved = connector
            .get_image(
                "old-image-2204",
                GetImageOptions {
                    replace_not_found: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, "a");
    }

    #[tokio::test]
    async fn test_missing_image_with_ignore_returns_none() {
        let connector = connector(MockCloud::default());
        let resolved = connector
            .get_image(
                "gone",
                GetImageOptions {
                    ignore_not_found: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(resolved.is_none());

        let err = connector
            .get_image("gone", GetImageOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn test_slurm_replacement_requires_worker_tag() {
        let mut plain = image("a", "ubuntu-22.04", "active");
        plain.slurm_version = Some("23.02".to_string());
        let mut worker = image("w", "ubuntu-22.04-worker", "active");
        worker.slurm_version = Some("23.02".to_string());
        worker.tags.push("worker".to_string());
        let mock = MockCloud::default()
            .with_image(plain)
            .with_image(worker)
            .with_image(image("b", "ubuntu-22.04-old", "deactivated"));
        let connector = connector(mock);

        let resolved = connector
            .get_image(
                "ubuntu-22.04-old",
                GetImageOptions {
                    replace_inactive: true,
                    slurm_version: Some("23.02".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, "w");
    }

    #[tokio::test]
    async fn test_base_image_derivatives_not_used_as_replacement() {
        let mut derived = image("d", "snapshot-of-22.04", "active");
        derived.base_image_ref = Some("a".to_string());
        let mock = MockCloud::default()
            .with_image(derived)
            .with_image(image("b", "ubuntu-22.04-old", "deactivated"));
        let connector = connector(mock);

        let err = connector
            .get_image(
                "ubuntu-22.04-old",
                GetImageOptions {
                    replace_inactive: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ImageNotActive(_)));
    }

    #[tokio::test]
    async fn test_listings_require_tags_and_active_status() {
        let mut untagged = image("u", "untagged", "active");
        untagged.tags.clear();
        let mock = MockCloud::default()
            .with_image(image("a", "ubuntu-22.04", "active"))
            .with_image(untagged)
            .with_image(image("d", "old", "deactivated"));
        let connector = connector(mock);

        let listed = connector.get_images().await.unwrap();
        let names: Vec<_> = listed.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["ubuntu-22.04"]);
    }
}
