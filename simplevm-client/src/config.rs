use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ClientError, Result};

fn default_true() -> bool {
    true
}

fn default_threads() -> usize {
    8
}

fn default_update_schedule_hours() -> u64 {
    12
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerSettings,
    pub openstack: OpenStackSettings,
    pub bibigrid: Option<BibigridSettings>,
    pub forc: Option<ForcSettings>,
    pub metadata_server: Option<MetadataSettings>,
    pub redis: RedisSettings,
    /// TLS verification of outbound HTTP requests.
    #[serde(default = "default_true")]
    pub production: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub use_ssl: bool,
    /// PEM file containing the server certificate and private key.
    pub certfile: Option<PathBuf>,
    /// When set, client certificates are required and verified against it.
    pub ca_certs_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenStackSettings {
    pub gateway_ip: String,
    pub internal_gateway_ip: Option<String>,
    pub network: String,
    pub cloud_site: String,
    pub ssh_port_calculation: String,
    pub udp_port_calculation: String,
    pub gateway_security_group_id: String,
    pub forc_security_group_id: Option<String>,
    pub compute_api_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BibigridSettings {
    #[serde(default = "default_true")]
    pub activated: bool,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub https: bool,
    #[serde(default)]
    pub modes: Vec<String>,
    pub sub_network: String,
    #[serde(default)]
    pub use_master_with_public_ip: bool,
    #[serde(default, rename = "localDnsLookup")]
    pub local_dns_lookup: bool,
    #[serde(default, rename = "ansibleGalaxyRoles")]
    pub ansible_galaxy_roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForcSettings {
    #[serde(default = "default_true")]
    pub activated: bool,
    pub forc_backend_url: String,
    pub forc_access_url: String,
    pub github_playbooks_repo: Option<String>,
    /// Hours between template catalog refreshes.
    #[serde(default = "default_update_schedule_hours")]
    pub update_templates_schedule: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataSettings {
    #[serde(default)]
    pub activated: bool,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub use_https: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let cfg: Config = serde_yaml::from_str(&raw)
            .map_err(|e| ClientError::Config(format!("invalid config file: {e}")))?;
        if cfg.server.use_ssl && cfg.server.certfile.is_none() {
            return Err(ClientError::Config(
                "server.use_ssl requires server.certfile".into(),
            ));
        }
        Ok(cfg)
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis.host, self.redis.port)
    }
}

impl BibigridSettings {
    pub fn endpoint(&self) -> String {
        let protocol = if self.https { "https" } else { "http" };
        format!("{}://{}:{}", protocol, self.host, self.port)
    }
}

impl MetadataSettings {
    pub fn endpoint(&self) -> String {
        let protocol = if self.use_https { "https" } else { "http" };
        format!("{}://{}:{}", protocol, self.host, self.port)
    }
}

/// OpenStack credentials, taken from the environment like every other
/// OpenStack client tool.
#[derive(Debug, Clone)]
pub struct OpenStackAuth {
    pub auth_url: String,
    pub method: AuthMethod,
}

#[derive(Debug, Clone)]
pub enum AuthMethod {
    ApplicationCredential {
        id: String,
        secret: String,
    },
    Password {
        username: String,
        password: String,
        project_name: String,
        project_id: String,
        user_domain_name: String,
        project_domain_id: String,
    },
}

fn require_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| ClientError::Config(format!("{key} not provided in env")))
}

impl OpenStackAuth {
    pub fn from_env() -> Result<Self> {
        let auth_url = require_env("OS_AUTH_URL")?;

        let use_application_credentials = env::var("USE_APPLICATION_CREDENTIALS")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let method = if use_application_credentials {
            AuthMethod::ApplicationCredential {
                id: require_env("OS_APPLICATION_CREDENTIAL_ID")?,
                secret: require_env("OS_APPLICATION_CREDENTIAL_SECRET")?,
            }
        } else {
            AuthMethod::Password {
                username: require_env("OS_USERNAME")?,
                password: require_env("OS_PASSWORD")?,
                project_name: require_env("OS_PROJECT_NAME")?,
                project_id: require_env("OS_PROJECT_ID")?,
                user_domain_name: require_env("OS_USER_DOMAIN_NAME")?,
                project_domain_id: require_env("OS_PROJECT_DOMAIN_ID")?,
            }
        };

        Ok(Self { auth_url, method })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  host: 0.0.0.0
  port: 9090
  threads: 30
  use_ssl: false

openstack:
  gateway_ip: 129.70.51.75
  network: portalexternalnetwork
  cloud_site: bielefeld
  ssh_port_calculation: 30000 + x + y * 256
  udp_port_calculation: 30000 + x + y * 256
  gateway_security_group_id: 8294d2ef-cdaa-4f5d-9b55-0f3e0a937ca5
  forc_security_group_id: f7e4d9c8-52b2-4b8c-8129-43cc51f46cf5

bibigrid:
  activated: true
  host: bibigrid.example.org
  port: 8080
  modes: ["slurm"]
  sub_network: portalexternalsubnetwork
  localDnsLookup: true
  ansibleGalaxyRoles: []

forc:
  forc_backend_url: https://proxy.example.org/api/
  forc_access_url: https://proxy.example.org/
  github_playbooks_repo: https://github.com/deNBI/resenvs/archive/refs/heads/staging.tar.gz

metadata_server:
  activated: true
  host: metadata.example.org
  port: 8444
  use_https: true

redis:
  host: localhost
  port: 6379

production: true
"#;

    #[test]
    fn test_parse_full_config() {
        let cfg: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.server.threads, 30);
        assert_eq!(cfg.openstack.cloud_site, "bielefeld");
        assert_eq!(cfg.redis_url(), "redis://localhost:6379/");
        let bibigrid = cfg.bibigrid.unwrap();
        assert!(bibigrid.local_dns_lookup);
        assert_eq!(bibigrid.endpoint(), "http://bibigrid.example.org:8080");
        let forc = cfg.forc.unwrap();
        assert!(forc.activated);
        assert_eq!(forc.update_templates_schedule, 12);
        assert_eq!(cfg.metadata_server.unwrap().port, 8444);
        assert!(cfg.production);
    }

    #[test]
    fn test_optional_subsystems_missing() {
        let minimal = r#"
server:
  host: "[::1]"
  port: 9090
openstack:
  gateway_ip: 127.0.0.1
  network: net
  cloud_site: giessen
  ssh_port_calculation: 30000 + x + y * 256
  udp_port_calculation: 32000 + x + y * 256
  gateway_security_group_id: gw-sg
redis:
  host: localhost
  port: 6379
"#;
        let cfg: Config = serde_yaml::from_str(minimal).unwrap();
        assert!(cfg.bibigrid.is_none());
        assert!(cfg.forc.is_none());
        assert!(cfg.metadata_server.is_none());
        // production defaults to verified TLS
        assert!(cfg.production);
        assert_eq!(cfg.server.threads, 8);
    }
}
