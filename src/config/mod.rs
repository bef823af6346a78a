/// Configuration management for robot-provision
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::provision::script::InstallAction;
use crate::resources::boot_installer::TimeoutSettings;
use crate::resources::{
    BootInstallerSpec, DataSourceSpec, FirewallSpec, ResourceSpec, ServerBulkSpec, VSwitchSpec,
};
use crate::robot::firewall::{FirewallAction, FirewallRule};
use crate::robot::models::ResetType;
use crate::robot::{RobotError, ServerTarget};
use crate::ssh::SshExecutor;
use crate::utils::probe::NetworkProber;

/// Default Robot webservice endpoint
pub const DEFAULT_BASE_URL: &str = "https://robot-ws.your-server.de";

pub const ENV_USERNAME: &str = "HETZNERROBOT_USERNAME";
pub const ENV_PASSWORD: &str = "HETZNERROBOT_PASSWORD";
pub const ENV_URL: &str = "HETZNERROBOT_URL";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Desired state: provider settings, resources and data source queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Robot webservice credentials (each can also come from the environment)
    #[serde(default)]
    pub provider: ProviderSettings,

    /// Managed resources, keyed by a user-chosen name
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceSpec>,

    /// Read-only lookups, keyed by a user-chosen name
    #[serde(default)]
    pub data: BTreeMap<String, DataSourceSpec>,
}

/// Provider block of the manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Robot webservice user (or HETZNERROBOT_USERNAME)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Robot webservice password (or HETZNERROBOT_PASSWORD)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Webservice base URL (or HETZNERROBOT_URL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Per-request timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// How installs reach the rescue system
    #[serde(default, skip_serializing_if = "RescueAccess::is_default")]
    pub rescue: RescueAccess,
}

/// Probe and SSH settings for rescue systems
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescueAccess {
    /// Ping before checking the SSH port (default true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_connect_timeout_secs: Option<u64>,

    /// Limit on a single install script run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_timeout_secs: Option<u64>,
}

impl RescueAccess {
    fn is_default(&self) -> bool {
        self == &Self::default()
    }

    pub fn prober(&self) -> NetworkProber {
        let prober = NetworkProber::new();
        if self.ping == Some(false) {
            prober.without_ping()
        } else {
            prober
        }
    }

    pub fn executor(&self) -> SshExecutor {
        let mut executor = SshExecutor::new();
        if let Some(secs) = self.ssh_connect_timeout_secs {
            executor = executor.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.install_timeout_secs {
            executor = executor.with_command_timeout(Duration::from_secs(secs));
        }
        executor
    }
}

/// Resolved connection settings handed to [`crate::robot::RobotClient::new`]
#[derive(Debug)]
pub struct RobotConfig {
    pub username: String,
    pub password: SecretString,
    pub base_url: String,
    pub timeout: Duration,
}

impl RobotConfig {
    /// Build a configuration from explicit values
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, RobotError> {
        let username = username.into();
        let password: String = password.into();
        if username.is_empty() || password.is_empty() {
            return Err(RobotError::Config(
                "both username and password must be provided".to_string(),
            ));
        }

        let base_url = base_url.into();
        let parsed = url::Url::parse(&base_url)
            .map_err(|e| RobotError::Config(format!("invalid base URL {base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RobotError::Config(format!(
                "base URL must be http(s): {base_url}"
            )));
        }

        Ok(Self {
            username,
            password: SecretString::from(password),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        })
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve settings from the manifest, falling back to the environment
    pub fn resolve(settings: &ProviderSettings) -> Result<Self, RobotError> {
        Self::resolve_with(settings, |key| std::env::var(key).ok())
    }

    fn resolve_with<F>(settings: &ProviderSettings, env: F) -> Result<Self, RobotError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let username = settings
            .username
            .clone()
            .or_else(|| env(ENV_USERNAME))
            .ok_or_else(|| {
                RobotError::Config(format!(
                    "Robot username not found. Set {ENV_USERNAME} or provider.username"
                ))
            })?;
        let password = settings
            .password
            .clone()
            .or_else(|| env(ENV_PASSWORD))
            .ok_or_else(|| {
                RobotError::Config(format!(
                    "Robot password not found. Set {ENV_PASSWORD} or provider.password"
                ))
            })?;
        let url = settings
            .url
            .clone()
            .or_else(|| env(ENV_URL))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let config = Self::new(username, password, url)?;
        Ok(match settings.timeout_secs {
            Some(secs) => config.with_timeout(Duration::from_secs(secs)),
            None => config,
        })
    }

    /// Password for basic auth
    pub(crate) fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl Manifest {
    /// Load a manifest from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: Manifest = serde_yaml::from_str(&content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, spec) in &self.resources {
            if name.is_empty() {
                anyhow::bail!("resource names cannot be empty");
            }
            spec.validate()
                .map_err(|e| anyhow::anyhow!("resource {name}: {e}"))?;
        }
        Ok(())
    }

    /// Generate an example manifest
    pub fn example() -> Self {
        let mut resources = BTreeMap::new();
        resources.insert(
            "private-lan".to_string(),
            ResourceSpec::Vswitch(VSwitchSpec {
                name: "private-lan".to_string(),
                vlan: None,
                servers: vec![1234567, 1234568],
                cancellation_date: None,
            }),
        );
        resources.insert(
            "web-firewall".to_string(),
            ResourceSpec::Firewall(FirewallSpec {
                server_id: 1234567,
                active: true,
                whitelist_hos: true,
                rules: vec![
                    FirewallRule {
                        name: "ssh".to_string(),
                        dst_port: "22".to_string(),
                        protocol: "tcp".to_string(),
                        ..FirewallRule::new(FirewallAction::Accept)
                    },
                    FirewallRule {
                        name: "https".to_string(),
                        dst_port: "443".to_string(),
                        protocol: "tcp".to_string(),
                        ..FirewallRule::new(FirewallAction::Accept)
                    },
                ],
            }),
        );
        resources.insert(
            "names".to_string(),
            ResourceSpec::ServerBulk(ServerBulkSpec {
                servers: vec![
                    ServerTarget::new(1234567, "node-1"),
                    ServerTarget::new(1234568, "node-2"),
                ],
            }),
        );
        resources.insert(
            "talos".to_string(),
            ResourceSpec::BootInstaller(BootInstallerSpec {
                servers: vec![ServerTarget::new(1234569, "talos-1")],
                rescue_os: "linux".to_string(),
                ssh_keys: vec![],
                action: InstallAction::Image {
                    image_url: "https://factory.talos.dev/image/376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba/v1.9.2/metal-amd64.raw.zst".to_string(),
                    disk: "/dev/nvme0n1".to_string(),
                },
                reset_type: ResetType::Hw,
                concurrency: 10,
                fail_fast: false,
                timeouts: TimeoutSettings::default(),
            }),
        );

        let mut data = BTreeMap::new();
        data.insert(
            "all-servers".to_string(),
            DataSourceSpec::Servers { ids: vec![] },
        );

        Self {
            provider: ProviderSettings::default(),
            resources,
            data,
        }
    }
}
