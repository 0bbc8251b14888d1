use crate::error::ErrorFormat;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// The managed instance and its tunnel
    #[serde(default)]
    pub instance: InstanceConfig,

    /// Google Compute Engine provider settings
    #[serde(default)]
    pub gce: GceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port the proxy listens on (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Host the local tunnel end is reached on (default: localhost)
    #[serde(default = "default_tunnel_host")]
    pub tunnel_host: String,

    /// Body format for failed requests: "legacy" (default) or "json"
    #[serde(default)]
    pub error_format: ErrorFormat,

    /// Maximum idle connections kept to the tunnel (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            tunnel_host: default_tunnel_host(),
            error_format: ErrorFormat::default(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// The single remote VM this proxy manages
#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    /// Logical instance name (default: docker-instance)
    #[serde(default = "default_instance_name")]
    pub name: String,

    /// Placement zone (default: us-central1-a)
    #[serde(default = "default_zone")]
    pub zone: String,

    /// Port the Docker daemon listens on inside the instance (default: 8000)
    #[serde(default = "default_docker_port")]
    pub docker_port: u16,

    /// Local end of the tunnel (default: 8001)
    #[serde(default = "default_tunnel_port")]
    pub tunnel_port: u16,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: default_instance_name(),
            zone: default_zone(),
            docker_port: default_docker_port(),
            tunnel_port: default_tunnel_port(),
        }
    }
}

/// Settings for the Compute Engine provider
///
/// The access token is a ready-made OAuth bearer token. When absent from the
/// file it is read from `GOOGLE_OAUTH_ACCESS_TOKEN` at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct GceConfig {
    /// Google Cloud project id (required)
    pub project: Option<String>,

    /// OAuth bearer token for the Compute API
    pub access_token: Option<String>,

    /// Compute API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Machine type name (default: n1-standard-1)
    #[serde(default = "default_machine_type")]
    pub machine_type: String,

    /// Source image for the root disk
    #[serde(default = "default_image")]
    pub image: String,

    /// Name of the root disk, reused across instance generations
    #[serde(default = "default_disk_name")]
    pub disk_name: String,

    /// Root disk size in GB (default: 100)
    #[serde(default = "default_disk_size_gb")]
    pub disk_size_gb: u64,

    /// SSH login user (default: $USER)
    pub ssh_user: Option<String>,

    /// SSH private key (default: ~/.ssh/google_compute_engine)
    pub ssh_key: Option<String>,

    /// SSH port on the instance (default: 22)
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Extra ssh options, shell-quoted
    #[serde(default = "default_ssh_options")]
    pub ssh_options: String,

    /// Interval between zone operation polls in milliseconds (default: 5000)
    #[serde(default = "default_operation_poll_interval")]
    pub operation_poll_interval_ms: u64,

    /// Deadline for a single zone operation in seconds (default: 600)
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// How long to wait for SSH on a new instance in seconds (default: 300)
    #[serde(default = "default_ssh_ready_timeout")]
    pub ssh_ready_timeout_secs: u64,

    /// Extra wait for the Docker daemon after SSH is up in seconds (default: 60)
    #[serde(default = "default_daemon_settle")]
    pub daemon_settle_secs: u64,
}

impl Default for GceConfig {
    fn default() -> Self {
        Self {
            project: None,
            access_token: None,
            api_base: default_api_base(),
            machine_type: default_machine_type(),
            image: default_image(),
            disk_name: default_disk_name(),
            disk_size_gb: default_disk_size_gb(),
            ssh_user: None,
            ssh_key: None,
            ssh_port: default_ssh_port(),
            ssh_options: default_ssh_options(),
            operation_poll_interval_ms: default_operation_poll_interval(),
            operation_timeout_secs: default_operation_timeout(),
            ssh_ready_timeout_secs: default_ssh_ready_timeout(),
            daemon_settle_secs: default_daemon_settle(),
        }
    }
}

impl GceConfig {
    pub fn operation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.operation_poll_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn ssh_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_ready_timeout_secs)
    }

    pub fn daemon_settle(&self) -> Duration {
        Duration::from_secs(self.daemon_settle_secs)
    }

    /// Token from the file, falling back to the environment
    pub fn resolve_access_token(&self) -> Option<String> {
        self.access_token
            .clone()
            .or_else(|| std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN").ok())
            .filter(|t| !t.is_empty())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_tunnel_host() -> String {
    "localhost".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_instance_name() -> String {
    "docker-instance".to_string()
}

fn default_zone() -> String {
    "us-central1-a".to_string()
}

fn default_docker_port() -> u16 {
    8000
}

fn default_tunnel_port() -> u16 {
    8001
}

fn default_api_base() -> String {
    "https://compute.googleapis.com/compute/v1".to_string()
}

fn default_machine_type() -> String {
    "n1-standard-1".to_string()
}

fn default_image() -> String {
    "https://www.googleapis.com/compute/v1/projects/debian-cloud/global/images/family/debian-12".to_string()
}

fn default_disk_name() -> String {
    "docker-root".to_string()
}

fn default_disk_size_gb() -> u64 {
    100
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_options() -> String {
    "-o LogLevel=quiet -o UserKnownHostsFile=/dev/null -o CheckHostIP=no -o StrictHostKeyChecking=no"
        .to_string()
}

fn default_operation_poll_interval() -> u64 {
    5000
}

fn default_operation_timeout() -> u64 {
    600
}

fn default_ssh_ready_timeout() -> u64 {
    300
}

fn default_daemon_settle() -> u64 {
    60
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.instance.docker_port == 0 {
            errors.push("instance.docker_port must be greater than 0".to_string());
        }
        if self.instance.tunnel_port == 0 {
            errors.push("instance.tunnel_port must be greater than 0".to_string());
        }
        if self.server.port != 0 && self.server.port == self.instance.tunnel_port {
            errors.push(format!(
                "server.port and instance.tunnel_port must differ (both {})",
                self.server.port
            ));
        }
        if self.instance.name.trim().is_empty() {
            errors.push("instance.name must not be empty".to_string());
        }
        if self.instance.zone.trim().is_empty() {
            errors.push("instance.zone must not be empty".to_string());
        }
        if self.gce.project.as_deref().map_or(true, |p| p.trim().is_empty()) {
            errors.push("gce.project is required".to_string());
        }
        if shell_words::split(&self.gce.ssh_options).is_err() {
            errors.push("gce.ssh_options is not valid shell syntax".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
