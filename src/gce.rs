//! Google Compute Engine implementation of [`Cloud`]
//!
//! Talks to the Compute Engine v1 REST API with a bearer token and opens
//! the tunnel by running `ssh -f -N -L`. Token acquisition is left to the
//! operator (for example `gcloud auth print-access-token`).

use crate::cloud::{Cloud, CloudError, CloudFuture, TunnelHandle};
use crate::config::GceConfig;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Instance {
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct NetworkInterface {
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

impl Instance {
    /// External address of the first interface, empty if none is assigned
    fn nat_ip(&self) -> String {
        self.network_interfaces
            .first()
            .and_then(|ni| ni.access_configs.first())
            .and_then(|ac| ac.nat_ip.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Disk {
    self_link: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Operation {
    name: String,
    status: String,
    target_link: Option<String>,
    error: Option<OperationErrors>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OperationErrors {
    errors: Vec<OperationErrorEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OperationErrorEntry {
    code: String,
    message: String,
}

impl OperationErrors {
    fn summary(&self) -> String {
        if self.errors.is_empty() {
            return "unknown error".to_string();
        }
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Startup script that runs the Docker daemon bound to loopback only; the
/// proxy reaches it through the SSH tunnel.
fn startup_script(docker_port: u16) -> String {
    format!(
        "#!/bin/bash\n\
         sysctl -w net.ipv4.ip_forward=1\n\
         curl -fsSL https://get.docker.com | sh\n\
         systemctl stop docker docker.socket\n\
         dockerd -H tcp://127.0.0.1:{} &\n",
        docker_port
    )
}

/// Compute Engine provider
pub struct GceCloud {
    http: reqwest::Client,
    project: String,
    token: String,
    docker_port: u16,
    ssh_user: String,
    ssh_key: PathBuf,
    ssh_options: Vec<String>,
    config: GceConfig,
}

impl GceCloud {
    /// Build a provider from configuration.
    ///
    /// `docker_port` is the daemon port inside the instance, baked into the
    /// startup script.
    pub fn new(config: &GceConfig, docker_port: u16) -> Result<Self, CloudError> {
        let project = config
            .project
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| CloudError::Config("gce.project is required".to_string()))?;

        let token = config.resolve_access_token().ok_or_else(|| {
            CloudError::Config(
                "no access token: set gce.access_token or GOOGLE_OAUTH_ACCESS_TOKEN".to_string(),
            )
        })?;

        let ssh_user = config
            .ssh_user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .ok_or_else(|| CloudError::Config("no ssh user: set gce.ssh_user or USER".to_string()))?;

        let ssh_key = match config.ssh_key {
            Some(ref key) => PathBuf::from(key),
            None => dirs_next::home_dir()
                .ok_or_else(|| CloudError::Config("cannot determine home directory".to_string()))?
                .join(".ssh")
                .join("google_compute_engine"),
        };

        let ssh_options = shell_words::split(&config.ssh_options)
            .map_err(|e| CloudError::Config(format!("invalid gce.ssh_options: {}", e)))?;

        Ok(Self {
            http: reqwest::Client::new(),
            project,
            token,
            docker_port,
            ssh_user,
            ssh_key,
            ssh_options,
            config: config.clone(),
        })
    }

    fn zone_url(&self, zone: &str, rest: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.project,
            zone,
            rest
        )
    }

    /// Map a non-success response to an API error
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CloudError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(CloudError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// GET a resource; `None` when it does not exist
    async fn get_resource<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Option<T>, CloudError> {
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn insert(&self, url: &str, body: &serde_json::Value) -> Result<Operation, CloudError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Poll a zone operation until it is DONE
    async fn wait_for_operation(&self, zone: &str, mut op: Operation) -> Result<Operation, CloudError> {
        let deadline = Instant::now() + self.config.operation_timeout();

        loop {
            match op.status.as_str() {
                "DONE" => {
                    if let Some(ref errors) = op.error {
                        return Err(CloudError::Operation(format!(
                            "{} failed: {}",
                            op.name,
                            errors.summary()
                        )));
                    }
                    return Ok(op);
                }
                "PENDING" | "RUNNING" => {}
                other => {
                    return Err(CloudError::Operation(format!(
                        "{} in unexpected state '{}'",
                        op.name, other
                    )));
                }
            }

            if Instant::now() >= deadline {
                return Err(CloudError::Timeout(format!("operation {}", op.name)));
            }
            sleep(self.config.operation_poll_interval()).await;

            let url = self.zone_url(zone, &format!("operations/{}", op.name));
            op = self
                .get_resource(&url)
                .await?
                .ok_or_else(|| CloudError::Operation(format!("operation {} vanished", op.name)))?;
            debug!(operation = %op.name, status = %op.status, "Polled zone operation");
        }
    }

    /// Reuse the root disk if it survived a previous instance, else create it
    async fn get_or_create_root_disk(&self, zone: &str) -> Result<String, CloudError> {
        let disk_name = &self.config.disk_name;
        let url = self.zone_url(zone, &format!("disks/{}", disk_name));
        if let Some(disk) = self.get_resource::<Disk>(&url).await? {
            debug!(disk = %disk_name, "Reusing existing root disk");
            return Ok(disk.self_link);
        }

        info!(disk = %disk_name, size_gb = self.config.disk_size_gb, "Creating root disk");
        let body = json!({
            "name": disk_name,
            "sourceImage": self.config.image,
            "sizeGb": self.config.disk_size_gb.to_string(),
        });
        let op = self.insert(&self.zone_url(zone, "disks"), &body).await?;
        let op = self.wait_for_operation(zone, op).await?;
        Ok(op
            .target_link
            .unwrap_or_else(|| self.zone_url(zone, &format!("disks/{}", disk_name))))
    }

    fn instance_body(&self, name: &str, zone: &str, root_disk: &str) -> serde_json::Value {
        json!({
            "name": name,
            "description": "Docker on GCE",
            "machineType": format!("zones/{}/machineTypes/{}", zone, self.config.machine_type),
            "disks": [{
                "boot": true,
                "type": "PERSISTENT",
                "mode": "READ_WRITE",
                "source": root_disk,
            }],
            "networkInterfaces": [{
                "network": "global/networks/default",
                "accessConfigs": [{ "type": "ONE_TO_ONE_NAT", "name": "External NAT" }],
            }],
            "metadata": {
                "items": [{ "key": "startup-script", "value": startup_script(self.docker_port) }],
            },
        })
    }

    /// Wait until the instance accepts SSH connections
    async fn wait_for_ssh(&self, address: &str) -> Result<(), CloudError> {
        let deadline = Instant::now() + self.config.ssh_ready_timeout();
        let target = format!("{}:{}", address, self.config.ssh_port);

        while Instant::now() <= deadline {
            if let Ok(Ok(_)) = timeout(CONNECT_TIMEOUT, TcpStream::connect(&target)).await {
                return Ok(());
            }
            sleep(self.config.operation_poll_interval()).await;
        }

        Err(CloudError::Timeout(format!("ssh on {}", target)))
    }

    fn tunnel_args(&self, address: &str, local_port: u16, remote_port: u16) -> Vec<String> {
        let mut args = self.ssh_options.clone();
        args.extend([
            // A stale forwarder still holding the local port must fail the call
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-i".to_string(),
            self.ssh_key.display().to_string(),
            "-A".to_string(),
            "-p".to_string(),
            self.config.ssh_port.to_string(),
            format!("{}@{}", self.ssh_user, address),
            "-f".to_string(),
            "-N".to_string(),
            "-L".to_string(),
            format!("{}:localhost:{}", local_port, remote_port),
        ]);
        args
    }
}

impl Cloud for GceCloud {
    fn public_ip_address<'a>(&'a self, name: &'a str, zone: &'a str) -> CloudFuture<'a, String> {
        Box::pin(async move {
            let url = self.zone_url(zone, &format!("instances/{}", name));
            match self.get_resource::<Instance>(&url).await? {
                Some(instance) => Ok(instance.nat_ip()),
                None => Err(CloudError::NotFound {
                    name: name.to_string(),
                    zone: zone.to_string(),
                }),
            }
        })
    }

    fn create_instance<'a>(&'a self, name: &'a str, zone: &'a str) -> CloudFuture<'a, String> {
        Box::pin(async move {
            let root_disk = self.get_or_create_root_disk(zone).await?;

            info!(instance = name, zone, machine_type = %self.config.machine_type, "Inserting instance");
            let body = self.instance_body(name, zone, &root_disk);
            let op = self.insert(&self.zone_url(zone, "instances"), &body).await?;
            self.wait_for_operation(zone, op).await?;

            let address = self.public_ip_address(name, zone).await?;
            if address.is_empty() {
                return Err(CloudError::Operation(format!(
                    "instance {} has no external address",
                    name
                )));
            }

            self.wait_for_ssh(&address).await?;
            let settle = self.config.daemon_settle();
            if !settle.is_zero() {
                debug!(instance = name, settle_secs = settle.as_secs(), "Waiting for Docker daemon");
                sleep(settle).await;
            }

            info!(instance = name, address = %address, "Instance ready");
            Ok(address)
        })
    }

    fn delete_instance<'a>(&'a self, name: &'a str, zone: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let url = self.zone_url(zone, &format!("instances/{}", name));
            let response = self.http.delete(&url).bearer_auth(&self.token).send().await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                debug!(instance = name, zone, "Instance already gone");
                return Ok(());
            }
            let op: Operation = Self::check(response).await?.json().await?;
            self.wait_for_operation(zone, op).await?;
            info!(instance = name, zone, "Instance deleted");
            Ok(())
        })
    }

    fn open_secure_tunnel<'a>(
        &'a self,
        name: &'a str,
        zone: &'a str,
        local_port: u16,
        remote_port: u16,
    ) -> CloudFuture<'a, TunnelHandle> {
        Box::pin(async move {
            let address = self.public_ip_address(name, zone).await?;
            if address.is_empty() {
                return Err(CloudError::Tunnel(format!(
                    "instance {} has no external address",
                    name
                )));
            }

            let args = self.tunnel_args(&address, local_port, remote_port);
            info!(address = %address, local_port, remote_port, "Starting ssh tunnel");

            let mut child = Command::new("ssh")
                .args(&args)
                .stdin(Stdio::null())
                .spawn()
                .map_err(|e| CloudError::Tunnel(format!("failed to spawn ssh: {}", e)))?;
            let pid = child.id();

            // `-f` makes ssh fork into the background once the forward is up,
            // so `pid` is gone by the time this returns
            let status = child.wait().await?;
            if !status.success() {
                warn!(address = %address, %status, "ssh tunnel exited with failure");
                return Err(CloudError::Tunnel(format!("ssh exited with {}", status)));
            }

            Ok(TunnelHandle::launched_by(pid))
        })
    }
}
