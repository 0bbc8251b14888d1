//! Idle teardown: delete the instance once its daemon runs no containers

use crate::cloud::{CloudError, SharedCloud};
use crate::probe::PROBE_PATH;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors raised while evaluating idle teardown
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("failed to fetch container listing: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("failed to parse container listing: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to delete instance: {0}")]
    Delete(#[source] CloudError),
}

/// A port mapping in the daemon's container listing
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerPort {
    pub private_port: u16,
    pub public_port: u16,
    #[serde(rename = "Type")]
    pub port_type: String,
}

/// One entry of the daemon's running-container listing
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerStatus {
    pub id: String,
    pub image: String,
    pub command: String,
    pub created: i64,
    pub status: String,
    pub ports: Vec<ContainerPort>,
    pub size_rw: i64,
    pub size_root_fs: i64,
}

/// Result of a teardown evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// No containers were running and the instance was deleted
    Deleted,
    /// Containers are still running; the instance was kept
    Busy { containers: usize },
}

/// Decides whether the managed instance is idle and deletes it if so
#[derive(Clone)]
pub struct IdleTeardown {
    cloud: SharedCloud,
    http: reqwest::Client,
}

impl IdleTeardown {
    pub fn new(cloud: SharedCloud) -> Self {
        Self {
            cloud,
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the listing from the daemon at `host` (`host:port`) and delete
    /// instance `name` in `zone` when it is empty
    pub async fn run(
        &self,
        host: &str,
        name: &str,
        zone: &str,
    ) -> Result<TeardownOutcome, TeardownError> {
        let url = format!("http://{}{}", host, PROBE_PATH);
        let body = self.http.get(&url).send().await?.bytes().await?;
        debug!(url = %url, body = %String::from_utf8_lossy(&body), "Fetched container listing");

        let containers: Vec<ContainerStatus> = serde_json::from_slice(&body)?;
        if !containers.is_empty() {
            return Ok(TeardownOutcome::Busy {
                containers: containers.len(),
            });
        }

        self.cloud
            .delete_instance(name, zone)
            .await
            .map_err(TeardownError::Delete)?;
        Ok(TeardownOutcome::Deleted)
    }
}
