//! Capability contract for the cloud provider that hosts the Docker daemon
//!
//! The proxy never talks to a provider directly; it goes through [`Cloud`],
//! which exposes exactly the four lifecycle operations the request handler
//! needs. Providers own all remote state and must tolerate redundant calls,
//! since several requests may race on the same instance.

pub mod fake;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Future returned by provider operations
pub type CloudFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CloudError>> + Send + 'a>>;

/// Shared handle to a provider implementation
pub type SharedCloud = Arc<dyn Cloud>;

/// Errors raised by cloud providers
#[derive(Debug, Error)]
pub enum CloudError {
    /// The named instance does not exist. Not fatal: drives the
    /// "no instance running" branch.
    #[error("instance '{name}' not found in zone {zone}")]
    NotFound { name: String, zone: String },

    /// The provider API answered with a non-success status
    #[error("provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure talking to the provider
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A long-running provider operation finished in a bad state
    #[error("operation failed: {0}")]
    Operation(String),

    /// The secure tunnel could not be established
    #[error("tunnel failed: {0}")]
    Tunnel(String),

    /// Waiting on the provider exceeded its deadline
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Provider configuration is incomplete
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CloudError {
    /// True when the error only signals that the instance is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }
}

/// Result of [`Cloud::open_secure_tunnel`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelHandle {
    /// PID of the process that launched the forward.
    ///
    /// Not the running forwarder: a launcher that backgrounds itself (as
    /// `ssh -f` does) has already exited when the handle is returned.
    pub launcher_pid: Option<u32>,
}

impl TunnelHandle {
    pub fn launched_by(pid: Option<u32>) -> Self {
        Self { launcher_pid: pid }
    }
}

/// Remote compute lifecycle operations.
///
/// Implementations must be safe to call concurrently with identical
/// arguments: `create_instance` and `open_secure_tunnel` must not corrupt
/// provider state when invoked redundantly, and `delete_instance` must treat
/// an instance that is already gone as success.
pub trait Cloud: Send + Sync {
    /// Resolve the public address of a named instance.
    ///
    /// Returns [`CloudError::NotFound`] when the instance does not exist. An
    /// existing instance without an assigned address resolves to an empty
    /// string.
    fn public_ip_address<'a>(&'a self, name: &'a str, zone: &'a str) -> CloudFuture<'a, String>;

    /// Create an instance and wait until its Docker daemon is reachable.
    /// Returns the instance address.
    fn create_instance<'a>(&'a self, name: &'a str, zone: &'a str) -> CloudFuture<'a, String>;

    /// Delete an instance.
    fn delete_instance<'a>(&'a self, name: &'a str, zone: &'a str) -> CloudFuture<'a, ()>;

    /// Open a tunnel from `local_port` on this host to `remote_port` on the
    /// instance.
    fn open_secure_tunnel<'a>(
        &'a self,
        name: &'a str,
        zone: &'a str,
        local_port: u16,
        remote_port: u16,
    ) -> CloudFuture<'a, TunnelHandle>;
}
