//! Dockercloud - a transparent proxy for a Docker daemon running in the cloud
//!
//! Point a Docker client at the proxy and it behaves like a local daemon:
//! - Provisions the cloud instance on the first request that needs it
//! - Opens an SSH port forward to the daemon when the tunnel is down
//! - Forwards GET and POST requests and streams the daemon's responses back
//! - Deletes the instance once a container stop leaves nothing running
//!
//! Listing containers while no instance exists answers `[]` without
//! provisioning anything.

pub mod cloud;
pub mod config;
pub mod error;
pub mod gce;
pub mod probe;
pub mod proxy;
pub mod teardown;
pub mod transport;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
