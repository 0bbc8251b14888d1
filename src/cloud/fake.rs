//! Deterministic in-memory provider used by tests
//!
//! `FakeCloud` keeps a single optional instance address and records every
//! call made against it, so tests can assert exactly which provider
//! operations a request triggered.

use super::{Cloud, CloudError, CloudFuture, TunnelHandle};
use parking_lot::Mutex;
use std::time::Duration;

/// Address handed out by [`FakeCloud::create_instance`] unless overridden
pub const DEFAULT_CREATED_ADDRESS: &str = "10.0.0.2";

/// A recorded provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    PublicIpAddress { name: String, zone: String },
    CreateInstance { name: String, zone: String },
    DeleteInstance { name: String, zone: String },
    OpenSecureTunnel { name: String, zone: String, local_port: u16, remote_port: u16 },
}

/// Kind of a recorded call, for counting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    PublicIpAddress,
    CreateInstance,
    DeleteInstance,
    OpenSecureTunnel,
}

impl CloudCall {
    pub fn kind(&self) -> CallKind {
        match self {
            CloudCall::PublicIpAddress { .. } => CallKind::PublicIpAddress,
            CloudCall::CreateInstance { .. } => CallKind::CreateInstance,
            CloudCall::DeleteInstance { .. } => CallKind::DeleteInstance,
            CloudCall::OpenSecureTunnel { .. } => CallKind::OpenSecureTunnel,
        }
    }
}

type TunnelHook = Box<dyn Fn(u16) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    address: Option<String>,
    lookup_error: Option<String>,
    create_error: Option<String>,
    delete_error: Option<String>,
    tunnel_error: Option<String>,
}

/// Scriptable [`Cloud`] implementation
pub struct FakeCloud {
    state: Mutex<FakeState>,
    calls: Mutex<Vec<CloudCall>>,
    created_address: String,
    create_delay: Duration,
    on_tunnel_open: Option<TunnelHook>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloud {
    /// A provider with no instance
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            calls: Mutex::new(Vec::new()),
            created_address: DEFAULT_CREATED_ADDRESS.to_string(),
            create_delay: Duration::ZERO,
            on_tunnel_open: None,
        }
    }

    /// Start with a running instance at `address`
    pub fn with_instance(self, address: &str) -> Self {
        self.state.lock().address = Some(address.to_string());
        self
    }

    /// Make address lookups fail with a fatal API error
    pub fn with_lookup_error(self, message: &str) -> Self {
        self.state.lock().lookup_error = Some(message.to_string());
        self
    }

    pub fn with_create_error(self, message: &str) -> Self {
        self.state.lock().create_error = Some(message.to_string());
        self
    }

    pub fn with_delete_error(self, message: &str) -> Self {
        self.state.lock().delete_error = Some(message.to_string());
        self
    }

    pub fn with_tunnel_error(self, message: &str) -> Self {
        self.state.lock().tunnel_error = Some(message.to_string());
        self
    }

    /// Simulate a slow boot
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Run `hook` with the local port whenever a tunnel is opened
    pub fn on_tunnel_open<F>(mut self, hook: F) -> Self
    where
        F: Fn(u16) + Send + Sync + 'static,
    {
        self.on_tunnel_open = Some(Box::new(hook));
        self
    }

    /// All calls recorded so far, in order
    pub fn calls(&self) -> Vec<CloudCall> {
        self.calls.lock().clone()
    }

    /// Number of recorded calls of the given kind
    pub fn count(&self, kind: CallKind) -> usize {
        self.calls.lock().iter().filter(|c| c.kind() == kind).count()
    }

    /// Current instance address, if an instance exists
    pub fn instance_address(&self) -> Option<String> {
        self.state.lock().address.clone()
    }

    fn record(&self, call: CloudCall) {
        self.calls.lock().push(call);
    }
}

impl Cloud for FakeCloud {
    fn public_ip_address<'a>(&'a self, name: &'a str, zone: &'a str) -> CloudFuture<'a, String> {
        Box::pin(async move {
            self.record(CloudCall::PublicIpAddress {
                name: name.to_string(),
                zone: zone.to_string(),
            });
            let state = self.state.lock();
            if let Some(ref message) = state.lookup_error {
                return Err(CloudError::Api {
                    status: 500,
                    message: message.clone(),
                });
            }
            state.address.clone().ok_or_else(|| CloudError::NotFound {
                name: name.to_string(),
                zone: zone.to_string(),
            })
        })
    }

    fn create_instance<'a>(&'a self, name: &'a str, zone: &'a str) -> CloudFuture<'a, String> {
        Box::pin(async move {
            self.record(CloudCall::CreateInstance {
                name: name.to_string(),
                zone: zone.to_string(),
            });
            if !self.create_delay.is_zero() {
                tokio::time::sleep(self.create_delay).await;
            }
            let mut state = self.state.lock();
            if let Some(ref message) = state.create_error {
                return Err(CloudError::Operation(message.clone()));
            }
            state.address = Some(self.created_address.clone());
            Ok(self.created_address.clone())
        })
    }

    fn delete_instance<'a>(&'a self, name: &'a str, zone: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.record(CloudCall::DeleteInstance {
                name: name.to_string(),
                zone: zone.to_string(),
            });
            let mut state = self.state.lock();
            if let Some(ref message) = state.delete_error {
                return Err(CloudError::Operation(message.clone()));
            }
            state.address = None;
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
            self.record(CloudCall::OpenSecureTunnel {
                name: name.to_string(),
                zone: zone.to_string(),
                local_port,
                remote_port,
            });
            if let Some(message) = self.state.lock().tunnel_error.clone() {
                return Err(CloudError::Tunnel(message));
            }
            if let Some(ref hook) = self.on_tunnel_open {
                hook(local_port);
            }
            Ok(TunnelHandle::launched_by(None))
        })
    }
}
