//! Liveness probe for the local end of the tunnel
//!
//! A tunnel is considered active when a plain GET against it gets any HTTP
//! response back. Status codes are ignored and there are no retries: a
//! connection error of any kind means the tunnel has to be opened again.

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

/// Read-only daemon path used to probe the tunnel
pub const PROBE_PATH: &str = "/v1.6/containers/json";

/// Build the probe URL for a tunnel endpoint
pub fn probe_url(host: &str, port: u16) -> String {
    format!("http://{}:{}{}", host, port, PROBE_PATH)
}

/// Checks whether the tunnel endpoint answers
#[derive(Clone)]
pub struct TunnelProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl Default for TunnelProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelProbe {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client }
    }

    /// True if `url` answered with any HTTP response
    pub async fn is_active(&self, url: &str) -> bool {
        let req = match Request::builder()
            .method("GET")
            .uri(url)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match self.client.request(req).await {
            Ok(response) => {
                debug!(url, status = %response.status(), "Tunnel probe answered");
                true
            }
            Err(e) => {
                debug!(url, error = %e, "Tunnel probe failed");
                false
            }
        }
    }
}
