//! The proxy server and the per-request lifecycle around the remote daemon
//!
//! Every request re-derives what it needs from the provider: whether the
//! instance exists, whether the tunnel answers. Nothing about the instance
//! is cached between requests.

use crate::cloud::{CloudError, SharedCloud};
use crate::config::Config;
use crate::error::{error_response, ErrorFormat, ProxyError};
use crate::probe::{probe_url, TunnelProbe};
use crate::teardown::{IdleTeardown, TeardownOutcome};
use crate::transport::{target_url, Forwarded, PoolConfig, Transport};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Path suffix of the daemon's running-container listing
pub const CONTAINER_LIST_SUFFIX: &str = "/containers/json";

/// Path suffix of requests after which idle teardown is evaluated
pub const STOP_SUFFIX: &str = "/stop";

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Values the request handler needs about the managed instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub instance_name: String,
    pub zone: String,
    /// Daemon port inside the instance
    pub docker_port: u16,
    /// Local end of the tunnel
    pub tunnel_port: u16,
    /// Host the local end of the tunnel is reached on
    pub tunnel_host: String,
    pub error_format: ErrorFormat,
}

impl ProxySettings {
    pub fn new(instance_name: &str, zone: &str, docker_port: u16, tunnel_port: u16) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            zone: zone.to_string(),
            docker_port,
            tunnel_port,
            tunnel_host: "localhost".to_string(),
            error_format: ErrorFormat::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            instance_name: config.instance.name.clone(),
            zone: config.instance.zone.clone(),
            docker_port: config.instance.docker_port,
            tunnel_port: config.instance.tunnel_port,
            tunnel_host: config.server.tunnel_host.clone(),
            error_format: config.server.error_format,
        }
    }

    pub fn with_tunnel_host(mut self, host: &str) -> Self {
        self.tunnel_host = host.to_string();
        self
    }

    pub fn with_error_format(mut self, format: ErrorFormat) -> Self {
        self.error_format = format;
        self
    }

    /// `host:port` of the local tunnel end
    pub fn tunnel_authority(&self) -> String {
        format!("{}:{}", self.tunnel_host, self.tunnel_port)
    }
}

/// Drives one request through provisioning, tunneling, forwarding and
/// teardown.
///
/// Instance creation and tunnel opening run under a single provisioning
/// lock. The proxy manages exactly one (name, zone) pair, so concurrent
/// requests that all find the instance missing or the tunnel down queue up
/// behind the first one, then see its result instead of repeating the work.
pub struct Orchestrator {
    cloud: SharedCloud,
    probe: TunnelProbe,
    transport: Transport,
    teardown: IdleTeardown,
    settings: ProxySettings,
    provision_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(cloud: SharedCloud, settings: ProxySettings, pool_config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            teardown: IdleTeardown::new(Arc::clone(&cloud)),
            cloud,
            probe: TunnelProbe::new(),
            transport: Transport::new(pool_config),
            settings,
            provision_lock: Mutex::new(()),
        })
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Handle a request, turning any failure into an error response
    pub async fn handle(self: &Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        debug!(method = %req.method(), uri = %req.uri(), request_id = %request_id, "Incoming request");

        match self.serve(req, &request_id).await {
            Ok(response) => response,
            Err(e) => {
                error!(request_id = %request_id, error = %e, "Request failed");
                error_response(self.settings.error_format, e.to_string())
            }
        }
    }

    async fn serve(
        self: &Arc<Self>,
        req: Request<Incoming>,
        request_id: &str,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(String::from);

        let address = self.lookup_address().await.map_err(ProxyError::Lookup)?;
        let instance_running = !address.is_empty();

        // Nothing can be running without an instance; don't boot one to say so
        if req.method() == Method::GET && path.ends_with(CONTAINER_LIST_SUFFIX) && !instance_running {
            debug!(request_id, path = %path, "No instance running, answering empty container list");
            return Ok(json_response(StatusCode::OK, Bytes::from_static(b"[]")));
        }

        self.ensure_ready(address, request_id).await?;

        let target = target_url(
            &self.settings.tunnel_host,
            self.settings.tunnel_port,
            &path,
            query.as_deref(),
        );
        let method = req.method().clone();

        let upstream = match self.transport.forward(&target, req).await? {
            Forwarded::Response(upstream) => upstream,
            Forwarded::Unsupported => {
                warn!(request_id, method = %method, path = %path, "Method not forwarded");
                return Ok(json_response(StatusCode::OK, Bytes::new()));
            }
        };

        let status = upstream.status();
        debug!(request_id, target = %target, status = %status, "Upstream responded");
        let body = upstream.into_body();

        if !path.ends_with(STOP_SUFFIX) {
            return Ok(json_body_response(status, body));
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.spawn_teardown(done_rx, request_id.to_string());
        Ok(json_body_response(status, NotifyOnEnd::new(body, done_tx).boxed()))
    }

    /// Make sure an instance exists and the tunnel answers.
    ///
    /// A running instance with a live tunnel needs no lock, so healthy
    /// traffic never waits behind a slow provisioning.
    async fn ensure_ready(&self, address: String, request_id: &str) -> Result<(), ProxyError> {
        let instance_running = !address.is_empty();
        let tunnel_url = probe_url(&self.settings.tunnel_host, self.settings.tunnel_port);
        if instance_running && self.probe.is_active(&tunnel_url).await {
            return Ok(());
        }
        self.provision(instance_running, address, &tunnel_url, request_id).await
    }

    /// Create the instance and open the tunnel as needed.
    ///
    /// Runs under the provisioning lock so racing requests collapse into one
    /// creation and one tunnel.
    async fn provision(
        &self,
        instance_running: bool,
        mut address: String,
        tunnel_url: &str,
        request_id: &str,
    ) -> Result<(), ProxyError> {
        let _guard = self.provision_lock.lock().await;

        if !instance_running {
            // Another request may have created it while we waited
            address = self.lookup_address().await.map_err(ProxyError::Lookup)?;
            if address.is_empty() {
                info!(
                    request_id,
                    instance = %self.settings.instance_name,
                    zone = %self.settings.zone,
                    "No instance running, creating one"
                );
                address = self
                    .cloud
                    .create_instance(&self.settings.instance_name, &self.settings.zone)
                    .await
                    .map_err(ProxyError::Create)?;
                info!(request_id, address = %address, "Instance created");
            }
        }

        // Re-probe: a request ahead of us may have opened it
        if !self.probe.is_active(tunnel_url).await {
            info!(
                request_id,
                address = %address,
                local_port = self.settings.tunnel_port,
                remote_port = self.settings.docker_port,
                "Tunnel inactive, opening"
            );
            let handle = self
                .cloud
                .open_secure_tunnel(
                    &self.settings.instance_name,
                    &self.settings.zone,
                    self.settings.tunnel_port,
                    self.settings.docker_port,
                )
                .await
                .map_err(ProxyError::Tunnel)?;
            info!(request_id, launcher_pid = ?handle.launcher_pid, "Tunnel opened");
        }

        Ok(())
    }

    /// Resolve the instance address; a missing instance is an empty address
    async fn lookup_address(&self) -> Result<String, CloudError> {
        match self
            .cloud
            .public_ip_address(&self.settings.instance_name, &self.settings.zone)
            .await
        {
            Ok(address) => Ok(address),
            Err(e) if e.is_not_found() => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Evaluate idle teardown once the response body has been written
    fn spawn_teardown(self: &Arc<Self>, done: oneshot::Receiver<()>, request_id: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            // A dropped sender also means the response is finished
            let _ = done.await;

            let settings = &this.settings;
            match this
                .teardown
                .run(&settings.tunnel_authority(), &settings.instance_name, &settings.zone)
                .await
            {
                Ok(TeardownOutcome::Deleted) => {
                    info!(request_id = %request_id, instance = %settings.instance_name, "Instance idle, deleted");
                }
                Ok(TeardownOutcome::Busy { containers }) => {
                    debug!(request_id = %request_id, containers, "Instance still has running containers");
                }
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "Idle teardown failed");
                }
            }
        });
    }
}

fn json_response(status: StatusCode, body: Bytes) -> Response<ProxyBody> {
    json_body_response(status, Full::new(body).map_err(|never| match never {}).boxed())
}

fn json_body_response(status: StatusCode, body: ProxyBody) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(body)
        .expect("valid response with StatusCode and static header")
}

/// Response body that signals once it has been fully written or dropped
struct NotifyOnEnd {
    inner: ProxyBody,
    done: Option<oneshot::Sender<()>>,
}

impl NotifyOnEnd {
    fn new(inner: ProxyBody, done: oneshot::Sender<()>) -> Self {
        Self {
            inner,
            done: Some(done),
        }
    }

    fn finish(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl Body for NotifyOnEnd {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(poll, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.finish();
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for NotifyOnEnd {
    fn drop(&mut self) {
        self.finish();
    }
}

/// The reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    orchestrator: Arc<Orchestrator>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        cloud: SharedCloud,
        settings: ProxySettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, cloud, settings, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        cloud: SharedCloud,
        settings: ProxySettings,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            orchestrator: Orchestrator::new(cloud, settings, pool_config),
            shutdown_rx,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let orchestrator = Arc::clone(&self.orchestrator);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, orchestrator).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let stats = self.orchestrator.transport().stats();
                        info!(
                            forwarded = stats.get_total_requests(),
                            unsupported = stats.get_unsupported(),
                            "Proxy server shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    orchestrator: Arc<Orchestrator>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let orchestrator = Arc::clone(&orchestrator);
        async move { Ok::<_, hyper::Error>(orchestrator.handle(req).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;

    #[test]
    fn test_settings_from_config() {
        let config: Config = toml::from_str(
            r#"
[server]
tunnel_host = "127.0.0.1"
error_format = "json"

[instance]
name = "builder"
zone = "asia-east1-a"
docker_port = 2376
tunnel_port = 2377
"#,
        )
        .unwrap();

        let settings = ProxySettings::from_config(&config);
        assert_eq!(settings.instance_name, "builder");
        assert_eq!(settings.zone, "asia-east1-a");
        assert_eq!(settings.docker_port, 2376);
        assert_eq!(settings.tunnel_port, 2377);
        assert_eq!(settings.error_format, ErrorFormat::Json);
        assert_eq!(settings.tunnel_authority(), "127.0.0.1:2377");
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ProxySettings::new("vm", "zone-a", 8000, 8001);
        assert_eq!(settings.tunnel_host, "localhost");
        assert_eq!(settings.error_format, ErrorFormat::Legacy);
        assert_eq!(settings.tunnel_authority(), "localhost:8001");
    }

    #[tokio::test]
    async fn test_notify_on_end_fires_after_last_frame() {
        let (tx, mut rx) = oneshot::channel();
        let inner = Full::new(Bytes::from_static(b"done"))
            .map_err(|never| match never {})
            .boxed();
        let body = NotifyOnEnd::new(inner, tx);

        assert!(rx.try_recv().is_err());
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"done");
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_notify_on_end_fires_on_drop() {
        let (tx, rx) = oneshot::channel();
        let inner = Empty::<Bytes>::new().map_err(|never| match never {}).boxed();
        drop(NotifyOnEnd::new(inner, tx));
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_json_response_headers() {
        let response = json_response(StatusCode::OK, Bytes::from_static(b"[]"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"[]");
    }

    #[tokio::test]
    async fn test_healthy_tunnel_skips_provisioning_lock() {
        use crate::cloud::fake::{CallKind, FakeCloud};
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let daemon = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&daemon)
            .await;

        let cloud = Arc::new(FakeCloud::new().with_instance("10.0.0.2"));
        let settings = ProxySettings::new("vm", "zone-a", 8000, daemon.address().port())
            .with_tunnel_host("127.0.0.1");
        let orchestrator = Orchestrator::new(cloud.clone(), settings, PoolConfig::default());

        // Simulate a slow provisioning holding the lock
        let _guard = orchestrator.provision_lock.lock().await;

        let ready = tokio::time::timeout(
            Duration::from_secs(2),
            orchestrator.ensure_ready("10.0.0.2".to_string(), "req-1"),
        )
        .await;

        assert!(matches!(ready, Ok(Ok(()))));
        assert_eq!(cloud.count(CallKind::OpenSecureTunnel), 0);
    }

    #[tokio::test]
    async fn test_dead_tunnel_waits_for_provisioning_lock() {
        use crate::cloud::fake::FakeCloud;

        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let cloud = Arc::new(FakeCloud::new().with_instance("10.0.0.2"));
        let settings = ProxySettings::new("vm", "zone-a", 8000, port).with_tunnel_host("127.0.0.1");
        let orchestrator = Orchestrator::new(cloud, settings, PoolConfig::default());

        let _guard = orchestrator.provision_lock.lock().await;

        let ready = tokio::time::timeout(
            Duration::from_millis(300),
            orchestrator.ensure_ready("10.0.0.2".to_string(), "req-2"),
        )
        .await;

        assert!(ready.is_err(), "tunnel reopen must queue behind the lock");
    }
}
