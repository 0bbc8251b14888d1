//! Shared helpers for integration tests: a fake Docker daemon and a raw
//! HTTP/1.1 client

#![allow(dead_code)]

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A request as the fake daemon received it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    /// Path plus query string
    pub uri: String,
    pub content_type: Option<String>,
    pub body: String,
}

/// State shared between a test and its fake daemon
#[derive(Default)]
pub struct DaemonState {
    requests: Mutex<Vec<RecordedRequest>>,
    listing: Mutex<String>,
}

impl DaemonState {
    pub fn new(listing: &str) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            listing: Mutex::new(listing.to_string()),
        })
    }

    pub fn set_listing(&self, listing: &str) {
        *self.listing.lock() = listing.to_string();
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Requests other than the container listings used for probing
    pub fn forwarded(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| !r.uri.ends_with("/containers/json"))
            .collect()
    }
}

async fn handle(state: Arc<DaemonState>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_default();
    let content_type = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let body = match req.into_body().collect().await {
        Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
        Err(_) => String::new(),
    };

    let path = uri.split('?').next().unwrap_or_default().to_string();
    state.requests.lock().push(RecordedRequest {
        method: method.clone(),
        uri,
        content_type,
        body,
    });

    let (status, body) = if method == Method::GET && path.ends_with("/containers/json") {
        (StatusCode::OK, state.listing.lock().clone())
    } else if method == Method::POST && path.ends_with("/containers/create") {
        (StatusCode::CREATED, r#"{"Id":"e90e34656806","Warnings":[]}"#.to_string())
    } else if method == Method::POST && path.ends_with("/stop") {
        (StatusCode::NO_CONTENT, String::new())
    } else if path.ends_with("/version") {
        (StatusCode::OK, r#"{"Version":"1.6"}"#.to_string())
    } else {
        (StatusCode::NOT_FOUND, r#"{"message":"page not found"}"#.to_string())
    };

    Ok(Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap())
}

/// Serve the fake daemon on an already bound listener.
///
/// Binding synchronously lets a tunnel hook make the port reachable before
/// the proxy forwards anything.
pub fn serve_daemon(listener: std::net::TcpListener, state: Arc<DaemonState>) {
    listener.set_nonblocking(true).unwrap();
    let listener = tokio::net::TcpListener::from_std(listener).unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(Arc::clone(&state), req));
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
}

/// Start the fake daemon on `port`
pub fn start_daemon(port: u16, state: Arc<DaemonState>) {
    let listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    serve_daemon(listener, state);
}

/// A port nothing is listening on
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for a port to become available (server listening)
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send an HTTP/1.1 request and read the whole response
pub async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let body = body.unwrap_or("");
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        port,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

pub async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_request(port, "GET", path, None).await
}

pub async fn http_post(port: u16, path: &str, body: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_request(port, "POST", path, Some(body)).await
}

/// Body of a raw HTTP response
pub fn response_body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
