//! Error handling and error responses for the proxy

use crate::cloud::CloudError;
use crate::transport::TransportError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures that abort a proxied request
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to resolve instance address: {0}")]
    Lookup(#[source] CloudError),

    #[error("failed to create instance: {0}")]
    Create(#[source] CloudError),

    #[error("failed to open tunnel: {0}")]
    Tunnel(#[source] CloudError),

    #[error("failed to forward request: {0}")]
    Forward(#[from] TransportError),
}

/// Body format used for failed requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorFormat {
    /// `{'error': '<message>'}` - single-quoted, what existing clients expect
    #[default]
    Legacy,
    /// `{"error":"<message>"}` - valid JSON
    Json,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl ErrorFormat {
    /// Render the body for an error message
    pub fn render(&self, message: &str) -> String {
        match self {
            ErrorFormat::Legacy => format!("{{'error': '{}'}}", message),
            ErrorFormat::Json => serde_json::to_string(&ErrorBody { error: message })
                .unwrap_or_else(|_| format!(r#"{{"error":"{}"}}"#, message.replace('"', "\\\""))),
        }
    }
}

/// Create a 500 response carrying `message`
pub fn error_response(
    format: ErrorFormat,
    message: impl AsRef<str>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format.render(message.as_ref());

    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
