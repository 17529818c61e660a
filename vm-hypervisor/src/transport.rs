use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as HyperlocalUri};
use serde_json::Value;
use tracing::trace;

use crate::error::{DriverError, Result};

/// HTTP verbs used by the control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMethod {
    Get,
    Put,
}

impl From<ControlMethod> for Method {
    fn from(method: ControlMethod) -> Self {
        match method {
            ControlMethod::Get => Method::GET,
            ControlMethod::Put => Method::PUT,
        }
    }
}

/// Status code and raw body of a control-socket response.
#[derive(Debug, Clone)]
pub struct ControlResponse {
    pub status: u16,
    pub body: String,
}

impl ControlResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Request/response channel to a hypervisor control socket.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    async fn request(
        &self,
        socket_path: &Path,
        method: ControlMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<ControlResponse>;
}

/// Upper bound on one control request, response body included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP/1.1 over a unix domain socket.
#[derive(Clone)]
pub struct UnixSocketTransport {
    client: Client<UnixConnector, Full<Bytes>>,
    timeout: Duration,
}

impl UnixSocketTransport {
    pub fn new() -> Self {
        Self {
            client: Client::unix(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for UnixSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlTransport for UnixSocketTransport {
    async fn request(
        &self,
        socket_path: &Path,
        method: ControlMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<ControlResponse> {
        let transport_error = |message: String| DriverError::Transport {
            path: socket_path.to_path_buf(),
            message,
        };

        let uri: Uri = HyperlocalUri::new(socket_path, path).into();
        let mut builder = Request::builder()
            .method(Method::from(method))
            .uri(uri)
            .header("accept", "application/json");

        let request_body = match body {
            Some(payload) => {
                builder = builder.header("content-type", "application/json");
                Full::new(Bytes::from(payload.to_string()))
            }
            None => Full::new(Bytes::new()),
        };

        let request = builder
            .body(request_body)
            .map_err(|e| transport_error(e.to_string()))?;

        // a wedged hypervisor may accept the connection and never answer
        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| transport_error(e.to_string()))?;

            let status = response.status().as_u16();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| transport_error(e.to_string()))?
                .to_bytes();
            Ok::<_, DriverError>((status, bytes))
        };

        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                transport_error(format!(
                    "no response to {:?} {} within {}ms",
                    method,
                    path,
                    self.timeout.as_millis()
                ))
            })??;

        trace!(status, path, "control socket response");

        Ok(ControlResponse {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}
