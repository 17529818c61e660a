//! In-memory control transport that records requests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::Result;
use crate::transport::{ControlMethod, ControlResponse, ControlTransport};

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub socket_path: PathBuf,
    pub method: ControlMethod,
    pub path: String,
    pub body: Option<Value>,
}

/// Accepts every request with 204 unless told otherwise.
///
/// `GET /machine-config` echoes the last machine config PUT to the same
/// socket, mimicking the real API.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<RecordedCall>>,
    failures: Mutex<HashMap<String, (u16, String)>>,
    machine_configs: Mutex<HashMap<PathBuf, Value>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request to `path` fail with the given status and body.
    pub fn fail_on(&self, path: &str, status: u16, body: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(path.to_string(), (status, body.to_string()));
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, socket_path: &Path) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.socket_path == socket_path)
            .collect()
    }

    /// Action types sent to `/actions` on any socket, in order.
    pub fn actions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.path == "/actions")
            .filter_map(|c| c.body)
            .filter_map(|b| b["action_type"].as_str().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl ControlTransport for MockTransport {
    async fn request(
        &self,
        socket_path: &Path,
        method: ControlMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<ControlResponse> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                socket_path: socket_path.to_path_buf(),
                method,
                path: path.to_string(),
                body: body.clone(),
            });
        }

        let failure = self
            .failures
            .lock()
            .ok()
            .and_then(|f| f.get(path).cloned());
        if let Some((status, body)) = failure {
            return Ok(ControlResponse { status, body });
        }

        if path == "/machine-config" {
            let mut configs = match self.machine_configs.lock() {
                Ok(configs) => configs,
                Err(poisoned) => poisoned.into_inner(),
            };
            match method {
                ControlMethod::Get => {
                    let config = configs
                        .get(socket_path)
                        .cloned()
                        .unwrap_or_else(|| json!({ "vcpu_count": 1, "mem_size_mib": 128, "smt": false }));
                    return Ok(ControlResponse {
                        status: 200,
                        body: config.to_string(),
                    });
                }
                _ => {
                    if let Some(body) = body {
                        configs.insert(socket_path.to_path_buf(), body);
                    }
                }
            }
        }

        Ok(ControlResponse {
            status: 204,
            body: String::new(),
        })
    }
}
