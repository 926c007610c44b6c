#![forbid(unsafe_code)]

use crate::discovery::VmInfoSink;
use crate::domain::{VmId, VmInfo};
use crate::error::Error;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub const VM_INFO_PATH: &str = "/jvms/0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    pub method: Method,
    /// Relative to the gateway base url.
    pub path: String,
    pub payload: Value,
}

impl GatewayRequest {
    pub fn post(path: impl Into<String>, payload: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            payload,
        }
    }

    pub fn put(path: impl Into<String>, payload: Value) -> Self {
        Self {
            method: Method::Put,
            path: path.into(),
            payload,
        }
    }
}

/// Ships collected records to the remote store.
pub trait Gateway: Send + Sync {
    fn send(&self, request: &GatewayRequest) -> Result<(), Error>;
}

/// Logs requests instead of sending them.
#[derive(Debug, Clone)]
pub struct LogGateway {
    base_url: String,
}

impl LogGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl Gateway for LogGateway {
    fn send(&self, request: &GatewayRequest) -> Result<(), Error> {
        let body = serde_json::to_string(&request.payload)?;
        debug!(method = %request.method, url = %self.url(&request.path), %body, "gateway request");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGateway;

impl Gateway for NoopGateway {
    fn send(&self, _: &GatewayRequest) -> Result<(), Error> {
        Ok(())
    }
}

/// Records VM lifecycles through the gateway.
pub struct GatewayVmInfoSink {
    gateway: Arc<dyn Gateway>,
}

impl GatewayVmInfoSink {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }
}

impl VmInfoSink for GatewayVmInfoSink {
    fn vm_started(&self, info: &VmInfo) {
        let result = serde_json::to_value([info])
            .map_err(Error::from)
            .and_then(|payload| {
                self.gateway
                    .send(&GatewayRequest::post(format!("{VM_INFO_PATH}/"), payload))
            });
        if let Err(err) = result {
            warn!(pid = info.pid, vm_id = %info.vm_id, %err, "failed to record vm start");
        }
    }

    fn vm_stopped(&self, vm_id: &VmId, pid: u32, stop_time: u64) {
        let request = GatewayRequest::put(
            format!("{VM_INFO_PATH}/update/jvms/{vm_id}"),
            json!({ "set": { "stopTimeStamp": stop_time } }),
        );
        if let Err(err) = self.gateway.send(&request) {
            warn!(pid, %vm_id, %err, "failed to record vm stop");
        }
    }
}
