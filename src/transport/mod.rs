//! Request/response exchange with the VMM API.
//!
//! Every endpoint lives beneath one fixed API root and is reachable only
//! through the per-VM Unix socket. The transport performs no retries and
//! keeps no per-call state; serialization of calls against one VM is the
//! monitor's job, not the transport's.

mod unix;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::Method;

use crate::errors::Result;

pub use unix::UnixTransport;

/// Fixed prefix of every VMM API endpoint.
pub const API_ROOT: &str = "/api/v1";

/// VMM API endpoint suffixes.
pub mod endpoints {
    pub const VMM_PING: &str = "vmm.ping";
    pub const VMM_SHUTDOWN: &str = "vmm.shutdown";
    pub const VM_CREATE: &str = "vm.create";
    pub const VM_BOOT: &str = "vm.boot";
    pub const VM_SHUTDOWN: &str = "vm.shutdown";
    pub const VM_REBOOT: &str = "vm.reboot";
    pub const VM_PAUSE: &str = "vm.pause";
    pub const VM_RESUME: &str = "vm.resume";
    pub const VM_INFO: &str = "vm.info";
}

/// One verb/endpoint/JSON exchange with the VMM.
///
/// A status of 200 or 204 is success and yields the (possibly empty)
/// response body. Any other status maps to `MonitorError::HttpStatus`,
/// lower-level failures to `MonitorError::Transport`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, method: Method, endpoint: &str, body: Option<Bytes>) -> Result<Bytes>;
}

/// Observer for raw request/response traffic, attached to a transport.
///
/// Replaces in-request trace logic: the transport calls out, the observer
/// decides what to record.
pub trait WireObserver: Send + Sync {
    fn on_request(&self, method: &Method, endpoint: &str, body: &[u8]);
    fn on_response(&self, endpoint: &str, status: u16, body: &[u8]);
}

/// Default observer that mirrors traffic to `tracing` at trace level.
pub struct TracingObserver;

impl WireObserver for TracingObserver {
    fn on_request(&self, method: &Method, endpoint: &str, body: &[u8]) {
        tracing::trace!(%method, endpoint, body_len = body.len(), "VMM API request");
    }

    fn on_response(&self, endpoint: &str, status: u16, body: &[u8]) {
        tracing::trace!(
            endpoint,
            status,
            body = %String::from_utf8_lossy(body),
            "VMM API response"
        );
    }
}
