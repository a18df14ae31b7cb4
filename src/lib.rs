//! Control-plane client for a cloud-hypervisor style VMM.
//!
//! One `VmmMonitor` per running guest: it translates the caller's
//! `VmConfig` into the VMM's wire document, launches and supervises the
//! VMM process, exchanges lifecycle commands over the per-VM Unix socket
//! and reconciles the VMM's OS threads into semantic roles (vCPU, I/O,
//! emulator) for scheduling and affinity control.
//!
//! The crate implements neither the VMM nor a general HTTP client; it
//! speaks the minimal verb/endpoint/JSON dialect the VMM API needs.

pub mod config;
pub mod errors;
pub mod monitor;
pub mod runtime;
pub mod transport;
pub mod wire;

pub use config::{
    ChardevBackend, DiskConfig, GuestIp, HostDeviceConfig, NetConfig, NetKind, PciAddress,
    VmConfig,
};
pub use errors::{MonitorError, Result};
pub use monitor::{IoThreadInfo, RetryPolicy, ThreadRecord, ThreadRole, VmmMonitor};
pub use runtime::{NetDescriptor, VmRuntime};
pub use transport::{Transport, TracingObserver, UnixTransport, WireObserver};
pub use wire::{Translator, WireDocument};
