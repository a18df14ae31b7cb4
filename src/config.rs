//! Read-only VM configuration model.
//!
//! `VmConfig` is the caller-owned input to the monitor: the translator reads
//! it to build the wire document and the supervisor reads it to resolve the
//! VMM binary. Nothing in this crate mutates it.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Default VMM binary, used when the configuration carries no override.
pub const DEFAULT_VMM_BINARY: &str = "cloud-hypervisor";

/// Static configuration for one guest.
#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    /// vCPUs online at boot.
    pub boot_vcpus: u32,
    /// Maximum hot-pluggable vCPUs.
    pub max_vcpus: u32,
    /// Guest memory in KiB (the wire document carries bytes).
    pub memory_kib: u64,
    /// Kernel image path. Required for translation.
    pub kernel: Option<PathBuf>,
    /// Kernel command line.
    pub cmdline: Option<String>,
    pub initramfs: Option<PathBuf>,
    /// Ordered disk list. Entries without a backing path are skipped.
    pub disks: Vec<DiskConfig>,
    /// Ordered network device list.
    pub nets: Vec<NetConfig>,
    /// Ordered host passthrough device list.
    pub host_devices: Vec<HostDeviceConfig>,
    /// Number of console devices. At most one is supported.
    pub consoles: usize,
    /// Number of serial devices. At most one is supported.
    pub serials: usize,
    /// VMM binary override.
    pub emulator: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct DiskConfig {
    /// Backing file path. `None` (or empty) disks are silently skipped.
    pub path: Option<PathBuf>,
    pub readonly: bool,
}

/// One guest network device.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub kind: NetKind,
    /// MAC address in colon-separated form.
    pub mac: String,
    /// Backing tap interface name on the host, when known.
    pub ifname: Option<String>,
    /// Guest-side addresses. Exactly one triggers ip/mask emission.
    pub guest_ips: Vec<GuestIp>,
    pub iommu: bool,
    /// virtio queue pair count; 0 means unspecified.
    pub queues: u32,
    /// virtio rx queue depth; 0 means unspecified.
    pub rx_queue_size: u32,
    /// virtio tx queue depth; 0 means unspecified.
    pub tx_queue_size: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            kind: NetKind::Ethernet,
            mac: String::new(),
            ifname: None,
            guest_ips: Vec::new(),
            iommu: false,
            queues: 0,
            rx_queue_size: 0,
            tx_queue_size: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetKind {
    /// Host-side tap created by the integrator; guest IP configured here.
    Ethernet,
    /// vhost-user backend. Only a filesystem socket is supported.
    VhostUser { backend: ChardevBackend },
    /// Tap setup happens in the network driver; nothing device-specific
    /// to translate.
    Network,
    /// Same as `Network`: the bridge attachment is prepared elsewhere.
    Bridge,
    /// macvtap. Not supported by the VMM wire format.
    Direct,
    /// Userspace SLIRP. Not supported by the VMM wire format.
    User,
}

/// Character-device backend for vhost-user network devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChardevBackend {
    UnixSocket(PathBuf),
    Tcp { host: String, port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestIp {
    pub address: Ipv4Addr,
    /// Network prefix length, at most 32.
    pub prefix: u8,
}

/// Host device to pass through. Only PCI entries are translated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostDeviceConfig {
    Pci { address: PciAddress },
    Usb { vendor: u16, product: u16 },
}

/// A host PCI address, `dddd:bb:ss.f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn new(domain: u16, bus: u8, slot: u8, function: u8) -> Self {
        PciAddress {
            domain,
            bus,
            slot,
            function,
        }
    }

    /// Sysfs directory for this device under `root`, with the trailing
    /// slash the VMM wire format expects.
    pub fn sysfs_path(&self, root: &Path) -> String {
        format!("{}/{}/", root.display(), self)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}
