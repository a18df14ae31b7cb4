//! Translation of a `VmConfig` into the VMM's wire document.
//!
//! The wire document is sparse by design: a field appears only when the
//! corresponding configuration facet is present. Field names are part of
//! the VMM API compatibility contract and must not change.
//!
//! Translation is pure apart from two host lookups: resolving a tap
//! interface name to its OS index (reported through the side-channel
//! `if_indexes` output, not the document) and checking that a host PCI
//! device exists under sysfs.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{ChardevBackend, HostDeviceConfig, NetKind, VmConfig};
use crate::errors::{MonitorError, Result};

const SYSFS_PCI_ROOT: &str = "/sys/bus/pci/devices";

/// The JSON object sent to the VMM on `vm.create`.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<CpusWire>,
    pub console: ConsoleWire,
    pub serial: ConsoleWire,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<PathWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<CmdlineWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initramfs: Option<PathWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disks: Option<Vec<DiskWire>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net: Option<Vec<NetWire>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<DeviceWire>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpusWire {
    pub boot_vcpus: u32,
    pub max_vcpus: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleWire {
    pub mode: ConsoleMode,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsoleMode {
    Pty,
    #[default]
    Null,
}

impl Default for ConsoleWire {
    fn default() -> Self {
        ConsoleWire {
            mode: ConsoleMode::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryWire {
    /// Guest memory size in bytes.
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathWire {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdlineWire {
    pub args: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskWire {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetWire {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vhost_socket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vhost_user: Option<bool>,
    /// Descriptor numbers the VMM child inherited for this device.
    pub fds: Vec<RawFd>,
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iommu: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_queues: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceWire {
    /// Host PCI sysfs path.
    pub path: String,
}

/// Builds wire documents from VM configurations.
///
/// The sysfs root is injectable so host-device translation can be tested
/// against a scratch directory.
#[derive(Debug, Clone)]
pub struct Translator {
    sysfs_pci_root: PathBuf,
}

impl Default for Translator {
    fn default() -> Self {
        Translator {
            sysfs_pci_root: PathBuf::from(SYSFS_PCI_ROOT),
        }
    }
}

impl Translator {
    pub fn new() -> Self {
        Translator::default()
    }

    #[cfg(test)]
    fn with_sysfs_pci_root(root: impl Into<PathBuf>) -> Self {
        Translator {
            sysfs_pci_root: root.into(),
        }
    }

    /// Translate `config` into a wire document.
    ///
    /// `net_fds` maps a network device index in `config.nets` to one raw
    /// descriptor number already handed to the VMM child.
    ///
    /// Returns the document plus the OS interface indexes discovered for
    /// tap-backed ethernet devices. Any failure discards the document
    /// being built.
    pub fn translate(
        &self,
        config: &VmConfig,
        net_fds: &[(usize, RawFd)],
    ) -> Result<(WireDocument, Vec<u32>)> {
        let mut doc = WireDocument::default();
        let mut if_indexes = Vec::new();

        if config.boot_vcpus != 0 || config.max_vcpus != 0 {
            doc.cpus = Some(CpusWire {
                boot_vcpus: config.boot_vcpus,
                max_vcpus: config.max_vcpus,
            });
        }

        if config.consoles > 1 {
            return Err(MonitorError::Config(
                "only a single console can be configured for this VM".into(),
            ));
        }
        if config.serials > 1 {
            return Err(MonitorError::Config(
                "only a single serial can be configured for this VM".into(),
            ));
        }
        doc.console = console_wire(config.consoles);
        doc.serial = console_wire(config.serials);

        if config.memory_kib != 0 {
            doc.memory = Some(MemoryWire {
                size: config.memory_kib * 1024,
            });
        }

        let kernel = config
            .kernel
            .as_ref()
            .ok_or_else(|| MonitorError::Config("kernel image path is not defined".into()))?;
        doc.kernel = Some(PathWire {
            path: kernel.clone(),
        });

        if let Some(args) = &config.cmdline {
            doc.cmdline = Some(CmdlineWire { args: args.clone() });
        }
        if let Some(path) = &config.initramfs {
            doc.initramfs = Some(PathWire { path: path.clone() });
        }

        if !config.disks.is_empty() {
            let mut disks = Vec::new();
            for disk in &config.disks {
                let Some(path) = disk.path.as_ref().filter(|p| !p.as_os_str().is_empty()) else {
                    continue;
                };
                disks.push(DiskWire {
                    path: path.clone(),
                    readonly: disk.readonly.then_some(true),
                });
            }
            doc.disks = Some(disks);
        }

        if !config.nets.is_empty() {
            let mut nets = Vec::new();
            for (index, net) in config.nets.iter().enumerate() {
                nets.push(self.translate_net(index, net, net_fds, &mut if_indexes)?);
            }
            doc.net = Some(nets);
        }

        if !config.host_devices.is_empty() {
            doc.devices = Some(self.translate_host_devices(&config.host_devices)?);
        }

        Ok((doc, if_indexes))
    }

    fn translate_net(
        &self,
        index: usize,
        net: &crate::config::NetConfig,
        net_fds: &[(usize, RawFd)],
        if_indexes: &mut Vec<u32>,
    ) -> Result<NetWire> {
        let mut wire = NetWire::default();

        match &net.kind {
            NetKind::Ethernet => {
                if let [ip] = net.guest_ips.as_slice() {
                    wire.ip = Some(ip.address.to_string());
                    wire.mask = Some(netmask(ip.prefix)?.to_string());
                }
                if let Some(ifname) = &net.ifname {
                    let ifindex = nix::net::if_::if_nametoindex(ifname.as_str()).map_err(|e| {
                        MonitorError::Config(format!(
                            "failed to resolve index of interface '{ifname}': {e}"
                        ))
                    })?;
                    if_indexes.push(ifindex);
                }
            }
            NetKind::VhostUser { backend } => match backend {
                ChardevBackend::UnixSocket(path) => {
                    wire.vhost_socket = Some(path.display().to_string());
                    wire.vhost_user = Some(true);
                }
                ChardevBackend::Tcp { .. } => {
                    return Err(MonitorError::Config(
                        "vhost-user network devices require a Unix socket backend".into(),
                    ));
                }
            },
            // Tap creation and bridge attachment happen in the network
            // driver before the VMM is spawned.
            NetKind::Network | NetKind::Bridge => {}
            other => {
                return Err(MonitorError::Config(format!(
                    "network device type {other:?} is not supported by this VMM"
                )));
            }
        }

        wire.fds = net_fds
            .iter()
            .filter(|(dev, _)| *dev == index)
            .map(|(_, fd)| *fd)
            .collect();
        wire.mac = net.mac.clone();

        if net.iommu {
            wire.iommu = Some(true);
        }
        if net.queues != 0 {
            wire.num_queues = Some(net.queues);
        }
        if net.rx_queue_size != 0 || net.tx_queue_size != 0 {
            if net.rx_queue_size != net.tx_queue_size {
                return Err(MonitorError::Config(format!(
                    "virtio rx_queue_size {} does not match tx_queue_size {}",
                    net.rx_queue_size, net.tx_queue_size
                )));
            }
            wire.queue_size = Some(net.rx_queue_size);
        }

        Ok(wire)
    }

    fn translate_host_devices(&self, devices: &[HostDeviceConfig]) -> Result<Vec<DeviceWire>> {
        let mut out = Vec::new();
        for device in devices {
            // Only PCI passthrough is expressible on the wire.
            let HostDeviceConfig::Pci { address } = device else {
                continue;
            };
            let path = address.sysfs_path(&self.sysfs_pci_root);
            if !Path::new(&path).exists() {
                return Err(MonitorError::DeviceMissing(format!(
                    "host pci device {path} not found"
                )));
            }
            out.push(DeviceWire { path });
        }
        Ok(out)
    }
}

fn console_wire(count: usize) -> ConsoleWire {
    ConsoleWire {
        mode: if count > 0 {
            ConsoleMode::Pty
        } else {
            ConsoleMode::Null
        },
    }
}

/// IPv4 netmask for a prefix length.
fn netmask(prefix: u8) -> Result<Ipv4Addr> {
    if prefix > 32 {
        return Err(MonitorError::Config(format!(
            "cannot translate net prefix {prefix} to a netmask"
        )));
    }
    let bits = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    };
    Ok(Ipv4Addr::from(bits))
}
