//! Per-VM runtime object shared between the caller and the monitor.
//!
//! The runtime holds what the static configuration cannot: the pre-opened
//! tap descriptors the integrator created for each network device. The
//! supervisor hands them to the VMM child at spawn time and closes the
//! parent copies; the translator only ever sees the raw numbers, which stay
//! valid inside the child.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;

/// A pre-opened tap descriptor bound to one network device.
#[derive(Debug)]
pub struct NetDescriptor {
    /// Index of the owning device in `VmConfig::nets`.
    pub device: usize,
    pub fd: OwnedFd,
}

impl NetDescriptor {
    pub fn new(device: usize, fd: OwnedFd) -> Self {
        NetDescriptor { device, fd }
    }
}

/// Shared per-VM runtime state.
#[derive(Debug)]
pub struct VmRuntime {
    name: String,
    /// Descriptors waiting to be handed to the VMM child.
    pending_fds: Mutex<Vec<NetDescriptor>>,
    /// Raw numbers of descriptors already handed off, per device index.
    /// Only the numbers survive the handoff; the parent copies are closed.
    passed_fds: Mutex<Vec<(usize, RawFd)>>,
}

impl VmRuntime {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(VmRuntime {
            name: name.into(),
            pending_fds: Mutex::new(Vec::new()),
            passed_fds: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a pre-opened tap descriptor for a network device.
    pub fn push_net_fd(&self, device: usize, fd: OwnedFd) {
        self.pending_fds.lock().push(NetDescriptor::new(device, fd));
    }

    /// Take every pending descriptor for handoff to the child process.
    pub(crate) fn take_pending_fds(&self) -> Vec<NetDescriptor> {
        std::mem::take(&mut *self.pending_fds.lock())
    }

    /// Record the raw numbers of descriptors the child inherited. The
    /// owned descriptors must be dropped by the caller right after this.
    pub(crate) fn record_passed_fds(&self, fds: &[NetDescriptor]) {
        let mut passed = self.passed_fds.lock();
        passed.extend(fds.iter().map(|d| (d.device, d.fd.as_raw_fd())));
    }

    /// Raw descriptor numbers handed to the child for one device, in
    /// registration order. Possibly empty.
    pub fn passed_fds_for(&self, device: usize) -> Vec<RawFd> {
        self.passed_fds
            .lock()
            .iter()
            .filter(|(dev, _)| *dev == device)
            .map(|(_, fd)| *fd)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_fd() -> OwnedFd {
        let (r, w) = nix::unistd::pipe().expect("pipe");
        drop(w);
        r
    }

    #[test]
    fn fds_move_from_pending_to_passed() {
        let vm = VmRuntime::new("test");
        vm.push_net_fd(0, pipe_fd());
        vm.push_net_fd(1, pipe_fd());
        vm.push_net_fd(0, pipe_fd());

        let pending = vm.take_pending_fds();
        assert_eq!(pending.len(), 3);
        assert!(vm.take_pending_fds().is_empty());

        let raw0: Vec<RawFd> = pending
            .iter()
            .filter(|d| d.device == 0)
            .map(|d| d.fd.as_raw_fd())
            .collect();
        vm.record_passed_fds(&pending);
        drop(pending);

        assert_eq!(vm.passed_fds_for(0), raw0);
        assert_eq!(vm.passed_fds_for(1).len(), 1);
        assert!(vm.passed_fds_for(2).is_empty());
    }

    #[test]
    fn raw_numbers_survive_close() {
        let vm = VmRuntime::new("test");
        let fd = pipe_fd();
        let raw = fd.as_raw_fd();
        vm.push_net_fd(0, fd);

        let pending = vm.take_pending_fds();
        vm.record_passed_fds(&pending);
        // Closing the parent copy must not lose the recorded number.
        drop(pending);
        assert_eq!(vm.passed_fds_for(0), vec![raw]);
    }
}
