//! Per-VM monitor: the façade over translation, transport, supervision and
//! thread introspection.
//!
//! Exactly one monitor, one API socket and one VMM process exist per
//! running VM. A single `tokio::sync::Mutex` serializes every transport
//! exchange and every thread-table rebuild against that VM; monitors of
//! distinct VMs share nothing and proceed in parallel.

pub mod supervisor;
pub mod threads;

use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Arc;

use bytes::Bytes;
use hyper::Method;
use tokio::sync::Mutex;

use crate::config::VmConfig;
use crate::errors::{MonitorError, Result};
use crate::runtime::VmRuntime;
use crate::transport::{Transport, UnixTransport, endpoints};
use crate::wire::Translator;

pub use supervisor::RetryPolicy;
pub use threads::{
    AffinityReader, CommReader, IoThreadInfo, ProcfsCommReader, SchedAffinityReader, ThreadRecord,
    ThreadRole, ThreadTable,
};

/// Monitor for one running VM.
pub struct VmmMonitor {
    socket_path: PathBuf,
    pid: u32,
    vm: Arc<VmRuntime>,
    translator: Translator,
    /// The per-VM lock. Held for the full duration of any request or
    /// thread-table refresh.
    state: Mutex<MonitorState>,
}

struct MonitorState {
    transport: Box<dyn Transport>,
    child: Option<Child>,
    threads: ThreadTable,
    comm_reader: Box<dyn CommReader>,
    affinity_reader: Box<dyn AffinityReader>,
}

impl std::fmt::Debug for VmmMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmmMonitor")
            .field("socket_path", &self.socket_path)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl VmmMonitor {
    /// Launch the VMM for `vm` and bring up its monitor.
    ///
    /// Spawns the process with the runtime's pre-opened tap descriptors
    /// handed off (parent copies are closed here), then probes readiness
    /// under the default retry policy. On probe exhaustion the process is
    /// torn down and the monitor never becomes usable.
    pub async fn start(
        vm: Arc<VmRuntime>,
        config: &VmConfig,
        socket_dir: &Path,
    ) -> Result<Arc<VmmMonitor>> {
        VmmMonitor::start_with_policy(vm, config, socket_dir, RetryPolicy::default()).await
    }

    pub async fn start_with_policy(
        vm: Arc<VmRuntime>,
        config: &VmConfig,
        socket_dir: &Path,
        policy: RetryPolicy,
    ) -> Result<Arc<VmmMonitor>> {
        let socket_path = socket_dir.join(format!("{}-socket", vm.name()));

        let descriptors = vm.take_pending_fds();
        let child = supervisor::spawn_vmm(config, &socket_path, &descriptors)?;
        vm.record_passed_fds(&descriptors);
        // The child inherited the descriptors; close the parent copies.
        drop(descriptors);

        let pid = child.id();
        let transport = UnixTransport::new(&socket_path);

        if let Err(e) = supervisor::wait_ready(&transport, &policy).await {
            tracing::error!(vm = vm.name(), pid, error = %e, "VMM never became ready");
            let mut child = child;
            if !supervisor::kill_process(pid) {
                tracing::warn!(pid, "unable to terminate unready VMM process");
            }
            let _ = child.wait();
            remove_socket_file(&socket_path);
            return Err(e);
        }

        tracing::debug!(vm = vm.name(), pid, socket = %socket_path.display(), "monitor started");
        Ok(Arc::new(VmmMonitor {
            socket_path,
            pid,
            vm,
            translator: Translator::new(),
            state: Mutex::new(MonitorState {
                transport: Box::new(transport),
                child: Some(child),
                threads: ThreadTable::default(),
                comm_reader: Box::new(ProcfsCommReader),
                affinity_reader: Box::new(SchedAffinityReader),
            }),
        }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Translate the configuration and ask the VMM to instantiate the
    /// guest. Returns the OS interface indexes discovered for tap-backed
    /// ethernet devices.
    pub async fn create_vm(&self, config: &VmConfig) -> Result<Vec<u32>> {
        let net_fds: Vec<(usize, i32)> = (0..config.nets.len())
            .flat_map(|dev| {
                self.vm
                    .passed_fds_for(dev)
                    .into_iter()
                    .map(move |fd| (dev, fd))
            })
            .collect();
        let (document, if_indexes) = self.translator.translate(config, &net_fds)?;
        let payload =
            serde_json::to_vec(&document).map_err(|e| MonitorError::Config(e.to_string()))?;

        let state = self.state.lock().await;
        state
            .transport
            .request(Method::PUT, endpoints::VM_CREATE, Some(Bytes::from(payload)))
            .await?;
        Ok(if_indexes)
    }

    pub async fn boot_vm(&self) -> Result<()> {
        self.put_no_content(endpoints::VM_BOOT).await
    }

    pub async fn shutdown_vm(&self) -> Result<()> {
        self.put_no_content(endpoints::VM_SHUTDOWN).await
    }

    pub async fn reboot_vm(&self) -> Result<()> {
        self.put_no_content(endpoints::VM_REBOOT).await
    }

    pub async fn suspend_vm(&self) -> Result<()> {
        self.put_no_content(endpoints::VM_PAUSE).await
    }

    pub async fn resume_vm(&self) -> Result<()> {
        self.put_no_content(endpoints::VM_RESUME).await
    }

    /// Ask the VMM process itself to exit.
    pub async fn shutdown_vmm(&self) -> Result<()> {
        self.put_no_content(endpoints::VMM_SHUTDOWN).await
    }

    /// Current VM state as reported by the VMM.
    pub async fn vm_info(&self) -> Result<serde_json::Value> {
        let state = self.state.lock().await;
        let body = state
            .transport
            .request(Method::GET, endpoints::VM_INFO, None)
            .await?;
        serde_json::from_slice(&body).map_err(MonitorError::Parse)
    }

    async fn put_no_content(&self, endpoint: &str) -> Result<()> {
        let state = self.state.lock().await;
        state
            .transport
            .request(Method::PUT, endpoint, None)
            .await
            .map(|_| ())
    }

    /// Reconcile the cached thread table with the VMM's live threads.
    ///
    /// Returns the thread count. When the OS-reported tid set has not
    /// changed the cached table is reused without re-reading any names.
    pub async fn refresh_thread_info(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let MonitorState {
            threads,
            comm_reader,
            ..
        } = &mut *state;
        threads::refresh(self.pid as i32, threads, comm_reader.as_ref())
    }

    /// Snapshot of the classified thread table, optionally refreshed first.
    pub async fn thread_info(&self, refresh: bool) -> Result<Vec<ThreadRecord>> {
        let mut state = self.state.lock().await;
        if refresh {
            let MonitorState {
                threads,
                comm_reader,
                ..
            } = &mut *state;
            threads::refresh(self.pid as i32, threads, comm_reader.as_ref())?;
        }
        Ok(state.threads.records().to_vec())
    }

    /// Affinity records for the VMM's I/O threads, after a forced refresh.
    /// Fails as a whole if any single affinity query fails.
    pub async fn io_threads(&self) -> Result<Vec<IoThreadInfo>> {
        let mut state = self.state.lock().await;
        let MonitorState {
            threads,
            comm_reader,
            affinity_reader,
            ..
        } = &mut *state;
        threads::refresh(self.pid as i32, threads, comm_reader.as_ref())?;
        threads::io_threads(threads, affinity_reader.as_ref())
    }

    /// Tear the VM down: terminate the VMM process, drop the thread table
    /// and remove the socket file. Best effort throughout; idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut child) = state.child.take() {
            let pid = child.id();
            if !supervisor::kill_process(pid) {
                tracing::warn!(pid, "unable to terminate VMM process");
            }
            // Reap so the pid cannot linger as a zombie.
            let _ = child.wait();
        }
        state.threads.clear();
        remove_socket_file(&self.socket_path);
        tracing::debug!(vm = self.vm.name(), "monitor closed");
    }
}

fn remove_socket_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "unable to remove VMM socket file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Transport fake recording endpoints and answering from a script.
    struct ScriptedTransport {
        calls: Arc<SyncMutex<Vec<(Method, String, Option<Bytes>)>>>,
        response: Bytes,
        fail_with_status: Option<u16>,
    }

    impl ScriptedTransport {
        fn ok(response: &str) -> Self {
            ScriptedTransport {
                calls: Arc::new(SyncMutex::new(Vec::new())),
                response: Bytes::from(response.to_string()),
                fail_with_status: None,
            }
        }

        fn failing(status: u16) -> Self {
            ScriptedTransport {
                calls: Arc::new(SyncMutex::new(Vec::new())),
                response: Bytes::new(),
                fail_with_status: Some(status),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn request(
            &self,
            method: Method,
            endpoint: &str,
            body: Option<Bytes>,
        ) -> Result<Bytes> {
            self.calls
                .lock()
                .push((method, endpoint.to_string(), body));
            match self.fail_with_status {
                Some(status) => Err(MonitorError::HttpStatus {
                    status,
                    endpoint: endpoint.to_string(),
                }),
                None => Ok(self.response.clone()),
            }
        }
    }

    struct StaticComm;
    impl CommReader for StaticComm {
        fn comm(&self, _pid: i32, _tid: i32) -> std::io::Result<String> {
            Ok("ch_vmm_main".into())
        }
    }

    struct StaticAffinity(AtomicU32);
    impl AffinityReader for StaticAffinity {
        fn affinity(&self, _tid: i32) -> Result<Vec<u8>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0b11])
        }
    }

    fn test_monitor(transport: Box<dyn Transport>) -> VmmMonitor {
        VmmMonitor {
            socket_path: PathBuf::from("/tmp/vmmctl-test-socket"),
            pid: std::process::id(),
            vm: VmRuntime::new("test"),
            translator: Translator::new(),
            state: Mutex::new(MonitorState {
                transport,
                child: None,
                threads: ThreadTable::default(),
                comm_reader: Box::new(StaticComm),
                affinity_reader: Box::new(StaticAffinity(AtomicU32::new(0))),
            }),
        }
    }

    #[tokio::test]
    async fn lifecycle_verbs_hit_their_endpoints() {
        let transport = ScriptedTransport::ok("");
        let calls = transport.calls.clone();
        let monitor = test_monitor(Box::new(transport));
        monitor.boot_vm().await.unwrap();
        monitor.suspend_vm().await.unwrap();
        monitor.resume_vm().await.unwrap();
        monitor.reboot_vm().await.unwrap();
        monitor.shutdown_vm().await.unwrap();
        monitor.shutdown_vmm().await.unwrap();

        let calls = calls.lock();
        let endpoints: Vec<&str> = calls.iter().map(|(_, e, _)| e.as_str()).collect();
        assert_eq!(
            endpoints,
            vec![
                "vm.boot",
                "vm.pause",
                "vm.resume",
                "vm.reboot",
                "vm.shutdown",
                "vmm.shutdown"
            ]
        );
        // Every lifecycle verb is a bodyless PUT.
        assert!(
            calls
                .iter()
                .all(|(m, _, body)| *m == Method::PUT && body.is_none())
        );
    }

    #[tokio::test]
    async fn create_vm_puts_translated_document() {
        let transport = ScriptedTransport::ok("");
        let calls = transport.calls.clone();
        let monitor = test_monitor(Box::new(transport));
        let config = VmConfig {
            boot_vcpus: 1,
            max_vcpus: 1,
            kernel: Some(PathBuf::from("/boot/vmlinux")),
            ..VmConfig::default()
        };
        monitor.create_vm(&config).await.unwrap();

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        let (method, endpoint, body) = &calls[0];
        assert_eq!(*method, Method::PUT);
        assert_eq!(endpoint, "vm.create");
        let document: serde_json::Value =
            serde_json::from_slice(body.as_ref().unwrap()).unwrap();
        assert_eq!(document["kernel"]["path"], "/boot/vmlinux");
        assert_eq!(document["cpus"]["boot_vcpus"], 1);
    }

    #[tokio::test]
    async fn create_vm_translation_failure_sends_nothing() {
        let transport = ScriptedTransport::ok("");
        let calls = transport.calls.clone();
        let monitor = test_monitor(Box::new(transport));
        // No kernel: translation fails before any transport activity.
        let err = monitor.create_vm(&VmConfig::default()).await.unwrap_err();
        assert!(matches!(err, MonitorError::Config(_)), "got {err:?}");
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn vm_info_parses_json() {
        let monitor = test_monitor(Box::new(ScriptedTransport::ok("{\"state\":\"Running\"}")));
        let info = monitor.vm_info().await.unwrap();
        assert_eq!(info["state"], "Running");
    }

    #[tokio::test]
    async fn vm_info_rejects_malformed_json() {
        let monitor = test_monitor(Box::new(ScriptedTransport::ok("not json")));
        let err = monitor.vm_info().await.unwrap_err();
        assert!(matches!(err, MonitorError::Parse(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn transport_status_errors_propagate() {
        let monitor = test_monitor(Box::new(ScriptedTransport::failing(500)));
        let err = monitor.boot_vm().await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn thread_refresh_over_own_process() {
        let monitor = test_monitor(Box::new(ScriptedTransport::ok("")));
        let count = monitor.refresh_thread_info().await.unwrap();
        assert!(count >= 1);
        let records = monitor.thread_info(false).await.unwrap();
        assert_eq!(records.len(), count);
        assert!(
            records
                .iter()
                .all(|r| matches!(r.role, ThreadRole::Emulator { .. }))
        );
        // No virtio-named threads in this process.
        assert!(monitor.io_threads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let monitor = test_monitor(Box::new(ScriptedTransport::ok("")));
        monitor.close().await;
        monitor.close().await;
    }
}
