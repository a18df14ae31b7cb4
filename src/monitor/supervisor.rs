//! VMM process supervision: spawn, readiness probing, termination.
//!
//! Spawning is non-blocking with respect to guest boot: it returns once the
//! child exists. Whether the child can actually serve API calls is decided
//! by the readiness probe, a bounded retry loop around `GET vmm.ping`.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use hyper::Method;

use crate::config::{DEFAULT_VMM_BINARY, VmConfig};
use crate::errors::{MonitorError, Result};
use crate::runtime::NetDescriptor;
use crate::transport::{Transport, endpoints};

/// Bounded retry policy for the readiness probe.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            delay: Duration::from_millis(100),
        }
    }
}

/// Resolve the VMM binary: configuration override, else the fixed default.
pub(crate) fn vmm_binary(config: &VmConfig) -> PathBuf {
    config
        .emulator
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_VMM_BINARY))
}

/// Spawn the VMM with its API socket flag, handing over the pre-opened tap
/// descriptors.
///
/// The descriptors keep their numbers in the child; only `FD_CLOEXEC` is
/// cleared. The caller still owns the parent copies and must close them
/// once the child exists.
pub(crate) fn spawn_vmm(
    config: &VmConfig,
    socket_path: &Path,
    descriptors: &[NetDescriptor],
) -> Result<Child> {
    let binary = vmm_binary(config);

    if let Some(dir) = socket_path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| {
            MonitorError::Process(format!(
                "cannot create socket directory '{}': {e}",
                dir.display()
            ))
        })?;
    }

    let mut cmd = Command::new(&binary);
    cmd.arg("--api-socket").arg(socket_path);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());

    let raw_fds: Vec<i32> = descriptors
        .iter()
        .map(|d| std::os::fd::AsRawFd::as_raw_fd(&d.fd))
        .collect();
    if !raw_fds.is_empty() {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe fcntl calls run in the child
        // before exec.
        unsafe {
            cmd.pre_exec(move || {
                for &fd in &raw_fds {
                    if libc::fcntl(fd, libc::F_SETFD, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    let child = cmd.spawn().map_err(|e| {
        tracing::error!(binary = %binary.display(), error = %e, "failed to spawn VMM");
        MonitorError::Process(format!("failed to spawn VMM '{}': {e}", binary.display()))
    })?;

    tracing::debug!(
        binary = %binary.display(),
        pid = child.id(),
        socket = %socket_path.display(),
        "VMM process spawned"
    );
    Ok(child)
}

/// Probe the VMM API until it answers a ping or the policy is exhausted.
///
/// Exhaustion is fatal for the monitor being brought up; the caller must
/// tear the process down and not use the monitor.
pub(crate) async fn wait_ready(transport: &dyn Transport, policy: &RetryPolicy) -> Result<()> {
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        match transport
            .request(Method::GET, endpoints::VMM_PING, None)
            .await
        {
            Ok(_) => {
                tracing::debug!(attempt, "VMM API is ready");
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(attempt, error = %e, "VMM API not ready yet");
                last_error = Some(e);
            }
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    let last = last_error.map(|e| e.to_string()).unwrap_or_default();
    Err(MonitorError::Process(format!(
        "VMM API did not become ready after {} attempts: {last}",
        policy.max_attempts
    )))
}

/// Send SIGKILL to a process.
///
/// Returns true if the process was killed or no longer exists.
pub(crate) fn kill_process(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGKILL) == 0 || !is_process_alive(pid) }
}

/// Check process existence with a null signal.
pub(crate) fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NeverReady {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for NeverReady {
        async fn request(&self, _: Method, _: &str, _: Option<Bytes>) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(MonitorError::Transport("connection refused".into()))
        }
    }

    struct ReadyAfter {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl Transport for ReadyAfter {
        async fn request(&self, _: Method, _: &str, _: Option<Bytes>) -> Result<Bytes> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                Ok(Bytes::new())
            } else {
                Err(MonitorError::Transport("connection refused".into()))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_exhausts_after_exact_attempt_count() {
        let transport = NeverReady {
            calls: AtomicU32::new(0),
        };
        let err = wait_ready(&transport, &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Process(_)), "got {err:?}");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_stops_probing_once_ready() {
        let transport = ReadyAfter {
            calls: AtomicU32::new(0),
            succeed_on: 3,
        };
        wait_ready(&transport, &RetryPolicy::default()).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_policy_is_parameterized() {
        let transport = NeverReady {
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_secs(10),
        };
        wait_ready(&transport, &policy).await.unwrap_err();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn binary_resolution_prefers_override() {
        let mut config = VmConfig::default();
        assert_eq!(vmm_binary(&config), PathBuf::from(DEFAULT_VMM_BINARY));
        config.emulator = Some(PathBuf::from("/opt/ch/cloud-hypervisor"));
        assert_eq!(vmm_binary(&config), PathBuf::from("/opt/ch/cloud-hypervisor"));
    }

    #[test]
    fn kill_of_dead_pid_is_treated_as_success() {
        assert!(!is_process_alive(999_999_999));
        assert!(kill_process(999_999_999));
    }

    #[test]
    fn spawn_creates_socket_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("sockets/vm1-socket");
        let config = VmConfig {
            emulator: Some(PathBuf::from("/bin/true")),
            ..VmConfig::default()
        };
        let mut child = spawn_vmm(&config, &socket, &[]).unwrap();
        assert!(socket.parent().unwrap().is_dir());
        let _ = child.wait();
    }
}
