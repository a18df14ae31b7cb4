//! Thread introspection and role classification for the VMM process.
//!
//! The VMM names its threads after their job: `vcpu<N>` for guest vCPUs,
//! `virtio*` for per-device I/O threads, anything else belongs to the
//! emulator itself. Classification is a pure function of the OS-reported
//! thread name; reading those names goes through the `CommReader` seam so
//! the caching behaviour is observable in tests.

use std::path::PathBuf;

use nix::sched::CpuSet;
use nix::unistd::Pid;

use crate::errors::{MonitorError, Result};

/// Retained thread names are bounded to this many bytes.
pub const THREAD_NAME_MAX: usize = 16;

/// Semantic role of one VMM thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadRole {
    /// A guest vCPU thread.
    Vcpu { index: u32, online: bool },
    /// A virtio device I/O thread.
    Io { name: String },
    /// Any other VMM-internal thread.
    Emulator { name: String },
    /// Name unreadable or unparsable.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub tid: i32,
    pub role: ThreadRole,
}

/// Scheduler affinity of one I/O thread, as a little-endian bit-per-CPU map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoThreadInfo {
    pub tid: i32,
    pub cpumap: Vec<u8>,
}

/// Cached classification of the VMM's threads.
///
/// Replaced as a whole on refresh; consumers see either the previous
/// complete table or the next one, never a mix.
#[derive(Debug, Default)]
pub struct ThreadTable {
    tids: Vec<i32>,
    records: Vec<ThreadRecord>,
}

impl ThreadTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ThreadRecord] {
        &self.records
    }

    pub(crate) fn clear(&mut self) {
        self.tids.clear();
        self.records.clear();
    }

    /// True when the sorted tid set differs from the cached one. An empty
    /// cache always counts as changed.
    fn changed(&self, tids: &[i32]) -> bool {
        self.tids.is_empty() || self.tids != tids
    }
}

/// Reads a thread's command name.
pub trait CommReader: Send + Sync {
    fn comm(&self, pid: i32, tid: i32) -> std::io::Result<String>;
}

/// Reads `/proc/<pid>/task/<tid>/comm`.
pub struct ProcfsCommReader;

impl CommReader for ProcfsCommReader {
    fn comm(&self, pid: i32, tid: i32) -> std::io::Result<String> {
        let path = PathBuf::from(format!("/proc/{pid}/task/{tid}/comm"));
        Ok(std::fs::read_to_string(path)?.trim_end().to_string())
    }
}

/// Queries a thread's scheduler affinity mask.
pub trait AffinityReader: Send + Sync {
    fn affinity(&self, tid: i32) -> Result<Vec<u8>>;
}

/// `sched_getaffinity`-backed reader.
pub struct SchedAffinityReader;

impl AffinityReader for SchedAffinityReader {
    fn affinity(&self, tid: i32) -> Result<Vec<u8>> {
        let set = nix::sched::sched_getaffinity(Pid::from_raw(tid)).map_err(|e| {
            MonitorError::Introspection(format!("cannot query affinity of tid {tid}: {e}"))
        })?;
        Ok(cpuset_to_bitmap(&set))
    }
}

fn cpuset_to_bitmap(set: &CpuSet) -> Vec<u8> {
    let mut bytes = vec![0u8; CpuSet::count().div_ceil(8)];
    for cpu in 0..CpuSet::count() {
        if set.is_set(cpu).unwrap_or(false) {
            bytes[cpu / 8] |= 1 << (cpu % 8);
        }
    }
    while bytes.len() > 1 && *bytes.last().unwrap() == 0 {
        bytes.pop();
    }
    bytes
}

/// Classify a thread by its command name.
pub fn classify(name: &str) -> ThreadRole {
    if let Some(rest) = name.strip_prefix("vcpu") {
        match rest.parse::<u32>() {
            Ok(index) => ThreadRole::Vcpu {
                index,
                online: true,
            },
            Err(_) => {
                tracing::warn!(name, "vcpu thread name carries no usable index");
                ThreadRole::Unknown
            }
        }
    } else if name.starts_with("virtio") {
        ThreadRole::Io {
            name: bounded_name(name),
        }
    } else {
        ThreadRole::Emulator {
            name: bounded_name(name),
        }
    }
}

fn bounded_name(name: &str) -> String {
    let mut end = name.len().min(THREAD_NAME_MAX);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Sorted thread ids of a process, from `/proc/<pid>/task`.
pub(crate) fn enumerate_tids(pid: i32) -> std::io::Result<Vec<i32>> {
    let mut tids = Vec::new();
    for entry in std::fs::read_dir(format!("/proc/{pid}/task"))? {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

/// Rebuild `table` from the live thread set of `pid`.
///
/// When the sorted tid set matches the cached one the table is reused
/// untouched and no names are re-read. A single unreadable name degrades
/// that thread to `Unknown`; an enumeration failure clears the cache and
/// fails the refresh.
pub(crate) fn refresh(pid: i32, table: &mut ThreadTable, reader: &dyn CommReader) -> Result<usize> {
    let tids = match enumerate_tids(pid) {
        Ok(tids) => tids,
        Err(e) => {
            table.clear();
            return Err(MonitorError::Introspection(format!(
                "cannot enumerate threads of pid {pid}: {e}"
            )));
        }
    };
    rebuild_if_changed(pid, tids, table, reader)
}

/// Rebuild the table from an already sorted tid set, unless it matches the
/// cached one.
fn rebuild_if_changed(
    pid: i32,
    tids: Vec<i32>,
    table: &mut ThreadTable,
    reader: &dyn CommReader,
) -> Result<usize> {
    if !table.changed(&tids) {
        return Ok(table.len());
    }

    let mut records = Vec::with_capacity(tids.len());
    for &tid in &tids {
        let role = match reader.comm(pid, tid) {
            Ok(name) => classify(name.trim_end()),
            Err(e) => {
                tracing::debug!(pid, tid, error = %e, "cannot read thread name");
                ThreadRole::Unknown
            }
        };
        tracing::trace!(pid, tid, ?role, "classified VMM thread");
        records.push(ThreadRecord { tid, role });
    }

    *table = ThreadTable { tids, records };
    Ok(table.len())
}

/// Affinity records for every I/O-role thread in `table`, all or nothing.
pub(crate) fn io_threads(
    table: &ThreadTable,
    affinity: &dyn AffinityReader,
) -> Result<Vec<IoThreadInfo>> {
    let mut out = Vec::new();
    for record in table.records() {
        if matches!(record.role, ThreadRole::Io { .. }) {
            out.push(IoThreadInfo {
                tid: record.tid,
                cpumap: affinity.affinity(record.tid)?,
            });
        }
    }
    Ok(out)
}
