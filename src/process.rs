// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use libc::pid_t;
use libc::uid_t;
use log::warn;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

/// Per-process scheduler statistics from /proc/<pid>/schedstat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleStats {
    /// Time spent on-CPU.
    pub cpu_time_ns: i64,
    /// Time spent runnable but waiting for a CPU.
    pub cpu_delay_ns: i64,
}

/// Freezer profile applied to a process when its timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessProfile {
    Frozen,
    Unfrozen,
}

impl ProcessProfile {
    fn freezer_value(&self) -> &'static str {
        match self {
            ProcessProfile::Frozen => "1",
            ProcessProfile::Unfrozen => "0",
        }
    }
}

/// OS-facing capabilities the timer service depends on. Injectable so tests
/// can run against a synthetic process table.
pub trait ProcessOps: Send + Sync {
    fn process_exists(&self, pid: pid_t) -> bool;

    /// None when the process is gone or the stats are unreadable.
    fn read_schedule_stats(&self, pid: pid_t) -> Option<ScheduleStats>;

    fn process_name(&self, pid: pid_t) -> Option<String>;

    /// Apply a freezer profile. False when the freezer is unavailable or
    /// rejects the write.
    fn apply_process_profile(&self, uid: uid_t, pid: pid_t, profile: ProcessProfile) -> bool;
}

/// Production implementation backed by procfs and the cgroup2 freezer.
pub struct SystemProcessOps {
    proc_root: PathBuf,
    cgroup_root: PathBuf,
}

impl SystemProcessOps {
    pub fn new() -> Self {
        Self::with_roots("/proc", "/sys/fs/cgroup")
    }

    /// Alternate filesystem roots, for tests.
    pub fn with_roots<P: AsRef<Path>, Q: AsRef<Path>>(proc_root: P, cgroup_root: Q) -> Self {
        Self {
            proc_root: proc_root.as_ref().to_path_buf(),
            cgroup_root: cgroup_root.as_ref().to_path_buf(),
        }
    }

    fn proc_path(&self, pid: pid_t, name: &str) -> PathBuf {
        self.proc_root.join(pid.to_string()).join(name)
    }
}

impl Default for SystemProcessOps {
    fn default() -> Self {
        Self::new()
    }
}

// schedstat is "<cputime_ns> <rq_delay_ns> <timeslices>".
fn parse_schedstat(raw: &str) -> Option<ScheduleStats> {
    let mut fields = raw.split_whitespace();
    let cpu_time_ns = fields.next()?.parse().ok()?;
    let cpu_delay_ns = fields.next()?.parse().ok()?;
    Some(ScheduleStats {
        cpu_time_ns,
        cpu_delay_ns,
    })
}

impl ProcessOps for SystemProcessOps {
    fn process_exists(&self, pid: pid_t) -> bool {
        self.proc_root.join(pid.to_string()).exists()
    }

    fn read_schedule_stats(&self, pid: pid_t) -> Option<ScheduleStats> {
        let raw = fs::read_to_string(self.proc_path(pid, "schedstat")).ok()?;
        parse_schedstat(&raw)
    }

    fn process_name(&self, pid: pid_t) -> Option<String> {
        let raw = fs::read_to_string(self.proc_path(pid, "comm")).ok()?;
        Some(raw.trim().to_string())
    }

    fn apply_process_profile(&self, uid: uid_t, pid: pid_t, profile: ProcessProfile) -> bool {
        let path = self
            .cgroup_root
            .join(format!("uid_{}", uid))
            .join(format!("pid_{}", pid))
            .join("cgroup.freeze");
        match fs::write(&path, profile.freezer_value()) {
            Ok(()) => true,
            Err(e) => {
                warn!("freezer write to {:?} failed: {}", path, e);
                false
            }
        }
    }
}
