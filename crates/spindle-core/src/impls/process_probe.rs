//! Process liveness for lock holders.
//!
//! A holder is dead when its pid no longer exists, or when the pid now
//! belongs to a different process (kernel start time changed).

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::io;

use crate::domain::{HolderId, RunId};
use crate::ports::LivenessProbe;

/// Kernel start time of `pid` in clock ticks (field 22 of `/proc/<pid>/stat`).
pub fn read_start_ticks(pid: u32) -> io::Result<u64> {
    let path = format!("/proc/{pid}/stat");
    let content = std::fs::read_to_string(&path)?;
    parse_start_ticks(&content).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Missing starttime field in {path}"),
        )
    })
}

/// Holder identity for a worker inside the current process.
pub fn current_holder(worker: impl Into<String>, run: RunId) -> HolderId {
    let pid = std::process::id();
    HolderId::new(worker, pid, read_start_ticks(pid).ok(), run)
}

/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`; starttime is the 20th after it.
fn parse_start_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessProbe;

impl ProcessProbe {
    fn pid_exists(pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // exists but owned by someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

impl LivenessProbe for ProcessProbe {
    fn is_alive(&self, holder: &HolderId) -> bool {
        if holder.pid == 0 || !Self::pid_exists(holder.pid) {
            return false;
        }
        match (holder.start_ticks, read_start_ticks(holder.pid)) {
            (Some(expected), Ok(actual)) => expected == actual,
            _ => true,
        }
    }
}
