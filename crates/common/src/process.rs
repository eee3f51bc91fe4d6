// Notebook Relay - Process Liveness and Signalling
// PID checks used to detect stale tunnel records and to stop relay processes

use chrono::{DateTime, Utc};
use tracing::debug;

/// Allowed gap between a process's kernel start time and the time recorded
/// right after spawning it
const START_TIME_TOLERANCE_SECS: i64 = 30;

/// Signals sent to relay processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Check if a process with the given PID is running
///
/// Zombies (exited but not yet reaped) count as not running.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    // kill(pid, 0) performs the permission/existence check without sending anything
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    let exists = if result == 0 {
        true
    } else {
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => false, // No such process
            Some(libc::EPERM) => true,  // Process exists but we don't have permission
            _ => false,
        }
    };

    exists && !is_zombie(pid)
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    tracing::warn!("Process existence check not implemented for this platform");
    true
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // /proc/<pid>/stat: "pid (comm) state ..."; comm may contain spaces
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rfind(')')
            .and_then(|idx| stat[idx + 1..].split_whitespace().next())
            .map(|state| state == "Z")
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Wall-clock start time of a process, from `/proc/<pid>/stat` field 22
#[cfg(target_os = "linux")]
pub fn process_started_at(pid: u32) -> Option<DateTime<Utc>> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Fields after "(comm)" start at field 3
    let rest = &stat[stat.rfind(')')? + 1..];
    let start_ticks: i64 = rest.split_whitespace().nth(19)?.parse().ok()?;

    let boot_time: i64 = std::fs::read_to_string("/proc/stat")
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;

    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_sec <= 0 {
        return None;
    }
    let millis = boot_time * 1000 + start_ticks * 1000 / ticks_per_sec as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
}

#[cfg(not(target_os = "linux"))]
pub fn process_started_at(_pid: u32) -> Option<DateTime<Utc>> {
    None
}

/// Check that `pid` is still the process recorded at `started_at`
///
/// A PID the kernel handed to an unrelated process after the relay exited
/// fails the start-time comparison. Where the start time is unavailable
/// only liveness is checked.
pub fn is_recorded_process(pid: u32, started_at: DateTime<Utc>) -> bool {
    if !is_process_running(pid) {
        return false;
    }
    match process_started_at(pid) {
        Some(actual) => {
            let gap = (actual - started_at).num_seconds().abs();
            if gap > START_TIME_TOLERANCE_SECS {
                debug!(
                    "PID {} started at {}, not at the recorded {}; treating it as reused",
                    pid, actual, started_at
                );
                return false;
            }
            true
        }
        None => true,
    }
}

/// Send a signal to a relay process and its process group
///
/// Relay processes are spawned as group leaders, so signalling the group
/// also reaches helpers they fork. Falls back to the single PID when the
/// group is gone. Returns false if nothing could be signalled.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = pid as libc::pid_t;

    unsafe {
        if libc::kill(-pid, sig) == 0 {
            debug!("Sent {:?} to process group {}", signal, pid);
            return true;
        }
        if libc::kill(pid, sig) == 0 {
            debug!("Sent {:?} to process {}", signal, pid);
            return true;
        }
    }

    debug!(
        "Failed to send {:?} to {}: {}",
        signal,
        pid,
        std::io::Error::last_os_error()
    );
    false
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    tracing::warn!("Cannot send {:?} to {} on this platform", signal, pid);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_running() {
        let current_pid = std::process::id();
        assert!(is_process_running(current_pid));
    }

    #[test]
    fn test_nonexistent_process_not_running() {
        // Far above the default pid_max on most systems
        assert!(!is_process_running(999_999_999));
        assert!(!is_process_running(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_child_process() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("sleep should be available");
        let pid = child.id();
        assert!(is_process_running(pid));

        // Not a group leader, so this goes through the single-PID path
        assert!(send_signal(pid, Signal::Terminate));
        child.wait().unwrap();
        assert!(!is_process_running(pid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_recorded_process_checks_start_time() {
        let pid = std::process::id();
        let started = process_started_at(pid).expect("own start time should be readable");
        assert!((Utc::now() - started).num_seconds().abs() < 3600);
        assert!(is_recorded_process(pid, started));

        // Same PID, but the record predates this process by a day
        assert!(!is_recorded_process(pid, started - chrono::Duration::days(1)));
        assert!(!is_recorded_process(999_999_999, started));
    }
}
