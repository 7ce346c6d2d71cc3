//! Host-level queries: memory, CPUs, hostname, clock.

use arbor_common::{Error, Result};

/// Total physical memory in bytes.
///
/// # Errors
///
/// Returns an error if `sysinfo` fails.
pub fn total_memory() -> Result<u64> {
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    // SAFETY: info is a valid sysinfo struct for the duration of the call.
    let rc = unsafe { libc::sysinfo(&mut info) };
    if rc != 0 {
        return Err(Error::system("sysinfo", &std::io::Error::last_os_error()));
    }
    Ok(info.totalram as u64 * info.mem_unit as u64)
}

/// Number of online logical CPUs.
#[must_use]
pub fn num_cpus() -> u64 {
    // SAFETY: read-only sysconf query.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as u64
    }
}

/// Caller's kernel thread id, for lock diagnostics.
#[must_use]
pub fn thread_id() -> u64 {
    nix::unistd::gettid().as_raw() as u64
}

/// Host name, empty when unreadable.
#[must_use]
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

/// Monotonic-enough wall clock in milliseconds since the epoch.
#[must_use]
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Whether a task exists (any state, zombie included).
#[must_use]
pub fn task_exists(pid: i32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

/// Whether a task is a zombie.
#[must_use]
pub fn task_is_zombie(pid: i32) -> bool {
    task_stat_field(pid, 2).is_some_and(|state| state == "Z")
}

/// Parent pid of a task; 0 when unreadable.
#[must_use]
pub fn task_ppid(pid: i32) -> i32 {
    task_stat_field(pid, 3)
        .and_then(|f| f.parse().ok())
        .unwrap_or(0)
}

/// Command name of a task.
#[must_use]
pub fn task_name(pid: i32) -> String {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Signals a task declares handled, as a bitmask from `/proc/<pid>/status`.
#[must_use]
pub fn task_handled_signals(pid: i32) -> u64 {
    let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
        return 0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("SigCgt:") {
            return u64::from_str_radix(rest.trim(), 16).unwrap_or(0);
        }
    }
    0
}

/// Field of `/proc/<pid>/stat` after the comm field, 0-based from the state.
///
/// Field 2 is the state letter, field 3 the ppid, matching proc(5) numbering.
fn task_stat_field(pid: i32, field: usize) -> Option<String> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces; fields resume after the closing paren.
    let rest = stat.rsplit_once(')')?.1;
    rest.split_whitespace().nth(field - 2).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_queries_return_sane_values() {
        assert!(total_memory().expect("sysinfo") > 0);
        assert!(num_cpus() >= 1);
        assert!(thread_id() > 0);
    }

    #[test]
    fn own_task_is_alive_and_not_zombie() {
        let pid = std::process::id() as i32;
        assert!(task_exists(pid));
        assert!(!task_is_zombie(pid));
        assert!(task_ppid(pid) > 0);
    }

    #[test]
    fn nonexistent_task_queries_degrade() {
        assert!(!task_exists(-1));
        assert_eq!(task_ppid(-1), 0);
        assert_eq!(task_name(-1), "");
    }
}
