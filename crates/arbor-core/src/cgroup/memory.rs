//! Memory controller knobs and the OOM event channel.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;

use arbor_common::{Error, ErrorKind, Result};
use nix::sys::eventfd::{EfdFlags, EventFd};

use super::Cgroup;

const LIMIT: &str = "memory.limit_in_bytes";
const GUARANTEE: &str = "memory.low_limit_in_bytes";
const ANON_LIMIT: &str = "memory.anon.limit";
const DIRTY_LIMIT: &str = "memory.dirty_limit_in_bytes";
const RECHARGE: &str = "memory.recharge_on_pgfault";
const SOFT_LIMIT: &str = "memory.soft_limit_in_bytes";
const USE_HIERARCHY: &str = "memory.use_hierarchy";
const OOM_CONTROL: &str = "memory.oom_control";
const EVENT_CONTROL: &str = "cgroup.event_control";
const FS_BPS_LIMIT: &str = "memory.fs_bps_limit";
const FS_IOPS_LIMIT: &str = "memory.fs_iops_limit";

/// Sets the hard memory limit; 0 means unlimited.
///
/// EBUSY means current usage already exceeds the requested value and is
/// reported as `InvalidValue` so clients see a validation failure, not a
/// kernel internals leak.
///
/// # Errors
///
/// Returns `InvalidValue` on EBUSY, otherwise the underlying write error.
pub fn set_limit(cg: &Cgroup, bytes: u64) -> Result<()> {
    let value = if bytes == 0 { -1 } else { bytes as i64 };
    cg.set_i64(LIMIT, value).map_err(|e| {
        if e.is_errno(libc::EBUSY) {
            Error::new(ErrorKind::InvalidValue, format!("memory limit too low: {bytes}"))
        } else {
            e
        }
    })
}

/// Sets the memory guarantee (low-limit) knob.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_guarantee(cg: &Cgroup, bytes: u64) -> Result<()> {
    cg.set_u64(GUARANTEE, bytes)
}

/// Sets the anonymous-memory limit; 0 means unlimited.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_anon_limit(cg: &Cgroup, bytes: u64) -> Result<()> {
    if !cg.has_knob(ANON_LIMIT) {
        return Ok(());
    }
    let value = if bytes == 0 { -1 } else { bytes as i64 };
    cg.set_i64(ANON_LIMIT, value)
}

/// Sets the dirty page limit.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_dirty_limit(cg: &Cgroup, bytes: u64) -> Result<()> {
    if !cg.has_knob(DIRTY_LIMIT) {
        return Ok(());
    }
    cg.set_u64(DIRTY_LIMIT, bytes)
}

/// Toggles page recharging on fault.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_recharge_on_pgfault(cg: &Cgroup, enable: bool) -> Result<()> {
    if !cg.has_knob(RECHARGE) {
        return Ok(());
    }
    cg.set(RECHARGE, if enable { "1" } else { "0" })
}

/// Sets the soft limit; negative disables the squeeze.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_soft_limit(cg: &Cgroup, bytes: i64) -> Result<()> {
    cg.set_i64(SOFT_LIMIT, bytes)
}

/// Enables hierarchical accounting below this cgroup.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_use_hierarchy(cg: &Cgroup) -> Result<()> {
    cg.set(USE_HIERARCHY, "1")
}

/// Filesystem-level throughput limit, bytes per second; 0 removes it.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_fs_bps_limit(cg: &Cgroup, bps: u64) -> Result<()> {
    if !cg.has_knob(FS_BPS_LIMIT) {
        return Ok(());
    }
    cg.set_u64(FS_BPS_LIMIT, bps)
}

/// Filesystem-level operation limit, iops; 0 removes it.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_fs_iops_limit(cg: &Cgroup, iops: u64) -> Result<()> {
    if !cg.has_knob(FS_IOPS_LIMIT) {
        return Ok(());
    }
    cg.set_u64(FS_IOPS_LIMIT, iops)
}

/// Registers an eventfd on the cgroup's OOM notifier.
///
/// The returned fd becomes readable whenever the kernel kills inside this
/// cgroup; it is registered with the epoll loop while the container is live.
///
/// # Errors
///
/// Returns an error if the control files cannot be opened or the
/// registration write fails.
pub fn setup_oom_event(cg: &Cgroup) -> Result<EventFd> {
    let event = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
        .map_err(|e| crate::sys_err("eventfd", e))?;

    let oom_control = OpenOptions::new()
        .read(true)
        .open(cg.dir().join(OOM_CONTROL))
        .map_err(|e| Error::system("open", &e).context(format!("{cg}: {OOM_CONTROL}")))?;

    // The eventfd keeps the registration alive; oom_control may close after
    // the registration write.
    let line = format!("{} {}", event.as_raw_fd(), oom_control.as_raw_fd());
    cg.set(EVENT_CONTROL, &line)?;

    Ok(event)
}

/// Drains pending OOM notifications, returning how many fired.
///
/// The fd is non-blocking; an empty counter reads as zero.
#[must_use]
pub fn read_oom_events(event: &EventFd) -> u64 {
    event.read().unwrap_or(0)
}

/// Count of kernel OOM kills recorded by the controller.
#[must_use]
pub fn oom_kill_count(cg: &Cgroup) -> u64 {
    let Ok(content) = cg.get(OOM_CONTROL) else {
        return 0;
    };
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("oom_kill ") {
            return rest.trim().parse().unwrap_or(0);
        }
    }
    0
}
