//! Small single-knob controllers: pids, hugetlb, net_cls and devices.

use arbor_common::Result;

use super::Cgroup;

const PIDS_MAX: &str = "pids.max";
const CLASSID: &str = "net_cls.classid";
const DEVICES_DENY: &str = "devices.deny";
const DEVICES_ALLOW: &str = "devices.allow";

/// Caps the number of tasks; 0 removes the cap.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_thread_limit(cg: &Cgroup, limit: u64) -> Result<()> {
    if limit == 0 {
        cg.set(PIDS_MAX, "max")
    } else {
        cg.set_u64(PIDS_MAX, limit)
    }
}

/// Limits 2 MiB huge pages; 0 means unlimited.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_hugetlb_limit(cg: &Cgroup, bytes: u64) -> Result<()> {
    let knob = "hugetlb.2MB.limit_in_bytes";
    if !cg.has_knob(knob) {
        return Ok(());
    }
    let value = if bytes == 0 { i64::MAX } else { bytes as i64 };
    cg.set_i64(knob, value)
}

/// Whether the kernel exposes 1 GiB huge page accounting.
#[must_use]
pub fn supports_giga_pages(cg: &Cgroup) -> bool {
    cg.has_knob("hugetlb.1GB.limit_in_bytes")
}

/// Forbids 1 GiB huge pages: they cannot be reclaimed per-container.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn forbid_giga_pages(cg: &Cgroup) -> Result<()> {
    cg.set_u64("hugetlb.1GB.limit_in_bytes", 0)
}

/// Tags traffic of all tasks with the class id used by the TC driver.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_classid(cg: &Cgroup, classid: u32) -> Result<()> {
    cg.set_u64(CLASSID, u64::from(classid))
}

/// Replaces the device access list with the given allow rules.
///
/// Rules use the kernel's `devices.allow` syntax, e.g. `c 1:3 rwm`.
///
/// # Errors
///
/// Returns an error if a write fails.
pub fn apply_device_rules(cg: &Cgroup, rules: &[String]) -> Result<()> {
    cg.set(DEVICES_DENY, "a")?;
    for rule in rules {
        cg.set(DEVICES_ALLOW, rule)?;
    }
    Ok(())
}

/// Opens device access completely; used for the first-level default set.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn allow_all_devices(cg: &Cgroup) -> Result<()> {
    cg.set(DEVICES_ALLOW, "a")
}
