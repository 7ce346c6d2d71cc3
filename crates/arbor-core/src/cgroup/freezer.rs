//! Freezer hierarchy control.
//!
//! The freezer cgroup is the one controller every container always has; its
//! task list is the authoritative membership.

use std::thread::sleep;
use std::time::Duration;

use arbor_common::{Error, ErrorKind, Result};

use super::Cgroup;

const STATE: &str = "freezer.state";
const SELF_FREEZING: &str = "freezer.self_freezing";
const PARENT_FREEZING: &str = "freezer.parent_freezing";

const WAIT_STEP_MS: u64 = 10;
const WAIT_LIMIT_MS: u64 = 10_000;

/// Waits until `freezer.state` reports `want`.
fn wait_state(cg: &Cgroup, want: &str) -> Result<()> {
    let mut waited = 0;
    loop {
        if cg.get(STATE)? == want {
            return Ok(());
        }
        if waited >= WAIT_LIMIT_MS {
            return Err(Error::new(
                ErrorKind::Busy,
                format!("{cg}: freezer did not reach {want}"),
            ));
        }
        sleep(Duration::from_millis(WAIT_STEP_MS));
        waited += WAIT_STEP_MS;
    }
}

/// Freezes the cgroup and waits for the kernel to finish.
///
/// # Errors
///
/// Returns an error if the write fails or the state never settles.
pub fn freeze(cg: &Cgroup) -> Result<()> {
    cg.set(STATE, "FROZEN")?;
    wait_state(cg, "FROZEN")
}

/// Thaws the cgroup; optionally waits for the kernel to finish.
///
/// # Errors
///
/// Returns an error if the write fails or (when waiting) the state never
/// settles.
pub fn thaw(cg: &Cgroup, wait: bool) -> Result<()> {
    cg.set(STATE, "THAWED")?;
    if wait {
        wait_state(cg, "THAWED")
    } else {
        Ok(())
    }
}

/// Whether the cgroup is frozen for any reason (self or ancestor).
#[must_use]
pub fn is_frozen(cg: &Cgroup) -> bool {
    cg.get(STATE).map(|s| s == "FROZEN").unwrap_or(false)
}

/// Whether this cgroup froze itself.
#[must_use]
pub fn is_self_freezing(cg: &Cgroup) -> bool {
    cg.get(SELF_FREEZING).map(|s| s == "1").unwrap_or(false)
}

/// Whether an ancestor cgroup holds this one frozen.
#[must_use]
pub fn is_parent_freezing(cg: &Cgroup) -> bool {
    cg.get(PARENT_FREEZING).map(|s| s == "1").unwrap_or(false)
}
