//! Block-io controller knobs.

use std::collections::BTreeMap;
use std::path::Path;

use arbor_common::{Error, Result};
use nix::sys::stat::stat;

use super::Cgroup;

const WEIGHT: &str = "blkio.weight";
const BFQ_WEIGHT: &str = "blkio.bfq.weight";
const READ_BPS: &str = "blkio.throttle.read_bps_device";
const WRITE_BPS: &str = "blkio.throttle.write_bps_device";
const READ_IOPS: &str = "blkio.throttle.read_iops_device";
const WRITE_IOPS: &str = "blkio.throttle.write_iops_device";

/// Resolves a filesystem path to the `major:minor` of its backing device.
///
/// # Errors
///
/// Returns an error if the path cannot be stat'ed.
pub fn resolve_device(path: &Path) -> Result<String> {
    let st = stat(path).map_err(|e| crate::sys_err("stat", e).context(path.display()))?;
    let dev = st.st_dev;
    let major = libc::major(dev);
    let minor = libc::minor(dev);
    Ok(format!("{major}:{minor}"))
}

/// Applies the io weight; BFQ kernels expose a separate knob.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_weight(cg: &Cgroup, policy: &str, weight: u64) -> Result<()> {
    let weight = weight.clamp(10, 1000);
    let knob = if policy == "bfq" && cg.has_knob(BFQ_WEIGHT) {
        BFQ_WEIGHT
    } else if cg.has_knob(WEIGHT) {
        WEIGHT
    } else {
        return Ok(());
    };
    cg.set_u64(knob, weight)
}

/// Applies per-device throughput or operation limits.
///
/// `limits` maps a filesystem path (resolved to its device here) to the
/// limit value; 0 removes the limit for that device. The reserved key `fs`
/// belongs to the memory controller and is skipped.
///
/// # Errors
///
/// Returns an error if device resolution or a write fails.
pub fn set_limits(cg: &Cgroup, limits: &BTreeMap<String, u64>, ops: bool) -> Result<()> {
    let (read_knob, write_knob) = if ops {
        (READ_IOPS, WRITE_IOPS)
    } else {
        (READ_BPS, WRITE_BPS)
    };
    for (target, &value) in limits {
        if target == "fs" {
            continue;
        }
        let device = resolve_device(Path::new(target))
            .map_err(|e: Error| e.context(format!("io limit for {target}")))?;
        let line = format!("{device} {value}");
        cg.set(read_knob, &line)?;
        cg.set(write_knob, &line)?;
    }
    Ok(())
}
