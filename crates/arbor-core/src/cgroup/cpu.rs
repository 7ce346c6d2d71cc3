//! CPU bandwidth controller knobs.
//!
//! Limits and guarantees are expressed in CPU power: nanoseconds of runtime
//! per second, so one full CPU is `CPU_POWER_PER_SEC`.

use arbor_common::constants::CPU_POWER_PER_SEC;
use arbor_common::Result;

use super::Cgroup;

const SHARES: &str = "cpu.shares";
const CFS_PERIOD: &str = "cpu.cfs_period_us";
const CFS_QUOTA: &str = "cpu.cfs_quota_us";
const RT_RUNTIME: &str = "cpu.rt_runtime_us";

/// Baseline `cpu.shares` for weight 100.
const BASE_SHARES: u64 = 1024;

/// Applies the guarantee as `cpu.shares`, scaled by weight.
///
/// The shares knob is relative, so the guarantee in CPU power is folded into
/// the same write: a guaranteed CPU counts like a weight boost of 100.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_guarantee(cg: &Cgroup, weight: u64, guarantee: u64) -> Result<()> {
    let boost = guarantee * 100 / CPU_POWER_PER_SEC;
    let shares = (BASE_SHARES * (weight + boost) / 100).max(2);
    cg.set_u64(SHARES, shares)
}

/// Applies a bandwidth limit via the CFS quota; limit 0 removes the quota.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_limit(cg: &Cgroup, period_ns: u64, limit: u64) -> Result<()> {
    let period_us = (period_ns / 1000).max(1000);
    cg.set_u64(CFS_PERIOD, period_us)?;
    if limit == 0 {
        cg.set_i64(CFS_QUOTA, -1)
    } else {
        let quota_us = (limit * period_us / CPU_POWER_PER_SEC).max(1000);
        cg.set_u64(CFS_QUOTA, quota_us)
    }
}

/// Applies the RT runtime budget matching the limit.
///
/// Not every kernel carries RT group scheduling; the caller decides whether
/// a failure here is fatal.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_rt_limit(cg: &Cgroup, period_ns: u64, limit: u64) -> Result<()> {
    if !cg.has_knob(RT_RUNTIME) {
        return Ok(());
    }
    let period_us = (period_ns / 1000).max(1000);
    if limit == 0 {
        cg.set_i64(RT_RUNTIME, -1)
    } else {
        cg.set_u64(RT_RUNTIME, limit * period_us / CPU_POWER_PER_SEC)
    }
}
