//! Scheduler policy selection and per-task application.

use std::fmt;
use std::str::FromStr;

use arbor_common::{Error, ErrorKind, Result};

/// Scheduling class requested through the `cpu_policy` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuPolicy {
    #[default]
    Normal,
    /// Real-time round-robin when a base RT priority is configured.
    Rt,
    /// Elevated nice.
    High,
    Batch,
    Idle,
    /// SCHED_ISO on kernels that carry it, elevated nice otherwise.
    Iso,
}

impl fmt::Display for CpuPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::Rt => "rt",
            Self::High => "high",
            Self::Batch => "batch",
            Self::Idle => "idle",
            Self::Iso => "iso",
        };
        f.write_str(name)
    }
}

impl FromStr for CpuPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(Self::Normal),
            "rt" => Ok(Self::Rt),
            "high" => Ok(Self::High),
            "batch" => Ok(Self::Batch),
            "idle" => Ok(Self::Idle),
            "iso" => Ok(Self::Iso),
            other => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown cpu policy: {other}"),
            )),
        }
    }
}

/// Daemon-level scheduler knobs, from the config file.
#[derive(Debug, Clone, Copy)]
pub struct SchedKnobs {
    /// Base RT priority; 0 keeps RT scheduling disabled.
    pub rt_priority: i32,
    /// Nice for RT containers.
    pub rt_nice: i32,
    /// Nice boost for `high` and `iso`.
    pub high_nice: i32,
}

/// Concrete scheduler assignment for every task of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedSpec {
    /// `SCHED_*` constant.
    pub policy: i32,
    /// RT priority, 0 for non-RT policies.
    pub priority: i32,
    /// Nice value.
    pub nice: i32,
}

/// SCHED_ISO is not in libc; present only on patched kernels.
const SCHED_ISO: i32 = 4;

/// Picks the scheduler policy, priority and nice for a container.
///
/// Doubling the weight is one RT priority step; for non-RT policies every
/// -1 of nice is worth roughly +10% of weight, so the nice offset is
/// `-log(weight)/log(1.1)`, clamped to the kernel range.
#[must_use]
pub fn choose(policy: CpuPolicy, weight: u64, knobs: &SchedKnobs) -> SchedSpec {
    let weight = weight.max(1);
    let mut spec = SchedSpec {
        policy: libc::SCHED_OTHER,
        priority: 0,
        nice: 0,
    };

    match policy {
        CpuPolicy::Rt => {
            spec.nice = knobs.rt_nice;
            if knobs.rt_priority > 0 {
                spec.policy = libc::SCHED_RR;
                let boost = (weight as f64).log2() as i32;
                let prio = knobs.rt_priority + boost;
                // SAFETY: both calls only read static scheduler tables.
                let min = unsafe { libc::sched_get_priority_min(libc::SCHED_RR) };
                let max = unsafe { libc::sched_get_priority_max(libc::SCHED_RR) };
                spec.priority = prio.clamp(min, max);
            }
        }
        CpuPolicy::High => spec.nice = knobs.high_nice,
        CpuPolicy::Batch => spec.policy = libc::SCHED_BATCH,
        CpuPolicy::Idle => spec.policy = libc::SCHED_IDLE,
        CpuPolicy::Iso => {
            spec.policy = SCHED_ISO;
            spec.nice = knobs.high_nice;
        }
        CpuPolicy::Normal => {}
    }

    if spec.policy != libc::SCHED_RR {
        let offset = ((weight as f64).ln() / 1.1f64.ln()) as i32;
        spec.nice = (spec.nice - offset).clamp(-20, 19);
    }

    spec
}

/// Applies the assignment to one task.
///
/// # Errors
///
/// Returns an error with the errno preserved; callers treat ESRCH as a race
/// with exit.
pub fn apply_to_task(pid: i32, spec: &SchedSpec) -> Result<()> {
    // SAFETY: plain syscalls on a foreign pid; no memory is shared.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, spec.nice) };
    if rc != 0 {
        return Err(Error::system("setpriority", &std::io::Error::last_os_error()));
    }
    let param = libc::sched_param {
        sched_priority: spec.priority,
    };
    // SAFETY: param is a valid sched_param for the duration of the call.
    let rc = unsafe { libc::sched_setscheduler(pid, spec.policy, &param) };
    if rc != 0 {
        // SCHED_ISO exists only on patched kernels; retry as SCHED_OTHER.
        if spec.policy == SCHED_ISO {
            let fallback = libc::sched_param { sched_priority: 0 };
            // SAFETY: as above.
            let rc = unsafe { libc::sched_setscheduler(pid, libc::SCHED_OTHER, &fallback) };
            if rc == 0 {
                return Ok(());
            }
        }
        return Err(Error::system(
            "sched_setscheduler",
            &std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Current policy of a task, `SCHED_OTHER` when unreadable.
#[must_use]
pub fn task_policy(pid: i32) -> i32 {
    // SAFETY: read-only query syscall.
    let rc = unsafe { libc::sched_getscheduler(pid) };
    if rc < 0 {
        libc::SCHED_OTHER
    } else {
        rc
    }
}

const IOPRIO_WHO_PROCESS: libc::c_int = 1;
const IOPRIO_CLASS_SHIFT: i32 = 13;

/// Sets the io priority of one task.
///
/// `ioprio` packs class and level the way the kernel expects; 0 resets to
/// the default class.
///
/// # Errors
///
/// Returns an error with the errno preserved.
pub fn set_io_prio(pid: i32, class: i32, level: i32) -> Result<()> {
    let ioprio = (class << IOPRIO_CLASS_SHIFT) | level;
    // SAFETY: ioprio_set takes plain integers.
    let rc = unsafe { libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, pid, ioprio) };
    if rc != 0 {
        return Err(Error::system("ioprio_set", &std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOBS: SchedKnobs = SchedKnobs {
        rt_priority: 10,
        rt_nice: -5,
        high_nice: -10,
    };

    #[test]
    fn normal_policy_weight_one_is_neutral() {
        let spec = choose(CpuPolicy::Normal, 1, &KNOBS);
        assert_eq!(spec.policy, libc::SCHED_OTHER);
        assert_eq!(spec.nice, 0);
        assert_eq!(spec.priority, 0);
    }

    #[test]
    fn normal_policy_weight_lowers_nice() {
        let spec = choose(CpuPolicy::Normal, 2, &KNOBS);
        assert!(spec.nice < 0);
        let heavy = choose(CpuPolicy::Normal, 1000, &KNOBS);
        assert_eq!(heavy.nice, -20, "nice clamps at -20");
    }

    #[test]
    fn rt_policy_scales_priority_with_weight() {
        let one = choose(CpuPolicy::Rt, 1, &KNOBS);
        let eight = choose(CpuPolicy::Rt, 8, &KNOBS);
        assert_eq!(one.policy, libc::SCHED_RR);
        assert_eq!(eight.priority - one.priority, 3, "x8 weight is +3 priority");
        assert_eq!(one.nice, KNOBS.rt_nice);
    }

    #[test]
    fn rt_without_base_priority_stays_other() {
        let knobs = SchedKnobs { rt_priority: 0, ..KNOBS };
        let spec = choose(CpuPolicy::Rt, 4, &knobs);
        assert_eq!(spec.policy, libc::SCHED_OTHER);
    }

    #[test]
    fn batch_and_idle_map_directly() {
        assert_eq!(choose(CpuPolicy::Batch, 1, &KNOBS).policy, libc::SCHED_BATCH);
        assert_eq!(choose(CpuPolicy::Idle, 1, &KNOBS).policy, libc::SCHED_IDLE);
    }

    #[test]
    fn policy_parse_round_trip() {
        for p in [
            CpuPolicy::Normal,
            CpuPolicy::Rt,
            CpuPolicy::High,
            CpuPolicy::Batch,
            CpuPolicy::Idle,
            CpuPolicy::Iso,
        ] {
            let parsed: CpuPolicy = p.to_string().parse().expect("parse");
            assert_eq!(parsed, p);
        }
    }
}
