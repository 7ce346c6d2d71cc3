//! Cpuset controller knobs.

use arbor_common::Result;

use super::Cgroup;

const CPUS: &str = "cpuset.cpus";
const MEMS: &str = "cpuset.mems";

/// Writes the CPU list. The kernel requires the list to stay a subset of the
/// parent cgroup's list at every instant; callers order their writes
/// accordingly.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn set_cpus(cg: &Cgroup, cpus: &str) -> Result<()> {
    cg.set(CPUS, cpus)
}

/// Writes the memory-node list; an empty list inherits the hierarchy root's
/// nodes, which a fresh v1 cpuset requires before any task can join.
///
/// # Errors
///
/// Returns an error if the read or write fails.
pub fn set_mems(cg: &Cgroup, mems: &str) -> Result<()> {
    if mems.is_empty() {
        let root_mems = cg.subsys.root_cgroup().get(MEMS)?;
        cg.set(MEMS, &root_mems)
    } else {
        cg.set(MEMS, mems)
    }
}
