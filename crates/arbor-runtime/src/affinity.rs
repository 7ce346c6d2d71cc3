//! CPU affinity distribution across the container tree.
//!
//! Runs at process start and whenever any `cpu_set` changes. Assignment
//! walks the tree top-down (each parent places its children before those
//! children place theirs), then the cpuset cgroups are written in two
//! passes: widest mask first everywhere, narrowest second, so a child's
//! cpuset stays a subset of its parent's at every instant.

use std::sync::Arc;

use arbor_common::constants::CPU_POWER_PER_SEC;
use arbor_common::types::{ContainerState, CpuSetType};
use arbor_common::{Error, ErrorKind, Result};
use arbor_core::cgroup::{self, CPUSET_SUBSYSTEM};
use arbor_core::cpumask::{CpuMask, Topology};

use crate::container::Container;
use crate::context::Runtime;
use crate::props::Prop;

/// Child placement order: the most constrained requests go first.
const PLACEMENT_ORDER: [CpuSetType; 6] = [
    CpuSetType::Absolute,
    CpuSetType::Node,
    CpuSetType::Cores,
    CpuSetType::Threads,
    CpuSetType::Reserve,
    CpuSetType::Inherit,
];

/// Reserves CPUs out of `vacant`.
///
/// Core reservations take whole SMT sibling groups; a core counts only when
/// every sibling is vacant. Thread reservations prefer whole cores first and
/// fall back to stray threads in a second pass.
///
/// # Errors
///
/// Returns `ResourceNotAvailable` (with `vacant` rolled back) when the
/// request cannot be satisfied, or when satisfying it would leave the root
/// container without any vacant CPU.
pub fn reserve_cpus(
    topo: &Topology,
    vacant: &mut CpuMask,
    mut nr_threads: u32,
    mut nr_cores: u32,
    protect_root: bool,
) -> Result<(CpuMask, CpuMask)> {
    let mut threads = CpuMask::new();
    let mut cores = CpuMask::new();

    for cpu in vacant.clone().iter() {
        if nr_threads == 0 && nr_cores == 0 {
            break;
        }
        if !vacant.contains(cpu) {
            continue;
        }
        let siblings = topo.siblings(cpu);
        if siblings.is_empty() || !siblings.is_subset_of(vacant) {
            continue;
        }
        if nr_cores > 0 {
            nr_cores -= 1;
            cores.insert(cpu);
            threads.add(&siblings);
            vacant.subtract(&siblings);
        } else if nr_threads > 0 {
            for thread in siblings.iter() {
                if nr_threads == 0 {
                    break;
                }
                nr_threads -= 1;
                threads.insert(thread);
                vacant.remove(thread);
            }
        }
    }

    if nr_threads > 0 {
        for cpu in vacant.clone().iter() {
            if nr_threads == 0 {
                break;
            }
            nr_threads -= 1;
            threads.insert(cpu);
            vacant.remove(cpu);
        }
    }

    if nr_threads > 0 || nr_cores > 0 || (protect_root && vacant.is_empty()) {
        vacant.add(&threads);
        return Err(Error::new(ErrorKind::ResourceNotAvailable, "not enough cpus"));
    }

    Ok((threads, cores))
}

/// Distributes CPUs over the subtree of `from`.
///
/// # Errors
///
/// Returns `ResourceNotAvailable` naming the container whose request could
/// not be placed.
pub fn distribute_cpus(rt: &Runtime, from: &Arc<Container>) -> Result<()> {
    let topo = rt.topology();

    if from.is_root() {
        let mut data = from.lock_data();
        data.cpu_affinity = topo.online.clone();
    }
    {
        let mut data = from.lock_data();
        data.cpu_vacant = data.cpu_affinity.clone();
    }

    let mut top_down = from.subtree();
    top_down.reverse();

    for parent in &top_down {
        if matches!(
            parent.state(),
            ContainerState::Stopped | ContainerState::Dead
        ) && !parent.is_root()
        {
            continue;
        }
        let childs = parent.childs();
        if childs.is_empty() {
            continue;
        }

        let parent_affinity = parent.lock_data().cpu_affinity.clone();
        tracing::debug!(
            container = %parent,
            vacant = %parent.lock_data().cpu_vacant,
            "distributing cpus"
        );

        let mut vacant_guarantee: u64 = 0;

        for kind in PLACEMENT_ORDER {
            for ct in &childs {
                if matches!(ct.state(), ContainerState::Stopped | ContainerState::Dead) {
                    continue;
                }
                // Parent and child data locks are never held together; the
                // topology guard already serializes whole distributions.
                let (spec, guarantee) = {
                    let data = ct.lock_data();
                    if data.cpu_set.kind != kind {
                        continue;
                    }
                    (
                        data.cpu_set.clone(),
                        data.cpu_guarantee.max(data.cpu_guarantee_sum),
                    )
                };

                let mut reserve = CpuMask::new();
                let affinity = match kind {
                    CpuSetType::Inherit => parent.lock_data().cpu_vacant.clone(),
                    CpuSetType::Absolute => spec.mask.parse()?,
                    CpuSetType::Node => topo
                        .node_cpus(spec.arg)
                        .cloned()
                        .ok_or_else(|| {
                            Error::new(
                                ErrorKind::ResourceNotAvailable,
                                format!("numa node {} not found for {ct}", spec.arg),
                            )
                        })?,
                    CpuSetType::Cores | CpuSetType::Threads | CpuSetType::Reserve => {
                        let (nr_threads, nr_cores) = if kind == CpuSetType::Cores {
                            (0, spec.arg)
                        } else {
                            (spec.arg, 0)
                        };
                        let mut parent_data = parent.lock_data();
                        let (threads, _cores) = reserve_cpus(
                            &topo,
                            &mut parent_data.cpu_vacant,
                            nr_threads,
                            nr_cores,
                            parent.is_root(),
                        )
                        .map_err(|e| e.context(format!("{ct}")))?;
                        reserve = threads.clone();
                        if kind == CpuSetType::Reserve {
                            parent_affinity.clone()
                        } else {
                            threads
                        }
                    }
                };

                if affinity.is_empty() || !affinity.is_subset_of(&parent_affinity) {
                    return Err(Error::new(
                        ErrorKind::ResourceNotAvailable,
                        format!("not enough cpus for {ct}"),
                    ));
                }

                if reserve.is_empty() {
                    vacant_guarantee += guarantee;
                } else {
                    tracing::info!(container = %ct, reserve = %reserve, "cpus reserved");
                }

                let mut data = ct.lock_data();
                data.cpu_reserve = reserve;
                if data.cpu_affinity != affinity {
                    data.cpu_affinity = affinity.clone();
                    data.prop_dirty.set(Prop::CpuSetAffinity);
                }
                data.cpu_vacant = affinity;
            }
        }

        let parent_data = parent.lock_data();
        if vacant_guarantee > parent_data.cpu_vacant.weight() as u64 * CPU_POWER_PER_SEC {
            if parent_data.cpu_vacant != parent_data.cpu_affinity {
                return Err(Error::new(
                    ErrorKind::ResourceNotAvailable,
                    format!("not enough cpus for cpu guarantee in {parent}"),
                ));
            }
            tracing::warn!(container = %parent, "cpu guarantee overcommit");
        }
    }

    // First pass, top-down: widen every affected cpuset to the distribution
    // root's mask so no child ever exceeds its parent.
    let wide = from.lock_data().cpu_affinity.to_string();
    for ct in &top_down {
        if !cpuset_write_applies(from, ct, false) {
            continue;
        }
        let cg = ct.cgroup(&CPUSET_SUBSYSTEM);
        if !cg.exists() {
            continue;
        }
        arbor_core::cgroup::cpuset::set_cpus(&cg, &wide)
            .map_err(|e| e.context(format!("widen cpuset of {ct}")))?;
    }

    // Second pass, bottom-up: narrow to the assigned masks, children first.
    for ct in from.subtree() {
        if !cpuset_write_applies(from, &ct, true) {
            continue;
        }
        let cg = ct.cgroup(&CPUSET_SUBSYSTEM);
        if !cg.exists() {
            continue;
        }
        let mask = ct.lock_data().cpu_affinity.to_string();
        arbor_core::cgroup::cpuset::set_cpus(&cg, &mask)
            .map_err(|e| e.context(format!("narrow cpuset of {ct}")))?;
        arbor_core::cgroup::cpuset::set_mems(&cg, "")
            .map_err(|e| e.context(format!("set mems of {ct}")))?;
    }

    Ok(())
}

/// Whether a cpuset write pass should touch this container; the narrowing
/// pass also consumes the dirty bit.
fn cpuset_write_applies(from: &Arc<Container>, ct: &Arc<Container>, consume: bool) -> bool {
    if ct.id == from.id {
        return false;
    }
    if matches!(ct.state(), ContainerState::Stopped | ContainerState::Dead) {
        return false;
    }
    let mut data = ct.lock_data();
    if data.controllers & cgroup::CPUSET == 0 {
        return false;
    }
    if consume {
        data.prop_dirty.take(Prop::CpuSetAffinity)
    } else {
        data.prop_dirty.test(Prop::CpuSetAffinity)
    }
}
