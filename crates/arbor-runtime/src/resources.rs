//! Resource preparation and teardown around the start/stop pipeline.

use std::sync::Arc;

use arbor_common::types::ContainerState;
use arbor_common::{Error, ErrorKind, Result};
use arbor_core::cgroup::{self, memory, misc, MEMORY_SUBSYSTEM, NETCLS_SUBSYSTEM};

use crate::affinity;
use crate::apply;
use crate::container::Container;
use crate::context::Runtime;
use crate::props::Prop;
use crate::volumes;

/// Memory guarantee rolled up over a subtree: children sum first, then the
/// node's own guarantee wins if larger. Stopped containers hold none.
#[must_use]
pub fn total_mem_guarantee(ct: &Arc<Container>) -> u64 {
    if ct.state() == ContainerState::Stopped && !ct.is_root() {
        return 0;
    }
    let sum: u64 = ct.childs().iter().map(total_mem_guarantee).sum();
    ct.lock_data().mem_guarantee.max(sum)
}

/// Verifies that guarantees plus the configured reserve fit host memory.
///
/// # Errors
///
/// Returns `ResourceNotAvailable` describing the overcommit in bytes.
pub fn check_mem_guarantee(rt: &Runtime) -> Result<()> {
    let total = rt.host_memory();
    let usage = total_mem_guarantee(&rt.root());
    let reserve = rt.config.memory_guarantee_reserve;

    if usage + reserve > total {
        return Err(Error::new(
            ErrorKind::ResourceNotAvailable,
            format!(
                "memory guarantee overcommit by {} bytes",
                usage + reserve - total
            ),
        ));
    }
    Ok(())
}

/// Creates the container working directory owned by the task credentials,
/// clearing any stale directory left from a previous life.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or chowned.
pub fn create_work_dir(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    if ct.is_root() {
        return Ok(());
    }
    let dir = ct.work_dir(&rt.config);
    if dir.exists() {
        tracing::info!(container = %ct, "removing stale working dir");
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::error!(container = %ct, error = %e, "cannot remove stale working dir");
        }
    }

    std::fs::create_dir_all(&dir).map_err(|e| Error::system("mkdir", &e).context(dir.display()))?;

    let (uid, gid) = {
        let data = ct.lock_data();
        (data.task_uid, data.task_gid)
    };
    nix::unistd::chown(
        &dir,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    )
    .map_err(|e| {
        let _ = std::fs::remove_dir(&dir);
        crate::sys_err("chown", e).context(dir.display())
    })?;
    Ok(())
}

/// Removes the working directory; failures are logged, not surfaced.
pub fn remove_work_dir(rt: &Runtime, ct: &Arc<Container>) {
    if ct.is_root() {
        return;
    }
    let dir = ct.work_dir(&rt.config);
    if !dir.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(&dir) {
        tracing::error!(container = %ct, error = %e, "cannot remove working dir");
    }
}

/// Registers the OOM notifier for a container and parks the fd in its data
/// block while the container is live.
///
/// # Errors
///
/// Returns an error if the eventfd or the registration fails.
pub fn prepare_oom_monitor(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    let memcg = ct.cgroup(&MEMORY_SUBSYSTEM);
    let event = memory::setup_oom_event(&memcg)?;
    rt.epoll.register_oom(&event, ct)?;
    ct.lock_data().oom_event = Some(event);
    Ok(())
}

/// Drops the OOM notifier registration and fd.
pub fn shutdown_oom(rt: &Runtime, ct: &Arc<Container>) {
    let event = ct.lock_data().oom_event.take();
    if let Some(event) = event {
        rt.epoll.deregister(&event);
    }
}

/// Creates and configures every cgroup the container owns.
///
/// # Errors
///
/// Returns `NotSupported` when a required hierarchy is not mounted, or the
/// underlying write error.
pub fn prepare_cgroups(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    // Inherit CPU placement, or grow a cpuset when the parent has
    // reservations that must not leak into this container.
    if let Some(parent) = ct.parent() {
        let _cpu = rt.topology();
        let parent_data = parent.lock_data();
        let reserved = parent_data.cpu_affinity != parent_data.cpu_vacant;
        let affinity = parent_data.cpu_affinity.clone();
        let vacant = parent_data.cpu_vacant.clone();
        drop(parent_data);

        let mut data = ct.lock_data();
        if !data.prop_set.test(Prop::CpuSet) {
            if reserved {
                tracing::info!(container = %ct, "enabling cpuset: parent has reserved cpus");
                data.controllers |= cgroup::CPUSET;
                data.required_controllers |= cgroup::CPUSET;
            } else {
                data.cpu_affinity = affinity;
                data.cpu_vacant = vacant;
            }
        }
        if data.controllers & cgroup::CPUSET != 0 {
            data.prop_set.set(Prop::CpuSet);
            data.prop_set.set(Prop::CpuSetAffinity);
        }
    }

    let (controllers, classid) = {
        let data = ct.lock_data();
        (data.controllers, data.net.classid)
    };

    let mut missing = controllers;
    for subsys in cgroup::SUBSYSTEMS {
        if controllers & subsys.kind == 0 {
            continue;
        }
        missing &= !subsys.kind;
        if !subsys.supported() {
            missing |= subsys.kind;
            continue;
        }
        let cg = ct.cgroup(subsys);
        if !cg.exists() {
            cg.create()?;
        }
    }
    if missing != 0 {
        return Err(Error::new(
            ErrorKind::NotSupported,
            format!(
                "cgroup controllers not available: {}",
                cgroup::format_controllers(missing)
            ),
        ));
    }

    if !ct.is_root() && controllers & cgroup::MEMORY != 0 {
        let memcg = ct.cgroup(&MEMORY_SUBSYSTEM);
        memory::set_use_hierarchy(&memcg)?;
        prepare_oom_monitor(rt, ct).map_err(|e| e.context("oom monitor"))?;
    }

    // A nested devices cgroup copies its parent at creation; the first level
    // starts from the host-wide default.
    if ct.level == 1 && controllers & cgroup::DEVICES != 0 {
        let devcg = ct.cgroup(&cgroup::DEVICES_SUBSYSTEM);
        misc::allow_all_devices(&devcg)?;
    }

    if controllers & cgroup::NETCLS != 0 {
        let netcg = ct.cgroup(&NETCLS_SUBSYSTEM);
        misc::set_classid(&netcg, classid)?;
    }

    apply::update_soft_limit(rt, ct)?;

    Ok(())
}

/// Prepares everything a task launch needs: CPU placement, guarantee
/// headroom, working directory, cgroups, traffic classes and volumes.
///
/// # Errors
///
/// Rolls resources back and returns the failure.
pub fn prepare_resources(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    if ct.is_root() {
        affinity::distribute_cpus(rt, ct)?;
    }

    check_mem_guarantee(rt)?;
    create_work_dir(rt, ct)?;

    let result = (|| {
        ct.lock_data().net.setup()?;
        prepare_cgroups(rt, ct).map_err(|e| e.context("prepare cgroups"))?;
        volumes::check_required(&ct.lock_data())?;
        apply::propagate_cpu_limit(rt, ct);
        Ok(())
    })();

    if let Err(e) = result {
        free_resources(rt, ct);
        return Err(e);
    }
    Ok(())
}

/// Releases resources a dead container no longer needs: the OOM notifier,
/// the soft-limit squeeze, CPU reservations and guarantee roll-ups.
pub fn free_runtime_resources(rt: &Runtime, ct: &Arc<Container>) {
    shutdown_oom(rt, ct);

    if let Err(e) = apply::update_soft_limit(rt, ct) {
        tracing::error!(container = %ct, error = %e, "cannot update memory soft limit");
    }

    let reserved = !ct.lock_data().cpu_reserve.is_empty();
    if reserved {
        if let Some(parent) = ct.parent() {
            tracing::info!(container = %ct, "releasing reserved cpus");
            if let Err(e) = affinity::distribute_cpus(rt, &parent) {
                tracing::error!(container = %ct, error = %e, "cannot redistribute cpus");
            }
        }
    }

    apply::propagate_cpu_limit(rt, ct);

    if ct.lock_data().cpu_guarantee != 0 && rt.config.propagate_cpu_guarantee {
        let mut cursor = ct.parent();
        while let Some(node) = cursor {
            cursor = node.parent();
            if let Err(e) = apply::apply_cpu_guarantee(rt, &node) {
                tracing::warn!(container = %node, error = %e, "cannot update cpu guarantee");
            }
        }
    }
}

/// Full teardown: runtime resources, traffic classes, cgroups, volumes,
/// working directory and stdio files.
pub fn free_resources(rt: &Runtime, ct: &Arc<Container>) {
    free_runtime_resources(rt, ct);

    ct.lock_data().net.teardown();

    if ct.is_root() {
        return;
    }

    let controllers = ct.lock_data().controllers;
    for subsys in cgroup::SUBSYSTEMS {
        if controllers & subsys.kind == 0 || !subsys.supported() {
            continue;
        }
        let cg = ct.cgroup(subsys);
        if let Err(e) = cg.remove() {
            tracing::warn!(container = %ct, cgroup = %cg, error = %e, "cannot remove cgroup");
        }
    }

    let links = volumes::unlink_all(&mut ct.lock_data());
    volumes::destroy_unlinked(links);

    remove_work_dir(rt, ct);
    crate::task::remove_stdio(rt, ct);
}
