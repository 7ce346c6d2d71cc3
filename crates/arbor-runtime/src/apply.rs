//! Resource applier: pushes dirty properties to the kernel.
//!
//! `apply_dynamic` runs under the container's write lock whenever properties
//! changed in a way that must reach cgroups. Steps run in a fixed order
//! (cheap and most-constraining writes first, cross-container arithmetic
//! last); each step clears its dirty bit only after a successful write and a
//! failure returns immediately leaving the remaining bits set.

use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

use arbor_common::types::ContainerState;
use arbor_common::{Error, ErrorKind, Result};
use arbor_core::cgroup::{
    self, cpu, freezer, io, memory, misc, BLKIO_SUBSYSTEM, CPU_SUBSYSTEM, FREEZER_SUBSYSTEM,
    HUGETLB_SUBSYSTEM, MEMORY_SUBSYSTEM, PIDS_SUBSYSTEM,
};
use arbor_core::sched::{self, SchedKnobs};
use arbor_core::ulimit::UlimitSet;

use crate::affinity;
use crate::container::Container;
use crate::context::Runtime;
use crate::props::Prop;

/// Scheduler knobs from the daemon config.
#[must_use]
pub fn sched_knobs(rt: &Runtime) -> SchedKnobs {
    SchedKnobs {
        rt_priority: rt.config.rt_priority,
        rt_nice: rt.config.rt_nice,
        high_nice: rt.config.high_nice,
    }
}

/// Recomputes memory soft limits from this container up to the root.
///
/// Dead containers and hollow meta containers (no running or starting
/// descendants) get squeezed when `pressurize_on_death` is set.
///
/// # Errors
///
/// Returns an error if a soft-limit write fails.
pub fn update_soft_limit(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    let mut cursor = Some(Arc::clone(ct));
    while let Some(node) = cursor {
        if node.is_root() {
            break;
        }
        cursor = node.parent();

        if node.lock_data().controllers & cgroup::MEMORY == 0 {
            continue;
        }
        // Resolve the cgroup before re-taking the data lock: the path walk
        // locks data itself.
        let cg = node.cgroup(&MEMORY_SUBSYSTEM);

        let mut data = node.lock_data();
        let hollow_meta = node.state() == ContainerState::Meta
            && node.running_children() == 0
            && node.starting_children() == 0;
        let limit = if data.pressurize_on_death
            && (node.state() == ContainerState::Dead || hollow_meta)
        {
            rt.config.dead_memory_soft_limit as i64
        } else {
            -1
        };

        if data.mem_soft_limit != limit {
            if cg.exists() {
                memory::set_soft_limit(&cg, limit)?;
            }
            data.mem_soft_limit = limit;
        }
    }
    Ok(())
}

/// Effective ulimit set: own entries override, ancestors fill the gaps.
#[must_use]
pub fn effective_ulimit(ct: &Arc<Container>) -> UlimitSet {
    let mut merged = ct.lock_data().ulimit.clone();
    for anc in ct.ancestors() {
        merged.merge(&anc.lock_data().ulimit, false);
    }
    merged
}

/// Applies the effective ulimits to every task of the container, using the
/// stable-iteration idiom. ESRCH is a race with exit and is ignored.
///
/// # Errors
///
/// Returns an error if the task list cannot be read or a limit write fails
/// for a live task.
pub fn apply_ulimits(ct: &Arc<Container>) -> Result<()> {
    let limits = effective_ulimit(ct);
    if limits.is_empty() {
        return Ok(());
    }
    tracing::debug!(container = %ct, "applying ulimits");
    let cg = ct.cgroup(&FREEZER_SUBSYSTEM);
    cgroup::for_each_task(&cg, |pid| match limits.apply(pid) {
        Err(e) if e.is_errno(libc::ESRCH) => Ok(()),
        r => r,
    })
}

/// Applies the scheduler policy to every task of the container.
///
/// # Errors
///
/// Returns an error if a priority or scheduler write fails for a live task.
pub fn apply_sched_policy(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    let spec = {
        let data = ct.lock_data();
        sched::choose(data.cpu_policy, data.cpu_weight, &sched_knobs(rt))
    };
    tracing::debug!(container = %ct, ?spec, "applying scheduler policy");
    let cg = ct.cgroup(&FREEZER_SUBSYSTEM);
    cgroup::for_each_task(&cg, |pid| {
        if sched::task_policy(pid) == spec.policy && spec.policy != libc::SCHED_OTHER {
            return Ok(());
        }
        match sched::apply_to_task(pid, &spec) {
            Err(e) if e.is_errno(libc::ESRCH) => Ok(()),
            r => r,
        }
    })
}

/// Io priority (class, level) implied by an io policy name.
#[must_use]
pub fn policy_to_ioprio(policy: &str) -> Option<(i32, i32)> {
    match policy {
        "" | "none" => None,
        "rt" => Some((1, 4)),
        "high" => Some((2, 0)),
        "normal" => Some((2, 4)),
        "batch" => Some((2, 7)),
        "idle" => Some((3, 0)),
        _ => None,
    }
}

/// Applies the io priority implied by `io_policy` to every task.
///
/// # Errors
///
/// Returns an error if an ioprio write fails for a live task.
pub fn apply_io_policy(ct: &Arc<Container>) -> Result<()> {
    let policy = ct.lock_data().io_policy.clone();
    let Some((class, level)) = policy_to_ioprio(&policy) else {
        return Ok(());
    };
    tracing::debug!(container = %ct, policy = %policy, "applying io policy");
    let cg = ct.cgroup(&FREEZER_SUBSYSTEM);
    cgroup::for_each_task(&cg, |pid| match sched::set_io_prio(pid, class, level) {
        Err(e) if e.is_errno(libc::ESRCH) => Ok(()),
        r => r,
    })
}

/// Rewrites `/etc/resolv.conf` inside the container root.
///
/// # Errors
///
/// Returns `InvalidState` without a task, `NotSupported` when the target is
/// not on tmpfs, or the underlying write error.
pub fn apply_resolv_conf(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    let (task_pid, content) = {
        let data = ct.lock_data();
        let explicit = data.prop_set.test(Prop::ResolvConf);
        if explicit {
            if data.resolv_conf.is_empty() {
                return Ok(());
            }
        } else if data.root.as_os_str() == "/" {
            return Ok(());
        }
        let lines = if data.resolv_conf.is_empty() {
            rt.root().lock_data().resolv_conf.clone()
        } else {
            data.resolv_conf.clone()
        };
        (data.task_pid, lines.join("\n") + "\n")
    };

    if task_pid == 0 {
        return Err(Error::new(ErrorKind::InvalidState, "no container task pid"));
    }

    let path = format!("/proc/{task_pid}/root/etc/resolv.conf");
    let file = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC | libc::O_NOCTTY)
        .open(&path)
        .map_err(|e| Error::system("open", &e).context(&path))?;

    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    // SAFETY: stat is valid for the duration of the call.
    let rc = unsafe { libc::fstatfs(file.as_raw_fd(), &mut stat) };
    if rc != 0 || stat.f_type != libc::TMPFS_MAGIC {
        return Err(Error::new(ErrorKind::NotSupported, "resolv.conf not on tmpfs"));
    }

    tracing::info!(container = %ct, "rewriting resolv.conf");
    file.set_len(0).map_err(|e| Error::system("truncate", &e))?;
    use std::io::Write;
    let mut file = file;
    file.write_all(content.as_bytes())
        .map_err(|e| Error::system("write", &e))?;
    Ok(())
}

/// Applies device rules: permission check against the owner, the devices
/// cgroup list, and node creation under a chroot root.
///
/// # Errors
///
/// Returns `Permission` for rules a non-root owner may not grant, or the
/// underlying write error.
pub fn apply_device_conf(ct: &Arc<Container>) -> Result<()> {
    if ct.is_root() {
        return Ok(());
    }
    let (rules, owner_uid, task_pid, chrooted, state) = {
        let data = ct.lock_data();
        (
            data.devices.clone(),
            data.owner_uid,
            data.wait_task_pid,
            data.root.as_os_str() != "/",
            ct.state(),
        )
    };

    if !rules.is_empty() && owner_uid != 0 {
        return Err(Error::new(
            ErrorKind::Permission,
            "only root-owned containers may widen device access",
        ));
    }

    let cg = ct.cgroup(&cgroup::DEVICES_SUBSYSTEM);
    if cg.exists() {
        misc::apply_device_rules(&cg, &rules)?;
    }

    // Repopulate /dev inside a chroot once the task exists.
    if state != ContainerState::Starting && task_pid != 0 && chrooted {
        for rule in &rules {
            if let Err(e) = make_device_node(task_pid, rule) {
                tracing::warn!(container = %ct, rule = %rule, error = %e, "cannot create device node");
            }
        }
    }
    Ok(())
}

/// Creates the device node named by a rule like `c 1:3 rwm /dev/null` inside
/// the task's root.
fn make_device_node(task_pid: i32, rule: &str) -> Result<()> {
    let mut parts = rule.split_whitespace();
    let kind = parts.next().unwrap_or("");
    let numbers = parts.next().unwrap_or("");
    let _access = parts.next();
    let Some(path) = parts.next() else {
        return Ok(());
    };
    let Some((major, minor)) = numbers.split_once(':') else {
        return Ok(());
    };
    let (Ok(major), Ok(minor)) = (major.parse::<u64>(), minor.parse::<u64>()) else {
        return Ok(());
    };
    let sflag = match kind {
        "c" => nix::sys::stat::SFlag::S_IFCHR,
        "b" => nix::sys::stat::SFlag::S_IFBLK,
        _ => return Ok(()),
    };
    let target = format!("/proc/{task_pid}/root{path}");
    match nix::sys::stat::mknod(
        target.as_str(),
        sflag,
        nix::sys::stat::Mode::from_bits_truncate(0o666),
        nix::sys::stat::makedev(major, minor),
    ) {
        Ok(()) | Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(crate::sys_err("mknod", e).context(target)),
    }
}

/// Recomputes and applies the cpu guarantee of one container.
///
/// With guarantee propagation enabled the children's guarantees roll up into
/// `cpu_guarantee_sum` first.
///
/// # Errors
///
/// Returns an error if the cgroup write fails.
pub fn apply_cpu_guarantee(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    if rt.config.propagate_cpu_guarantee {
        let mut sum = 0;
        for child in ct.childs() {
            if child.state().is_live() {
                let cd = child.lock_data();
                sum += cd.cpu_guarantee.max(cd.cpu_guarantee_sum);
            }
        }
        ct.lock_data().cpu_guarantee_sum = sum;
    }

    let cg = ct.cgroup(&CPU_SUBSYSTEM);
    let mut data = ct.lock_data();
    let cur = data.cpu_guarantee.max(data.cpu_guarantee_sum);
    if !ct.is_root() && data.controllers & cgroup::CPU != 0 && cur != data.cpu_guarantee_cur {
        tracing::info!(
            container = %ct,
            from = data.cpu_guarantee_cur,
            to = cur,
            "setting cpu guarantee"
        );
        if cg.exists() {
            cpu::set_guarantee(&cg, data.cpu_weight, cur)?;
        }
        data.cpu_guarantee_cur = cur;
    }
    Ok(())
}

/// Recomputes the cached `cpu_limit_sum` on this container and its
/// ancestors; stops at the first node whose sum is unchanged.
pub fn propagate_cpu_limit(rt: &Runtime, ct: &Arc<Container>) {
    let max = rt.root().lock_data().cpu_limit;
    let mut cursor = Some(Arc::clone(ct));
    while let Some(node) = cursor {
        cursor = node.parent();

        let mut sum = 0;
        {
            let data = node.lock_data();
            let live_task = node.state() == ContainerState::Running
                || (node.state() == ContainerState::Starting && !data.command.is_empty());
            if live_task {
                sum += if data.cpu_limit != 0 { data.cpu_limit } else { max };
            }
        }
        for child in node.childs() {
            let cd = child.lock_data();
            let limit = if cd.cpu_limit != 0 { cd.cpu_limit } else { max };
            match child.state() {
                ContainerState::Running => sum += limit,
                ContainerState::Starting if !cd.command.is_empty() => sum += limit,
                ContainerState::Meta => sum += limit.min(cd.cpu_limit_sum),
                _ => {}
            }
        }

        let mut data = node.lock_data();
        if sum == data.cpu_limit_sum {
            break;
        }
        tracing::debug!(container = %node, from = data.cpu_limit_sum, to = sum, "cpu limit sum");
        data.cpu_limit_sum = sum;
    }
}

/// Writes a bandwidth limit to one container's cpu cgroup.
///
/// # Errors
///
/// Returns an error if the cfs write fails, or the rt write fails for an RT
/// container.
fn set_cpu_limit(ct: &Arc<Container>, limit: u64) -> Result<()> {
    let cg = ct.cgroup(&CPU_SUBSYSTEM);
    let mut data = ct.lock_data();
    tracing::info!(container = %ct, from = data.cpu_limit_cur, to = limit, "setting cpu limit");
    if cg.exists() {
        if let Err(e) = cpu::set_rt_limit(&cg, data.cpu_period, limit) {
            if data.cpu_policy == arbor_core::sched::CpuPolicy::Rt {
                return Err(e);
            }
            tracing::warn!(container = %ct, error = %e, "cannot set rt cpu limit");
        }
        cpu::set_limit(&cg, data.cpu_period, limit)?;
    }
    data.cpu_limit_cur = limit;
    Ok(())
}

/// Effective limit of a container given its ancestors: a parent with an
/// equal or lower limit disables the child's own quota.
fn effective_cpu_limit(ct: &Arc<Container>) -> u64 {
    let limit = ct.lock_data().cpu_limit;
    if limit == 0 {
        return 0;
    }
    for anc in ct.ancestors() {
        let parent_limit = anc.lock_data().cpu_limit;
        if parent_limit != 0 && parent_limit <= limit {
            return 0;
        }
    }
    limit
}

/// Applies the cpu limit to this container and fixes up the whole subtree.
///
/// When lowering, descendants above the new limit are clamped first so the
/// kernel never observes a child quota above its parent's.
///
/// # Errors
///
/// Returns an error if a cgroup write fails.
pub fn apply_cpu_limit(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    let limit = effective_cpu_limit(ct);
    let subtree = ct.subtree();

    let applies = |node: &Arc<Container>| {
        node.id != ct.id
            && node.state() != ContainerState::Stopped
            && node.lock_data().controllers & cgroup::CPU != 0
    };

    if limit != 0 {
        let cur = ct.lock_data().cpu_limit_cur;
        if cur == 0 || limit < cur {
            for node in &subtree {
                if applies(node) && node.lock_data().cpu_limit_cur > limit {
                    set_cpu_limit(node, limit)?;
                }
            }
        }
    }

    set_cpu_limit(ct, limit)?;

    for node in &subtree {
        if applies(node) {
            let effective = effective_cpu_limit(node);
            if effective != node.lock_data().cpu_limit_cur {
                set_cpu_limit(node, effective)?;
            }
        }
    }
    Ok(())
}

/// Drains pending OOM notifications into the container's counters.
///
/// Returns true when at least one notification fired.
pub fn recv_oom_events(
    rt: &Runtime,
    ct: &Arc<Container>,
    data: &mut crate::container::ContainerData,
) -> bool {
    let Some(event) = data.oom_event.as_ref() else {
        return false;
    };
    let fired = memory::read_oom_events(event);
    if fired == 0 {
        return false;
    }
    data.oom_events += fired;
    crate::context::Statistics::bump(&rt.stats.containers_oom);
    tracing::warn!(container = %ct, count = fired, "oom event");
    true
}

/// Pushes every dirty property to the kernel, in the fixed order.
///
/// # Errors
///
/// Returns the first failure; remaining dirty bits stay set for the caller
/// to retry or revert.
pub fn apply_dynamic(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    let memcg = ct.cgroup(&MEMORY_SUBSYSTEM);
    let blkcg = ct.cgroup(&BLKIO_SUBSYSTEM);

    // Memory knobs.
    {
        let mut data = ct.lock_data();
        if data.prop_dirty.take(Prop::MemGuarantee) {
            if let Err(e) = memory::set_guarantee(&memcg, data.mem_guarantee) {
                data.prop_dirty.set(Prop::MemGuarantee);
                if e.is_errno(libc::EBUSY) {
                    return Err(e.with_kind(ErrorKind::InvalidValue));
                }
                return Err(e);
            }
        }
        if data.prop_dirty.take(Prop::MemLimit) {
            if let Err(e) = memory::set_limit(&memcg, data.mem_limit) {
                data.prop_dirty.set(Prop::MemLimit);
                return Err(e);
            }
        }
        if data.prop_dirty.take(Prop::AnonLimit) {
            match memory::set_anon_limit(&memcg, data.anon_limit) {
                Err(e) if !e.is_errno(libc::EINVAL) => {
                    data.prop_dirty.set(Prop::AnonLimit);
                    return Err(e);
                }
                _ => {}
            }
        }
        if data.prop_dirty.take(Prop::DirtyLimit) {
            match memory::set_dirty_limit(&memcg, data.dirty_limit) {
                Err(e) if !e.is_errno(libc::EINVAL) => {
                    data.prop_dirty.set(Prop::DirtyLimit);
                    return Err(e);
                }
                _ => {}
            }
        }
        if data.prop_dirty.take(Prop::RechargeOnPgfault) {
            match memory::set_recharge_on_pgfault(&memcg, data.recharge_on_pgfault) {
                Err(e) if !e.is_errno(libc::EINVAL) => {
                    data.prop_dirty.set(Prop::RechargeOnPgfault);
                    return Err(e);
                }
                _ => {}
            }
        }
    }

    if ct.lock_data().prop_dirty.take(Prop::PressurizeOnDeath) {
        if let Err(e) = update_soft_limit(rt, ct) {
            ct.lock_data().prop_dirty.set(Prop::PressurizeOnDeath);
            return Err(e);
        }
    }

    // Io limits: filesystem entry via memcg, devices via blkio.
    {
        let mut data = ct.lock_data();
        if data.prop_dirty.take(Prop::IoBpsLimit) {
            let result = (|| {
                if let Some(&bps) = data.io_bps_limit.get("fs") {
                    memory::set_fs_bps_limit(&memcg, bps)?;
                }
                io::set_limits(&blkcg, &data.io_bps_limit, false)
            })();
            if let Err(e) = result {
                data.prop_dirty.set(Prop::IoBpsLimit);
                return Err(e);
            }
        }
        if data.prop_dirty.take(Prop::IoOpsLimit) {
            let result = (|| {
                if let Some(&iops) = data.io_ops_limit.get("fs") {
                    memory::set_fs_iops_limit(&memcg, iops)?;
                }
                io::set_limits(&blkcg, &data.io_ops_limit, true)
            })();
            if let Err(e) = result {
                data.prop_dirty.set(Prop::IoOpsLimit);
                return Err(e);
            }
        }
        let weight_dirty = data.prop_dirty.take(Prop::IoWeight);
        if weight_dirty || data.prop_dirty.test(Prop::IoPolicy) {
            if data.controllers & cgroup::BLKIO != 0 {
                if let Err(e) = io::set_weight(&blkcg, &data.io_policy, data.io_weight) {
                    if weight_dirty {
                        data.prop_dirty.set(Prop::IoWeight);
                    }
                    return Err(e);
                }
            }
        }
    }

    if ct.lock_data().prop_dirty.take(Prop::IoPolicy) {
        if let Err(e) = apply_io_policy(ct) {
            ct.lock_data().prop_dirty.set(Prop::IoPolicy);
            return Err(e);
        }
    }

    if ct.lock_data().prop_dirty.take(Prop::HugetlbLimit) {
        let hugecg = ct.cgroup(&HUGETLB_SUBSYSTEM);
        let limit = ct.lock_data().hugetlb_limit;
        match misc::set_hugetlb_limit(&hugecg, limit) {
            Err(e) if !e.is_errno(libc::EINVAL) => {
                ct.lock_data().prop_dirty.set(Prop::HugetlbLimit);
                return Err(e);
            }
            _ => {
                if misc::supports_giga_pages(&hugecg) {
                    if let Err(e) = misc::forbid_giga_pages(&hugecg) {
                        tracing::warn!(container = %ct, error = %e, "cannot forbid 1G pages");
                    }
                }
            }
        }
    }

    // Cpu guarantee: rolls up through ancestors when propagation is on.
    {
        let (has_cpu, guarantee_dirty) = {
            let mut data = ct.lock_data();
            let dirty =
                data.prop_dirty.test(Prop::CpuPeriod) | data.prop_dirty.take(Prop::CpuGuarantee);
            (data.controllers & cgroup::CPU != 0, dirty)
        };
        if has_cpu && guarantee_dirty {
            let mut cursor = Some(Arc::clone(ct));
            while let Some(node) = cursor {
                cursor = node.parent();
                apply_cpu_guarantee(rt, &node)?;
                if !rt.config.propagate_cpu_guarantee {
                    break;
                }
            }
        }
    }

    if ct.lock_data().prop_dirty.test(Prop::CpuLimit) {
        propagate_cpu_limit(rt, ct);
    }

    {
        let (has_cpu, limit_dirty) = {
            let mut data = ct.lock_data();
            let dirty = data.prop_dirty.test(Prop::CpuPolicy)
                | data.prop_dirty.test(Prop::CpuWeight)
                | data.prop_dirty.take(Prop::CpuLimit)
                | data.prop_dirty.take(Prop::CpuPeriod);
            (data.controllers & cgroup::CPU != 0, dirty)
        };
        if has_cpu && limit_dirty {
            apply_cpu_limit(rt, ct)?;
        }
    }

    {
        let sched_dirty = {
            let mut data = ct.lock_data();
            data.prop_dirty.take(Prop::CpuPolicy) | data.prop_dirty.take(Prop::CpuWeight)
        };
        if sched_dirty {
            apply_sched_policy(rt, ct)?;
        }
    }

    if ct.lock_data().prop_dirty.take(Prop::CpuSet) {
        if let Some(parent) = ct.parent() {
            if let Err(e) = affinity::distribute_cpus(rt, &parent) {
                ct.lock_data().prop_dirty.set(Prop::CpuSet);
                return Err(e);
            }
        }
    }

    {
        let net_dirty = {
            let mut data = ct.lock_data();
            data.prop_dirty.take(Prop::NetPrio)
                | data.prop_dirty.take(Prop::NetLimit)
                | data.prop_dirty.take(Prop::NetGuarantee)
                | data.prop_dirty.take(Prop::NetRxLimit)
        };
        if net_dirty {
            ct.lock_data().net.setup()?;
        }
    }

    if ct.lock_data().prop_dirty.take(Prop::Ulimit) {
        for node in ct.subtree() {
            if matches!(node.state(), ContainerState::Stopped | ContainerState::Dead) {
                continue;
            }
            apply_ulimits(&node)?;
        }
    }

    if ct.lock_data().prop_dirty.take(Prop::ThreadLimit) {
        let limit = ct.lock_data().thread_limit;
        let cg = ct.cgroup(&PIDS_SUBSYSTEM);
        if cg.exists() {
            if let Err(e) = misc::set_thread_limit(&cg, limit) {
                ct.lock_data().prop_dirty.set(Prop::ThreadLimit);
                return Err(e);
            }
        }
    }

    if ct.lock_data().prop_dirty.take(Prop::ResolvConf) {
        if let Err(e) = apply_resolv_conf(rt, ct) {
            ct.lock_data().prop_dirty.set(Prop::ResolvConf);
            return Err(e);
        }
    }

    if ct.lock_data().prop_dirty.take(Prop::Devices) {
        if let Err(e) = apply_device_conf(ct) {
            ct.lock_data().prop_dirty.set(Prop::Devices);
            return Err(e);
        }
    }

    Ok(())
}

/// Thaws the container if it froze itself; used by stop and recovery.
///
/// # Errors
///
/// Returns an error if the thaw write fails.
pub fn thaw_if_self_frozen(ct: &Arc<Container>) -> Result<()> {
    let cg = ct.cgroup(&FREEZER_SUBSYSTEM);
    if cg.exists() && freezer::is_self_freezing(&cg) {
        tracing::info!(container = %ct, "thawing self-frozen container");
        freezer::thaw(&cg, false)?;
    }
    Ok(())
}
