//! Container lifecycle pipeline: create, destroy, start, stop, pause,
//! resume, exit handling and respawn.

use std::path::{Component, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arbor_common::constants::{
    CONTAINER_LEVEL_MAX, SERVICE_CONTAINERS_RESERVE, SUPERUSER_CONTAINERS_BONUS,
};
use arbor_common::types::{AccessLevel, ContainerState};
use arbor_common::{Error, ErrorKind, Result};
use arbor_core::capability::{self, CapSet};
use arbor_core::cgroup::{self, freezer, memory, FREEZER_SUBSYSTEM, MEMORY_SUBSYSTEM};
use arbor_core::host;
use nix::sys::signal::{kill as kill_task, Signal};
use nix::unistd::Pid;

pub use crate::apply::recv_oom_events;
use crate::apply;
use crate::container::{Container, ContainerData};
use crate::context::{ClientContext, Runtime, Statistics};
use crate::events::{self, Event, Waiter};
use crate::kv;
use crate::locks::SubtreeLock;
use crate::props::{self, Prop, ALL_PROPS};
use crate::registry::{parent_name, validate_name};
use crate::resources;
use crate::task;
use crate::volumes;

/// Default place granted to chrooted containers that did not set one.
const DEFAULT_PLACE: &str = "/place";

/// Persists a container's record: reserved keys plus every set property.
///
/// # Errors
///
/// Returns an error if a property cannot be read or the record cannot be
/// written.
pub fn save(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    let mut record = kv::Record::new();
    record.insert(kv::KEY_ID.to_string(), ct.id.to_string());
    record.insert(kv::KEY_NAME.to_string(), ct.name.clone());
    record.insert(kv::KEY_STATE.to_string(), ct.state().to_string());

    let data = ct.lock_data();
    for prop in ALL_PROPS {
        if !prop.persisted() || !data.prop_set.test(prop) {
            continue;
        }
        let value = props::get_prop(&data, prop)?;
        record.insert(prop.name().to_string(), value);
    }
    drop(data);

    rt.kv.save(ct.id, &record)
}

/// Narrows the capability sets per the ownership and isolation rules.
///
/// Root owners get the full host bound (or their explicit limit). Everyone
/// else starts from the host bound, narrows through every ancestor's limit,
/// loses capability groups whose isolation is missing, and narrows to the
/// chroot-safe bound inside a chroot.
pub fn sanitize_capabilities(ct: &Arc<Container>) {
    let host_bound = CapSet::host_bound();

    let mut chroot = false;
    let mut pidns = false;
    let mut memcg = false;
    let mut limit = host_bound;
    {
        let data = ct.lock_data();
        chroot |= data.root.as_os_str() != "/";
        pidns |= data.isolate;
        memcg |= data.mem_limit != 0;
        if data.prop_set.test(Prop::CapLimit) {
            limit = limit.intersect(data.cap_limit);
        }
    }
    for anc in ct.ancestors() {
        let data = anc.lock_data();
        chroot |= data.root.as_os_str() != "/";
        pidns |= data.isolate;
        memcg |= data.mem_limit != 0;
        if data.prop_set.test(Prop::CapLimit) {
            limit = limit.intersect(data.cap_limit);
        }
    }

    let mut data = ct.lock_data();
    if data.owner_uid == 0 {
        data.cap_bound = if data.prop_set.test(Prop::CapLimit) {
            data.cap_limit
        } else {
            host_bound
        };
        data.cap_allowed = data.cap_bound;
    } else {
        let mut remove = CapSet::NONE;
        if !pidns {
            remove = remove.union(capability::PID_NS_CAPS);
        }
        if !memcg {
            remove = remove.union(capability::MEM_CG_CAPS);
        }
        // No private network namespace in this tree: the caps go too.
        remove = remove.union(capability::NET_NS_CAPS);

        data.cap_bound = limit;
        if chroot {
            data.cap_bound = data
                .cap_bound
                .intersect(capability::CHROOT_BOUND)
                .without(remove);
            data.cap_allowed = data.cap_bound;
        } else {
            data.cap_allowed = capability::HOST_ALLOWED
                .intersect(data.cap_bound)
                .without(remove);
        }
    }

    if !data.prop_set.test(Prop::CapLimit) {
        data.cap_limit = data.cap_bound;
    }
}

/// Creates a container: name validation, parent lookup under a read lock,
/// access and quota checks, id allocation, persistence and registration.
///
/// # Errors
///
/// Returns the appropriate kind for every §4.7 failure: `InvalidValue`,
/// `ContainerDoesNotExist`, `Permission`, `ContainerAlreadyExists`,
/// `ResourceNotAvailable`.
pub fn create(rt: &Runtime, client: &ClientContext, name: &str) -> Result<Arc<Container>> {
    validate_name(name, client.superuser)?;

    let parent = rt.find(parent_name(name)).map_err(|e| {
        e.context(format!("parent container not found for {name}"))
    })?;
    if parent.level >= CONTAINER_LEVEL_MAX {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("maximum nesting level is {CONTAINER_LEVEL_MAX}"),
        ));
    }

    let _parent_lock = rt.lock_read(&parent)?;

    {
        let pd = parent.lock_data();
        if !client.superuser
            && matches!(
                pd.access_level,
                AccessLevel::None | AccessLevel::ReadIsolate | AccessLevel::ReadOnly
            )
        {
            return Err(Error::new(
                ErrorKind::Permission,
                format!("parent container {} denies child creation", parent.name),
            ));
        }
        client.can_control(pd.owner_uid, pd.owner_gid).or_else(|e| {
            // Anyone may create below the root.
            if parent.is_root() {
                Ok(())
            } else {
                Err(e)
            }
        })?;
    }

    let mut max_containers = rt.config.max_containers;
    if client.superuser {
        max_containers += SUPERUSER_CONTAINERS_BONUS;
    }

    let ct = {
        let mut registry = rt.registry();
        if registry.containers.contains_key(name) {
            return Err(Error::new(
                ErrorKind::ContainerAlreadyExists,
                format!("container {name} already exists"),
            ));
        }
        if registry.containers.len() >= max_containers + SERVICE_CONTAINERS_RESERVE {
            return Err(Error::new(
                ErrorKind::ResourceNotAvailable,
                format!("number of containers reached limit: {max_containers}"),
            ));
        }
        let id = registry.ids.allocate()?;
        drop(registry);
        Container::new(Some(&parent), id, name, &rt.config)
    };

    tracing::info!(container = %ct, "create");

    {
        let mut data = ct.lock_data();
        data.owner_uid = client.uid;
        data.owner_gid = client.gid;
        data.task_uid = client.uid;
        data.task_gid = client.gid;
        data.prop_set.set(Prop::OwnerUser);
        data.prop_set.set(Prop::OwnerGroup);
        data.prop_set.set(Prop::User);
        data.prop_set.set(Prop::Group);
        data.prop_set.set(Prop::State);
        data.respawn_count = 0;
        data.prop_set.set(Prop::RespawnCount);
    }
    sanitize_capabilities(&ct);

    if let Err(e) = save(rt, &ct) {
        rt.registry().ids.release(ct.id);
        return Err(e);
    }

    {
        let mut registry = rt.registry();
        registry.containers.insert(name.to_string(), Arc::clone(&ct));
        drop(registry);
        parent
            .children
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Arc::clone(&ct));
    }
    Statistics::bump(&rt.stats.containers_created);

    Ok(ct)
}

/// Destroys a container and its whole subtree, post-order.
///
/// Takes the subtree write lock itself, so a destroy can never overlap a
/// start in flight anywhere on the chain.
///
/// # Errors
///
/// Returns an error if the container is the root or the stop fails; KV and
/// volume cleanup failures after unregistration are logged only.
pub fn destroy(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    if ct.is_root() {
        return Err(Error::new(ErrorKind::Permission, "cannot destroy root container"));
    }

    let lock = rt.lock_write(ct)?;
    tracing::info!(container = %ct, "destroy");

    if ct.state() != ContainerState::Stopped {
        stop_subtree(rt, ct, 0, None)?;
    }

    let mut orphans = Vec::new();
    for node in ct.subtree() {
        orphans.append(&mut volumes::unlink_all(&mut node.lock_data()));

        {
            let mut registry = rt.registry();
            registry.containers.remove(&node.name);
            if let Some(parent) = node.parent() {
                parent
                    .children
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .retain(|c| c.id != node.id);
            }
            registry.ids.release(node.id);
            node.force_state(ContainerState::Destroyed);
        }

        if let Err(e) = rt.kv.remove(node.id) {
            tracing::error!(container = %node, error = %e, "cannot remove kv record");
        }
    }

    drop(lock);
    volumes::destroy_unlinked(orphans);
    Ok(())
}

/// Starts a container, auto-starting stopped ancestors top-down first.
///
/// Each ancestor is started under its own write lock; the chain is
/// re-computed every round so a concurrent stop or destroy simply
/// re-targets the loop.
///
/// # Errors
///
/// Returns `InvalidState` when the container is not stopped, or whatever a
/// pipeline stage reports.
pub fn start(rt: &Runtime, ct: &Arc<Container>, client: &ClientContext) -> Result<()> {
    if let Some(parent) = ct.parent() {
        let cg = parent.cgroup(&FREEZER_SUBSYSTEM);
        if cg.exists() && freezer::is_frozen(&cg) {
            return Err(Error::new(ErrorKind::InvalidState, "parent container is frozen"));
        }
    }

    loop {
        let mut target = Arc::clone(ct);
        while let Some(parent) = target.parent() {
            if parent.is_root()
                || matches!(
                    parent.state(),
                    ContainerState::Running | ContainerState::Meta
                )
            {
                break;
            }
            target = parent;
        }

        let mut lock = rt.lock_write(&target)?;
        match target.state() {
            ContainerState::Stopped => start_locked(rt, &mut lock, client)?,
            ContainerState::Running | ContainerState::Meta if target.id != ct.id => {
                // Someone else started this ancestor meanwhile; re-target.
            }
            state => {
                drop(lock);
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    format!("cannot start container {} in state {state}", target.name),
                ));
            }
        }
        drop(lock);

        if target.id == ct.id {
            return Ok(());
        }
    }
}

/// The start pipeline for one container whose write lock is already held.
///
/// # Errors
///
/// Tears back down to `Stopped` and returns the failure; an OOM during
/// startup is promoted to `ResourceNotAvailable`.
pub fn start_locked(
    rt: &Runtime,
    lock: &mut SubtreeLock<'_>,
    client: &ClientContext,
) -> Result<()> {
    let ct = Arc::clone(lock.container());

    if ct.state() != ContainerState::Stopped {
        return Err(Error::new(
            ErrorKind::InvalidState,
            format!("cannot start container {} in state {}", ct.name, ct.state()),
        ));
    }

    prepare_start(rt, &ct, client)
        .map_err(|e| e.context(format!("cannot prepare start for container {}", ct.name)))?;

    tracing::info!(container = %ct, "start");
    ct.set_state(rt, ContainerState::Starting);
    {
        let mut data = ct.lock_data();
        data.start_time_ms = host::current_time_ms();
        data.real_start_time = data.start_time_ms / 1000;
        data.prop_set.set(Prop::StartTime);
    }

    if let Err(e) = resources::prepare_resources(rt, &ct) {
        ct.set_state(rt, ContainerState::Stopped);
        Statistics::bump(&rt.stats.containers_failed_start);
        return Err(e);
    }

    // The launcher can take a while; let readers through meanwhile.
    lock.downgrade();
    let launched = start_task(rt, &ct);
    lock.upgrade();

    if let Err(e) = launched {
        ct.set_state(rt, ContainerState::Stopping);
        if let Err(te) = terminate(&ct, 0) {
            tracing::warn!(container = %ct, error = %te, "cannot terminate after failed start");
        }
        resources::free_resources(rt, &ct);
        ct.set_state(rt, ContainerState::Stopped);
        Statistics::bump(&rt.stats.containers_failed_start);
        return Err(e);
    }

    let is_meta = ct.lock_data().command.is_empty();
    ct.set_state(
        rt,
        if is_meta {
            ContainerState::Meta
        } else {
            ContainerState::Running
        },
    );
    ct.lock_data().prop_set.set(Prop::RootPid);

    if let Err(e) = save(rt, &ct) {
        tracing::error!(container = %ct, error = %e, "cannot save state after start");
        reap(rt, &ct, false);
    }
    Statistics::bump(&rt.stats.containers_started);
    Ok(())
}

/// Pushes every set dynamic property to the kernel and launches the task.
fn start_task(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    if ct.is_root() {
        return Ok(());
    }

    {
        let mut data = ct.lock_data();
        let set = data.prop_set;
        for prop in ALL_PROPS {
            if prop.is_dynamic() && set.test(prop) {
                data.prop_dirty.set(prop);
            }
        }
        // Applied by the starting task itself.
        data.prop_dirty.clear(Prop::ResolvConf);
        data.prop_dirty.clear(Prop::Devices);
    }

    apply::apply_dynamic(rt, ct)?;

    if ct.lock_data().command.is_empty() {
        // Pure meta: no payload to run.
        return Ok(());
    }

    match task::launch(rt, ct) {
        Ok(()) => Ok(()),
        Err(e) => {
            let oom = {
                let mut data = ct.lock_data();
                recv_oom_events(rt, ct, &mut data)
            };
            if oom {
                Err(Error::new(
                    ErrorKind::ResourceNotAvailable,
                    format!("OOM at container {} start: {e}", ct.name),
                ))
            } else {
                Err(e)
            }
        }
    }
}

fn prepare_start(rt: &Runtime, ct: &Arc<Container>, client: &ClientContext) -> Result<()> {
    {
        let data = ct.lock_data();
        client.can_control(data.owner_uid, data.owner_gid)?;
    }

    // Normalize the root path against the parent's resolved root.
    if let Some(parent) = ct.parent() {
        let parent_root = parent.lock_data().root_path.clone();
        let mut data = ct.lock_data();
        if data.root.components().any(|c| c == Component::ParentDir) {
            return Err(Error::new(ErrorKind::Permission, "root path with .."));
        }
        data.root_path = if data.root.as_os_str() == "/" {
            parent_root
        } else {
            let rel: PathBuf = data
                .root
                .components()
                .filter(|c| !matches!(c, Component::RootDir | Component::CurDir))
                .collect();
            parent_root.join(rel)
        };
    }

    sanitize_capabilities(ct);

    {
        let data = ct.lock_data();

        // Even without capabilities a root uid task needs a chroot unless
        // the owner is root.
        if data.root_path.as_os_str() == "/" && data.task_uid == 0 && data.owner_uid != 0 {
            return Err(Error::new(ErrorKind::Permission, "user=root requires chroot"));
        }

        if !data.cap_limit.is_subset_of(data.cap_bound) {
            let extra = data.cap_limit.without(data.cap_bound);
            return Err(Error::new(
                ErrorKind::Permission,
                format!("capabilities out of bounds: {extra}"),
            ));
        }
        if !data.cap_ambient.is_subset_of(data.cap_allowed) {
            let extra = data.cap_ambient.without(data.cap_allowed);
            return Err(Error::new(
                ErrorKind::Permission,
                format!("ambient capabilities out of bounds: {extra}"),
            ));
        }
    }

    // Place list inheritance and enforcement.
    if let Some(parent) = ct.parent() {
        let parent_places = parent.lock_data().place.clone();
        let mut data = ct.lock_data();
        if data.prop_set.test(Prop::Place) {
            for place in &data.place {
                let allowed = parent_places
                    .iter()
                    .any(|p| p == "***" || events::glob_match(p, place));
                if !allowed {
                    return Err(Error::new(
                        ErrorKind::Permission,
                        format!("place {place} is not allowed by parent container"),
                    ));
                }
            }
        } else {
            data.place = if data.root.as_os_str() != "/" {
                vec![DEFAULT_PLACE.to_string()]
            } else {
                parent_places
            };
        }
    }

    Ok(())
}

fn forget_pid(data: &mut ContainerData) {
    data.task_pid = 0;
    data.task_vpid = 0;
    data.wait_task_pid = 0;
    data.prop_set.clear(Prop::RootPid);
    data.seize_task_pid = 0;
    data.prop_set.clear(Prop::SeizePid);
}

fn wait_task_gone(pid: i32, deadline_ms: u64) -> bool {
    loop {
        if !host::task_exists(pid) || host::task_is_zombie(pid) {
            return true;
        }
        if host::current_time_ms() >= deadline_ms {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Terminates every task of a container.
///
/// Frozen groups get SIGKILL outright. Otherwise the main task receives
/// SIGTERM (or SIGPWR for OS-mode payloads that handle it), the deadline is
/// awaited, then the wait-task and finally the whole freezer group get
/// SIGKILL.
///
/// # Errors
///
/// Returns an error if the root is targeted or a kill fails.
pub fn terminate(ct: &Arc<Container>, deadline_ms: u64) -> Result<()> {
    if ct.is_root() {
        return Err(Error::new(ErrorKind::Permission, "cannot terminate root container"));
    }

    tracing::info!(container = %ct, "terminate tasks");

    let (task_pid, wait_pid, isolate, os_mode, is_meta) = {
        let data = ct.lock_data();
        (
            data.task_pid,
            data.wait_task_pid,
            data.isolate,
            data.os_mode,
            data.command.is_empty(),
        )
    };

    let cg = ct.cgroup(&FREEZER_SUBSYSTEM);
    if !cg.exists() || cg.is_empty().unwrap_or(true) {
        return Ok(());
    }

    if freezer::is_frozen(&cg) {
        return cg.kill_all(Signal::SIGKILL);
    }

    if task_pid != 0 && deadline_ms != 0 && !is_meta {
        let mut signal = Some(Signal::SIGTERM);
        if isolate && os_mode {
            let mask = host::task_handled_signals(task_pid);
            if mask & (1 << (libc::SIGPWR - 1)) != 0 {
                signal = Some(Signal::SIGPWR);
            } else if mask & (1 << (libc::SIGTERM - 1)) == 0 {
                signal = None;
            }
        }
        if let Some(signal) = signal {
            if kill_task(Pid::from_raw(task_pid), signal).is_ok() {
                tracing::info!(container = %ct, task = task_pid, signal = %signal, "graceful stop");
                wait_task_gone(task_pid, deadline_ms);
            }
        }
    }

    if wait_pid != 0 && isolate {
        if let Err(e) = kill_task(Pid::from_raw(wait_pid), Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                return Err(crate::sys_err("kill", e));
            }
        }
    }

    if cg.is_empty().unwrap_or(true) {
        return Ok(());
    }
    cg.kill_all(Signal::SIGKILL)
}

/// Stops a container and its subtree, bottom-up.
///
/// With a grace period the caller's write lock is voluntarily downgraded so
/// concurrent readers are not blocked while payloads shut down.
///
/// # Errors
///
/// Returns an error when the parent holds the freezer frozen, or when
/// persistence fails.
pub fn stop_subtree(
    rt: &Runtime,
    ct: &Arc<Container>,
    timeout_ms: u64,
    mut lock: Option<&mut SubtreeLock<'_>>,
) -> Result<()> {
    if ct.state() == ContainerState::Stopped {
        return Ok(());
    }

    let freezer_cg = ct.cgroup(&FREEZER_SUBSYSTEM);
    if freezer_cg.exists() && freezer::is_parent_freezing(&freezer_cg) {
        return Err(Error::new(ErrorKind::InvalidState, "parent container is paused"));
    }

    let deadline = if timeout_ms != 0 {
        host::current_time_ms() + timeout_ms
    } else {
        0
    };
    let subtree = ct.subtree();

    if timeout_ms != 0 {
        if let Some(lock) = lock.as_mut() {
            lock.downgrade();
        }
    } else {
        // Killing spree: no grace, take out the wait-tasks top-down first.
        for node in subtree.iter().rev() {
            let data = node.lock_data();
            if data.isolate && data.wait_task_pid != 0 {
                let _ = kill_task(Pid::from_raw(data.wait_task_pid), Signal::SIGKILL);
            }
        }
    }

    for node in &subtree {
        if node.is_root() || node.state() == ContainerState::Stopped {
            continue;
        }
        node.set_state(rt, ContainerState::Stopping);
        if let Err(e) = terminate(node, deadline) {
            tracing::error!(container = %node, error = %e, "cannot terminate tasks");
        }
        if let Err(e) = apply::thaw_if_self_frozen(node) {
            tracing::error!(container = %node, error = %e, "cannot thaw");
        }
    }

    if timeout_ms != 0 {
        if let Some(lock) = lock.as_mut() {
            lock.upgrade();
        }
    }

    for node in &subtree {
        if node.is_root() || node.state() == ContainerState::Stopped {
            continue;
        }

        tracing::info!(container = %node, "stop");
        {
            let mut data = node.lock_data();
            forget_pid(&mut data);
            data.death_time_ms = 0;
            data.prop_set.clear(Prop::DeathTime);
            data.exit_status = 0;
            data.prop_set.clear(Prop::ExitStatus);
            data.oom_events = 0;
            data.oom_killed = false;
            data.prop_set.clear(Prop::OomKilled);
        }
        resources::free_resources(rt, node);
        node.set_state(rt, ContainerState::Stopped);
        save(rt, node)?;
    }

    Ok(())
}

/// Public stop: takes the write lock, then runs [`stop_subtree`].
///
/// # Errors
///
/// As [`stop_subtree`].
pub fn stop(rt: &Runtime, ct: &Arc<Container>, timeout_ms: u64) -> Result<()> {
    let mut lock = rt.lock_write(ct)?;
    stop_subtree(rt, ct, timeout_ms, Some(&mut lock))
}

/// Freezes the container and marks the live subtree `Paused`.
///
/// # Errors
///
/// Returns `InvalidState` unless the container is running or meta.
pub fn pause(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    let _lock = rt.lock_write(ct)?;

    if !matches!(
        ct.state(),
        ContainerState::Running | ContainerState::Meta
    ) {
        return Err(Error::new(ErrorKind::InvalidState, "container not running"));
    }

    let cg = ct.cgroup(&FREEZER_SUBSYSTEM);
    freezer::freeze(&cg)?;

    for node in ct.subtree() {
        if matches!(
            node.state(),
            ContainerState::Running | ContainerState::Meta
        ) {
            node.set_state(rt, ContainerState::Paused);
            apply::propagate_cpu_limit(rt, &node);
            if let Err(e) = save(rt, &node) {
                tracing::error!(container = %node, error = %e, "cannot save state after pause");
            }
        }
    }
    Ok(())
}

/// Thaws the container and restores the prior live state of the subtree.
///
/// # Errors
///
/// Returns `InvalidState` when the container is not self-frozen or an
/// ancestor holds it frozen.
pub fn resume(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    let _lock = rt.lock_write(ct)?;

    let cg = ct.cgroup(&FREEZER_SUBSYSTEM);
    if freezer::is_parent_freezing(&cg) {
        return Err(Error::new(ErrorKind::InvalidState, "parent container is paused"));
    }
    if !freezer::is_self_freezing(&cg) {
        return Err(Error::new(ErrorKind::InvalidState, "container not paused"));
    }

    freezer::thaw(&cg, true)?;

    for node in ct.subtree() {
        if let Err(e) = apply::thaw_if_self_frozen(&node) {
            tracing::error!(container = %node, error = %e, "cannot thaw");
        }
        if node.state() == ContainerState::Paused {
            let is_meta = node.lock_data().command.is_empty();
            node.set_state(
                rt,
                if is_meta {
                    ContainerState::Meta
                } else {
                    ContainerState::Running
                },
            );
            apply::propagate_cpu_limit(rt, &node);
        }
        if let Err(e) = save(rt, &node) {
            tracing::error!(container = %node, error = %e, "cannot save state after resume");
        }
    }
    Ok(())
}

/// Delivers a signal to the main task of a running container.
///
/// # Errors
///
/// Returns `InvalidState` unless the container is running.
pub fn kill(rt: &Runtime, ct: &Arc<Container>, signal: i32) -> Result<()> {
    let _lock = rt.lock_read(ct)?;
    if ct.state() != ContainerState::Running {
        return Err(Error::new(ErrorKind::InvalidState, "container not running"));
    }
    let task_pid = ct.lock_data().task_pid;
    let signal = Signal::try_from(signal)
        .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("bad signal: {signal}")))?;
    tracing::info!(container = %ct, task = task_pid, signal = %signal, "kill");
    kill_task(Pid::from_raw(task_pid), signal).map_err(|e| crate::sys_err("kill", e))
}

/// Moves a dead-to-be container into `Dead`: terminates stragglers, records
/// timestamps, rotates stdio, releases runtime resources and schedules a
/// respawn when configured.
pub fn reap(rt: &Runtime, ct: &Arc<Container>, oom_killed: bool) {
    if let Err(e) = terminate(ct, 0) {
        tracing::warn!(container = %ct, error = %e, "cannot terminate while reaping");
    }

    {
        let mut data = ct.lock_data();
        data.death_time_ms = host::current_time_ms();
        data.prop_set.set(Prop::DeathTime);
        if oom_killed {
            data.oom_killed = true;
            data.prop_set.set(Prop::OomKilled);
        }
        forget_pid(&mut data);
    }

    task::rotate_stdio(rt, ct);
    ct.set_state(rt, ContainerState::Dead);
    resources::free_runtime_resources(rt, ct);

    if let Err(e) = save(rt, ct) {
        tracing::warn!(container = %ct, error = %e, "cannot save state after exit");
    }

    let auto_respawn = ct.lock_data().auto_respawn;
    if auto_respawn && may_respawn(ct).is_ok() {
        schedule_respawn(rt, ct);
    }
}

/// Handles the exit of a container's wait-task: re-codes shim statuses,
/// folds in OOM evidence and reaps the whole subtree.
///
/// Must be called under the container's write lock.
pub fn exit_event(rt: &Runtime, ct: &Arc<Container>, status: i32, oom_killed: bool) {
    if ct.state() == ContainerState::Stopped {
        return;
    }

    let mut oom = oom_killed;
    let status = {
        let mut data = ct.lock_data();
        // SIGKILL can arrive before the OOM notification does.
        if !oom && recv_oom_events(rt, ct, &mut data) {
            oom = true;
        }
        let status = if data.wait_task_pid != data.task_pid {
            events::decode_shim_status(status)
        } else {
            status
        };
        data.exit_status = status;
        data.prop_set.set(Prop::ExitStatus);
        status
    };

    tracing::info!(
        container = %ct,
        status = %events::format_exit_status(status),
        oom,
        "exit"
    );

    // Memory shortage can also surface as syscall failures; check the
    // controller's own kill counter.
    if !oom && ct.lock_data().oom_is_fatal {
        let memcg = ct.cgroup(&MEMORY_SUBSYSTEM);
        if memcg.exists() && memory::oom_kill_count(&memcg) > 0 {
            tracing::warn!(container = %ct, "hit memory limit");
            oom = true;
        }
    }

    for node in ct.subtree() {
        if !matches!(
            node.state(),
            ContainerState::Stopped | ContainerState::Dead
        ) {
            reap(rt, &node, oom);
        }
    }
}

/// Whether a dead container may respawn right now.
///
/// # Errors
///
/// Returns `InvalidState` for a live container or a dead parent, and
/// `ResourceNotAvailable` once the respawn budget is exhausted.
pub fn may_respawn(ct: &Arc<Container>) -> Result<()> {
    if ct.state() != ContainerState::Dead {
        return Err(Error::new(
            ErrorKind::InvalidState,
            "cannot respawn a container that is not dead",
        ));
    }
    if let Some(parent) = ct.parent() {
        if !parent.is_root()
            && !matches!(
                parent.state(),
                ContainerState::Running | ContainerState::Meta
            )
        {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "cannot respawn: parent container not running",
            ));
        }
    }
    let data = ct.lock_data();
    if data.respawn_limit >= 0 && data.respawn_count >= data.respawn_limit as u64 {
        return Err(Error::new(
            ErrorKind::ResourceNotAvailable,
            "cannot respawn: reached limit",
        ));
    }
    Ok(())
}

/// Queues a respawn after the configured delay.
pub fn schedule_respawn(rt: &Runtime, ct: &Arc<Container>) {
    let delay = ct.lock_data().respawn_delay_ms;
    rt.events.add(delay, Event::Respawn { ct: Arc::downgrade(ct) });
}

/// Stops and restarts a dead container, bumping its respawn counter.
///
/// The caller holds the write lock (the event dispatcher does).
///
/// # Errors
///
/// Returns the stop or start failure.
pub fn respawn(rt: &Runtime, lock: &mut SubtreeLock<'_>) -> Result<()> {
    let ct = Arc::clone(lock.container());
    may_respawn(&ct)?;

    tracing::info!(container = %ct, "respawn");
    stop_subtree(rt, &ct, 0, None)?;

    {
        let mut data = ct.lock_data();
        data.respawn_count += 1;
        data.prop_set.set(Prop::RespawnCount);
    }

    start_locked(rt, lock, &ClientContext::system())
}

/// Properties that may change while the container is not stopped even
/// though the applier does not push them anywhere.
fn runtime_settable(prop: Prop) -> bool {
    matches!(
        prop,
        Prop::Labels
            | Prop::Weak
            | Prop::AccessLevel
            | Prop::AgingTime
            | Prop::AutoRespawn
            | Prop::RespawnLimit
            | Prop::RespawnDelay
            | Prop::OomIsFatal
            | Prop::Symlink
    )
}

/// Sets a property on behalf of a client: validation, controller
/// enablement, dirty marking, immediate apply with rewind on failure, and
/// persistence.
///
/// # Errors
///
/// Every §4.4/§7 outcome: `InvalidProperty`, `InvalidValue`,
/// `InvalidState`, `Permission`, `NotSupported`, or an apply failure.
pub fn set_property(
    rt: &Runtime,
    client: &ClientContext,
    ct: &Arc<Container>,
    key: &str,
    value: &str,
) -> Result<()> {
    if ct.is_root() {
        return Err(Error::new(ErrorKind::Permission, "system containers are read only"));
    }
    let prop = Prop::from_name(key).ok_or_else(|| {
        Error::new(ErrorKind::InvalidProperty, format!("unknown property: {key}"))
    })?;
    if !prop.client_writable() {
        return Err(Error::new(
            ErrorKind::InvalidProperty,
            format!("property is read-only: {key}"),
        ));
    }

    let _lock = rt.lock_write(ct)?;

    let state = ct.state();
    let old_value = {
        let mut data = ct.lock_data();
        client.can_control(data.owner_uid, data.owner_gid)?;

        if !prop.is_dynamic() && !runtime_settable(prop) && state != ContainerState::Stopped {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("cannot set {key} while {state}"),
            ));
        }

        let required = prop.required_controllers();
        if required != 0 {
            if state == ContainerState::Stopped {
                data.controllers |= required;
                data.required_controllers |= required;
            } else if data.controllers & required != required {
                return Err(Error::new(
                    ErrorKind::NotSupported,
                    "cannot enable controllers at runtime",
                ));
            }
        }

        let old_value = props::get_prop(&data, prop)?;
        props::set_prop(&mut data, prop, value.trim())?;
        data.prop_set.set(prop);
        if prop.is_dynamic() {
            data.prop_dirty.set(prop);
        }
        old_value
    };

    if matches!(prop, Prop::CapLimit | Prop::CapAmbient) {
        sanitize_capabilities(ct);
    }

    if state.is_alive() && prop.is_dynamic() {
        if let Err(e) = apply::apply_dynamic(rt, ct) {
            let mut data = ct.lock_data();
            if let Err(re) = props::set_prop(&mut data, prop, &old_value) {
                tracing::error!(container = %ct, error = %re, "cannot rewind property");
            }
            data.prop_dirty.clear(prop);
            return Err(e);
        }
    }

    save(rt, ct)
}

/// Reads a property, a raw cgroup knob (`memory.stat` style), or one of the
/// computed keys (`state`, `id`, `taint`).
///
/// # Errors
///
/// Returns `InvalidProperty` for unknown keys and `InvalidState` for cgroup
/// knobs of stopped containers.
pub fn get_property(rt: &Runtime, ct: &Arc<Container>, key: &str) -> Result<String> {
    let _lock = rt.lock_read(ct)?;

    match key {
        "state" => return Ok(ct.state().to_string()),
        "id" => return Ok(ct.id.to_string()),
        "name" => return Ok(ct.name.clone()),
        "taint" => return Ok(taint(ct).join("\n")),
        _ => {}
    }

    if let Some((subsys_name, _)) = key.split_once('.') {
        if let Some(subsys) = cgroup::SUBSYSTEMS.iter().find(|s| s.name == subsys_name) {
            if ct.state() == ContainerState::Stopped {
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    format!("not available in stopped state: {key}"),
                ));
            }
            let cg = ct.cgroup(subsys);
            if !cg.has_knob(key) {
                return Err(Error::new(
                    ErrorKind::InvalidProperty,
                    format!("unknown cgroup attribute: {key}"),
                ));
            }
            return cg.get(key);
        }
    }

    let prop = Prop::from_name(key).ok_or_else(|| {
        Error::new(ErrorKind::InvalidProperty, format!("unknown property: {key}"))
    })?;
    let data = ct.lock_data();
    props::get_prop(&data, prop)
}

/// Advisory warnings about configurations that are legal but suspicious.
#[must_use]
pub fn taint(ct: &Arc<Container>) -> Vec<String> {
    let data = ct.lock_data();
    let mut warnings = Vec::new();

    if data.cpu_policy == arbor_core::sched::CpuPolicy::Rt
        && data.controllers & cgroup::CPU == 0
    {
        warnings.push(String::from("rt cpu policy without cpu controller"));
    }
    if data.mem_limit != 0 && data.mem_guarantee > data.mem_limit {
        warnings.push(String::from("memory guarantee above memory limit"));
    }
    if data.auto_respawn && data.respawn_limit < 0 {
        warnings.push(String::from("respawn enabled without a respawn limit"));
    }
    if data.cpu_limit != 0 && data.cpu_guarantee > data.cpu_limit {
        warnings.push(String::from("cpu guarantee above cpu limit"));
    }
    warnings
}

/// Registers a waiter for the named containers and patterns.
///
/// Containers already in a non-live state wake the waiter immediately.
/// Patterns with wildcards go onto the shared wildcard list; a timeout is
/// scheduled as an event when requested.
pub fn setup_wait(rt: &Runtime, patterns: &[String], timeout_ms: Option<u64>) -> Arc<Waiter> {
    let waiter = Waiter::new(patterns.to_vec());

    for pattern in patterns {
        if pattern.contains('*') {
            rt.add_wildcard_waiter(&waiter);
            continue;
        }
        if let Ok(ct) = rt.find(pattern) {
            if !ct.state().is_live() {
                waiter.wake(&ct.name, false);
            } else {
                ct.add_waiter(&waiter);
            }
        }
    }

    if let Some(timeout) = timeout_ms {
        rt.events.add(
            timeout,
            Event::WaitTimeout {
                waiter: Arc::downgrade(&waiter),
            },
        );
    }
    waiter
}
