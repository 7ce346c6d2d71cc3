//! Recovery engine: rebuilds the container tree from the KV store at boot
//! and reconciles it with live cgroups and processes.
//!
//! Restore runs single-threaded before the RPC surface opens, so it works
//! without subtree locks. Records load in id order, which guarantees every
//! parent is registered before its children.

use std::sync::Arc;

use arbor_common::types::ContainerState;
use arbor_common::{Error, ErrorKind, Result};
use arbor_core::cgroup::{self, freezer, FREEZER_SUBSYSTEM};
use arbor_core::host;

use crate::apply;
use crate::container::Container;
use crate::context::Runtime;
use crate::events::Event;
use crate::kv::{Record, KEY_ID, KEY_NAME, KEY_STATE};
use crate::lifecycle;
use crate::props::{self, Prop};
use crate::registry::parent_name;
use crate::resources;
use crate::task;

/// Restores every persisted container and reschedules aging and respawn.
///
/// One broken record never blocks the boot; it is logged and skipped.
///
/// # Errors
///
/// Returns an error only when the store itself cannot be listed.
pub fn restore_all(rt: &Arc<Runtime>) -> Result<()> {
    let records = rt.kv.list()?;
    tracing::info!(count = records.len(), "restoring containers");

    for (id, record) in records {
        if id == rt.root().id {
            continue;
        }
        if let Err(e) = restore_one(rt, id, &record) {
            tracing::error!(id, error = %e, "cannot restore container");
        }
    }

    for ct in rt.root().subtree() {
        if ct.state() == ContainerState::Dead {
            let (death, aging) = {
                let data = ct.lock_data();
                (data.death_time_ms, data.aging_time_ms)
            };
            let now = host::current_time_ms();
            let delay = (death + aging).saturating_sub(now);
            rt.events.add(delay, Event::DestroyAgedContainer { ct: Arc::downgrade(&ct) });
        }
    }

    Ok(())
}

fn restore_one(rt: &Arc<Runtime>, id: u32, record: &Record) -> Result<()> {
    let name = record
        .get(KEY_NAME)
        .ok_or_else(|| Error::new(ErrorKind::InvalidValue, "record without a name"))?;

    tracing::info!(id, name = %name, "restore");

    if rt.registry().containers.contains_key(name) {
        return Err(Error::new(ErrorKind::ContainerAlreadyExists, name.clone()));
    }
    let parent = rt.find(parent_name(name))?;

    let ct = {
        let mut registry = rt.registry();
        registry.ids.reserve(id)?;
        let ct = Container::new(Some(&parent), id, name, &rt.config);
        registry.containers.insert(name.clone(), Arc::clone(&ct));
        ct
    };
    parent
        .children
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .push(Arc::clone(&ct));

    let result = (|| {
        load(rt, &ct, record)?;

        {
            let parent_root = parent.lock_data().root_path.clone();
            let mut data = ct.lock_data();
            data.root_path = if data.root.as_os_str() == "/" {
                parent_root
            } else {
                let rel = data.root.strip_prefix("/").unwrap_or(&data.root).to_path_buf();
                parent_root.join(rel)
            };
        }

        sync_state(rt, &ct);

        // Resurrect the kernel side only for containers that are still live.
        if !matches!(
            ct.state(),
            ContainerState::Stopped | ContainerState::Dead
        ) {
            resources::prepare_cgroups(rt, &ct)?;
            replay_dynamic(rt, &ct)?;
            apply::propagate_cpu_limit(rt, &ct);
            sync_cgroups(&ct)?;
        }

        let auto_respawn = ct.lock_data().auto_respawn;
        if auto_respawn && lifecycle::may_respawn(&ct).is_ok() {
            lifecycle::schedule_respawn(rt, &ct);
        }

        lifecycle::save(rt, &ct)?;

        if ct.state() == ContainerState::Stopped {
            resources::remove_work_dir(rt, &ct);
        }
        Ok(())
    })();

    if let Err(e) = result {
        // Roll the broken record out of the tree entirely.
        let mut registry = rt.registry();
        registry.containers.remove(&ct.name);
        parent
            .children
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|c| c.id != ct.id);
        registry.ids.release(ct.id);
        ct.force_state(ContainerState::Destroyed);
        return Err(e);
    }

    Ok(())
}

/// Replays property assignments from a record. Unknown keys are logged and
/// skipped; a value that fails to parse marks the container dead instead of
/// losing it.
fn load(rt: &Runtime, ct: &Arc<Container>, record: &Record) -> Result<()> {
    let mut state: Option<ContainerState> = None;

    {
        let mut data = ct.lock_data();
        for (key, value) in record {
            if key == KEY_STATE {
                // State applies last: properties depend on the current one.
                state = Some(value.parse()?);
                continue;
            }
            if key == KEY_ID || key == KEY_NAME {
                continue;
            }
            let Some(prop) = Prop::from_name(key) else {
                tracing::warn!(container = %ct, key = %key, "unknown property, skipped");
                continue;
            };
            if let Err(e) = props::set_prop(&mut data, prop, value) {
                tracing::error!(container = %ct, key = %key, error = %e, "cannot load property");
                state = Some(ContainerState::Dead);
                break;
            }
            data.prop_set.set(prop);
        }
    }

    let state = state.ok_or_else(|| Error::new(ErrorKind::InvalidValue, "container has no state"))?;
    if state == ContainerState::Destroyed {
        return Err(Error::new(ErrorKind::InvalidValue, "record for a destroyed container"));
    }
    ct.set_state(rt, state);
    ct.lock_data().prop_set.set(Prop::State);

    lifecycle::sanitize_capabilities(ct);

    if state == ContainerState::Running {
        let mut data = ct.lock_data();
        if !data.prop_set.test(Prop::StartTime) {
            data.start_time_ms = host::current_time_ms();
            data.prop_set.set(Prop::StartTime);
        }
        data.real_start_time = data.start_time_ms / 1000;
    }

    Ok(())
}

/// Marks every set dynamic property dirty and pushes it, minus the ones the
/// task applied at launch.
fn replay_dynamic(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    {
        let mut data = ct.lock_data();
        let set = data.prop_set;
        for prop in props::ALL_PROPS {
            if prop.is_dynamic() && set.test(prop) {
                data.prop_dirty.set(prop);
            }
        }
        // Never rewrite resolv.conf on a restore.
        data.prop_dirty.clear(Prop::ResolvConf);
    }
    apply::apply_dynamic(rt, ct)
}

/// Reconciles the recorded state with the live kernel state.
pub fn sync_state(rt: &Runtime, ct: &Arc<Container>) {
    let freezer_cg = ct.cgroup(&FREEZER_SUBSYSTEM);
    tracing::info!(container = %ct, state = %ct.state(), "syncing state");

    if !freezer_cg.exists() {
        if ct.state() != ContainerState::Stopped {
            tracing::warn!(container = %ct, "freezer not found, forcing stop");
        }
        let mut data = ct.lock_data();
        data.task_pid = 0;
        data.task_vpid = 0;
        data.wait_task_pid = 0;
        data.seize_task_pid = 0;
        drop(data);
        ct.set_state(rt, ContainerState::Stopped);
        return;
    }

    let is_meta = ct.lock_data().command.is_empty();

    if ct.state() == ContainerState::Starting {
        ct.set_state(
            rt,
            if is_meta {
                ContainerState::Meta
            } else {
                ContainerState::Running
            },
        );
    }

    if freezer::is_frozen(&freezer_cg) {
        if ct.state() != ContainerState::Paused {
            if let Err(e) = freezer::thaw(&freezer_cg, false) {
                tracing::warn!(container = %ct, error = %e, "cannot thaw");
            }
        }
    } else if ct.state() == ContainerState::Paused {
        ct.set_state(
            rt,
            if is_meta {
                ContainerState::Meta
            } else {
                ContainerState::Running
            },
        );
    }

    let (wait_pid, task_pid, isolate) = {
        let data = ct.lock_data();
        (data.wait_task_pid, data.task_pid, data.isolate)
    };
    let self_pid = std::process::id() as i32;

    if ct.state() == ContainerState::Stopped {
        tracing::warn!(container = %ct, "found unexpected freezer");
        lifecycle::reap(rt, ct, false);
    } else if ct.state() == ContainerState::Meta && wait_pid == 0 && !isolate {
        // Hollow meta container, nothing to reconcile.
    } else if !host::task_exists(wait_pid) {
        if ct.state() != ContainerState::Dead {
            tracing::warn!(container = %ct, "wait task not found");
            lifecycle::reap(rt, ct, false);
        }
    } else if host::task_is_zombie(wait_pid) {
        ct.lock_data().task_pid = 0;
    } else {
        match FREEZER_SUBSYSTEM.task_cgroup(wait_pid) {
            Err(_) => {
                tracing::warn!(container = %ct, "cannot check freezer membership");
                lifecycle::reap(rt, ct, false);
            }
            Ok(task_cg) if task_cg.name != freezer_cg.name => {
                tracing::warn!(container = %ct, "wait task in wrong freezer");
                if host::task_ppid(wait_pid) == self_pid {
                    if task_pid != wait_pid && host::task_ppid(task_pid) == wait_pid {
                        let _ = nix::sys::signal::kill(
                            nix::unistd::Pid::from_raw(task_pid),
                            nix::sys::signal::Signal::SIGKILL,
                        );
                    }
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(wait_pid),
                        nix::sys::signal::Signal::SIGKILL,
                    );
                }
                lifecycle::reap(rt, ct, false);
            }
            Ok(_) => {
                let ppid = host::task_ppid(wait_pid);
                if ppid != self_pid {
                    tracing::warn!(
                        container = %ct,
                        ppid,
                        comm = %host::task_name(ppid),
                        "wait task re-parented, seizing"
                    );
                    if let Err(e) = task::seize(ct, wait_pid) {
                        tracing::warn!(container = %ct, error = %e, "cannot seize re-parented task");
                        lifecycle::reap(rt, ct, false);
                    } else {
                        ct.lock_data().prop_set.set(Prop::SeizePid);
                    }
                }
            }
        }
    }

    // Posture towards the parent's state.
    let parent_state = ct.parent().map_or(ContainerState::Meta, |p| p.state());
    match parent_state {
        ContainerState::Stopped => {
            if ct.state() != ContainerState::Stopped {
                if let Err(e) = lifecycle::stop_subtree(rt, ct, 0, None) {
                    tracing::error!(container = %ct, error = %e, "cannot stop under stopped parent");
                }
            }
        }
        ContainerState::Dead => {
            if !matches!(
                ct.state(),
                ContainerState::Dead | ContainerState::Stopped
            ) {
                lifecycle::reap(rt, ct, false);
            }
        }
        ContainerState::Paused => {
            if matches!(
                ct.state(),
                ContainerState::Running | ContainerState::Meta
            ) {
                ct.set_state(rt, ContainerState::Paused);
            }
        }
        _ => {}
    }
}

/// Re-attaches every non-freezer controller to the freezer's task list.
///
/// # Errors
///
/// Returns an error if a task move fails.
pub fn sync_cgroups(ct: &Arc<Container>) -> Result<()> {
    let controllers = ct.lock_data().controllers;
    if controllers & cgroup::FREEZER == 0 {
        return Err(Error::new(
            ErrorKind::NotSupported,
            "cannot sync cgroups without freezer",
        ));
    }
    let freezer_cg = ct.cgroup(&FREEZER_SUBSYSTEM);
    for subsys in cgroup::SUBSYSTEMS {
        if subsys.kind & cgroup::FREEZER != 0 || controllers & subsys.kind == 0 {
            continue;
        }
        if !subsys.supported() {
            continue;
        }
        let cg = ct.cgroup(subsys);
        if cg.exists() {
            cg.attach_all(&freezer_cg)?;
        }
    }
    Ok(())
}
