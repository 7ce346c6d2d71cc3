//! The container record: identity, configuration block, runtime state and
//! the lifecycle state machine.
//!
//! A container's identity (id, name, level, parent link) is immutable for
//! its whole life. Everything mutable sits either in atomic lock/counter
//! slots touched only under the registry mutex, or in the `data` block
//! guarded by the subtree lock discipline (a plain mutex backs it up so the
//! compiler can see the exclusion).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arbor_common::config::DaemonConfig;
use arbor_common::constants::{CGROUP_PREFIX, CPU_POWER_PER_SEC, ROOT_CONTAINER};
use arbor_common::types::{AccessLevel, ContainerState, CpuSetSpec};
use arbor_core::capability::CapSet;
use arbor_core::cgroup::{self, Cgroup, ControllerMask, Subsystem};
use arbor_core::cpumask::CpuMask;
use arbor_core::host;
use arbor_core::sched::CpuPolicy;
use arbor_core::ulimit::UlimitSet;
use nix::sys::eventfd::EventFd;

use crate::context::Runtime;
use crate::events::Waiter;
use crate::net::NetClass;
use crate::props::PropBits;
use crate::registry::first_name;

/// Mutable configuration and runtime block of a container.
///
/// Mutated only while the container's subtree write lock (or a parent's) is
/// held; read under at least a read lock.
pub struct ContainerData {
    // Configuration.
    pub command: String,
    pub env: Vec<String>,
    pub root: PathBuf,
    pub root_path: PathBuf,
    pub root_ro: bool,
    pub cwd: PathBuf,
    pub hostname: String,
    pub isolate: bool,
    pub os_mode: bool,
    pub weak: bool,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub task_uid: u32,
    pub task_gid: u32,
    pub supplementary_groups: Vec<u32>,
    pub access_level: AccessLevel,
    pub place: Vec<String>,
    pub labels: BTreeMap<String, String>,

    pub mem_guarantee: u64,
    pub mem_limit: u64,
    pub anon_limit: u64,
    pub dirty_limit: u64,
    pub recharge_on_pgfault: bool,
    pub pressurize_on_death: bool,
    pub hugetlb_limit: u64,
    pub oom_is_fatal: bool,

    pub io_bps_limit: BTreeMap<String, u64>,
    pub io_ops_limit: BTreeMap<String, u64>,
    pub io_weight: u64,
    pub io_policy: String,

    pub cpu_policy: CpuPolicy,
    pub cpu_weight: u64,
    pub cpu_guarantee: u64,
    pub cpu_limit: u64,
    pub cpu_period: u64,
    pub cpu_set: CpuSetSpec,

    pub thread_limit: u64,
    pub ulimit: UlimitSet,
    pub resolv_conf: Vec<String>,
    pub devices: Vec<String>,
    pub bind_mounts: Vec<String>,
    pub symlinks: BTreeMap<PathBuf, PathBuf>,

    pub net: NetClass,

    pub cap_limit: CapSet,
    pub cap_ambient: CapSet,
    pub cap_bound: CapSet,
    pub cap_allowed: CapSet,

    pub auto_respawn: bool,
    pub respawn_limit: i64,
    pub respawn_count: u64,
    pub respawn_delay_ms: u64,
    pub aging_time_ms: u64,

    pub controllers: ControllerMask,
    pub required_controllers: ControllerMask,

    /// Was the property explicitly set (by a client or the daemon)?
    pub prop_set: PropBits,
    /// Does the property need a kernel re-apply?
    pub prop_dirty: PropBits,

    // Runtime.
    pub task_pid: i32,
    pub wait_task_pid: i32,
    pub seize_task_pid: i32,
    pub task_vpid: i32,
    pub oom_event: Option<EventFd>,
    pub oom_events: u64,
    pub oom_killed: bool,
    pub exit_status: i32,
    pub start_time_ms: u64,
    pub real_start_time: u64,
    pub real_creation_time: u64,
    pub death_time_ms: u64,

    pub cpu_affinity: CpuMask,
    pub cpu_vacant: CpuMask,
    pub cpu_reserve: CpuMask,
    pub cpu_guarantee_sum: u64,
    pub cpu_limit_sum: u64,
    pub cpu_limit_cur: u64,
    pub cpu_guarantee_cur: u64,
    pub mem_soft_limit: i64,

    /// Volume link targets mounted for this container.
    pub volumes: Vec<PathBuf>,
}

/// A node in the container tree.
pub struct Container {
    /// Dense id from the pool, unique for the container's lifetime.
    pub id: u32,
    /// Full path name; `/` for the root.
    pub name: String,
    /// Last path component; empty for the root.
    pub first_name: String,
    /// Depth below the root.
    pub level: u32,

    parent: Option<Weak<Container>>,
    /// Children own their lifetimes; mutated under the registry mutex.
    pub(crate) children: Mutex<Vec<Arc<Container>>>,

    state: AtomicU8,
    /// Count of descendants in `Starting`, maintained by `set_state`.
    pub(crate) starting_children: AtomicI64,
    /// Count of descendants in `Running`, maintained by `set_state`.
    pub(crate) running_children: AtomicI64,

    // Subtree lock slots; mutated only under the registry mutex.
    pub(crate) locked: AtomicI64,
    pub(crate) pending_write: AtomicBool,
    pub(crate) subtree_read: AtomicI64,
    pub(crate) subtree_write: AtomicI64,
    pub(crate) last_owner: AtomicU64,

    pub(crate) waiters: Mutex<Vec<Weak<Waiter>>>,

    /// Everything the subtree lock protects.
    pub data: Mutex<ContainerData>,
}

fn state_to_u8(state: ContainerState) -> u8 {
    match state {
        ContainerState::Stopped => 0,
        ContainerState::Starting => 1,
        ContainerState::Running => 2,
        ContainerState::Meta => 3,
        ContainerState::Paused => 4,
        ContainerState::Stopping => 5,
        ContainerState::Dead => 6,
        ContainerState::Destroyed => 7,
    }
}

fn state_from_u8(raw: u8) -> ContainerState {
    match raw {
        0 => ContainerState::Stopped,
        1 => ContainerState::Starting,
        2 => ContainerState::Running,
        3 => ContainerState::Meta,
        4 => ContainerState::Paused,
        5 => ContainerState::Stopping,
        6 => ContainerState::Dead,
        _ => ContainerState::Destroyed,
    }
}

impl Container {
    /// Builds a record with defaults derived from the daemon config and the
    /// parent. Does not register it anywhere.
    #[must_use]
    pub fn new(
        parent: Option<&Arc<Container>>,
        id: u32,
        name: &str,
        config: &DaemonConfig,
    ) -> Arc<Self> {
        let level = parent.map_or(0, |p| p.level + 1);
        let is_root = parent.is_none();

        let (access_level, place) = match parent {
            Some(p) => {
                let pd = p.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                (pd.access_level.inherited(), pd.place.clone())
            }
            None => (AccessLevel::Internal, vec![String::from("***")]),
        };

        let mut controllers = cgroup::FREEZER;
        if level <= 1 {
            controllers |= cgroup::MEMORY
                | cgroup::CPU
                | cgroup::CPUACCT
                | cgroup::NETCLS
                | cgroup::DEVICES;
            if cgroup::BLKIO_SUBSYSTEM.supported() {
                controllers |= cgroup::BLKIO;
            }
            if cgroup::CPUSET_SUBSYSTEM.supported() {
                controllers |= cgroup::CPUSET;
            }
            if cgroup::HUGETLB_SUBSYSTEM.supported() {
                controllers |= cgroup::HUGETLB;
            }
        }
        let mut thread_limit = 0;
        if level == 1 && cgroup::PIDS_SUBSYSTEM.supported() {
            controllers |= cgroup::PIDS;
            thread_limit = config.default_thread_limit;
        }

        let data = ContainerData {
            command: String::new(),
            env: Vec::new(),
            root: PathBuf::from("/"),
            root_path: PathBuf::from("/"),
            root_ro: false,
            cwd: PathBuf::new(),
            hostname: String::new(),
            isolate: true,
            os_mode: false,
            weak: false,
            owner_uid: 0,
            owner_gid: 0,
            task_uid: 0,
            task_gid: 0,
            supplementary_groups: Vec::new(),
            access_level,
            place,
            labels: BTreeMap::new(),
            mem_guarantee: 0,
            mem_limit: 0,
            anon_limit: 0,
            dirty_limit: 0,
            recharge_on_pgfault: false,
            pressurize_on_death: config.pressurize_on_death,
            hugetlb_limit: 0,
            oom_is_fatal: true,
            io_bps_limit: BTreeMap::new(),
            io_ops_limit: BTreeMap::new(),
            io_weight: 100,
            io_policy: String::new(),
            cpu_policy: CpuPolicy::Normal,
            cpu_weight: 1,
            cpu_guarantee: 0,
            cpu_limit: if is_root {
                host::num_cpus() * CPU_POWER_PER_SEC
            } else {
                0
            },
            cpu_period: config.cpu_period_ns,
            cpu_set: CpuSetSpec::inherit(),
            thread_limit,
            ulimit: UlimitSet::new(),
            resolv_conf: Vec::new(),
            devices: Vec::new(),
            bind_mounts: Vec::new(),
            symlinks: BTreeMap::new(),
            net: NetClass::new(id),
            cap_limit: CapSet::NONE,
            cap_ambient: CapSet::NONE,
            cap_bound: CapSet::NONE,
            cap_allowed: CapSet::NONE,
            auto_respawn: false,
            respawn_limit: -1,
            respawn_count: 0,
            respawn_delay_ms: config.respawn_delay_ms,
            aging_time_ms: config.default_aging_time_ms,
            controllers,
            required_controllers: cgroup::FREEZER,
            prop_set: PropBits::new(),
            prop_dirty: PropBits::new(),
            task_pid: 0,
            wait_task_pid: 0,
            seize_task_pid: 0,
            task_vpid: 0,
            oom_event: None,
            oom_events: 0,
            oom_killed: false,
            exit_status: 0,
            start_time_ms: 0,
            real_start_time: 0,
            real_creation_time: host::current_time_ms() / 1000,
            death_time_ms: 0,
            cpu_affinity: CpuMask::new(),
            cpu_vacant: CpuMask::new(),
            cpu_reserve: CpuMask::new(),
            cpu_guarantee_sum: 0,
            cpu_limit_sum: 0,
            cpu_limit_cur: 0,
            cpu_guarantee_cur: 0,
            mem_soft_limit: -1,
            volumes: Vec::new(),
        };

        Arc::new(Self {
            id,
            name: name.to_string(),
            first_name: if is_root {
                String::new()
            } else {
                first_name(name).to_string()
            },
            level,
            parent: parent.map(Arc::downgrade),
            children: Mutex::new(Vec::new()),
            state: AtomicU8::new(state_to_u8(ContainerState::Stopped)),
            starting_children: AtomicI64::new(0),
            running_children: AtomicI64::new(0),
            locked: AtomicI64::new(0),
            pending_write: AtomicBool::new(false),
            subtree_read: AtomicI64::new(0),
            subtree_write: AtomicI64::new(0),
            last_owner: AtomicU64::new(0),
            waiters: Mutex::new(Vec::new()),
            data: Mutex::new(data),
        })
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.level == 0
    }

    /// Parent link; `None` for the root or after the parent was destroyed.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Container>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Ancestors from parent to root.
    #[must_use]
    pub fn ancestors(&self) -> Vec<Arc<Container>> {
        let mut chain = Vec::with_capacity(self.level as usize);
        let mut cursor = self.parent();
        while let Some(ct) = cursor {
            cursor = ct.parent();
            chain.push(ct);
        }
        chain
    }

    #[must_use]
    pub fn is_child_of(&self, other: &Container) -> bool {
        self.ancestors().iter().any(|ct| ct.id == other.id)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Snapshot of the children list.
    #[must_use]
    pub fn childs(&self) -> Vec<Arc<Container>> {
        self.children
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Subtree in DFS post-order: descendants first, self last.
    #[must_use]
    pub fn subtree(self: &Arc<Self>) -> Vec<Arc<Container>> {
        let mut list = Vec::new();
        fn walk(ct: &Arc<Container>, out: &mut Vec<Arc<Container>>) {
            for child in ct.childs() {
                walk(&child, out);
            }
            out.push(Arc::clone(ct));
        }
        walk(self, &mut list);
        list
    }

    /// Locks the data block, riding over poisoning: a panicking writer
    /// cannot leave the tree permanently unusable.
    #[must_use]
    pub fn lock_data(&self) -> std::sync::MutexGuard<'_, ContainerData> {
        self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Transitions the lifecycle state, maintaining every ancestor's
    /// starting/running counters and waking waiters on entry into any
    /// non-live state.
    pub fn set_state(self: &Arc<Self>, rt: &Runtime, next: ContainerState) {
        let prev = self.state();
        if prev == next {
            return;
        }

        tracing::info!(
            id = self.id,
            name = %self.name,
            from = %prev,
            to = %next,
            "container state change"
        );

        let _registry = rt.registry();
        self.state.store(state_to_u8(next), Ordering::SeqCst);

        if prev == ContainerState::Starting || next == ContainerState::Starting {
            let delta = if next == ContainerState::Starting { 1 } else { -1 };
            for anc in self.ancestors() {
                anc.starting_children.fetch_add(delta, Ordering::SeqCst);
            }
        }

        if prev == ContainerState::Running || next == ContainerState::Running {
            let delta = if next == ContainerState::Running { 1 } else { -1 };
            for anc in self.ancestors() {
                let left = anc.running_children.fetch_add(delta, Ordering::SeqCst) + delta;
                if left == 0 && anc.state() == ContainerState::Meta {
                    anc.notify_waiters(rt);
                }
            }
        }

        if !next.is_live() {
            self.notify_waiters(rt);
        }
    }

    /// Forces the raw state without counter maintenance; restore-time only,
    /// before the container has observers.
    pub(crate) fn force_state(&self, state: ContainerState) {
        self.state.store(state_to_u8(state), Ordering::SeqCst);
    }

    /// Count of children currently in `Running`.
    #[must_use]
    pub fn running_children(&self) -> i64 {
        self.running_children.load(Ordering::SeqCst)
    }

    /// Count of children currently in `Starting`.
    #[must_use]
    pub fn starting_children(&self) -> i64 {
        self.starting_children.load(Ordering::SeqCst)
    }

    /// Registers a waiter to be woken on state changes.
    pub fn add_waiter(&self, waiter: &Arc<Waiter>) {
        let mut waiters = self
            .waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        waiters.retain(|w| w.strong_count() > 0);
        waiters.push(Arc::downgrade(waiter));
    }

    /// Wakes every live waiter of this container, plus the wildcard list.
    pub fn notify_waiters(&self, rt: &Runtime) {
        let mut waiters = self
            .waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        waiters.retain(|w| w.strong_count() > 0);
        for weak in waiters.iter() {
            if let Some(waiter) = weak.upgrade() {
                waiter.wake(&self.name, false);
            }
        }
        drop(waiters);
        if !self.is_root() {
            rt.wake_wildcard_waiters(&self.name);
        }
    }

    /// Cgroup of this container in the given hierarchy.
    ///
    /// The freezer path mirrors the container tree below the daemon prefix.
    /// Other controllers use the same shape where every ancestor owns the
    /// controller, and fold skipped ancestors into one `%`-separated
    /// component otherwise.
    #[must_use]
    pub fn cgroup(&self, subsys: &'static Subsystem) -> Cgroup {
        if self.is_root() {
            return subsys.root_cgroup();
        }

        if subsys.kind & cgroup::FREEZER != 0 {
            return subsys.cgroup(&format!("{CGROUP_PREFIX}/{}", self.name));
        }

        // A container without the controller resolves to the nearest enabled
        // ancestor's cgroup; skipped ancestors fold into a `%` component.
        let mut path = String::new();
        let mut fold = |first_name: &str, enabled: bool| {
            if !path.is_empty() {
                path.insert(0, if enabled { '/' } else { '%' });
            }
            if !path.is_empty() || enabled {
                path.insert_str(0, first_name);
            }
        };
        fold(&self.first_name, self.lock_data().controllers & subsys.kind != 0);
        for anc in self.ancestors() {
            if anc.is_root() {
                break;
            }
            fold(&anc.first_name, anc.lock_data().controllers & subsys.kind != 0);
        }

        if path.is_empty() {
            return subsys.root_cgroup();
        }
        subsys.cgroup(&format!("{CGROUP_PREFIX}%{path}"))
    }

    /// Working directory of the container under the configured base.
    #[must_use]
    pub fn work_dir(&self, config: &DaemonConfig) -> PathBuf {
        config.work_dir.join(self.name.trim_start_matches('/'))
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("level", &self.level)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = if self.is_root() { ROOT_CONTAINER } else { &self.name };
        write!(f, "CT{}:{}", self.id, name)
    }
}
