//! The runtime context: registry map, id pool, CPU topology, statistics.
//!
//! Every former global lives here and is passed explicitly; tests construct
//! their own context with a scratch KV directory, a synthetic topology and a
//! fake host memory size.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use arbor_common::config::DaemonConfig;
use arbor_common::constants::ROOT_CONTAINER;
use arbor_common::types::ContainerState;
use arbor_common::{Error, ErrorKind, Result};
use arbor_core::cpumask::Topology;
use arbor_core::host;

use crate::container::Container;
use crate::epoll::EpollLoop;
use crate::events::{EventQueue, Waiter};
use crate::kv::KvStore;
use crate::registry::IdPool;

/// Registry state guarded by the single registry mutex. The same mutex also
/// covers every container's lock slots and state counters.
pub struct RegistryInner {
    pub containers: HashMap<String, Arc<Container>>,
    pub ids: IdPool,
}

/// Daemon-wide counters, exported through the RPC status call.
#[derive(Debug, Default)]
pub struct Statistics {
    pub containers_created: AtomicU64,
    pub containers_started: AtomicU64,
    pub containers_failed_start: AtomicU64,
    pub containers_oom: AtomicU64,
    pub removed_dead: AtomicU64,
}

impl Statistics {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Credentials and rights of the client issuing an operation.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub uid: u32,
    pub gid: u32,
    pub superuser: bool,
}

impl ClientContext {
    /// The daemon acting on its own behalf.
    #[must_use]
    pub fn system() -> Self {
        Self {
            uid: 0,
            gid: 0,
            superuser: true,
        }
    }

    /// Whether this client may manage a container owned by `uid`/`gid`.
    ///
    /// # Errors
    ///
    /// Returns `Permission` when the client is neither the owner nor a
    /// superuser.
    pub fn can_control(&self, owner_uid: u32, owner_gid: u32) -> Result<()> {
        if self.superuser || self.uid == owner_uid || self.gid == owner_gid {
            return Ok(());
        }
        Err(Error::new(
            ErrorKind::Permission,
            format!("uid {} cannot control container of uid {owner_uid}", self.uid),
        ))
    }
}

/// The runtime context passed to every operation.
pub struct Runtime {
    pub config: DaemonConfig,
    pub kv: KvStore,
    pub events: EventQueue,
    pub epoll: EpollLoop,
    pub stats: Statistics,

    registry: Mutex<RegistryInner>,
    pub(crate) registry_cv: Condvar,

    /// Serializes CPU distribution; also caches the host topology.
    cpu: Mutex<Topology>,
    host_memory: u64,

    root: OnceLock<Arc<Container>>,
    wildcard_waiters: Mutex<Vec<Weak<Waiter>>>,
}

/// Builder with the injectable seams tests rely on.
pub struct RuntimeBuilder {
    config: DaemonConfig,
    host_memory: Option<u64>,
    topology: Option<Topology>,
}

impl RuntimeBuilder {
    #[must_use]
    pub fn host_memory(mut self, bytes: u64) -> Self {
        self.host_memory = Some(bytes);
        self
    }

    #[must_use]
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Opens the KV store, resolves host facts and registers the root
    /// container.
    ///
    /// # Errors
    ///
    /// Returns an error if the KV directory cannot be created or host
    /// queries fail.
    pub fn build(self) -> Result<Arc<Runtime>> {
        let kv = KvStore::open(&self.config.kvs_dir)?;
        let host_memory = match self.host_memory {
            Some(bytes) => bytes,
            None => host::total_memory()?,
        };
        let topology = match self.topology {
            Some(topo) => topo,
            None => Topology::read().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "cannot read cpu topology, assuming flat");
                Topology::synthetic(host::num_cpus() as u32, 1)
            }),
        };

        let rt = Arc::new(Runtime {
            config: self.config,
            kv,
            events: EventQueue::new(),
            epoll: EpollLoop::new(),
            stats: Statistics::default(),
            registry: Mutex::new(RegistryInner {
                containers: HashMap::new(),
                ids: IdPool::new(),
            }),
            registry_cv: Condvar::new(),
            cpu: Mutex::new(topology),
            host_memory,
            root: OnceLock::new(),
            wildcard_waiters: Mutex::new(Vec::new()),
        });

        rt.register_root()?;
        Ok(rt)
    }
}

/// Id permanently reserved for the root container.
const ROOT_ID: u32 = 1;

impl Runtime {
    #[must_use]
    pub fn builder(config: DaemonConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            host_memory: None,
            topology: None,
        }
    }

    /// Production context with live host facts.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be built.
    pub fn new(config: DaemonConfig) -> Result<Arc<Self>> {
        Self::builder(config).build()
    }

    fn register_root(self: &Arc<Self>) -> Result<()> {
        let root = Container::new(None, ROOT_ID, ROOT_CONTAINER, &self.config);
        {
            let mut data = root.lock_data();
            data.cpu_affinity = self.topology().online.clone();
            data.cpu_vacant = data.cpu_affinity.clone();
        }
        root.force_state(ContainerState::Meta);
        let mut registry = self.registry();
        registry.ids.reserve(ROOT_ID)?;
        registry.containers.insert(ROOT_CONTAINER.to_string(), Arc::clone(&root));
        drop(registry);
        self.root
            .set(root)
            .map_err(|_| Error::new(ErrorKind::Unknown, "root container registered twice"))?;
        Ok(())
    }

    /// The root container.
    ///
    /// Present from `build` onward, so the accessor is infallible.
    #[must_use]
    pub fn root(&self) -> Arc<Container> {
        self.root
            .get()
            .cloned()
            .unwrap_or_else(|| unreachable!("runtime built without a root container"))
    }

    /// Locks the registry; rides over poisoning so one panicked worker does
    /// not take the daemon down with it.
    #[must_use]
    pub fn registry(&self) -> MutexGuard<'_, RegistryInner> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Host memory available to guarantees, before the configured reserve.
    #[must_use]
    pub fn host_memory(&self) -> u64 {
        self.host_memory
    }

    /// Locks CPU distribution and exposes the topology. The guard is the
    /// analog of the affinity mutex: hold it across a whole distribution.
    #[must_use]
    pub fn topology(&self) -> MutexGuard<'_, Topology> {
        self.cpu.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a registered container.
    ///
    /// # Errors
    ///
    /// Returns `ContainerDoesNotExist` for unknown names.
    pub fn find(&self, name: &str) -> Result<Arc<Container>> {
        self.registry()
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::ContainerDoesNotExist,
                    format!("container {name} not found"),
                )
            })
    }

    /// Resolves the container a task belongs to via its freezer cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error when the task has no cgroup or the container is
    /// not registered.
    pub fn find_task_container(&self, pid: i32) -> Result<Arc<Container>> {
        use arbor_common::constants::CGROUP_PREFIX;
        use arbor_core::cgroup::FREEZER_SUBSYSTEM;

        let cg = FREEZER_SUBSYSTEM.task_cgroup(pid)?;
        let name = cg.name.replace('%', "/");
        let prefix = format!("{CGROUP_PREFIX}/");
        match name.strip_prefix(&prefix) {
            Some(rest) => self.find(rest),
            None => Ok(self.root()),
        }
    }

    /// Registers a waiter woken by any container's state changes.
    pub fn add_wildcard_waiter(&self, waiter: &Arc<Waiter>) {
        let mut waiters = self
            .wildcard_waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        waiters.retain(|w| w.strong_count() > 0);
        waiters.push(Arc::downgrade(waiter));
    }

    pub(crate) fn wake_wildcard_waiters(&self, name: &str) {
        let waiters = self
            .wildcard_waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for weak in waiters.iter() {
            if let Some(waiter) = weak.upgrade() {
                waiter.wake(name, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::cpumask::Topology;

    pub(crate) fn test_runtime() -> (tempfile::TempDir, Arc<Runtime>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = DaemonConfig::default();
        config.kvs_dir = dir.path().join("kvs");
        config.work_dir = dir.path().join("place");
        let rt = Runtime::builder(config)
            .host_memory(1 << 30)
            .topology(Topology::synthetic(4, 2))
            .build()
            .expect("runtime");
        (dir, rt)
    }

    #[test]
    fn root_is_registered_with_reserved_id() {
        let (_dir, rt) = test_runtime();
        let root = rt.root();
        assert!(root.is_root());
        assert_eq!(root.id, ROOT_ID);
        assert_eq!(root.state(), ContainerState::Meta);
        assert!(rt.find(ROOT_CONTAINER).is_ok());
    }

    #[test]
    fn root_affinity_covers_topology() {
        let (_dir, rt) = test_runtime();
        let root = rt.root();
        let data = root.lock_data();
        assert_eq!(data.cpu_affinity.weight(), 8);
        assert_eq!(data.cpu_vacant, data.cpu_affinity);
    }

    #[test]
    fn find_unknown_container_fails() {
        let (_dir, rt) = test_runtime();
        let err = rt.find("ghost").expect_err("unknown");
        assert_eq!(err.kind, ErrorKind::ContainerDoesNotExist);
    }

    #[test]
    fn client_permission_checks() {
        let client = ClientContext {
            uid: 1000,
            gid: 1000,
            superuser: false,
        };
        client.can_control(1000, 1000).expect("own container");
        assert!(client.can_control(0, 0).is_err());
        ClientContext::system().can_control(1000, 1000).expect("superuser");
    }
}
