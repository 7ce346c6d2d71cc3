//! Subtree lock manager.
//!
//! Per-container read/write locks with ancestor-chain exclusion: at most one
//! writer is active anywhere along any ancestor chain. All slots live on the
//! containers but are mutated only under the registry mutex; waiters sleep
//! on the registry condvar and every release broadcasts. Fairness is not
//! FIFO; writer preference (via the pending flag) is the only scheduling
//! bias.

use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};

use arbor_common::types::ContainerState;
use arbor_common::{Error, ErrorKind, Result};
use arbor_core::host;

use crate::container::Container;
use crate::context::Runtime;

/// Lock flavor held by a [`SubtreeLock`] guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// RAII guard over a container's subtree lock.
///
/// Dropping the guard releases the lock in whatever mode it currently holds;
/// `downgrade`/`upgrade` switch modes mid-operation the way the start and
/// stop pipelines need.
pub struct SubtreeLock<'rt> {
    rt: &'rt Runtime,
    ct: Arc<Container>,
    mode: LockMode,
}

impl std::fmt::Debug for SubtreeLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubtreeLock")
            .field("ct", &self.ct.id)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Runtime {
    /// Takes a read lock, sleeping until it can be granted.
    ///
    /// # Errors
    ///
    /// Returns `ContainerDoesNotExist` if the container is destroyed while
    /// waiting.
    pub fn lock_read<'rt>(&'rt self, ct: &Arc<Container>) -> Result<SubtreeLock<'rt>> {
        self.acquire(ct, LockMode::Read, false)
    }

    /// Takes a write lock, sleeping until it can be granted.
    ///
    /// # Errors
    ///
    /// Returns `ContainerDoesNotExist` if the container is destroyed while
    /// waiting.
    pub fn lock_write<'rt>(&'rt self, ct: &Arc<Container>) -> Result<SubtreeLock<'rt>> {
        self.acquire(ct, LockMode::Write, false)
    }

    /// Like [`Runtime::lock_read`] but fails with `Busy` instead of sleeping.
    ///
    /// # Errors
    ///
    /// Returns `Busy` when the lock cannot be granted immediately.
    pub fn try_lock_read<'rt>(&'rt self, ct: &Arc<Container>) -> Result<SubtreeLock<'rt>> {
        self.acquire(ct, LockMode::Read, true)
    }

    /// Like [`Runtime::lock_write`] but fails with `Busy` instead of sleeping.
    ///
    /// # Errors
    ///
    /// Returns `Busy` when the lock cannot be granted immediately.
    pub fn try_lock_write<'rt>(&'rt self, ct: &Arc<Container>) -> Result<SubtreeLock<'rt>> {
        self.acquire(ct, LockMode::Write, true)
    }

    fn acquire<'rt>(
        &'rt self,
        ct: &Arc<Container>,
        mode: LockMode,
        try_lock: bool,
    ) -> Result<SubtreeLock<'rt>> {
        let for_read = mode == LockMode::Read;
        tracing::trace!(container = %ct, ?mode, try_lock, "lock request");

        let mut registry = self.registry();
        loop {
            if ct.state() == ContainerState::Destroyed {
                return Err(Error::new(
                    ErrorKind::ContainerDoesNotExist,
                    "container was destroyed",
                ));
            }

            let mut busy = if for_read {
                ct.locked.load(Ordering::Relaxed) < 0
                    || ct.pending_write.load(Ordering::Relaxed)
                    || ct.subtree_write.load(Ordering::Relaxed) > 0
            } else {
                ct.locked.load(Ordering::Relaxed) != 0
                    || ct.subtree_read.load(Ordering::Relaxed) > 0
                    || ct.subtree_write.load(Ordering::Relaxed) > 0
            };
            for anc in ct.ancestors() {
                if busy {
                    break;
                }
                let locked = anc.locked.load(Ordering::Relaxed);
                busy = anc.pending_write.load(Ordering::Relaxed)
                    || if for_read { locked < 0 } else { locked != 0 };
            }

            if !busy {
                break;
            }
            if try_lock {
                return Err(Error::new(
                    ErrorKind::Busy,
                    format!("container is busy: {}", ct.name),
                ));
            }
            if !for_read {
                ct.pending_write.store(true, Ordering::Relaxed);
            }
            registry = self
                .registry_cv
                .wait(registry)
                .unwrap_or_else(PoisonError::into_inner);
        }

        ct.pending_write.store(false, Ordering::Relaxed);
        if for_read {
            ct.locked.fetch_add(1, Ordering::Relaxed);
        } else {
            ct.locked.store(-1, Ordering::Relaxed);
        }
        ct.last_owner.store(host::thread_id(), Ordering::Relaxed);
        for anc in ct.ancestors() {
            if for_read {
                anc.subtree_read.fetch_add(1, Ordering::Relaxed);
            } else {
                anc.subtree_write.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(registry);

        Ok(SubtreeLock {
            rt: self,
            ct: Arc::clone(ct),
            mode,
        })
    }

    /// Logs every held or contended lock slot, for deadlock hunts.
    pub fn dump_locks(&self) {
        let registry = self.registry();
        for ct in registry.containers.values() {
            let locked = ct.locked.load(Ordering::Relaxed);
            let pending = ct.pending_write.load(Ordering::Relaxed);
            let sub_read = ct.subtree_read.load(Ordering::Relaxed);
            let sub_write = ct.subtree_write.load(Ordering::Relaxed);
            if locked != 0 || pending || sub_read != 0 || sub_write != 0 {
                tracing::info!(
                    container = %ct,
                    locked,
                    pending,
                    sub_read,
                    sub_write,
                    owner = ct.last_owner.load(Ordering::Relaxed),
                    "lock slot"
                );
            }
        }
    }
}

impl SubtreeLock<'_> {
    #[must_use]
    pub fn container(&self) -> &Arc<Container> {
        &self.ct
    }

    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Atomically trades the write lock for a read lock, letting concurrent
    /// readers in while a long grace period runs.
    pub fn downgrade(&mut self) {
        if self.mode != LockMode::Write {
            return;
        }
        tracing::trace!(container = %self.ct, "downgrading write lock to read");
        let registry = self.rt.registry();
        debug_assert_eq!(self.ct.locked.load(Ordering::Relaxed), -1);
        for anc in self.ct.ancestors() {
            anc.subtree_write.fetch_sub(1, Ordering::Relaxed);
            anc.subtree_read.fetch_add(1, Ordering::Relaxed);
        }
        self.ct.locked.store(1, Ordering::Relaxed);
        self.mode = LockMode::Read;
        drop(registry);
        self.rt.registry_cv.notify_all();
    }

    /// Takes the write lock back after a downgrade, waiting until this guard
    /// is the only remaining reader.
    pub fn upgrade(&mut self) {
        if self.mode != LockMode::Read {
            return;
        }
        tracing::trace!(container = %self.ct, "upgrading read lock back to write");
        let mut registry = self.rt.registry();

        self.ct.pending_write.store(true, Ordering::Relaxed);
        for anc in self.ct.ancestors() {
            anc.subtree_read.fetch_sub(1, Ordering::Relaxed);
            anc.subtree_write.fetch_add(1, Ordering::Relaxed);
        }

        while self.ct.locked.load(Ordering::Relaxed) != 1 {
            registry = self
                .rt
                .registry_cv
                .wait(registry)
                .unwrap_or_else(PoisonError::into_inner);
        }

        self.ct.locked.store(-1, Ordering::Relaxed);
        self.ct
            .last_owner
            .store(host::thread_id(), Ordering::Relaxed);
        self.ct.pending_write.store(false, Ordering::Relaxed);
        self.mode = LockMode::Write;
    }
}

impl Drop for SubtreeLock<'_> {
    fn drop(&mut self) {
        let registry = self.rt.registry();
        for anc in self.ct.ancestors() {
            let slot = if self.mode == LockMode::Read {
                &anc.subtree_read
            } else {
                &anc.subtree_write
            };
            let prev = slot.fetch_sub(1, Ordering::Relaxed);
            debug_assert!(prev > 0, "subtree counter underflow on {}", anc.name);
        }
        match self.mode {
            LockMode::Read => {
                let prev = self.ct.locked.fetch_sub(1, Ordering::Relaxed);
                debug_assert!(prev > 0, "read unlock without readers on {}", self.ct.name);
            }
            LockMode::Write => {
                debug_assert_eq!(self.ct.locked.load(Ordering::Relaxed), -1);
                self.ct.locked.store(0, Ordering::Relaxed);
            }
        }
        drop(registry);
        // Not the most precise wakeup, but simple and starvation-free given
        // writer preference.
        self.rt.registry_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_common::config::DaemonConfig;
    use arbor_core::cpumask::Topology;

    fn runtime() -> (tempfile::TempDir, Arc<Runtime>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = DaemonConfig::default();
        config.kvs_dir = dir.path().join("kvs");
        let rt = Runtime::builder(config)
            .host_memory(1 << 30)
            .topology(Topology::synthetic(2, 1))
            .build()
            .expect("runtime");
        (dir, rt)
    }

    fn register_child(rt: &Arc<Runtime>, parent: &Arc<Container>, name: &str) -> Arc<Container> {
        let ct = {
            let mut registry = rt.registry();
            let id = registry.ids.allocate().expect("id");
            let ct = Container::new(Some(parent), id, name, &rt.config);
            registry.containers.insert(name.to_string(), Arc::clone(&ct));
            ct
        };
        parent
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&ct));
        ct
    }

    #[test]
    fn read_locks_share() {
        let (_dir, rt) = runtime();
        let root = rt.root();
        let a = register_child(&rt, &root, "a");

        let first = rt.lock_read(&a).expect("first reader");
        let second = rt.lock_read(&a).expect("second reader");
        drop(first);
        drop(second);
    }

    #[test]
    fn write_lock_excludes_everything() {
        let (_dir, rt) = runtime();
        let root = rt.root();
        let a = register_child(&rt, &root, "a");

        let write = rt.lock_write(&a).expect("writer");
        assert_eq!(
            rt.try_lock_read(&a).expect_err("read must fail").kind,
            ErrorKind::Busy
        );
        assert_eq!(
            rt.try_lock_write(&a).expect_err("write must fail").kind,
            ErrorKind::Busy
        );
        drop(write);
        rt.try_lock_write(&a).expect("free after drop");
    }

    #[test]
    fn child_write_blocks_parent_write_but_not_sibling() {
        let (_dir, rt) = runtime();
        let root = rt.root();
        let a = register_child(&rt, &root, "a");
        let ab = register_child(&rt, &a, "a/b");
        let ac = register_child(&rt, &a, "a/c");

        let hold = rt.lock_write(&ab).expect("write child");
        assert!(rt.try_lock_write(&a).is_err(), "ancestor write must block");
        assert!(rt.try_lock_read(&a).is_err(), "ancestor read blocks on subtree writer");
        rt.try_lock_write(&ac).expect("independent sibling subtree");
        drop(hold);
    }

    #[test]
    fn ancestor_write_blocks_descendant() {
        let (_dir, rt) = runtime();
        let root = rt.root();
        let a = register_child(&rt, &root, "a");
        let ab = register_child(&rt, &a, "a/b");

        let hold = rt.lock_write(&a).expect("write parent");
        assert!(rt.try_lock_read(&ab).is_err());
        assert!(rt.try_lock_write(&ab).is_err());
        drop(hold);
    }

    #[test]
    fn downgrade_admits_readers_upgrade_reclaims() {
        let (_dir, rt) = runtime();
        let root = rt.root();
        let a = register_child(&rt, &root, "a");

        let mut lock = rt.lock_write(&a).expect("writer");
        lock.downgrade();
        assert_eq!(lock.mode(), LockMode::Read);
        let reader = rt.try_lock_read(&a).expect("reader during grace period");
        drop(reader);
        lock.upgrade();
        assert_eq!(lock.mode(), LockMode::Write);
        assert!(rt.try_lock_read(&a).is_err());
    }

    #[test]
    fn destroyed_container_cannot_be_locked() {
        let (_dir, rt) = runtime();
        let root = rt.root();
        let a = register_child(&rt, &root, "a");
        a.force_state(ContainerState::Destroyed);
        assert_eq!(
            rt.lock_read(&a).expect_err("destroyed").kind,
            ErrorKind::ContainerDoesNotExist
        );
    }
}
