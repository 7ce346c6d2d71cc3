//! Epoll loop for OOM notifiers.
//!
//! Every live container's OOM eventfd is registered here; the loop thread
//! turns readiness into [`Event::Oom`] queue entries. Registration keys on
//! the raw fd, which stays stable while the container holds the eventfd.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use arbor_common::Result;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::EventFd;

use crate::container::Container;
use crate::context::Runtime;
use crate::events::Event;

/// OOM fd registry plus the epoll instance behind it.
pub struct EpollLoop {
    epoll: Option<Epoll>,
    watched: Mutex<HashMap<i32, Weak<Container>>>,
}

impl EpollLoop {
    /// Creates the epoll instance; degraded (registration becomes a no-op)
    /// when the kernel refuses, so unit tests run without one.
    #[must_use]
    pub fn new() -> Self {
        let epoll = match Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC) {
            Ok(ep) => Some(ep),
            Err(e) => {
                tracing::warn!(error = %e, "cannot create epoll instance, oom events disabled");
                None
            }
        };
        Self {
            epoll,
            watched: Mutex::new(HashMap::new()),
        }
    }

    /// Starts watching a container's OOM eventfd.
    ///
    /// # Errors
    ///
    /// Returns an error if the epoll registration fails.
    pub fn register_oom(&self, event: &EventFd, ct: &Arc<Container>) -> Result<()> {
        let Some(epoll) = &self.epoll else {
            return Ok(());
        };
        let fd = event.as_fd().as_raw_fd();
        epoll
            .add(event, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
            .map_err(|e| crate::sys_err("epoll_ctl", e))?;
        self.watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fd, Arc::downgrade(ct));
        tracing::debug!(container = %ct, fd, "oom notifier registered");
        Ok(())
    }

    /// Stops watching an eventfd; called from `free_runtime_resources`.
    pub fn deregister(&self, event: &EventFd) {
        let Some(epoll) = &self.epoll else {
            return;
        };
        let fd = event.as_fd().as_raw_fd();
        if let Err(e) = epoll.delete(event) {
            tracing::debug!(fd, error = %e, "epoll deregistration failed");
        }
        self.watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fd);
    }

    /// Loop body: waits for OOM readiness and feeds the event queue. Checks
    /// `stop` roughly once a second.
    pub fn run(&self, rt: &Arc<Runtime>, stop: &AtomicBool) {
        let Some(epoll) = &self.epoll else {
            return;
        };
        let timeout = EpollTimeout::try_from(Duration::from_millis(1000))
            .unwrap_or(EpollTimeout::NONE);
        let mut events = [EpollEvent::empty(); 32];
        while !stop.load(Ordering::SeqCst) {
            let ready = match epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "epoll_wait failed");
                    break;
                }
            };
            for event in &events[..ready] {
                let fd = event.data() as i32;
                let target = self
                    .watched
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&fd)
                    .cloned();
                if let Some(ct) = target {
                    rt.events.add(0, Event::Oom { ct });
                }
            }
        }
    }
}

impl Default for EpollLoop {
    fn default() -> Self {
        Self::new()
    }
}
