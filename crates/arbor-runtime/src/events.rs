//! Event queue and waiter dispatch.
//!
//! Asynchronous sources (OOM eventfds, the SIGCHLD reaper, aging timers)
//! inject events here; a dedicated thread drains the queue, re-acquires
//! container locks and runs the same pipelines as RPC calls. Waiters are
//! client-side rendezvous points woken on state changes, either bound to one
//! container or matched against wildcard patterns.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;

use arbor_common::types::ContainerState;
use arbor_core::host;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::container::Container;
use crate::context::{Runtime, Statistics};
use crate::lifecycle;

/// Events delivered to the dispatch thread.
pub enum Event {
    /// The OOM notifier of a container fired.
    Oom { ct: Weak<Container> },
    /// A directly-awaited task exited.
    Exit { pid: i32, status: i32 },
    /// The reaper collected a child of the daemon.
    ChildExit { pid: i32, status: i32 },
    /// A dead container with respawn enabled is due for another run.
    Respawn { ct: Weak<Container> },
    /// A dead container outlived its aging time.
    DestroyAgedContainer { ct: Weak<Container> },
    /// A weak container lost its last client.
    DestroyWeakContainer { ct: Weak<Container> },
    /// A waiter's timeout elapsed.
    WaitTimeout { waiter: Weak<Waiter> },
    /// Self-rescheduling stdio rotation and aging sweep.
    RotateLogs,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Oom { .. } => "Oom",
            Self::Exit { .. } => "Exit",
            Self::ChildExit { .. } => "ChildExit",
            Self::Respawn { .. } => "Respawn",
            Self::DestroyAgedContainer { .. } => "DestroyAgedContainer",
            Self::DestroyWeakContainer { .. } => "DestroyWeakContainer",
            Self::WaitTimeout { .. } => "WaitTimeout",
            Self::RotateLogs => "RotateLogs",
        };
        f.write_str(name)
    }
}

struct Scheduled {
    due_ms: u64,
    seq: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due_ms, self.seq).cmp(&(other.due_ms, other.seq))
    }
}

struct QueueInner {
    heap: BinaryHeap<Reverse<Scheduled>>,
    seq: u64,
}

/// Timed event queue drained by one dispatch thread.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
    stopped: AtomicBool,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                seq: 0,
            }),
            cv: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Schedules an event `delay_ms` from now.
    pub fn add(&self, delay_ms: u64, event: Event) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(Reverse(Scheduled {
            due_ms: host::current_time_ms() + delay_ms,
            seq,
            event,
        }));
        drop(inner);
        self.cv.notify_one();
    }

    /// Stops the dispatch loop after the current event.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cv.notify_all();
    }

    /// Blocks until the next event is due; `None` once stopped.
    pub fn next(&self) -> Option<Event> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return None;
            }
            let now = host::current_time_ms();
            let next_due = inner.heap.peek().map(|Reverse(s)| s.due_ms);
            match next_due {
                Some(due) if due <= now => {
                    return inner.heap.pop().map(|Reverse(s)| s.event);
                }
                Some(due) => {
                    let wait = Duration::from_millis(due - now);
                    let (guard, _) = self
                        .cv
                        .wait_timeout(inner, wait)
                        .unwrap_or_else(PoisonError::into_inner);
                    inner = guard;
                }
                None => {
                    inner = self.cv.wait(inner).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Dispatch loop body; runs until [`EventQueue::stop`].
    pub fn run(&self, rt: &Arc<Runtime>) {
        while let Some(event) = self.next() {
            dispatch(rt, event);
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles one event, taking the locks the pipelines expect.
pub fn dispatch(rt: &Arc<Runtime>, event: Event) {
    tracing::debug!(?event, "dispatching event");
    match event {
        Event::Oom { ct } => {
            if let Some(ct) = ct.upgrade() {
                if let Ok(_lock) = rt.lock_write(&ct) {
                    let fatal = {
                        let mut data = ct.lock_data();
                        let fired = lifecycle::recv_oom_events(rt, &ct, &mut data);
                        fired && data.oom_is_fatal
                    };
                    if fatal {
                        lifecycle::exit_event(rt, &ct, libc::SIGKILL, true);
                    }
                }
            }
        }
        Event::Exit { pid, status } | Event::ChildExit { pid, status } => {
            let target = rt.registry().containers.values().find_map(|ct| {
                let data = ct.lock_data();
                if data.wait_task_pid == pid || data.seize_task_pid == pid {
                    Some(Arc::clone(ct))
                } else {
                    None
                }
            });
            match target {
                Some(ct) => {
                    if let Ok(_lock) = rt.lock_write(&ct) {
                        lifecycle::exit_event(rt, &ct, status, false);
                    }
                }
                None => tracing::debug!(pid, status, "exit of unknown task"),
            }
        }
        Event::Respawn { ct } => {
            if let Some(ct) = ct.upgrade() {
                if let Ok(mut lock) = rt.lock_write(&ct) {
                    if let Err(e) = lifecycle::respawn(rt, &mut lock) {
                        tracing::warn!(container = %ct, error = %e, "respawn failed");
                    }
                }
            }
        }
        Event::DestroyAgedContainer { ct } => {
            if let Some(ct) = ct.upgrade() {
                let expired = ct.state() == ContainerState::Dead && {
                    let data = ct.lock_data();
                    host::current_time_ms() >= data.death_time_ms + data.aging_time_ms
                };
                if expired {
                    Statistics::bump(&rt.stats.removed_dead);
                    if let Err(e) = lifecycle::destroy(rt, &ct) {
                        tracing::warn!(container = %ct, error = %e, "aged destroy failed");
                    }
                }
            }
        }
        Event::DestroyWeakContainer { ct } => {
            if let Some(ct) = ct.upgrade() {
                if ct.lock_data().weak {
                    if let Err(e) = lifecycle::destroy(rt, &ct) {
                        tracing::warn!(container = %ct, error = %e, "weak destroy failed");
                    }
                }
            }
        }
        Event::WaitTimeout { waiter } => {
            if let Some(waiter) = waiter.upgrade() {
                waiter.timeout();
            }
        }
        Event::RotateLogs => {
            for ct in rt.root().subtree() {
                match ct.state() {
                    ContainerState::Dead => {
                        let data = ct.lock_data();
                        if host::current_time_ms() >= data.death_time_ms + data.aging_time_ms {
                            rt.events.add(
                                0,
                                Event::DestroyAgedContainer {
                                    ct: Arc::downgrade(&ct),
                                },
                            );
                        }
                    }
                    ContainerState::Running => crate::task::rotate_stdio(rt, &ct),
                    _ => {}
                }
            }
            rt.events.add(rt.config.log_rotate_ms, Event::RotateLogs);
        }
    }
}

/// Reaper loop: collects every child the kernel hands us and feeds the
/// queue. The engine never calls `wait` anywhere else.
pub fn run_reaper(rt: &Arc<Runtime>, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                rt.events.add(
                    0,
                    Event::ChildExit {
                        pid: pid.as_raw(),
                        status: exit_status_from_code(code),
                    },
                );
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                rt.events.add(
                    0,
                    Event::ChildExit {
                        pid: pid.as_raw(),
                        status: signal as i32,
                    },
                );
            }
            Ok(_) => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(nix::errno::Errno::ECHILD) => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                tracing::warn!(error = %e, "waitpid failed in reaper");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Wait-status encoding of a normal exit.
#[must_use]
pub fn exit_status_from_code(code: i32) -> i32 {
    (code & 0xff) << 8
}

#[must_use]
pub fn is_signaled(status: i32) -> bool {
    status & 0x7f != 0
}

#[must_use]
pub fn term_signal(status: i32) -> i32 {
    status & 0x7f
}

#[must_use]
pub fn exit_code(status: i32) -> i32 {
    (status >> 8) & 0xff
}

/// Human-readable exit status for logs and the `exit_status` property text.
#[must_use]
pub fn format_exit_status(status: i32) -> String {
    if is_signaled(status) {
        format!("killed by signal {}", term_signal(status))
    } else {
        format!("exited with code {}", exit_code(status))
    }
}

/// Re-codes statuses reported by the init shim: the shim cannot die from the
/// payload's signal, so it encodes the signal into its exit code as
/// `128 + sig` (or `128 + SIGRTMIN + sig` for the realtime band).
#[must_use]
pub fn decode_shim_status(status: i32) -> i32 {
    const SIGRTMIN: i32 = 32;
    if !is_signaled(status) {
        let code = exit_code(status);
        if code > 128 && code < 128 + SIGRTMIN * 2 {
            let sig = if code > 128 + SIGRTMIN {
                code - SIGRTMIN - 128
            } else {
                code - 128
            };
            return sig & 0x7f;
        }
    }
    status
}

/// Simple `*` glob over container names.
#[must_use]
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(c), Some(d)) if c == d => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

enum WaitOutcome {
    Pending,
    Woken(String),
    TimedOut,
}

/// A client blocked in a wait call.
///
/// Bound waiters are registered on specific containers and woken by any of
/// their state changes; wildcard waiters live on the runtime's shared list
/// and filter by pattern.
pub struct Waiter {
    patterns: Vec<String>,
    state: Mutex<WaitOutcome>,
    cv: Condvar,
}

impl Waiter {
    /// `patterns` filters wildcard wakeups; empty means "any".
    #[must_use]
    pub fn new(patterns: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            patterns,
            state: Mutex::new(WaitOutcome::Pending),
            cv: Condvar::new(),
        })
    }

    /// Delivers a wakeup. Wildcard wakeups are filtered by the patterns;
    /// direct wakeups always land.
    pub fn wake(&self, name: &str, wildcard: bool) {
        if wildcard
            && !self.patterns.is_empty()
            && !self.patterns.iter().any(|p| glob_match(p, name))
        {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, WaitOutcome::Pending) {
            *state = WaitOutcome::Woken(name.to_string());
            self.cv.notify_all();
        }
    }

    /// Marks the waiter as timed out without naming a container.
    pub fn timeout(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, WaitOutcome::Pending) {
            *state = WaitOutcome::TimedOut;
            self.cv.notify_all();
        }
    }

    /// Blocks until woken or timed out; returns the container name on a
    /// wakeup, `None` on timeout.
    #[must_use]
    pub fn wait(&self, timeout: Option<Duration>) -> Option<String> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*state {
                WaitOutcome::Woken(name) => return Some(name.clone()),
                WaitOutcome::TimedOut => return None,
                WaitOutcome::Pending => {}
            }
            state = match timeout {
                Some(limit) => {
                    let (guard, result) = self
                        .cv
                        .wait_timeout(state, limit)
                        .unwrap_or_else(PoisonError::into_inner);
                    if result.timed_out() {
                        if let WaitOutcome::Woken(name) = &*guard {
                            return Some(name.clone());
                        }
                        return None;
                    }
                    guard
                }
                None => self.cv.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_encodings() {
        let exited = exit_status_from_code(3);
        assert!(!is_signaled(exited));
        assert_eq!(exit_code(exited), 3);

        let killed = libc::SIGKILL;
        assert!(is_signaled(killed));
        assert_eq!(term_signal(killed), libc::SIGKILL);
    }

    #[test]
    fn shim_status_recodes_signals() {
        // Shim exited with 128 + SIGTERM: the payload died from SIGTERM.
        let status = exit_status_from_code(128 + libc::SIGTERM);
        let decoded = decode_shim_status(status);
        assert!(is_signaled(decoded));
        assert_eq!(term_signal(decoded), libc::SIGTERM);

        // A plain exit code passes through.
        let plain = exit_status_from_code(7);
        assert_eq!(decode_shim_status(plain), plain);
    }

    #[test]
    fn glob_matches_container_paths() {
        assert!(glob_match("a/*", "a/b"));
        assert!(glob_match("a/*", "a/b/c"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("a/*", "b/a"));
        assert!(glob_match("a*c", "abc"));
        assert!(!glob_match("a*c", "abd"));
    }

    #[test]
    fn waiter_direct_wake_ignores_patterns() {
        let waiter = Waiter::new(vec![String::from("x/*")]);
        waiter.wake("a", false);
        assert_eq!(waiter.wait(None).as_deref(), Some("a"));
    }

    #[test]
    fn waiter_wildcard_wake_filters() {
        let waiter = Waiter::new(vec![String::from("a/*")]);
        waiter.wake("b/c", true);
        waiter.wake("a/c", true);
        assert_eq!(waiter.wait(None).as_deref(), Some("a/c"));
    }

    #[test]
    fn waiter_timeout_returns_none() {
        let waiter = Waiter::new(Vec::new());
        waiter.timeout();
        assert_eq!(waiter.wait(None), None);
    }

    #[test]
    fn queue_delivers_in_due_order() {
        let queue = EventQueue::new();
        queue.add(50, Event::RotateLogs);
        queue.add(0, Event::Exit { pid: 1, status: 0 });
        let first = queue.next().expect("first");
        assert!(matches!(first, Event::Exit { .. }));
        let second = queue.next().expect("second");
        assert!(matches!(second, Event::RotateLogs));
    }

    #[test]
    fn queue_stop_unblocks() {
        let queue = Arc::new(EventQueue::new());
        let q = Arc::clone(&queue);
        let handle = std::thread::spawn(move || q.next());
        std::thread::sleep(Duration::from_millis(20));
        queue.stop();
        assert!(handle.join().expect("join").is_none());
    }
}
