//! Kernel-facing drivers for the arbor daemon.
//!
//! Everything here is a thin, stateless wrapper over cgroup v1 control files,
//! sysfs topology, scheduler syscalls and rlimits. The container engine in
//! `arbor-runtime` decides *what* to write; this crate knows *where* and
//! *how*.

pub mod capability;
pub mod cgroup;
pub mod cpumask;
pub mod host;
pub mod sched;
pub mod ulimit;

use arbor_common::{Error, ErrorKind};

/// Wraps a failed nix call, keeping the errno and syscall name.
#[must_use]
pub fn sys_err(syscall: &str, err: nix::Error) -> Error {
    Error {
        kind: ErrorKind::Unknown,
        errno: Some(err as i32),
        text: format!("{syscall}: {err}"),
    }
}
