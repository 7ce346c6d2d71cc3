//! Hierarchical container state engine.
//!
//! The daemon-facing surface: a [`context::Runtime`] holds the registry and
//! every former global; [`lifecycle`] exposes the operations clients invoke;
//! [`events`] and [`epoll`] feed asynchronous kernel signals back into the
//! same pipelines; [`recovery`] rebuilds everything after a daemon restart.

pub mod affinity;
pub mod apply;
pub mod container;
pub mod context;
pub mod epoll;
pub mod events;
pub mod kv;
pub mod lifecycle;
pub mod locks;
pub mod net;
pub mod props;
pub mod recovery;
pub mod registry;
pub mod resources;
pub mod task;
pub mod volumes;

pub use arbor_core::sys_err;

pub use container::Container;
pub use context::{ClientContext, Runtime};
pub use locks::{LockMode, SubtreeLock};
