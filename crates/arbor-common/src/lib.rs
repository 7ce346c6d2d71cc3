//! Shared foundation of the arbor workspace: the unified error type, domain
//! primitives, configuration model and system-wide constants.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use error::{Error, ErrorKind, Result};
