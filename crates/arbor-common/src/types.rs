//! Domain primitive types used across the arbor workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    /// No task, no live cgroups beyond the record itself.
    Stopped,
    /// Start pipeline committed, task not yet launched.
    Starting,
    /// Main task is alive.
    Running,
    /// Holds no task of its own but its children may be live.
    Meta,
    /// Freezer reports FROZEN; resumes to the prior live state.
    Paused,
    /// Teardown in progress.
    Stopping,
    /// Task exited; record kept until aged out or restarted.
    Dead,
    /// Unregistered; the id has been released.
    Destroyed,
}

impl ContainerState {
    /// True for states that hold kernel resources.
    #[must_use]
    pub fn is_alive(self) -> bool {
        !matches!(self, Self::Stopped | Self::Dead | Self::Destroyed)
    }

    /// True for states in which the subtree may have active tasks.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Running | Self::Meta | Self::Starting | Self::Stopping)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Meta => "meta",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Dead => "dead",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

impl FromStr for ContainerState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "meta" => Ok(Self::Meta),
            "paused" => Ok(Self::Paused),
            "stopping" => Ok(Self::Stopping),
            "dead" => Ok(Self::Dead),
            "destroyed" => Ok(Self::Destroyed),
            other => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown container state: {other}"),
            )),
        }
    }
}

/// What a container's clients are allowed to see and do through the daemon.
///
/// Ordered from most to least restricted; a child inherits
/// `min(parent_level, Normal)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    /// No daemon access at all.
    None,
    /// Read-only, namespaced to the own subtree.
    ReadIsolate,
    /// Read-only over the visible namespace.
    ReadOnly,
    /// Full control, namespaced to the own subtree.
    Isolate,
    /// Like `Isolate` but the container may also manage itself.
    SelfIsolate,
    /// May manage child containers only, not itself.
    ChildOnly,
    /// Regular access.
    Normal,
    /// Administrative access.
    SuperUser,
    /// Reserved for the daemon's own service containers.
    Internal,
}

impl AccessLevel {
    /// Level granted to a child of a container at this level.
    #[must_use]
    pub fn inherited(self) -> Self {
        self.min(Self::Normal)
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::ReadIsolate => "read-isolate",
            Self::ReadOnly => "read-only",
            Self::Isolate => "isolate",
            Self::SelfIsolate => "self-isolate",
            Self::ChildOnly => "child-only",
            Self::Normal => "normal",
            Self::SuperUser => "super",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl FromStr for AccessLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "read-isolate" => Ok(Self::ReadIsolate),
            "read-only" => Ok(Self::ReadOnly),
            "isolate" => Ok(Self::Isolate),
            "self-isolate" => Ok(Self::SelfIsolate),
            "child-only" => Ok(Self::ChildOnly),
            "normal" => Ok(Self::Normal),
            "super" => Ok(Self::SuperUser),
            "internal" => Ok(Self::Internal),
            other => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("unknown access level: {other}"),
            )),
        }
    }
}

/// Policy by which a container receives CPUs from its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CpuSetType {
    /// Take whatever is vacant in the parent.
    Inherit,
    /// Explicit CPU mask.
    Absolute,
    /// All CPUs of one NUMA node.
    Node,
    /// Reserve whole physical cores, SMT siblings included.
    Cores,
    /// Reserve logical CPUs, whole cores preferred.
    Threads,
    /// Reserve logical CPUs but keep the parent-wide affinity.
    Reserve,
}

/// Parsed `cpu_set` property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSetSpec {
    /// Placement policy.
    pub kind: CpuSetType,
    /// Node number or CPU count, unused for `Inherit`/`Absolute`.
    pub arg: u32,
    /// Explicit mask in list format, only for `Absolute`.
    pub mask: String,
}

impl CpuSetSpec {
    /// The default: inherit whatever the parent leaves vacant.
    #[must_use]
    pub fn inherit() -> Self {
        Self {
            kind: CpuSetType::Inherit,
            arg: 0,
            mask: String::new(),
        }
    }
}

impl Default for CpuSetSpec {
    fn default() -> Self {
        Self::inherit()
    }
}

impl fmt::Display for CpuSetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CpuSetType::Inherit => Ok(()),
            CpuSetType::Absolute => f.write_str(&self.mask),
            CpuSetType::Node => write!(f, "node {}", self.arg),
            CpuSetType::Cores => write!(f, "cores {}", self.arg),
            CpuSetType::Threads => write!(f, "threads {}", self.arg),
            CpuSetType::Reserve => write!(f, "reserve {}", self.arg),
        }
    }
}

impl FromStr for CpuSetSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::inherit());
        }
        let (word, arg) = match s.split_once(' ') {
            Some((w, a)) => (w, a.trim()),
            None => (s, ""),
        };
        let parse_arg = |what: &str| -> Result<u32> {
            arg.parse().map_err(|_| {
                Error::new(
                    ErrorKind::InvalidValue,
                    format!("cpu_set {what} requires a number, got '{arg}'"),
                )
            })
        };
        match word {
            "node" => Ok(Self {
                kind: CpuSetType::Node,
                arg: parse_arg("node")?,
                mask: String::new(),
            }),
            "cores" => Ok(Self {
                kind: CpuSetType::Cores,
                arg: parse_arg("cores")?,
                mask: String::new(),
            }),
            "threads" => Ok(Self {
                kind: CpuSetType::Threads,
                arg: parse_arg("threads")?,
                mask: String::new(),
            }),
            "reserve" => Ok(Self {
                kind: CpuSetType::Reserve,
                arg: parse_arg("reserve")?,
                mask: String::new(),
            }),
            _ => Ok(Self {
                kind: CpuSetType::Absolute,
                arg: 0,
                mask: s.to_string(),
            }),
        }
    }
}

/// Parses a byte size with an optional binary suffix (`4096`, `64M`, `1G`).
///
/// # Errors
///
/// Returns `InvalidValue` for an empty string, unknown suffix, or overflow.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let bad = || Error::new(ErrorKind::InvalidValue, format!("invalid size: '{s}'"));
    if s.is_empty() {
        return Err(bad());
    }
    let (digits, suffix) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let base: u64 = digits.parse().map_err(|_| bad())?;
    let mult: u64 = match suffix.trim() {
        "" | "B" | "b" => 1,
        "K" | "k" | "KiB" => 1 << 10,
        "M" | "m" | "MiB" => 1 << 20,
        "G" | "g" | "GiB" => 1 << 30,
        "T" | "t" | "TiB" => 1 << 40,
        _ => return Err(bad()),
    };
    base.checked_mul(mult).ok_or_else(bad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display_and_parse_round_trip() {
        for state in [
            ContainerState::Stopped,
            ContainerState::Starting,
            ContainerState::Running,
            ContainerState::Meta,
            ContainerState::Paused,
            ContainerState::Stopping,
            ContainerState::Dead,
            ContainerState::Destroyed,
        ] {
            let parsed: ContainerState = state.to_string().parse().expect("parse");
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn live_and_alive_classification() {
        assert!(ContainerState::Running.is_alive());
        assert!(ContainerState::Paused.is_alive());
        assert!(!ContainerState::Dead.is_alive());
        assert!(ContainerState::Stopping.is_live());
        assert!(!ContainerState::Paused.is_live());
    }

    #[test]
    fn access_level_inheritance_caps_at_normal() {
        assert_eq!(AccessLevel::SuperUser.inherited(), AccessLevel::Normal);
        assert_eq!(AccessLevel::ReadOnly.inherited(), AccessLevel::ReadOnly);
        assert_eq!(AccessLevel::None.inherited(), AccessLevel::None);
    }

    #[test]
    fn cpu_set_spec_parses_all_forms() {
        assert_eq!("".parse::<CpuSetSpec>().expect("inherit").kind, CpuSetType::Inherit);
        let cores: CpuSetSpec = "cores 2".parse().expect("cores");
        assert_eq!(cores.kind, CpuSetType::Cores);
        assert_eq!(cores.arg, 2);
        let node: CpuSetSpec = "node 1".parse().expect("node");
        assert_eq!(node.kind, CpuSetType::Node);
        let abs: CpuSetSpec = "0-3,8".parse().expect("absolute");
        assert_eq!(abs.kind, CpuSetType::Absolute);
        assert_eq!(abs.mask, "0-3,8");
        assert!("cores lots".parse::<CpuSetSpec>().is_err());
    }

    #[test]
    fn parse_size_accepts_suffixes() {
        assert_eq!(parse_size("4096").expect("plain"), 4096);
        assert_eq!(parse_size("64M").expect("mebi"), 64 << 20);
        assert_eq!(parse_size("1G").expect("gibi"), 1 << 30);
        assert!(parse_size("").is_err());
        assert!(parse_size("10X").is_err());
    }
}
