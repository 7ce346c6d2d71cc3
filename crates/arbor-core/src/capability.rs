//! Linux capability sets.
//!
//! A [`CapSet`] is a bitmask over capability numbers. The daemon reasons
//! about bounding, allowed, ambient and limit sets; actual installation into
//! the payload happens in the task launcher.

use std::fmt;
use std::str::FromStr;

use arbor_common::{Error, ErrorKind, Result};

/// Capability names indexed by their kernel number.
const CAP_NAMES: [&str; 41] = [
    "CHOWN",
    "DAC_OVERRIDE",
    "DAC_READ_SEARCH",
    "FOWNER",
    "FSETID",
    "KILL",
    "SETGID",
    "SETUID",
    "SETPCAP",
    "LINUX_IMMUTABLE",
    "NET_BIND_SERVICE",
    "NET_BROADCAST",
    "NET_ADMIN",
    "NET_RAW",
    "IPC_LOCK",
    "IPC_OWNER",
    "SYS_MODULE",
    "SYS_RAWIO",
    "SYS_CHROOT",
    "SYS_PTRACE",
    "SYS_PACCT",
    "SYS_ADMIN",
    "SYS_BOOT",
    "SYS_NICE",
    "SYS_RESOURCE",
    "SYS_TIME",
    "SYS_TTY_CONFIG",
    "MKNOD",
    "LEASE",
    "AUDIT_WRITE",
    "AUDIT_CONTROL",
    "SETFCAP",
    "MAC_OVERRIDE",
    "MAC_ADMIN",
    "SYSLOG",
    "WAKE_ALARM",
    "BLOCK_SUSPEND",
    "AUDIT_READ",
    "PERFMON",
    "BPF",
    "CHECKPOINT_RESTORE",
];

/// A set of Linux capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapSet(pub u64);

impl CapSet {
    pub const NONE: Self = Self(0);

    /// Set containing a single capability by kernel number.
    #[must_use]
    pub const fn single(cap: u32) -> Self {
        Self(1 << cap)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Every capability this kernel knows about.
    ///
    /// Falls back to the full compile-time table when
    /// `/proc/sys/kernel/cap_last_cap` cannot be read.
    #[must_use]
    pub fn host_bound() -> Self {
        let last = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(CAP_NAMES.len() as u32 - 1);
        if last >= 63 {
            return Self(u64::MAX);
        }
        Self((2u64 << last) - 1)
    }
}

impl fmt::Display for CapSet {
    /// Semicolon-separated capability names, the property wire format.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (i, name) in CAP_NAMES.iter().enumerate() {
            if self.0 & (1 << i) != 0 {
                if !first {
                    f.write_str(";")?;
                }
                first = false;
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}

impl FromStr for CapSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut set = Self::NONE;
        for name in s.split(';').map(str::trim).filter(|n| !n.is_empty()) {
            let cap = CAP_NAMES
                .iter()
                .position(|n| n.eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    Error::new(ErrorKind::InvalidValue, format!("unknown capability: {name}"))
                })?;
            set.0 |= 1 << cap;
        }
        Ok(set)
    }
}

macro_rules! caps {
    ($($name:ident),+ $(,)?) => {
        CapSet(0 $(| (1 << cap_index(stringify!($name))))+)
    };
}

const fn cap_index(name: &str) -> u32 {
    let mut i = 0;
    while i < CAP_NAMES.len() {
        if str_eq(CAP_NAMES[i], name) {
            return i as u32;
        }
        i += 1;
    }
    panic!("unknown capability name in constant set");
}

const fn str_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
    }
    true
}

/// Capabilities that only make sense with pid-namespace isolation.
pub const PID_NS_CAPS: CapSet = caps!(KILL, SYS_PTRACE, SYS_BOOT);

/// Capabilities that only make sense under a memory limit.
pub const MEM_CG_CAPS: CapSet = caps!(IPC_LOCK);

/// Capabilities that only make sense with a private network namespace.
pub const NET_NS_CAPS: CapSet = caps!(NET_ADMIN, NET_RAW);

/// Bounding set considered safe inside a chroot.
pub const CHROOT_BOUND: CapSet = caps!(
    CHOWN,
    DAC_OVERRIDE,
    FOWNER,
    FSETID,
    KILL,
    SETGID,
    SETUID,
    SETPCAP,
    NET_BIND_SERVICE,
    NET_ADMIN,
    NET_RAW,
    IPC_LOCK,
    SYS_CHROOT,
    SYS_PTRACE,
    SYS_NICE,
    SYS_RESOURCE,
    MKNOD,
    AUDIT_WRITE,
    SETFCAP,
);

/// Capabilities granted by default to non-root owners outside a chroot.
pub const HOST_ALLOWED: CapSet = caps!(
    KILL,
    NET_BIND_SERVICE,
    NET_ADMIN,
    NET_RAW,
    IPC_LOCK,
    SYS_PTRACE,
    SYS_NICE,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        let set: CapSet = "CHOWN;NET_ADMIN;SYS_PTRACE".parse().expect("parse");
        let again: CapSet = set.to_string().parse().expect("reparse");
        assert_eq!(set, again);
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!("CHOWN;TELEPORT".parse::<CapSet>().is_err());
    }

    #[test]
    fn set_algebra() {
        let a: CapSet = "CHOWN;KILL".parse().expect("a");
        let b: CapSet = "KILL".parse().expect("b");
        assert!(b.is_subset_of(a));
        assert_eq!(a.without(b).to_string(), "CHOWN");
        assert_eq!(a.intersect(b), b);
        assert!(!a.is_subset_of(b));
    }

    #[test]
    fn constant_groups_are_non_empty() {
        assert!(!PID_NS_CAPS.is_empty());
        assert!(!CHROOT_BOUND.is_empty());
        assert!(MEM_CG_CAPS.is_subset_of(CHROOT_BOUND));
    }

    #[test]
    fn host_bound_covers_chroot_bound() {
        assert!(CHROOT_BOUND.is_subset_of(CapSet::host_bound()));
    }
}
