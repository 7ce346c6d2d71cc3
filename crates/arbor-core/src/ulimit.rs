//! Resource limits (ulimits) parsing, merging and per-task application.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use arbor_common::{Error, ErrorKind, Result};

/// Resources the daemon knows how to set, by property name.
const RESOURCES: &[(&str, u32)] = &[
    ("as", libc::RLIMIT_AS as u32),
    ("core", libc::RLIMIT_CORE as u32),
    ("cpu", libc::RLIMIT_CPU as u32),
    ("data", libc::RLIMIT_DATA as u32),
    ("fsize", libc::RLIMIT_FSIZE as u32),
    ("locks", libc::RLIMIT_LOCKS as u32),
    ("memlock", libc::RLIMIT_MEMLOCK as u32),
    ("msgqueue", libc::RLIMIT_MSGQUEUE as u32),
    ("nice", libc::RLIMIT_NICE as u32),
    ("nofile", libc::RLIMIT_NOFILE as u32),
    ("nproc", libc::RLIMIT_NPROC as u32),
    ("rss", libc::RLIMIT_RSS as u32),
    ("rtprio", libc::RLIMIT_RTPRIO as u32),
    ("sigpending", libc::RLIMIT_SIGPENDING as u32),
    ("stack", libc::RLIMIT_STACK as u32),
];

/// One soft/hard pair; `u64::MAX` encodes `unlimited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ulimit {
    pub soft: u64,
    pub hard: u64,
}

/// Set of ulimits keyed by resource number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UlimitSet {
    limits: BTreeMap<u32, Ulimit>,
}

fn resource_by_name(name: &str) -> Result<u32> {
    RESOURCES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, r)| *r)
        .ok_or_else(|| Error::new(ErrorKind::InvalidValue, format!("unknown ulimit: {name}")))
}

fn resource_name(resource: u32) -> &'static str {
    RESOURCES
        .iter()
        .find(|(_, r)| *r == resource)
        .map_or("?", |(n, _)| n)
}

fn parse_value(s: &str) -> Result<u64> {
    if s == "unlimited" || s == "-1" {
        return Ok(u64::MAX);
    }
    s.parse()
        .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("invalid ulimit value: {s}")))
}

impl UlimitSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    pub fn set(&mut self, resource: u32, soft: u64, hard: u64) {
        self.limits.insert(resource, Ulimit { soft, hard });
    }

    #[must_use]
    pub fn get(&self, resource: u32) -> Option<Ulimit> {
        self.limits.get(&resource).copied()
    }

    /// Folds in limits from `other`; existing entries win unless `overwrite`.
    pub fn merge(&mut self, other: &Self, overwrite: bool) {
        for (&resource, &limit) in &other.limits {
            if overwrite || !self.limits.contains_key(&resource) {
                self.limits.insert(resource, limit);
            }
        }
    }

    /// Applies every limit to one task.
    ///
    /// # Errors
    ///
    /// Returns an error with the errno preserved; callers treat ESRCH as a
    /// race with exit.
    pub fn apply(&self, pid: i32) -> Result<()> {
        for (&resource, limit) in &self.limits {
            let rlim = libc::rlimit {
                rlim_cur: if limit.soft == u64::MAX {
                    libc::RLIM_INFINITY
                } else {
                    limit.soft
                },
                rlim_max: if limit.hard == u64::MAX {
                    libc::RLIM_INFINITY
                } else {
                    limit.hard
                },
            };
            // SAFETY: rlim is valid for the duration of the call; prlimit
            // does not retain the pointer.
            let rc = unsafe {
                libc::prlimit(
                    pid,
                    resource as libc::__rlimit_resource_t,
                    &rlim,
                    std::ptr::null_mut(),
                )
            };
            if rc != 0 {
                return Err(
                    Error::system("prlimit", &std::io::Error::last_os_error())
                        .context(format!("ulimit {} for task {pid}", resource_name(resource))),
                );
            }
        }
        Ok(())
    }
}

impl fmt::Display for UlimitSet {
    /// Property wire format: `core: 0 unlimited; nofile: 1024 4096`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let format_value = |v: u64| {
            if v == u64::MAX {
                String::from("unlimited")
            } else {
                v.to_string()
            }
        };
        let mut first = true;
        for (&resource, limit) in &self.limits {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(
                f,
                "{}: {} {}",
                resource_name(resource),
                format_value(limit.soft),
                format_value(limit.hard)
            )?;
        }
        Ok(())
    }
}

impl FromStr for UlimitSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut set = Self::new();
        for entry in s.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, values) = entry.split_once(':').ok_or_else(|| {
                Error::new(ErrorKind::InvalidValue, format!("invalid ulimit entry: {entry}"))
            })?;
            let resource = resource_by_name(name.trim())?;
            let mut parts = values.split_whitespace();
            let soft = parse_value(parts.next().ok_or_else(|| {
                Error::new(ErrorKind::InvalidValue, format!("ulimit {name} missing value"))
            })?)?;
            let hard = match parts.next() {
                Some(v) => parse_value(v)?,
                None => soft,
            };
            if parts.next().is_some() {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("ulimit {name} has trailing values"),
                ));
            }
            set.set(resource, soft, hard);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_round_trip() {
        let set: UlimitSet = "core: 0 unlimited; nofile: 1024 4096".parse().expect("parse");
        let again: UlimitSet = set.to_string().parse().expect("reparse");
        assert_eq!(set, again);
    }

    #[test]
    fn single_value_sets_both_bounds() {
        let set: UlimitSet = "nofile: 512".parse().expect("parse");
        let limit = set.get(libc::RLIMIT_NOFILE as u32).expect("entry");
        assert_eq!(limit.soft, 512);
        assert_eq!(limit.hard, 512);
    }

    #[test]
    fn unknown_resource_is_rejected() {
        assert!("warp: 1".parse::<UlimitSet>().is_err());
    }

    #[test]
    fn merge_prefers_existing_without_overwrite() {
        let mut child: UlimitSet = "nofile: 100".parse().expect("child");
        let parent: UlimitSet = "nofile: 200; core: 0".parse().expect("parent");
        child.merge(&parent, false);
        assert_eq!(child.get(libc::RLIMIT_NOFILE as u32).expect("nofile").soft, 100);
        assert_eq!(child.get(libc::RLIMIT_CORE as u32).expect("core").soft, 0);
    }

    #[test]
    fn apply_to_own_process_succeeds() {
        let set: UlimitSet = "core: 0 0".parse().expect("parse");
        set.apply(std::process::id() as i32).expect("apply to self");
    }
}
