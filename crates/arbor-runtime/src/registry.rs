//! Container name validation and the dense id pool.

use arbor_common::constants::{
    CONTAINER_ID_MAX, CONTAINER_PATH_MAX, CONTAINER_PATH_MAX_SUPERUSER, DOT_CONTAINER,
    NAME_COMPONENT_MAX, ROOT_CONTAINER, SELF_CONTAINER,
};
use arbor_common::{Error, ErrorKind, Result};

/// Validates a container path.
///
/// A name is a `/`-separated path of components from
/// `[A-Za-z0-9_\-@:.]`, each component at most 128 bytes, never empty and
/// never the reserved `.` or `self`. The whole path is capped at 200 bytes
/// (220 for superusers). `/` alone names the root.
///
/// # Errors
///
/// Returns `InvalidValue` describing the first violation.
pub fn validate_name(name: &str, superuser: bool) -> Result<()> {
    if name.is_empty() {
        return Err(Error::new(ErrorKind::InvalidValue, "container path too short"));
    }

    let path_max = if superuser {
        CONTAINER_PATH_MAX_SUPERUSER
    } else {
        CONTAINER_PATH_MAX
    };
    if name.len() > path_max {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("container path too long, limit is {path_max}"),
        ));
    }

    if name.starts_with('/') {
        if name == ROOT_CONTAINER {
            return Ok(());
        }
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("container path starts with '/': {name}"),
        ));
    }

    for component in name.split('/') {
        if component.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("double or trailing '/' in container path: {name}"),
            ));
        }
        if component.len() > NAME_COMPONENT_MAX {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!(
                    "container name component too long, limit is {NAME_COMPONENT_MAX}: '{component}'"
                ),
            ));
        }
        if component == SELF_CONTAINER {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "container name 'self' is reserved",
            ));
        }
        if component == DOT_CONTAINER {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "container name '.' is reserved",
            ));
        }
        if let Some(c) = component
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !"_-@:.".contains(*c))
        {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("forbidden character {:#x} in container name", c as u32),
            ));
        }
    }

    Ok(())
}

/// Parent of a container path; the root for single-component names.
#[must_use]
pub fn parent_name(name: &str) -> &str {
    match name.rsplit_once('/') {
        Some((parent, _)) => parent,
        None => ROOT_CONTAINER,
    }
}

/// Last component of a container path.
#[must_use]
pub fn first_name(name: &str) -> &str {
    match name.rsplit_once('/') {
        Some((_, first)) => first,
        None => name,
    }
}

/// Dense bitmap allocator over `[1, CONTAINER_ID_MAX]`.
///
/// Ids are released back to the pool only when a container reaches
/// `Destroyed`, so a dead container keeps its id across daemon restarts.
#[derive(Debug)]
pub struct IdPool {
    words: Vec<u64>,
}

impl IdPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            words: vec![0; (CONTAINER_ID_MAX as usize + 64) / 64],
        }
    }

    /// Allocates the lowest free id.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotAvailable` when the pool is exhausted.
    pub fn allocate(&mut self) -> Result<u32> {
        for id in 1..=CONTAINER_ID_MAX {
            if !self.taken(id) {
                self.mark(id, true);
                return Ok(id);
            }
        }
        Err(Error::new(ErrorKind::ResourceNotAvailable, "container id pool exhausted"))
    }

    /// Claims a specific id during restore.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for an out-of-range id and
    /// `ContainerAlreadyExists` when the id is already taken.
    pub fn reserve(&mut self, id: u32) -> Result<()> {
        if id == 0 || id > CONTAINER_ID_MAX {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("container id out of range: {id}"),
            ));
        }
        if self.taken(id) {
            return Err(Error::new(
                ErrorKind::ContainerAlreadyExists,
                format!("container id already in use: {id}"),
            ));
        }
        self.mark(id, true);
        Ok(())
    }

    /// Returns an id to the pool.
    pub fn release(&mut self, id: u32) {
        if id == 0 || id > CONTAINER_ID_MAX {
            return;
        }
        if !self.taken(id) {
            tracing::warn!(id, "releasing an id that was not allocated");
            return;
        }
        self.mark(id, false);
    }

    fn taken(&self, id: u32) -> bool {
        self.words[id as usize / 64] & (1 << (id % 64)) != 0
    }

    fn mark(&mut self, id: u32, taken: bool) {
        let word = &mut self.words[id as usize / 64];
        if taken {
            *word |= 1 << (id % 64);
        } else {
            *word &= !(1 << (id % 64));
        }
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names_pass() {
        for name in ["a", "a/b", "web-1", "a_b@c:d.e", "x/y/z"] {
            validate_name(name, false).expect(name);
        }
        validate_name("/", false).expect("root");
    }

    #[test]
    fn invalid_names_fail() {
        for name in ["", "a//b", "a/", "/a", "self", "a/self", ".", "a/.", "a b", "a\tb"] {
            assert!(validate_name(name, false).is_err(), "{name:?} should fail");
        }
    }

    #[test]
    fn validation_is_idempotent() {
        let name = "a/b-c";
        assert!(validate_name(name, false).is_ok());
        assert!(validate_name(name, false).is_ok());
    }

    #[test]
    fn path_length_limits_respect_superuser() {
        let long = "a".repeat(210);
        assert!(validate_name(&long, false).is_err());
        // 210 bytes needs components: single component is capped at 128.
        let long = format!("{}/{}", "a".repeat(128), "b".repeat(81));
        assert!(validate_name(&long, false).is_err());
        assert!(validate_name(&long, true).is_ok());
    }

    #[test]
    fn parent_and_first_name_split() {
        assert_eq!(parent_name("a/b/c"), "a/b");
        assert_eq!(parent_name("a"), ROOT_CONTAINER);
        assert_eq!(first_name("a/b/c"), "c");
        assert_eq!(first_name("a"), "a");
    }

    #[test]
    fn id_pool_allocates_densely_and_releases() {
        let mut pool = IdPool::new();
        assert_eq!(pool.allocate().expect("first"), 1);
        assert_eq!(pool.allocate().expect("second"), 2);
        pool.release(1);
        assert_eq!(pool.allocate().expect("reuse"), 1);
    }

    #[test]
    fn id_pool_reserve_conflicts() {
        let mut pool = IdPool::new();
        pool.reserve(5).expect("reserve");
        assert!(pool.reserve(5).is_err());
        assert!(pool.reserve(0).is_err());
        assert!(pool.reserve(CONTAINER_ID_MAX + 1).is_err());
        assert_eq!(pool.allocate().expect("skips reserved"), 1);
    }

    #[test]
    fn id_pool_exhaustion() {
        let mut pool = IdPool::new();
        for _ in 0..CONTAINER_ID_MAX {
            pool.allocate().expect("allocate");
        }
        let err = pool.allocate().expect_err("exhausted");
        assert_eq!(err.kind, ErrorKind::ResourceNotAvailable);
    }
}
