//! CPU bitmaps and host CPU topology.
//!
//! Masks use the kernel's list format (`0-3,8`) for parsing and display so
//! they can be written to `cpuset` control files verbatim.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use arbor_common::{Error, ErrorKind, Result};

/// A set of logical CPU numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuMask {
    cpus: BTreeSet<u32>,
}

impl CpuMask {
    /// Empty mask.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mask containing `0..count`.
    #[must_use]
    pub fn first(count: u32) -> Self {
        Self {
            cpus: (0..count).collect(),
        }
    }

    #[must_use]
    pub fn contains(&self, cpu: u32) -> bool {
        self.cpus.contains(&cpu)
    }

    pub fn insert(&mut self, cpu: u32) {
        self.cpus.insert(cpu);
    }

    pub fn remove(&mut self, cpu: u32) {
        self.cpus.remove(&cpu);
    }

    /// Adds every CPU of `other`.
    pub fn add(&mut self, other: &Self) {
        self.cpus.extend(other.cpus.iter().copied());
    }

    /// Removes every CPU of `other`.
    pub fn subtract(&mut self, other: &Self) {
        for cpu in &other.cpus {
            self.cpus.remove(cpu);
        }
    }

    pub fn clear(&mut self) {
        self.cpus.clear();
    }

    /// Number of CPUs in the mask.
    #[must_use]
    pub fn weight(&self) -> usize {
        self.cpus.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.cpus.is_subset(&other.cpus)
    }

    #[must_use]
    pub fn is_disjoint(&self, other: &Self) -> bool {
        self.cpus.is_disjoint(&other.cpus)
    }

    /// CPUs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.cpus.iter().copied()
    }

    /// Reads a mask from a sysfs file in list format.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn read_sysfs(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::system("read", &e).context(path.display()))?;
        content.trim().parse().map_err(|e: Error| e.context(path.display()))
    }
}

impl fmt::Display for CpuMask {
    /// Kernel list format: ranges joined by commas, e.g. `0-3,8`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.cpus.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end = iter.next().unwrap_or(end);
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for CpuMask {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut mask = Self::new();
        let s = s.trim();
        if s.is_empty() {
            return Ok(mask);
        }
        for part in s.split(',') {
            let part = part.trim();
            let bad = || {
                Error::new(ErrorKind::InvalidValue, format!("invalid cpu list: '{s}'"))
            };
            match part.split_once('-') {
                Some((a, b)) => {
                    let a: u32 = a.trim().parse().map_err(|_| bad())?;
                    let b: u32 = b.trim().parse().map_err(|_| bad())?;
                    if a > b {
                        return Err(bad());
                    }
                    for cpu in a..=b {
                        mask.insert(cpu);
                    }
                }
                None => mask.insert(part.parse().map_err(|_| bad())?),
            }
        }
        Ok(mask)
    }
}

/// Host CPU topology: online mask, SMT sibling groups and NUMA node lists.
///
/// Read from sysfs on the live system; tests construct synthetic topologies
/// directly.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// All online CPUs.
    pub online: CpuMask,
    /// For each online CPU, the set of its SMT siblings (itself included).
    pub core_threads: Vec<CpuMask>,
    /// Online NUMA nodes.
    pub nodes: CpuMask,
    /// For each NUMA node, its CPU list.
    pub node_threads: Vec<CpuMask>,
}

impl Topology {
    /// Reads the live topology from `/sys`.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the sysfs files cannot be read.
    pub fn read() -> Result<Self> {
        let online = CpuMask::read_sysfs(Path::new("/sys/devices/system/cpu/online"))?;

        let size = online.iter().max().map_or(0, |max| max + 1);
        let mut core_threads = vec![CpuMask::new(); size as usize];
        for cpu in online.iter() {
            let path = format!("/sys/devices/system/cpu/cpu{cpu}/topology/thread_siblings_list");
            core_threads[cpu as usize] = CpuMask::read_sysfs(Path::new(&path))?;
        }

        let nodes = CpuMask::read_sysfs(Path::new("/sys/devices/system/node/online"))?;
        let node_size = nodes.iter().max().map_or(0, |max| max + 1);
        let mut node_threads = vec![CpuMask::new(); node_size as usize];
        for node in nodes.iter() {
            let path = format!("/sys/devices/system/node/node{node}/cpulist");
            node_threads[node as usize] = CpuMask::read_sysfs(Path::new(&path))?;
        }

        Ok(Self {
            online,
            core_threads,
            nodes,
            node_threads,
        })
    }

    /// Synthetic topology: `cores` physical cores with `smt` threads each,
    /// all on NUMA node 0. CPU numbering follows the common enumeration where
    /// thread `t` of core `c` is CPU `c + t * cores`.
    #[must_use]
    pub fn synthetic(cores: u32, smt: u32) -> Self {
        let total = cores * smt;
        let online = CpuMask::first(total);
        let mut core_threads = vec![CpuMask::new(); total as usize];
        for core in 0..cores {
            let mut siblings = CpuMask::new();
            for thread in 0..smt {
                siblings.insert(core + thread * cores);
            }
            for cpu in siblings.iter() {
                core_threads[cpu as usize] = siblings.clone();
            }
        }
        let mut nodes = CpuMask::new();
        nodes.insert(0);
        Self {
            online: online.clone(),
            core_threads,
            nodes,
            node_threads: vec![online],
        }
    }

    /// Sibling set of a CPU; empty when the CPU is unknown.
    #[must_use]
    pub fn siblings(&self, cpu: u32) -> CpuMask {
        self.core_threads
            .get(cpu as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// CPU list of a NUMA node, if the node is online.
    #[must_use]
    pub fn node_cpus(&self, node: u32) -> Option<&CpuMask> {
        if self.nodes.contains(node) {
            self.node_threads.get(node as usize)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_round_trip() {
        for list in ["0", "0-3", "0-3,8", "1,3,5-7"] {
            let mask: CpuMask = list.parse().expect("parse");
            assert_eq!(mask.to_string(), list);
        }
    }

    #[test]
    fn empty_list_is_empty_mask() {
        let mask: CpuMask = "".parse().expect("parse");
        assert!(mask.is_empty());
        assert_eq!(mask.to_string(), "");
    }

    #[test]
    fn reversed_range_is_rejected() {
        assert!("3-0".parse::<CpuMask>().is_err());
    }

    #[test]
    fn subtract_and_subset() {
        let mut a: CpuMask = "0-7".parse().expect("a");
        let b: CpuMask = "2-3".parse().expect("b");
        assert!(b.is_subset_of(&a));
        a.subtract(&b);
        assert_eq!(a.to_string(), "0-1,4-7");
        assert!(a.is_disjoint(&b));
    }

    #[test]
    fn synthetic_topology_smt_pairs() {
        let topo = Topology::synthetic(4, 2);
        assert_eq!(topo.online.weight(), 8);
        // Thread sibling of CPU 1 is CPU 5 under the c + t*cores numbering.
        let siblings = topo.siblings(1);
        assert!(siblings.contains(1));
        assert!(siblings.contains(5));
        assert_eq!(siblings.weight(), 2);
        assert_eq!(topo.node_cpus(0).map(CpuMask::weight), Some(8));
        assert!(topo.node_cpus(1).is_none());
    }
}
