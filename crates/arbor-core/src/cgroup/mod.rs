//! Cgroup v1 hierarchy access.
//!
//! Each controller is mounted as its own hierarchy under
//! `/sys/fs/cgroup/<name>`. A [`Cgroup`] is a handle to one directory in one
//! hierarchy; control-file handles are opened per call and closed at scope
//! exit. The container engine composes paths, this module reads and writes
//! them.

pub mod cpu;
pub mod cpuset;
pub mod freezer;
pub mod io;
pub mod memory;
pub mod misc;

use std::fmt;
use std::path::{Path, PathBuf};

use arbor_common::constants::CGROUP_ROOT;
use arbor_common::{Error, ErrorKind, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Bitmask over the controllers a container owns.
pub type ControllerMask = u64;

pub const FREEZER: ControllerMask = 1 << 0;
pub const MEMORY: ControllerMask = 1 << 1;
pub const CPU: ControllerMask = 1 << 2;
pub const CPUACCT: ControllerMask = 1 << 3;
pub const CPUSET: ControllerMask = 1 << 4;
pub const NETCLS: ControllerMask = 1 << 5;
pub const BLKIO: ControllerMask = 1 << 6;
pub const DEVICES: ControllerMask = 1 << 7;
pub const HUGETLB: ControllerMask = 1 << 8;
pub const PIDS: ControllerMask = 1 << 9;

/// One mounted cgroup v1 hierarchy.
#[derive(Debug, PartialEq, Eq)]
pub struct Subsystem {
    /// Controller bit this hierarchy carries.
    pub kind: ControllerMask,
    /// Mount directory name, also the name in `/proc/<pid>/cgroup`.
    pub name: &'static str,
}

pub static FREEZER_SUBSYSTEM: Subsystem = Subsystem { kind: FREEZER, name: "freezer" };
pub static MEMORY_SUBSYSTEM: Subsystem = Subsystem { kind: MEMORY, name: "memory" };
pub static CPU_SUBSYSTEM: Subsystem = Subsystem { kind: CPU, name: "cpu" };
pub static CPUACCT_SUBSYSTEM: Subsystem = Subsystem { kind: CPUACCT, name: "cpuacct" };
pub static CPUSET_SUBSYSTEM: Subsystem = Subsystem { kind: CPUSET, name: "cpuset" };
pub static NETCLS_SUBSYSTEM: Subsystem = Subsystem { kind: NETCLS, name: "net_cls" };
pub static BLKIO_SUBSYSTEM: Subsystem = Subsystem { kind: BLKIO, name: "blkio" };
pub static DEVICES_SUBSYSTEM: Subsystem = Subsystem { kind: DEVICES, name: "devices" };
pub static HUGETLB_SUBSYSTEM: Subsystem = Subsystem { kind: HUGETLB, name: "hugetlb" };
pub static PIDS_SUBSYSTEM: Subsystem = Subsystem { kind: PIDS, name: "pids" };

/// All hierarchies the daemon manages, freezer first.
pub static SUBSYSTEMS: [&Subsystem; 10] = [
    &FREEZER_SUBSYSTEM,
    &MEMORY_SUBSYSTEM,
    &CPU_SUBSYSTEM,
    &CPUACCT_SUBSYSTEM,
    &CPUSET_SUBSYSTEM,
    &NETCLS_SUBSYSTEM,
    &BLKIO_SUBSYSTEM,
    &DEVICES_SUBSYSTEM,
    &HUGETLB_SUBSYSTEM,
    &PIDS_SUBSYSTEM,
];

/// Human-readable list of controller names in a mask.
#[must_use]
pub fn format_controllers(mask: ControllerMask) -> String {
    let names: Vec<&str> = SUBSYSTEMS
        .iter()
        .filter(|s| s.kind & mask != 0)
        .map(|s| s.name)
        .collect();
    names.join(";")
}

impl Subsystem {
    /// Whether the hierarchy is mounted on this host.
    #[must_use]
    pub fn supported(&self) -> bool {
        self.mount_point().is_dir()
    }

    /// Hierarchy mount directory.
    #[must_use]
    pub fn mount_point(&self) -> PathBuf {
        Path::new(CGROUP_ROOT).join(self.name)
    }

    /// Handle to the hierarchy root.
    #[must_use]
    pub fn root_cgroup(&'static self) -> Cgroup {
        Cgroup {
            subsys: self,
            name: String::from("/"),
        }
    }

    /// Handle to a cgroup at `name` (absolute within the hierarchy).
    #[must_use]
    pub fn cgroup(&'static self, name: &str) -> Cgroup {
        Cgroup {
            subsys: self,
            name: name.to_string(),
        }
    }

    /// The cgroup a task currently belongs to in this hierarchy.
    ///
    /// # Errors
    ///
    /// Returns an error if `/proc/<pid>/cgroup` cannot be read or has no
    /// entry for this controller.
    pub fn task_cgroup(&'static self, pid: i32) -> Result<Cgroup> {
        let path = format!("/proc/{pid}/cgroup");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::system("read", &e).context(&path))?;
        for line in content.lines() {
            let mut fields = line.splitn(3, ':');
            let _id = fields.next();
            let controllers = fields.next().unwrap_or("");
            let Some(cg_path) = fields.next() else { continue };
            if controllers.split(',').any(|c| c == self.name) {
                return Ok(self.cgroup(cg_path));
            }
        }
        Err(Error::new(
            ErrorKind::NoValue,
            format!("no {} cgroup for task {pid}", self.name),
        ))
    }
}

/// Handle to one cgroup directory in one hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    /// Owning hierarchy.
    pub subsys: &'static Subsystem,
    /// Path within the hierarchy, always starting with `/`.
    pub name: String,
}

impl fmt::Display for Cgroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subsys.name, self.name)
    }
}

impl Cgroup {
    /// Absolute filesystem path of the cgroup directory.
    #[must_use]
    pub fn dir(&self) -> PathBuf {
        let rel = self.name.trim_start_matches('/');
        self.subsys.mount_point().join(rel)
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.dir().is_dir()
    }

    /// Creates the cgroup directory, parents included.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(self.dir())
            .map_err(|e| Error::system("mkdir", &e).context(self))?;
        tracing::debug!(cgroup = %self, "cgroup created");
        Ok(())
    }

    /// Removes the cgroup directory. The kernel refuses while tasks remain.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails for a reason other than the
    /// directory already being gone.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_dir(self.dir()) {
            Ok(()) => {
                tracing::debug!(cgroup = %self, "cgroup removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::system("rmdir", &e).context(self)),
        }
    }

    /// Whether the control file exists in this cgroup.
    #[must_use]
    pub fn has_knob(&self, knob: &str) -> bool {
        self.dir().join(knob).exists()
    }

    /// Reads a control file, trimmed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn get(&self, knob: &str) -> Result<String> {
        let path = self.dir().join(knob);
        let value = std::fs::read_to_string(&path)
            .map_err(|e| Error::system("read", &e).context(path.display()))?;
        Ok(value.trim().to_string())
    }

    /// Reads a control file as an unsigned integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn get_u64(&self, knob: &str) -> Result<u64> {
        let value = self.get(knob)?;
        value.parse().map_err(|_| {
            Error::new(
                ErrorKind::Unknown,
                format!("{self}: {knob} is not a number: '{value}'"),
            )
        })
    }

    /// Writes a control file.
    ///
    /// # Errors
    ///
    /// Returns an error (with errno preserved) if the write fails.
    pub fn set(&self, knob: &str, value: &str) -> Result<()> {
        let path = self.dir().join(knob);
        std::fs::write(&path, value)
            .map_err(|e| Error::system("write", &e).context(path.display()))?;
        tracing::trace!(cgroup = %self, knob, value, "cgroup knob set");
        Ok(())
    }

    /// Writes an unsigned integer to a control file.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn set_u64(&self, knob: &str, value: u64) -> Result<()> {
        self.set(knob, &value.to_string())
    }

    /// Writes a signed integer to a control file (`-1` means unlimited for
    /// most v1 knobs).
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn set_i64(&self, knob: &str, value: i64) -> Result<()> {
        self.set(knob, &value.to_string())
    }

    /// All thread ids currently in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the `tasks` file cannot be read.
    pub fn tasks(&self) -> Result<Vec<i32>> {
        let content = self.get("tasks")?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    /// Whether the cgroup currently holds no task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task list cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.tasks()?.is_empty())
    }

    /// Moves a process (all of its threads) into this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn attach(&self, pid: i32) -> Result<()> {
        self.set("cgroup.procs", &pid.to_string())
    }

    /// Moves every task of `other` into this cgroup, repeating until the
    /// source stops producing newcomers. ESRCH is a race with exit and is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if a task list cannot be read or an attach fails.
    pub fn attach_all(&self, other: &Cgroup) -> Result<()> {
        for_each_task(other, |pid| match self.attach(pid) {
            Err(e) if e.is_errno(libc::ESRCH) => Ok(()),
            r => r,
        })
    }

    /// Sends a signal to every task, repeating until the task list is stable.
    ///
    /// # Errors
    ///
    /// Returns an error if the task list cannot be read.
    pub fn kill_all(&self, signal: Signal) -> Result<()> {
        tracing::debug!(cgroup = %self, signal = %signal, "signalling all tasks");
        for_each_task(self, |pid| {
            // Racing with exit is fine.
            let _ = kill(Pid::from_raw(pid), signal);
            Ok(())
        })
    }
}

/// Applies `apply` to every task in the cgroup until two consecutive reads of
/// the task list yield the same set. This is the idempotent iteration idiom
/// for per-task settings racing against fork.
///
/// # Errors
///
/// Returns an error if the task list cannot be read or `apply` fails.
pub fn for_each_task<F>(cg: &Cgroup, mut apply: F) -> Result<()>
where
    F: FnMut(i32) -> Result<()>,
{
    let mut prev: Vec<i32> = Vec::new();
    loop {
        let pids = cg.tasks()?;
        let mut newcomer = false;
        for pid in &pids {
            if prev.contains(pid) {
                continue;
            }
            apply(*pid)?;
            newcomer = true;
        }
        prev = pids;
        if !newcomer {
            return Ok(());
        }
    }
}
