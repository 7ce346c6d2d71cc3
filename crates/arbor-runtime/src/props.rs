//! Closed property registry.
//!
//! Every configurable field of a container is keyed by a [`Prop`] tag. The
//! registry maps tags to wire names, typed getters/setters over the data
//! block, the controllers a property requires, and whether the resource
//! applier handles it at runtime. Dispatch is a closed match, not a trait
//! hierarchy.

use std::collections::BTreeMap;
use std::path::PathBuf;

use arbor_common::types::parse_size;
use arbor_common::{Error, ErrorKind, Result};
use arbor_core::cgroup::{self, ControllerMask};

use crate::container::ContainerData;

/// Property tags. The discriminant indexes the set/dirty bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Prop {
    State,
    OwnerUser,
    OwnerGroup,
    User,
    Group,
    Command,
    Env,
    Root,
    RootRo,
    Cwd,
    Hostname,
    Isolate,
    OsMode,
    Weak,
    AccessLevel,
    Place,
    Labels,
    MemGuarantee,
    MemLimit,
    AnonLimit,
    DirtyLimit,
    RechargeOnPgfault,
    PressurizeOnDeath,
    HugetlbLimit,
    OomIsFatal,
    IoBpsLimit,
    IoOpsLimit,
    IoWeight,
    IoPolicy,
    CpuPolicy,
    CpuWeight,
    CpuGuarantee,
    CpuLimit,
    CpuPeriod,
    CpuSet,
    CpuSetAffinity,
    ThreadLimit,
    Ulimit,
    ResolvConf,
    Devices,
    BindMounts,
    Symlink,
    NetPrio,
    NetLimit,
    NetGuarantee,
    NetRxLimit,
    Controllers,
    CapLimit,
    CapAmbient,
    AutoRespawn,
    RespawnLimit,
    RespawnCount,
    RespawnDelay,
    AgingTime,
    StartTime,
    DeathTime,
    ExitStatus,
    OomKilled,
    RootPid,
    SeizePid,
}

/// Every tag, in bitmap order.
pub const ALL_PROPS: [Prop; 60] = [
    Prop::State,
    Prop::OwnerUser,
    Prop::OwnerGroup,
    Prop::User,
    Prop::Group,
    Prop::Command,
    Prop::Env,
    Prop::Root,
    Prop::RootRo,
    Prop::Cwd,
    Prop::Hostname,
    Prop::Isolate,
    Prop::OsMode,
    Prop::Weak,
    Prop::AccessLevel,
    Prop::Place,
    Prop::Labels,
    Prop::MemGuarantee,
    Prop::MemLimit,
    Prop::AnonLimit,
    Prop::DirtyLimit,
    Prop::RechargeOnPgfault,
    Prop::PressurizeOnDeath,
    Prop::HugetlbLimit,
    Prop::OomIsFatal,
    Prop::IoBpsLimit,
    Prop::IoOpsLimit,
    Prop::IoWeight,
    Prop::IoPolicy,
    Prop::CpuPolicy,
    Prop::CpuWeight,
    Prop::CpuGuarantee,
    Prop::CpuLimit,
    Prop::CpuPeriod,
    Prop::CpuSet,
    Prop::CpuSetAffinity,
    Prop::ThreadLimit,
    Prop::Ulimit,
    Prop::ResolvConf,
    Prop::Devices,
    Prop::BindMounts,
    Prop::Symlink,
    Prop::NetPrio,
    Prop::NetLimit,
    Prop::NetGuarantee,
    Prop::NetRxLimit,
    Prop::Controllers,
    Prop::CapLimit,
    Prop::CapAmbient,
    Prop::AutoRespawn,
    Prop::RespawnLimit,
    Prop::RespawnCount,
    Prop::RespawnDelay,
    Prop::AgingTime,
    Prop::StartTime,
    Prop::DeathTime,
    Prop::ExitStatus,
    Prop::OomKilled,
    Prop::RootPid,
    Prop::SeizePid,
];

/// Bitmap over the property tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropBits(u64);

impl PropBits {
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn test(self, prop: Prop) -> bool {
        self.0 & (1 << prop as usize) != 0
    }

    pub fn set(&mut self, prop: Prop) {
        self.0 |= 1 << prop as usize;
    }

    pub fn clear(&mut self, prop: Prop) {
        self.0 &= !(1 << prop as usize);
    }

    /// Tests and clears in one step; the applier's per-step idiom.
    pub fn take(&mut self, prop: Prop) -> bool {
        let was = self.test(prop);
        self.clear(prop);
        was
    }

    #[must_use]
    pub fn any(self) -> bool {
        self.0 != 0
    }

    /// Replaces this bitmap with another; restore-time "re-apply all set".
    pub fn copy_from(&mut self, other: PropBits) {
        self.0 = other.0;
    }
}

impl Prop {
    /// Wire name: RPC property key and KV record key.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::OwnerUser => "owner_user",
            Self::OwnerGroup => "owner_group",
            Self::User => "user",
            Self::Group => "group",
            Self::Command => "command",
            Self::Env => "env",
            Self::Root => "root",
            Self::RootRo => "root_readonly",
            Self::Cwd => "cwd",
            Self::Hostname => "hostname",
            Self::Isolate => "isolate",
            Self::OsMode => "os_mode",
            Self::Weak => "weak",
            Self::AccessLevel => "access_level",
            Self::Place => "place",
            Self::Labels => "labels",
            Self::MemGuarantee => "memory_guarantee",
            Self::MemLimit => "memory_limit",
            Self::AnonLimit => "anon_limit",
            Self::DirtyLimit => "dirty_limit",
            Self::RechargeOnPgfault => "recharge_on_pgfault",
            Self::PressurizeOnDeath => "pressurize_on_death",
            Self::HugetlbLimit => "hugetlb_limit",
            Self::OomIsFatal => "oom_is_fatal",
            Self::IoBpsLimit => "io_limit",
            Self::IoOpsLimit => "io_ops_limit",
            Self::IoWeight => "io_weight",
            Self::IoPolicy => "io_policy",
            Self::CpuPolicy => "cpu_policy",
            Self::CpuWeight => "cpu_weight",
            Self::CpuGuarantee => "cpu_guarantee",
            Self::CpuLimit => "cpu_limit",
            Self::CpuPeriod => "cpu_period",
            Self::CpuSet => "cpu_set",
            Self::CpuSetAffinity => "cpu_set_affinity",
            Self::ThreadLimit => "thread_limit",
            Self::Ulimit => "ulimit",
            Self::ResolvConf => "resolv_conf",
            Self::Devices => "devices",
            Self::BindMounts => "bind",
            Self::Symlink => "symlink",
            Self::NetPrio => "net_prio",
            Self::NetLimit => "net_limit",
            Self::NetGuarantee => "net_guarantee",
            Self::NetRxLimit => "net_rx_limit",
            Self::Controllers => "controllers",
            Self::CapLimit => "capabilities",
            Self::CapAmbient => "capabilities_ambient",
            Self::AutoRespawn => "respawn",
            Self::RespawnLimit => "max_respawns",
            Self::RespawnCount => "respawn_count",
            Self::RespawnDelay => "respawn_delay",
            Self::AgingTime => "aging_time",
            Self::StartTime => "start_time",
            Self::DeathTime => "death_time",
            Self::ExitStatus => "exit_status",
            Self::OomKilled => "oom_killed",
            Self::RootPid => "root_pid",
            Self::SeizePid => "seize_pid",
        }
    }

    /// Resolves a wire name; unknown names stay unknown so record loaders
    /// can skip them.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_PROPS.iter().copied().find(|p| p.name() == name)
    }

    /// Whether the resource applier pushes this property to the kernel while
    /// the container is alive.
    #[must_use]
    pub fn is_dynamic(self) -> bool {
        matches!(
            self,
            Self::MemGuarantee
                | Self::MemLimit
                | Self::AnonLimit
                | Self::DirtyLimit
                | Self::RechargeOnPgfault
                | Self::PressurizeOnDeath
                | Self::HugetlbLimit
                | Self::IoBpsLimit
                | Self::IoOpsLimit
                | Self::IoWeight
                | Self::IoPolicy
                | Self::CpuPolicy
                | Self::CpuWeight
                | Self::CpuGuarantee
                | Self::CpuLimit
                | Self::CpuPeriod
                | Self::CpuSet
                | Self::ThreadLimit
                | Self::Ulimit
                | Self::ResolvConf
                | Self::Devices
                | Self::NetPrio
                | Self::NetLimit
                | Self::NetGuarantee
                | Self::NetRxLimit
        )
    }

    /// Controllers the property needs on the container.
    #[must_use]
    pub fn required_controllers(self) -> ControllerMask {
        match self {
            Self::MemGuarantee
            | Self::MemLimit
            | Self::AnonLimit
            | Self::DirtyLimit
            | Self::RechargeOnPgfault
            | Self::PressurizeOnDeath => cgroup::MEMORY,
            Self::HugetlbLimit => cgroup::HUGETLB,
            Self::IoBpsLimit | Self::IoOpsLimit => cgroup::MEMORY | cgroup::BLKIO,
            Self::IoWeight | Self::IoPolicy => cgroup::BLKIO,
            Self::CpuPolicy
            | Self::CpuWeight
            | Self::CpuGuarantee
            | Self::CpuLimit
            | Self::CpuPeriod => cgroup::CPU,
            Self::CpuSet | Self::CpuSetAffinity => cgroup::CPUSET,
            Self::ThreadLimit => cgroup::PIDS,
            Self::NetPrio | Self::NetLimit | Self::NetGuarantee | Self::NetRxLimit => {
                cgroup::NETCLS
            }
            Self::Devices => cgroup::DEVICES,
            _ => 0,
        }
    }

    /// Whether clients may set the property directly.
    #[must_use]
    pub fn client_writable(self) -> bool {
        !matches!(
            self,
            Self::State
                | Self::CpuSetAffinity
                | Self::RespawnCount
                | Self::StartTime
                | Self::DeathTime
                | Self::ExitStatus
                | Self::OomKilled
                | Self::RootPid
                | Self::SeizePid
        )
    }

    /// Whether the property participates in the generic save loop. `state`
    /// goes through the reserved record key instead, and the CPU placement
    /// outcome is recomputed on every boot.
    #[must_use]
    pub fn persisted(self) -> bool {
        !matches!(self, Self::State | Self::CpuSetAffinity)
    }
}

fn parse_bool(prop: Prop, value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("{}: expected bool, got '{other}'", prop.name()),
        )),
    }
}

fn parse_u64(prop: Prop, value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        Error::new(
            ErrorKind::InvalidValue,
            format!("{}: expected number, got '{value}'", prop.name()),
        )
    })
}

fn parse_i64(prop: Prop, value: &str) -> Result<i64> {
    value.parse().map_err(|_| {
        Error::new(
            ErrorKind::InvalidValue,
            format!("{}: expected number, got '{value}'", prop.name()),
        )
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_list(items: &[String]) -> String {
    items.join(";")
}

fn parse_limit_map(prop: Prop, value: &str) -> Result<BTreeMap<String, u64>> {
    let mut map = BTreeMap::new();
    for entry in split_list(value) {
        let (key, val) = entry.split_once(':').ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidValue,
                format!("{}: expected 'target: value', got '{entry}'", prop.name()),
            )
        })?;
        map.insert(key.trim().to_string(), parse_size(val)?);
    }
    Ok(map)
}

fn format_limit_map(map: &BTreeMap<String, u64>) -> String {
    map.iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn parse_string_map(prop: Prop, value: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for entry in split_list(value) {
        let (key, val) = entry.split_once(':').ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidValue,
                format!("{}: expected 'key: value', got '{entry}'", prop.name()),
            )
        })?;
        map.insert(key.trim().to_string(), val.trim().to_string());
    }
    Ok(map)
}

fn format_string_map(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn parse_path_map(prop: Prop, value: &str) -> Result<BTreeMap<PathBuf, PathBuf>> {
    let mut map = BTreeMap::new();
    for entry in split_list(value) {
        let (key, val) = entry.split_once(':').ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidValue,
                format!("{}: expected 'link: target', got '{entry}'", prop.name()),
            )
        })?;
        map.insert(PathBuf::from(key.trim()), PathBuf::from(val.trim()));
    }
    Ok(map)
}

fn format_path_map(map: &BTreeMap<PathBuf, PathBuf>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}: {}", k.display(), v.display()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Reads a property as its wire string.
///
/// # Errors
///
/// Returns `NoValue` where the property has no meaningful value in the
/// current state (none currently) or `InvalidProperty` never: the tag enum
/// is closed.
pub fn get_prop(data: &ContainerData, prop: Prop) -> Result<String> {
    let value = match prop {
        Prop::State => String::new(),
        Prop::OwnerUser => data.owner_uid.to_string(),
        Prop::OwnerGroup => data.owner_gid.to_string(),
        Prop::User => data.task_uid.to_string(),
        Prop::Group => data.task_gid.to_string(),
        Prop::Command => data.command.clone(),
        Prop::Env => join_list(&data.env),
        Prop::Root => data.root.display().to_string(),
        Prop::RootRo => data.root_ro.to_string(),
        Prop::Cwd => data.cwd.display().to_string(),
        Prop::Hostname => data.hostname.clone(),
        Prop::Isolate => data.isolate.to_string(),
        Prop::OsMode => data.os_mode.to_string(),
        Prop::Weak => data.weak.to_string(),
        Prop::AccessLevel => data.access_level.to_string(),
        Prop::Place => join_list(&data.place),
        Prop::Labels => format_string_map(&data.labels),
        Prop::MemGuarantee => data.mem_guarantee.to_string(),
        Prop::MemLimit => data.mem_limit.to_string(),
        Prop::AnonLimit => data.anon_limit.to_string(),
        Prop::DirtyLimit => data.dirty_limit.to_string(),
        Prop::RechargeOnPgfault => data.recharge_on_pgfault.to_string(),
        Prop::PressurizeOnDeath => data.pressurize_on_death.to_string(),
        Prop::HugetlbLimit => data.hugetlb_limit.to_string(),
        Prop::OomIsFatal => data.oom_is_fatal.to_string(),
        Prop::IoBpsLimit => format_limit_map(&data.io_bps_limit),
        Prop::IoOpsLimit => format_limit_map(&data.io_ops_limit),
        Prop::IoWeight => data.io_weight.to_string(),
        Prop::IoPolicy => data.io_policy.clone(),
        Prop::CpuPolicy => data.cpu_policy.to_string(),
        Prop::CpuWeight => data.cpu_weight.to_string(),
        Prop::CpuGuarantee => data.cpu_guarantee.to_string(),
        Prop::CpuLimit => data.cpu_limit.to_string(),
        Prop::CpuPeriod => data.cpu_period.to_string(),
        Prop::CpuSet => data.cpu_set.to_string(),
        Prop::CpuSetAffinity => data.cpu_affinity.to_string(),
        Prop::ThreadLimit => data.thread_limit.to_string(),
        Prop::Ulimit => data.ulimit.to_string(),
        Prop::ResolvConf => join_list(&data.resolv_conf),
        Prop::Devices => join_list(&data.devices),
        Prop::BindMounts => join_list(&data.bind_mounts),
        Prop::Symlink => format_path_map(&data.symlinks),
        Prop::NetPrio => format_limit_map(&data.net.prio),
        Prop::NetLimit => format_limit_map(&data.net.limit),
        Prop::NetGuarantee => format_limit_map(&data.net.guarantee),
        Prop::NetRxLimit => format_limit_map(&data.net.rx_limit),
        Prop::Controllers => cgroup::format_controllers(data.controllers),
        Prop::CapLimit => data.cap_limit.to_string(),
        Prop::CapAmbient => data.cap_ambient.to_string(),
        Prop::AutoRespawn => data.auto_respawn.to_string(),
        Prop::RespawnLimit => data.respawn_limit.to_string(),
        Prop::RespawnCount => data.respawn_count.to_string(),
        Prop::RespawnDelay => data.respawn_delay_ms.to_string(),
        Prop::AgingTime => data.aging_time_ms.to_string(),
        Prop::StartTime => data.start_time_ms.to_string(),
        Prop::DeathTime => data.death_time_ms.to_string(),
        Prop::ExitStatus => data.exit_status.to_string(),
        Prop::OomKilled => data.oom_killed.to_string(),
        Prop::RootPid => data.task_pid.to_string(),
        Prop::SeizePid => data.seize_task_pid.to_string(),
    };
    Ok(value)
}

/// Parses and assigns a property from its wire string. Bookkeeping of the
/// set/dirty bitmaps is the caller's job.
///
/// # Errors
///
/// Returns `InvalidValue` when the value does not parse.
pub fn set_prop(data: &mut ContainerData, prop: Prop, value: &str) -> Result<()> {
    match prop {
        Prop::State => {}
        Prop::OwnerUser => data.owner_uid = parse_u64(prop, value)? as u32,
        Prop::OwnerGroup => data.owner_gid = parse_u64(prop, value)? as u32,
        Prop::User => data.task_uid = parse_u64(prop, value)? as u32,
        Prop::Group => data.task_gid = parse_u64(prop, value)? as u32,
        Prop::Command => data.command = value.to_string(),
        Prop::Env => data.env = split_list(value),
        Prop::Root => data.root = PathBuf::from(value),
        Prop::RootRo => data.root_ro = parse_bool(prop, value)?,
        Prop::Cwd => data.cwd = PathBuf::from(value),
        Prop::Hostname => data.hostname = value.to_string(),
        Prop::Isolate => data.isolate = parse_bool(prop, value)?,
        Prop::OsMode => data.os_mode = parse_bool(prop, value)?,
        Prop::Weak => data.weak = parse_bool(prop, value)?,
        Prop::AccessLevel => data.access_level = value.parse()?,
        Prop::Place => data.place = split_list(value),
        Prop::Labels => data.labels = parse_string_map(prop, value)?,
        Prop::MemGuarantee => data.mem_guarantee = parse_size(value)?,
        Prop::MemLimit => data.mem_limit = parse_size(value)?,
        Prop::AnonLimit => data.anon_limit = parse_size(value)?,
        Prop::DirtyLimit => data.dirty_limit = parse_size(value)?,
        Prop::RechargeOnPgfault => data.recharge_on_pgfault = parse_bool(prop, value)?,
        Prop::PressurizeOnDeath => data.pressurize_on_death = parse_bool(prop, value)?,
        Prop::HugetlbLimit => data.hugetlb_limit = parse_size(value)?,
        Prop::OomIsFatal => data.oom_is_fatal = parse_bool(prop, value)?,
        Prop::IoBpsLimit => data.io_bps_limit = parse_limit_map(prop, value)?,
        Prop::IoOpsLimit => data.io_ops_limit = parse_limit_map(prop, value)?,
        Prop::IoWeight => data.io_weight = parse_u64(prop, value)?,
        Prop::IoPolicy => data.io_policy = value.to_string(),
        Prop::CpuPolicy => data.cpu_policy = value.parse()?,
        Prop::CpuWeight => data.cpu_weight = parse_u64(prop, value)?.max(1),
        Prop::CpuGuarantee => data.cpu_guarantee = parse_u64(prop, value)?,
        Prop::CpuLimit => data.cpu_limit = parse_u64(prop, value)?,
        Prop::CpuPeriod => data.cpu_period = parse_u64(prop, value)?,
        Prop::CpuSet => data.cpu_set = value.parse()?,
        Prop::CpuSetAffinity => data.cpu_affinity = value.parse()?,
        Prop::ThreadLimit => data.thread_limit = parse_u64(prop, value)?,
        Prop::Ulimit => data.ulimit = value.parse()?,
        Prop::ResolvConf => data.resolv_conf = split_list(value),
        Prop::Devices => data.devices = split_list(value),
        Prop::BindMounts => data.bind_mounts = split_list(value),
        Prop::Symlink => data.symlinks = parse_path_map(prop, value)?,
        Prop::NetPrio => data.net.prio = parse_limit_map(prop, value)?,
        Prop::NetLimit => data.net.limit = parse_limit_map(prop, value)?,
        Prop::NetGuarantee => data.net.guarantee = parse_limit_map(prop, value)?,
        Prop::NetRxLimit => data.net.rx_limit = parse_limit_map(prop, value)?,
        Prop::Controllers => {
            let mut mask = 0;
            for name in split_list(value) {
                let subsys = cgroup::SUBSYSTEMS
                    .iter()
                    .find(|s| s.name == name)
                    .ok_or_else(|| {
                        Error::new(
                            ErrorKind::InvalidValue,
                            format!("unknown controller: {name}"),
                        )
                    })?;
                mask |= subsys.kind;
            }
            data.controllers = mask | cgroup::FREEZER;
        }
        Prop::CapLimit => data.cap_limit = value.parse()?,
        Prop::CapAmbient => data.cap_ambient = value.parse()?,
        Prop::AutoRespawn => data.auto_respawn = parse_bool(prop, value)?,
        Prop::RespawnLimit => data.respawn_limit = parse_i64(prop, value)?,
        Prop::RespawnCount => data.respawn_count = parse_u64(prop, value)?,
        Prop::RespawnDelay => data.respawn_delay_ms = parse_u64(prop, value)?,
        Prop::AgingTime => data.aging_time_ms = parse_u64(prop, value)?,
        Prop::StartTime => data.start_time_ms = parse_u64(prop, value)?,
        Prop::DeathTime => data.death_time_ms = parse_u64(prop, value)?,
        Prop::ExitStatus => data.exit_status = parse_i64(prop, value)? as i32,
        Prop::OomKilled => data.oom_killed = parse_bool(prop, value)?,
        Prop::RootPid => data.task_pid = parse_i64(prop, value)? as i32,
        Prop::SeizePid => data.seize_task_pid = parse_i64(prop, value)? as i32,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use arbor_common::config::DaemonConfig;
    use crate::container::Container;

    fn root() -> Arc<Container> {
        Container::new(None, 1, "/", &DaemonConfig::default())
    }

    #[test]
    fn names_are_unique_and_resolvable() {
        for prop in ALL_PROPS {
            assert_eq!(Prop::from_name(prop.name()), Some(prop), "{}", prop.name());
        }
        assert_eq!(Prop::from_name("no_such_prop"), None);
    }

    #[test]
    fn bits_indexable_for_every_prop() {
        let mut bits = PropBits::new();
        for prop in ALL_PROPS {
            assert!(!bits.test(prop));
            bits.set(prop);
            assert!(bits.test(prop));
        }
        for prop in ALL_PROPS {
            assert!(bits.take(prop));
            assert!(!bits.test(prop));
        }
        assert!(!bits.any());
    }

    #[test]
    fn set_get_round_trip_scalar_props() {
        let ct = root();
        let d = &mut *ct.lock_data();
        for (prop, value) in [
            (Prop::Command, "/bin/sleep 3600"),
            (Prop::MemLimit, "67108864"),
            (Prop::CpuPolicy, "batch"),
            (Prop::CpuSet, "cores 2"),
            (Prop::AccessLevel, "read-only"),
            (Prop::Ulimit, "core: 0 0"),
            (Prop::CapLimit, "CHOWN;KILL"),
        ] {
            set_prop(d, prop, value).expect(prop.name());
            assert_eq!(get_prop(d, prop).expect(prop.name()), value);
        }
    }

    #[test]
    fn limit_maps_round_trip() {
        let ct = root();
        let d = &mut *ct.lock_data();
        set_prop(d, Prop::IoBpsLimit, "/place: 1048576; fs: 4096").expect("set");
        let out = get_prop(d, Prop::IoBpsLimit).expect("get");
        assert_eq!(out, "/place: 1048576; fs: 4096");
    }

    #[test]
    fn size_suffixes_accepted_for_memory() {
        let ct = root();
        let d = &mut *ct.lock_data();
        set_prop(d, Prop::MemLimit, "64M").expect("set");
        assert_eq!(d.mem_limit, 64 << 20);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let ct = root();
        let d = &mut *ct.lock_data();
        assert!(set_prop(d, Prop::MemLimit, "lots").is_err());
        assert!(set_prop(d, Prop::Isolate, "maybe").is_err());
        assert!(set_prop(d, Prop::CpuPolicy, "turbo").is_err());
    }

    #[test]
    fn controllers_parse_includes_freezer() {
        let ct = root();
        let d = &mut *ct.lock_data();
        set_prop(d, Prop::Controllers, "memory;cpu").expect("set");
        assert_ne!(d.controllers & cgroup::FREEZER, 0);
        assert_ne!(d.controllers & cgroup::MEMORY, 0);
    }

    #[test]
    fn runtime_only_props_are_not_client_writable() {
        assert!(!Prop::RootPid.client_writable());
        assert!(!Prop::ExitStatus.client_writable());
        assert!(Prop::MemLimit.client_writable());
    }
}
