//! System-wide constants and default paths.

/// Root container's reserved name.
pub const ROOT_CONTAINER: &str = "/";

/// Reserved alias for "the container this client runs in".
pub const SELF_CONTAINER: &str = "self";

/// Reserved relative component.
pub const DOT_CONTAINER: &str = ".";

/// Maximum length of one name component, bytes.
pub const NAME_COMPONENT_MAX: usize = 128;

/// Maximum length of a container path.
pub const CONTAINER_PATH_MAX: usize = 200;

/// Path limit granted to superusers.
pub const CONTAINER_PATH_MAX_SUPERUSER: usize = 220;

/// Maximum nesting depth below the root.
pub const CONTAINER_LEVEL_MAX: u32 = 16;

/// Highest allocatable container id; ids are dense in `[1, ID_MAX]`.
pub const CONTAINER_ID_MAX: u32 = 4095;

/// Slots reserved for the daemon's own service containers.
pub const SERVICE_CONTAINERS_RESERVE: usize = 4;

/// Extra container quota granted to superusers.
pub const SUPERUSER_CONTAINERS_BONUS: usize = 32;

/// Default directory for per-container persistent records.
pub const DEFAULT_KVS_DIR: &str = "/run/arbor/kvs";

/// Default base for container working directories.
pub const DEFAULT_WORK_DIR: &str = "/place/arbor";

/// Default RPC socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/arbord.socket";

/// Group owning the RPC socket.
pub const SOCKET_GROUP: &str = "arbor";

/// Prefix of every container cgroup inside each hierarchy.
pub const CGROUP_PREFIX: &str = "/arbord";

/// Cgroup v1 mount root.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// CPU power of one logical CPU, nanoseconds of runtime per second.
pub const CPU_POWER_PER_SEC: u64 = 1_000_000_000;

/// Environment variable carrying the container name into the payload.
pub const ENV_NAME: &str = "ARBOR_NAME";

/// Environment variable carrying the host name into the payload.
pub const ENV_HOST: &str = "ARBOR_HOST";

/// Environment variable carrying the owner user into the payload.
pub const ENV_USER: &str = "ARBOR_USER";

/// Inherited event fd for daemon re-exec handoff.
pub const EVENT_FD: i32 = 128;

/// Inherited ack fd for daemon re-exec handoff.
pub const ACK_FD: i32 = 129;

/// Inherited RPC socket fd for daemon re-exec handoff.
pub const RPC_FD: i32 = 130;
