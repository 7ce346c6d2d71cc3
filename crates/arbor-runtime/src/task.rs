//! Task launcher: the fork sequence that enters cgroups and namespaces and
//! executes the payload.
//!
//! The daemon spawns its own binary as a *sentinel* process. The sentinel
//! reads a [`TaskSpec`] from stdin (which also sequences it after the daemon
//! has attached it to every cgroup), enters namespaces, drops credentials
//! and forks the payload. It then lingers as the wait-task: its exit code
//! reports the payload's fate, signals encoded as `128 + sig`.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use arbor_common::constants::{ENV_HOST, ENV_NAME, ENV_USER};
use arbor_common::{Error, ErrorKind, Result};
use arbor_core::cgroup;
use arbor_core::host;
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, execvp, fork, setgid, setgroups, sethostname, setsid, setuid,
    ForkResult, Gid, Pid, Uid};

use crate::container::Container;
use crate::context::Runtime;

/// Hidden argv[1] that turns the daemon binary into the sentinel.
pub const SENTINEL_ARG: &str = "__sentinel";

/// Stdout/stderr files grow up to this before rotation truncates them.
const STDIO_LIMIT: u64 = 8 << 20;

/// Everything the sentinel needs, serialized over its stdin.
#[derive(Debug)]
pub struct TaskSpec {
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub root: PathBuf,
    pub hostname: String,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    pub isolate: bool,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Pid to watch instead of launching; the seize mode.
    pub seize_pid: i32,
}

impl TaskSpec {
    fn to_record(&self) -> serde_json::Value {
        serde_json::json!({
            "command": self.command,
            "env": self.env.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>(),
            "cwd": self.cwd,
            "root": self.root,
            "hostname": self.hostname,
            "uid": self.uid,
            "gid": self.gid,
            "groups": self.groups,
            "isolate": self.isolate,
            "stdout_path": self.stdout_path,
            "stderr_path": self.stderr_path,
            "seize_pid": self.seize_pid,
        })
    }

    fn from_record(value: &serde_json::Value) -> Result<Self> {
        let bad = |what: &str| Error::new(ErrorKind::InvalidValue, format!("task spec: {what}"));
        let strings = |key: &str| -> Vec<String> {
            value[key]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(Self {
            command: strings("command"),
            env: strings("env")
                .into_iter()
                .filter_map(|kv| {
                    kv.split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                })
                .collect(),
            cwd: PathBuf::from(value["cwd"].as_str().ok_or_else(|| bad("cwd"))?),
            root: PathBuf::from(value["root"].as_str().ok_or_else(|| bad("root"))?),
            hostname: value["hostname"].as_str().unwrap_or_default().to_string(),
            uid: value["uid"].as_u64().ok_or_else(|| bad("uid"))? as u32,
            gid: value["gid"].as_u64().ok_or_else(|| bad("gid"))? as u32,
            groups: value["groups"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_u64().map(|g| g as u32)).collect())
                .unwrap_or_default(),
            isolate: value["isolate"].as_bool().unwrap_or(false),
            stdout_path: PathBuf::from(value["stdout_path"].as_str().unwrap_or("/dev/null")),
            stderr_path: PathBuf::from(value["stderr_path"].as_str().unwrap_or("/dev/null")),
            seize_pid: value["seize_pid"].as_i64().unwrap_or(0) as i32,
        })
    }
}

/// Environment exported to the payload: fixed base plus the configuration
/// inherited from containers in the same isolation domain, nearest first.
#[must_use]
pub fn environment(rt: &Runtime, ct: &Arc<Container>) -> Vec<(String, String)> {
    let data = ct.lock_data();
    let mut env: Vec<(String, String)> = vec![
        (
            String::from("PATH"),
            String::from("/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"),
        ),
        (
            String::from("HOME"),
            if data.cwd.as_os_str().is_empty() {
                ct.work_dir(&rt.config).display().to_string()
            } else {
                data.cwd.display().to_string()
            },
        ),
        (String::from("USER"), data.task_uid.to_string()),
        (String::from("container"), String::from("lxc")),
        (ENV_NAME.to_string(), ct.name.clone()),
        (ENV_HOST.to_string(), host::hostname()),
        (ENV_USER.to_string(), data.owner_uid.to_string()),
    ];
    drop(data);

    // The locked entries above win over anything a container configures.
    let mut cursor = Some(Arc::clone(ct));
    while let Some(node) = cursor {
        let data = node.lock_data();
        for entry in &data.env {
            if let Some((key, value)) = entry.split_once('=') {
                if !env.iter().any(|(k, _)| k == key) {
                    env.push((key.to_string(), value.to_string()));
                }
            }
        }
        let stop = data.isolate;
        drop(data);
        if stop {
            break;
        }
        cursor = node.parent();
    }
    env
}

fn stdio_dir(rt: &Runtime, ct: &Arc<Container>) -> PathBuf {
    ct.work_dir(&rt.config)
}

/// Builds the spec for a normal launch.
fn build_spec(rt: &Runtime, ct: &Arc<Container>) -> TaskSpec {
    let data = ct.lock_data();
    let dir = ct.work_dir(&rt.config);
    TaskSpec {
        command: data.command.split_whitespace().map(str::to_string).collect(),
        env: Vec::new(),
        cwd: if data.cwd.as_os_str().is_empty() {
            dir.clone()
        } else {
            data.cwd.clone()
        },
        root: data.root_path.clone(),
        hostname: data.hostname.clone(),
        uid: data.task_uid,
        gid: data.task_gid,
        groups: data.supplementary_groups.clone(),
        isolate: data.isolate,
        stdout_path: dir.join("stdout"),
        stderr_path: dir.join("stderr"),
        seize_pid: 0,
    }
}

/// Launches the container payload.
///
/// Records `wait_task_pid` (the sentinel) and `task_pid` (the payload) in
/// the container data on success.
///
/// # Errors
///
/// Returns an error if the sentinel cannot be spawned, attached, or the
/// payload fails to report back.
pub fn launch(rt: &Runtime, ct: &Arc<Container>) -> Result<()> {
    let mut spec = build_spec(rt, ct);
    spec.env = environment(rt, ct);

    let exe = std::env::current_exe()
        .map_err(|e| Error::system("readlink", &e).context("/proc/self/exe"))?;
    let mut child = Command::new(exe)
        .arg(SENTINEL_ARG)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::system("fork", &e).context("sentinel"))?;
    let sentinel_pid = child.id() as i32;

    // Attach before the payload exists: the sentinel blocks on stdin until
    // the spec arrives, and every fork inherits the cgroups.
    attach_to_cgroups(ct, sentinel_pid)?;

    let spec_line = spec.to_record().to_string() + "\n";
    let write_result = child
        .stdin
        .take()
        .ok_or_else(|| Error::new(ErrorKind::Unknown, "sentinel stdin lost"))
        .and_then(|mut stdin| {
            stdin
                .write_all(spec_line.as_bytes())
                .map_err(|e| Error::system("write", &e).context("sentinel spec"))
        });

    let task_pid = write_result.and_then(|()| {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::new(ErrorKind::Unknown, "sentinel stdout lost"))?;
        let mut line = String::new();
        BufReader::new(stdout)
            .read_line(&mut line)
            .map_err(|e| Error::system("read", &e).context("sentinel report"))?;
        line.trim().parse::<i32>().map_err(|_| {
            Error::new(
                ErrorKind::Unknown,
                format!("sentinel reported no task pid: '{}'", line.trim()),
            )
        })
    });

    match task_pid {
        Ok(pid) => {
            let mut data = ct.lock_data();
            data.wait_task_pid = sentinel_pid;
            data.task_pid = pid;
            data.task_vpid = if data.isolate { 1 } else { pid };
            tracing::info!(container = %ct, task = pid, wait_task = sentinel_pid, "task started");
            Ok(())
        }
        Err(e) => {
            let _ = nix::sys::signal::kill(
                Pid::from_raw(sentinel_pid),
                nix::sys::signal::Signal::SIGKILL,
            );
            let _ = child.wait();
            Err(e)
        }
    }
}

/// Spawns a sentinel inside the freezer cgroup to adopt a re-parented
/// wait-task; the sentinel exits when the watched pid disappears.
///
/// # Errors
///
/// Returns an error if the helper cannot be spawned or attached.
pub fn seize(ct: &Arc<Container>, target_pid: i32) -> Result<()> {
    {
        let data = ct.lock_data();
        if data.seize_task_pid != 0 && host::task_name(data.seize_task_pid).starts_with("arbord") {
            let ppid = host::task_ppid(data.seize_task_pid);
            if ppid == std::process::id() as i32 {
                return Ok(());
            }
        }
    }

    let mut spec = TaskSpec {
        command: Vec::new(),
        env: Vec::new(),
        cwd: PathBuf::from("/"),
        root: PathBuf::from("/"),
        hostname: String::new(),
        uid: 0,
        gid: 0,
        groups: Vec::new(),
        isolate: false,
        stdout_path: PathBuf::from("/dev/null"),
        stderr_path: PathBuf::from("/dev/null"),
        seize_pid: target_pid,
    };
    spec.env = vec![(ENV_NAME.to_string(), ct.name.clone())];

    let exe = std::env::current_exe()
        .map_err(|e| Error::system("readlink", &e).context("/proc/self/exe"))?;
    let mut child = Command::new(exe)
        .arg(SENTINEL_ARG)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::system("fork", &e).context("seize helper"))?;
    let helper_pid = child.id() as i32;

    let freezer = ct.cgroup(&cgroup::FREEZER_SUBSYSTEM);
    freezer.attach(helper_pid)?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::new(ErrorKind::Unknown, "seize helper stdin lost"))?;
    let line = spec.to_record().to_string() + "\n";
    stdin
        .write_all(line.as_bytes())
        .map_err(|e| Error::system("write", &e).context("seize spec"))?;

    ct.lock_data().seize_task_pid = helper_pid;
    tracing::info!(container = %ct, target = target_pid, helper = helper_pid, "seized task");
    Ok(())
}

fn attach_to_cgroups(ct: &Arc<Container>, pid: i32) -> Result<()> {
    let controllers = ct.lock_data().controllers;
    for subsys in cgroup::SUBSYSTEMS {
        if controllers & subsys.kind == 0 || !subsys.supported() {
            continue;
        }
        let cg = ct.cgroup(subsys);
        if cg.exists() {
            cg.attach(pid).map_err(|e| e.context(format!("attach to {cg}")))?;
        }
    }
    Ok(())
}

/// Truncates oversized stdout/stderr files of a running container.
pub fn rotate_stdio(rt: &Runtime, ct: &Arc<Container>) {
    for name in ["stdout", "stderr"] {
        let path = stdio_dir(rt, ct).join(name);
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        if meta.len() > STDIO_LIMIT {
            tracing::debug!(container = %ct, file = name, "rotating stdio");
            if let Err(e) = std::fs::File::create(&path) {
                tracing::warn!(container = %ct, error = %e, "cannot rotate stdio");
            }
        }
    }
}

/// Removes the stdio files during teardown.
pub fn remove_stdio(rt: &Runtime, ct: &Arc<Container>) {
    for name in ["stdout", "stderr"] {
        let path = stdio_dir(rt, ct).join(name);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(container = %ct, error = %e, "cannot remove stdio file");
            }
        }
    }
}

/// Sentinel entry point, run when the binary is re-executed with
/// [`SENTINEL_ARG`]. Never returns to the caller's control flow.
pub fn run_sentinel() -> ! {
    let code = sentinel_body().unwrap_or_else(|e| {
        eprintln!("sentinel: {e}");
        126
    });
    std::process::exit(code);
}

fn sentinel_body() -> Result<i32> {
    let mut input = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut input)
        .map_err(|e| Error::system("read", &e).context("task spec"))?;
    let value: serde_json::Value = serde_json::from_str(&input)?;
    let spec = TaskSpec::from_record(&value)?;

    // Seize mode: linger until the watched task disappears.
    if spec.seize_pid != 0 {
        while host::task_exists(spec.seize_pid) && !host::task_is_zombie(spec.seize_pid) {
            std::thread::sleep(std::time::Duration::from_millis(500));
        }
        return Ok(0);
    }

    if spec.command.is_empty() {
        return Err(Error::new(ErrorKind::InvalidValue, "empty command"));
    }

    setsid().map_err(|e| crate::sys_err("setsid", e))?;

    if spec.isolate {
        unshare(
            CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWUTS
                | CloneFlags::CLONE_NEWIPC,
        )
        .map_err(|e| crate::sys_err("unshare", e))?;
        nix::mount::mount(
            None::<&str>,
            "/",
            None::<&str>,
            nix::mount::MsFlags::MS_REC | nix::mount::MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| crate::sys_err("mount", e))?;
    }

    if !spec.hostname.is_empty() {
        sethostname(&spec.hostname).map_err(|e| crate::sys_err("sethostname", e))?;
    }

    if spec.root.as_os_str() != "/" {
        chroot(&spec.root).map_err(|e| crate::sys_err("chroot", e))?;
        chdir("/").map_err(|e| crate::sys_err("chdir", e))?;
    }
    if !spec.cwd.as_os_str().is_empty() && spec.cwd.is_dir() {
        chdir(&spec.cwd).map_err(|e| crate::sys_err("chdir", e))?;
    }

    let stdout = std::fs::File::create(&spec.stdout_path)
        .map_err(|e| Error::system("open", &e).context(spec.stdout_path.display()))?;
    let stderr = std::fs::File::create(&spec.stderr_path)
        .map_err(|e| Error::system("open", &e).context(spec.stderr_path.display()))?;

    let groups: Vec<Gid> = spec.groups.iter().map(|&g| Gid::from_raw(g)).collect();
    setgroups(&groups).map_err(|e| crate::sys_err("setgroups", e))?;
    setgid(Gid::from_raw(spec.gid)).map_err(|e| crate::sys_err("setgid", e))?;
    setuid(Uid::from_raw(spec.uid)).map_err(|e| crate::sys_err("setuid", e))?;

    // The payload is a grandchild so a new pid namespace gets its init.
    // SAFETY: the sentinel is single-threaded; fork is safe here.
    match unsafe { fork() }.map_err(|e| crate::sys_err("fork", e))? {
        ForkResult::Child => {
            use std::os::fd::AsRawFd;
            let _ = nix::unistd::dup2(stdout.as_raw_fd(), 1);
            let _ = nix::unistd::dup2(stderr.as_raw_fd(), 2);
            for (key, value) in &spec.env {
                std::env::set_var(key, value);
            }
            let argv: Vec<std::ffi::CString> = spec
                .command
                .iter()
                .filter_map(|a| std::ffi::CString::new(a.as_str()).ok())
                .collect();
            if argv.is_empty() {
                std::process::exit(127);
            }
            let _ = execvp(&argv[0], &argv);
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            // Report the payload pid, then linger as the wait-task.
            println!("{}", child.as_raw());
            let _ = std::io::stdout().flush();
            loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, code)) => return Ok(code & 0xff),
                    Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
                    Ok(_) => continue,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(_) => return Ok(0),
                }
            }
        }
    }
}
