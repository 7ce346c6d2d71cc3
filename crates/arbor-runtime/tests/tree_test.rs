//! Registry, lifecycle and persistence invariants over the container tree.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::Path;
use std::sync::Arc;

use arbor_common::config::DaemonConfig;
use arbor_common::types::ContainerState;
use arbor_common::ErrorKind;
use arbor_core::cpumask::Topology;
use arbor_runtime::{lifecycle, recovery};
use arbor_runtime::{ClientContext, Runtime};

fn runtime_at(dir: &Path) -> Arc<Runtime> {
    let mut config = DaemonConfig::default();
    config.kvs_dir = dir.join("kvs");
    config.work_dir = dir.join("place");
    Runtime::builder(config)
        .host_memory(4 << 30)
        .topology(Topology::synthetic(4, 1))
        .build()
        .expect("runtime")
}

fn test_runtime() -> (tempfile::TempDir, Arc<Runtime>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let rt = runtime_at(dir.path());
    (dir, rt)
}

// ── Create / Destroy ─────────────────────────────────────────────────

#[test]
fn create_registers_destroy_unregisters() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();

    let a = lifecycle::create(&rt, &client, "a").expect("create a");
    assert_eq!(a.state(), ContainerState::Stopped);
    assert_eq!(a.level, 1);
    assert!(a.id > 1 && a.id <= 4095);
    assert!(rt.find("a").is_ok());
    assert_eq!(rt.root().childs().len(), 1);
    assert!(rt.kv.load(a.id).is_ok(), "record persisted on create");

    let id = a.id;
    lifecycle::destroy(&rt, &a).expect("destroy a");
    assert_eq!(a.state(), ContainerState::Destroyed);
    assert_eq!(
        rt.find("a").expect_err("unregistered").kind,
        ErrorKind::ContainerDoesNotExist
    );
    assert!(rt.root().childs().is_empty());
    assert!(rt.kv.load(id).is_err(), "record removed on destroy");

    // The id returns to the pool only on destruction.
    let b = lifecycle::create(&rt, &client, "b").expect("create b");
    assert_eq!(b.id, id, "released id is reused");
}

#[test]
fn create_rejects_duplicates_and_orphans() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();

    lifecycle::create(&rt, &client, "a").expect("create a");
    assert_eq!(
        lifecycle::create(&rt, &client, "a").expect_err("dup").kind,
        ErrorKind::ContainerAlreadyExists
    );
    assert_eq!(
        lifecycle::create(&rt, &client, "missing/child").expect_err("orphan").kind,
        ErrorKind::ContainerDoesNotExist
    );
    assert_eq!(
        lifecycle::create(&rt, &client, "bad name").expect_err("invalid").kind,
        ErrorKind::InvalidValue
    );
}

#[test]
fn nesting_depth_is_capped() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();

    let mut name = String::from("c");
    lifecycle::create(&rt, &client, &name).expect("level 1");
    for _ in 1..16 {
        name.push_str("/c");
        lifecycle::create(&rt, &client, &name).expect(&name.clone());
    }
    name.push_str("/c");
    assert_eq!(
        lifecycle::create(&rt, &client, &name).expect_err("level 17").kind,
        ErrorKind::InvalidValue
    );
}

#[test]
fn container_quota_is_enforced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = DaemonConfig::default();
    config.kvs_dir = dir.path().join("kvs");
    config.max_containers = 3;
    let rt = Runtime::builder(config)
        .host_memory(4 << 30)
        .topology(Topology::synthetic(2, 1))
        .build()
        .expect("runtime");
    let client = ClientContext {
        uid: 1000,
        gid: 1000,
        superuser: false,
    };

    let mut created = 0;
    let err = loop {
        match lifecycle::create(&rt, &client, &format!("c{created}")) {
            Ok(_) => created += 1,
            Err(e) => break e,
        }
        assert!(created < 64, "quota never hit");
    };
    assert_eq!(err.kind, ErrorKind::ResourceNotAvailable);
    assert!(err.text.contains("limit"));
    assert!(created >= 3, "at least the configured quota fits");
}

#[test]
fn destroy_removes_whole_subtree_post_order() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();

    let a = lifecycle::create(&rt, &client, "a").expect("a");
    lifecycle::create(&rt, &client, "a/b").expect("a/b");
    lifecycle::create(&rt, &client, "a/b/c").expect("a/b/c");

    lifecycle::destroy(&rt, &a).expect("destroy subtree");
    for name in ["a", "a/b", "a/b/c"] {
        assert!(rt.find(name).is_err(), "{name} must be gone");
    }
}

#[test]
fn destroying_the_root_is_refused() {
    let (_dir, rt) = test_runtime();
    let root = rt.root();
    assert_eq!(
        lifecycle::destroy(&rt, &root).expect_err("root").kind,
        ErrorKind::Permission
    );
}

// ── State machine counters ───────────────────────────────────────────

#[test]
fn ancestor_counters_track_starting_and_running() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");
    let ab = lifecycle::create(&rt, &client, "a/b").expect("a/b");
    let root = rt.root();

    ab.set_state(&rt, ContainerState::Starting);
    assert_eq!(a.starting_children(), 1);
    assert_eq!(root.starting_children(), 1);
    assert_eq!(a.running_children(), 0);

    ab.set_state(&rt, ContainerState::Running);
    assert_eq!(a.starting_children(), 0);
    assert_eq!(a.running_children(), 1);
    assert_eq!(root.running_children(), 1);

    ab.set_state(&rt, ContainerState::Dead);
    assert_eq!(a.running_children(), 0);
    assert_eq!(root.running_children(), 0);
}

#[test]
fn meta_container_notifies_waiters_when_last_child_dies() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");
    let ab = lifecycle::create(&rt, &client, "a/b").expect("a/b");

    a.set_state(&rt, ContainerState::Meta);
    ab.set_state(&rt, ContainerState::Running);

    let waiter = lifecycle::setup_wait(&rt, &[String::from("a")], None);
    ab.set_state(&rt, ContainerState::Dead);

    let woken = waiter.wait(Some(std::time::Duration::from_secs(5)));
    assert_eq!(woken.as_deref(), Some("a"));
}

#[test]
fn wildcard_waiters_match_subtree_events() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let ab = {
        lifecycle::create(&rt, &client, "a").expect("a");
        lifecycle::create(&rt, &client, "a/b").expect("a/b")
    };

    let waiter = lifecycle::setup_wait(&rt, &[String::from("a/*")], None);
    ab.set_state(&rt, ContainerState::Running);
    ab.set_state(&rt, ContainerState::Dead);

    let woken = waiter.wait(Some(std::time::Duration::from_secs(5)));
    assert_eq!(woken.as_deref(), Some("a/b"));
}

// ── Properties and lifecycle preconditions ───────────────────────────

#[test]
fn static_properties_require_stopped_state() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");

    lifecycle::set_property(&rt, &client, &a, "command", "/bin/true").expect("set stopped");

    a.set_state(&rt, ContainerState::Running);
    assert_eq!(
        lifecycle::set_property(&rt, &client, &a, "command", "/bin/false")
            .expect_err("running")
            .kind,
        ErrorKind::InvalidState
    );
    // Bookkeeping properties stay settable.
    lifecycle::set_property(&rt, &client, &a, "aging_time", "60000").expect("aging while running");
}

#[test]
fn resume_without_pause_is_invalid_state() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");

    assert_eq!(
        lifecycle::resume(&rt, &a).expect_err("not paused").kind,
        ErrorKind::InvalidState
    );
    assert_eq!(
        lifecycle::pause(&rt, &a).expect_err("not running").kind,
        ErrorKind::InvalidState
    );
}

#[test]
fn start_of_running_container_is_invalid_state() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");
    a.set_state(&rt, ContainerState::Running);

    assert_eq!(
        lifecycle::start(&rt, &a, &client).expect_err("running").kind,
        ErrorKind::InvalidState
    );
}

#[test]
fn root_properties_are_read_only() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let root = rt.root();
    assert_eq!(
        lifecycle::set_property(&rt, &client, &root, "memory_limit", "1024")
            .expect_err("root")
            .kind,
        ErrorKind::Permission
    );
}

#[test]
fn non_owner_cannot_set_properties() {
    let (_dir, rt) = test_runtime();
    let owner = ClientContext {
        uid: 1000,
        gid: 1000,
        superuser: false,
    };
    let stranger = ClientContext {
        uid: 2000,
        gid: 2000,
        superuser: false,
    };
    let a = lifecycle::create(&rt, &owner, "a").expect("a");
    assert_eq!(
        lifecycle::set_property(&rt, &stranger, &a, "memory_limit", "1024")
            .expect_err("stranger")
            .kind,
        ErrorKind::Permission
    );
}

// ── Persistence round trip ───────────────────────────────────────────

#[test]
fn save_then_restore_preserves_properties() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = ClientContext::system();
    let id;
    {
        let rt = runtime_at(dir.path());
        let a = lifecycle::create(&rt, &client, "a").expect("a");
        lifecycle::create(&rt, &client, "a/b").expect("a/b");
        id = a.id;
        lifecycle::set_property(&rt, &client, &a, "command", "/bin/sleep 3600").expect("command");
        lifecycle::set_property(&rt, &client, &a, "memory_limit", "64M").expect("memory");
        lifecycle::set_property(&rt, &client, &a, "cpu_policy", "batch").expect("policy");
        lifecycle::set_property(&rt, &client, &a, "labels", "tier: web").expect("labels");
        lifecycle::set_property(&rt, &client, &a, "respawn", "true").expect("respawn");
    }

    let rt = runtime_at(dir.path());
    recovery::restore_all(&rt).expect("restore");

    let a = rt.find("a").expect("a restored");
    assert_eq!(a.id, id, "id survives restart");
    assert_eq!(a.state(), ContainerState::Stopped);
    assert!(rt.find("a/b").is_ok(), "children restored after parents");

    for (key, want) in [
        ("command", "/bin/sleep 3600"),
        ("memory_limit", "67108864"),
        ("cpu_policy", "batch"),
        ("labels", "tier: web"),
        ("respawn", "true"),
    ] {
        let got = lifecycle::get_property(&rt, &a, key).expect(key);
        assert_eq!(got, want, "{key}");
    }
}

#[test]
fn restore_tolerates_unknown_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let id;
    {
        let rt = runtime_at(dir.path());
        let client = ClientContext::system();
        let a = lifecycle::create(&rt, &client, "a").expect("a");
        id = a.id;
    }

    // A newer daemon wrote a key this build does not know.
    {
        let rt = runtime_at(dir.path());
        let mut record = rt.kv.load(id).expect("record");
        record.insert(String::from("hologram_limit"), String::from("9000"));
        rt.kv.save(id, &record).expect("save");
    }

    let rt = runtime_at(dir.path());
    recovery::restore_all(&rt).expect("restore");
    assert!(rt.find("a").is_ok(), "container restored despite unknown key");
}

// ── Computed keys ────────────────────────────────────────────────────

#[test]
fn computed_property_keys() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");

    assert_eq!(lifecycle::get_property(&rt, &a, "state").expect("state"), "stopped");
    assert_eq!(
        lifecycle::get_property(&rt, &a, "id").expect("id"),
        a.id.to_string()
    );
    assert_eq!(
        lifecycle::get_property(&rt, &a, "no_such_prop").expect_err("unknown").kind,
        ErrorKind::InvalidProperty
    );
}

#[test]
fn taint_flags_suspicious_configuration() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");

    assert!(lifecycle::taint(&a).is_empty());

    lifecycle::set_property(&rt, &client, &a, "memory_limit", "64M").expect("limit");
    lifecycle::set_property(&rt, &client, &a, "memory_guarantee", "128M").expect("guarantee");
    let warnings = lifecycle::taint(&a);
    assert!(warnings.iter().any(|w| w.contains("guarantee")));
}
