//! Subtree lock discipline under real thread contention.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arbor_common::config::DaemonConfig;
use arbor_core::cpumask::Topology;
use arbor_runtime::lifecycle;
use arbor_runtime::{ClientContext, Runtime};

fn test_runtime() -> (tempfile::TempDir, Arc<Runtime>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = DaemonConfig::default();
    config.kvs_dir = dir.path().join("kvs");
    config.work_dir = dir.path().join("place");
    let rt = Runtime::builder(config)
        .host_memory(4 << 30)
        .topology(Topology::synthetic(4, 1))
        .build()
        .expect("runtime");
    (dir, rt)
}

// ── Writer preference ────────────────────────────────────────────────

#[test]
fn pending_writer_blocks_new_readers() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("create a");

    let first_read = rt.lock_read(&a).expect("first reader");

    // A writer queues up behind the reader and flags its intent.
    let (writer_tx, writer_rx) = mpsc::channel();
    let writer_rt = Arc::clone(&rt);
    let writer_ct = Arc::clone(&a);
    let writer = thread::spawn(move || {
        let lock = writer_rt.lock_write(&writer_ct).expect("writer");
        writer_tx.send(Instant::now()).expect("send");
        thread::sleep(Duration::from_millis(50));
        drop(lock);
    });

    // Give the writer time to park with pending_write set, then verify a
    // newcomer reader cannot sneak past it.
    thread::sleep(Duration::from_millis(50));
    assert!(
        rt.try_lock_read(&a).is_err(),
        "reader must not starve a pending writer"
    );

    let (reader_tx, reader_rx) = mpsc::channel();
    let reader_rt = Arc::clone(&rt);
    let reader_ct = Arc::clone(&a);
    let reader = thread::spawn(move || {
        let lock = reader_rt.lock_read(&reader_ct).expect("late reader");
        reader_tx.send(Instant::now()).expect("send");
        drop(lock);
    });

    thread::sleep(Duration::from_millis(50));
    drop(first_read);

    let writer_acquired = writer_rx.recv_timeout(Duration::from_secs(5)).expect("writer ran");
    let reader_acquired = reader_rx.recv_timeout(Duration::from_secs(5)).expect("reader ran");
    writer.join().expect("writer join");
    reader.join().expect("reader join");

    assert!(
        writer_acquired < reader_acquired,
        "the queued writer must win over the late reader"
    );
}

// ── Ancestor-chain exclusion ─────────────────────────────────────────

#[test]
fn writer_on_child_excludes_parent_writer() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("create a");
    let ab = lifecycle::create(&rt, &client, "a/b").expect("create a/b");

    let child_write = rt.lock_write(&ab).expect("child writer");
    assert!(rt.try_lock_write(&a).is_err(), "parent write must block");
    assert!(rt.try_lock_read(&a).is_err(), "parent read blocks on subtree writer");
    drop(child_write);

    let parent_write = rt.lock_write(&a).expect("parent writer");
    assert!(rt.try_lock_write(&ab).is_err(), "descendant write must block");
    assert!(rt.try_lock_read(&ab).is_err(), "descendant read must block");
    drop(parent_write);
}

#[test]
fn independent_subtrees_lock_concurrently() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("create a");
    let b = lifecycle::create(&rt, &client, "b").expect("create b");

    let hold_a = rt.lock_write(&a).expect("write a");
    let hold_b = rt.lock_write(&b).expect("write b despite a being locked");
    drop(hold_a);
    drop(hold_b);
}

// ── Downgrade / upgrade ──────────────────────────────────────────────

#[test]
fn downgrade_lets_reader_through_and_upgrade_waits_for_it() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("create a");

    let mut lock = rt.lock_write(&a).expect("writer");
    lock.downgrade();

    let reader_rt = Arc::clone(&rt);
    let reader_ct = Arc::clone(&a);
    let reader = thread::spawn(move || {
        let lock = reader_rt.lock_read(&reader_ct).expect("concurrent reader");
        thread::sleep(Duration::from_millis(100));
        let about_to_release = Instant::now();
        drop(lock);
        about_to_release
    });

    thread::sleep(Duration::from_millis(30));
    lock.upgrade();
    let upgraded_at = Instant::now();
    let reader_released = reader.join().expect("reader join");

    assert!(
        upgraded_at >= reader_released,
        "upgrade must wait for the last concurrent reader"
    );
}

// ── Try-lock semantics ───────────────────────────────────────────────

#[test]
fn try_lock_fails_fast_with_busy() {
    let (_dir, rt) = test_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("create a");

    let hold = rt.lock_write(&a).expect("writer");
    let started = Instant::now();
    let err = rt.try_lock_write(&a).expect_err("busy");
    assert_eq!(err.kind, arbor_common::ErrorKind::Busy);
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "try_lock must not sleep"
    );
    drop(hold);
}
